//! HTTP response plumbing for live and transcoded streams.
//!
//! - [`RangeResponseWriter`]: single-range responses over growing transcode output
//! - [`pipe_body`]: adapts an async writer task into an axum response body

mod body;
mod range;

pub use body::{pipe_body, PIPE_CAPACITY};
pub use range::{RangeError, RangeReport, RangeResponseWriter, RangeSpec};
