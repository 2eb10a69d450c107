//! Tunerflow-Common: Shared types, constants, and utilities.
//!
//! This crate provides common functionality used across tunerflow:
//!
//! - **Typed IDs**: Type-safe UUID wrappers for live streams and transcode jobs
//! - **Core Types**: Media source descriptors and the protocols a source can use
//! - **Path Utilities**: Deterministic temp-file naming for rotating segment files
//! - **Error Handling**: Common error types and result aliases
//!
//! # Examples
//!
//! ```
//! use tunerflow_common::{LiveStreamId, MediaProtocol, Error, Result};
//! use tunerflow_common::paths::segment_path;
//! use std::path::Path;
//!
//! let id = LiveStreamId::new();
//! let first = segment_path(Path::new("/tmp/transcodes"), &id, "ts", 0);
//! assert!(first.to_string_lossy().ends_with(".ts"));
//!
//! let protocol = MediaProtocol::Http;
//! assert_eq!(protocol.to_string(), "http");
//!
//! fn example() -> Result<()> {
//!     Err(Error::not_found("stream"))
//! }
//! ```

pub mod error;
pub mod ids;
pub mod paths;
pub mod types;

pub use error::{Error, Result};
pub use ids::*;
pub use types::*;
