//! Live stream acquisition and fan-out.
//!
//! A live source (tuner or channel URL) is opened once and its transport
//! stream is written to a rotating sequence of temp segment files. Any number
//! of HTTP consumers then read from those files independently.
//!
//! - [`TunerStream`]: one open source connection plus its segment files
//! - [`StreamSharingRegistry`]: maps sharing keys to open streams, refcounted
//! - [`SegmentFileCopier`]: tails the segment files into an output sink
//! - [`LiveSource`]: the closed set of source variants

mod copier;
mod registry;
mod segments;
mod source;
mod stream;

pub(crate) use copier::is_disconnect;
pub use copier::{CopierSettings, CopyOptions, CopyOutcome, CopyReport, ProducerState, SegmentFileCopier};
pub use registry::{Acquired, ReleaseOutcome, StreamSharingRegistry};
pub use segments::{delete_with_retry, CleanupSettings, SegmentFileSet, SegmentWriter};
pub use source::{LiveSource, SourceConnection};
pub use stream::{
    CloseNotifier, LiveStreamInfo, LiveStreamOptions, LiveStreamSettings, StreamClosed, StreamState,
    TunerStream,
};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tuners::TunerError;

/// Key under which one open stream may be shared by several consumers.
///
/// Built from the tuner (or source) identity plus the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharingKey {
    pub source: String,
    pub channel: String,
}

impl SharingKey {
    pub fn new(source: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            channel: channel.into(),
        }
    }
}

impl fmt::Display for SharingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.channel)
    }
}

/// Error type for live stream operations.
#[derive(Debug, thiserror::Error)]
pub enum LiveStreamError {
    /// The device could not be reached (network error or open timeout).
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// The device is reachable but has no free tuner.
    #[error("Source busy: {0}")]
    SourceBusy(String),

    /// The source description cannot be opened at all.
    #[error("Invalid source: {0}")]
    InvalidSource(String),

    /// The stream was closed (or is closing) and cannot be used.
    #[error("Stream closed")]
    Closed,

    /// No stream with this id is registered.
    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TunerError> for LiveStreamError {
    fn from(err: TunerError) -> Self {
        match err {
            TunerError::NoFreeTuner(msg) => Self::SourceBusy(msg),
            TunerError::ChannelNotFound(msg) | TunerError::UnknownTuner(msg) => Self::InvalidSource(msg),
            other => Self::SourceUnavailable(other.to_string()),
        }
    }
}
