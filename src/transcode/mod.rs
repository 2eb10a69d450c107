//! Transcode jobs: encoder processes producing growing output files.
//!
//! Range responses and copiers only need the [`TranscodeJobTracker`] view of
//! a job: whether it exited, how far along it is, and a hook to report
//! readers coming and going. [`JobRegistry`] is the in-process tracker that
//! also launches ffmpeg and reaps idle jobs.

pub mod ffmpeg;
mod job;
mod registry;

pub use job::{TranscodeJob, TranscodeJobInfo};
pub use registry::{start_reaper, JobRegistry, TranscodeSettings};

use std::sync::Arc;
use tunerflow_common::TranscodeJobId;

/// What the streaming side needs from whoever owns the encoder processes.
pub trait TranscodeJobTracker: Send + Sync {
    fn get(&self, id: &TranscodeJobId) -> Option<Arc<TranscodeJob>>;

    /// A response started reading the job's output.
    fn on_reader_attached(&self, job: &TranscodeJob);

    /// A response finished, failed or was cancelled. Called exactly once per attach.
    fn on_reader_detached(&self, job: &TranscodeJob);
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Encoder not found: {0}")]
    EncoderNotFound(String),

    #[error("Failed to start encoder: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Transcode job not found: {0}")]
    NotFound(String),

    #[error("Source stream unavailable: {0}")]
    Source(#[from] crate::live::LiveStreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
