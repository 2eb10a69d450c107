//! A running (or finished) encoder process and its progress counters.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tunerflow_common::{LiveStreamId, TranscodeJobId};

use crate::live::ProducerState;

/// Completion above this counts as done.
const FINISHED_PERCENT: f64 = 99.0;

/// Encoder job writing a growing output file.
#[derive(Debug)]
pub struct TranscodeJob {
    id: TranscodeJobId,
    output_path: PathBuf,
    created_at: DateTime<Utc>,
    source_stream: Option<LiveStreamId>,
    run_time_ticks: Option<i64>,
    has_exited: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    completion: Mutex<Option<f64>>,
    bytes_downloaded: AtomicU64,
    bytes_reported: AtomicBool,
    active_readers: AtomicU32,
    last_activity: Mutex<Instant>,
    kill: CancellationToken,
}

impl TranscodeJob {
    pub fn new(id: TranscodeJobId, output_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            output_path: output_path.into(),
            created_at: Utc::now(),
            source_stream: None,
            run_time_ticks: None,
            has_exited: AtomicBool::new(false),
            exit_code: Mutex::new(None),
            completion: Mutex::new(None),
            bytes_downloaded: AtomicU64::new(0),
            bytes_reported: AtomicBool::new(false),
            active_readers: AtomicU32::new(0),
            last_activity: Mutex::new(Instant::now()),
            kill: CancellationToken::new(),
        }
    }

    pub fn with_source_stream(mut self, stream: LiveStreamId) -> Self {
        self.source_stream = Some(stream);
        self
    }

    /// Known input duration in 100ns ticks.
    pub fn with_run_time_ticks(mut self, ticks: Option<i64>) -> Self {
        self.run_time_ticks = ticks;
        self
    }

    pub fn id(&self) -> TranscodeJobId {
        self.id
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source_stream(&self) -> Option<LiveStreamId> {
        self.source_stream
    }

    pub fn run_time_ticks(&self) -> Option<i64> {
        self.run_time_ticks
    }

    pub fn has_exited(&self) -> bool {
        self.has_exited.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock()
    }

    pub fn mark_exited(&self, code: Option<i32>) {
        *self.exit_code.lock() = code;
        self.has_exited.store(true, Ordering::SeqCst);
    }

    pub fn completion_percentage(&self) -> Option<f64> {
        *self.completion.lock()
    }

    pub fn set_completion(&self, percent: f64) {
        *self.completion.lock() = Some(percent.clamp(0.0, 100.0));
    }

    /// Exited with (nearly) everything written: the file size is final.
    pub fn is_finished(&self) -> bool {
        self.has_exited() && self.completion_percentage().is_some_and(|p| p > FINISHED_PERCENT)
    }

    pub fn bytes_downloaded(&self) -> Option<u64> {
        self.bytes_reported
            .load(Ordering::SeqCst)
            .then(|| self.bytes_downloaded.load(Ordering::SeqCst))
    }

    /// Record cumulative bytes served. Never decreases; returns the current value.
    pub fn report_bytes_downloaded(&self, bytes: u64) -> u64 {
        let previous = self.bytes_downloaded.fetch_max(bytes, Ordering::SeqCst);
        self.bytes_reported.store(true, Ordering::SeqCst);
        previous.max(bytes)
    }

    pub fn active_readers(&self) -> u32 {
        self.active_readers.load(Ordering::SeqCst)
    }

    pub(crate) fn reader_attached(&self) -> u32 {
        self.touch();
        self.active_readers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reader_detached(&self) -> u32 {
        self.touch();
        let previous = self
            .active_readers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    /// Fires when the job should stop its encoder.
    pub fn kill_token(&self) -> &CancellationToken {
        &self.kill
    }

    pub fn kill(&self) {
        self.kill.cancel();
    }

    pub fn info(&self) -> TranscodeJobInfo {
        TranscodeJobInfo {
            id: self.id,
            output_path: self.output_path.clone(),
            created_at: self.created_at,
            source_stream: self.source_stream,
            has_exited: self.has_exited(),
            exit_code: self.exit_code(),
            completion_percentage: self.completion_percentage(),
            bytes_downloaded: self.bytes_downloaded(),
            active_readers: self.active_readers(),
        }
    }
}

impl ProducerState for TranscodeJob {
    fn has_exited(&self) -> bool {
        TranscodeJob::has_exited(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeJobInfo {
    pub id: TranscodeJobId,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub source_stream: Option<LiveStreamId>,
    pub has_exited: bool,
    pub exit_code: Option<i32>,
    pub completion_percentage: Option<f64>,
    pub bytes_downloaded: Option<u64>,
    pub active_readers: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_finished_requires_exit_and_completion() {
        let job = TranscodeJob::new(TranscodeJobId::new(), "/tmp/x.ts");
        assert!(!job.is_finished());

        job.set_completion(100.0);
        assert!(!job.is_finished());

        job.mark_exited(Some(0));
        assert!(job.is_finished());
        assert_eq!(job.exit_code(), Some(0));

        let partial = TranscodeJob::new(TranscodeJobId::new(), "/tmp/y.ts");
        partial.set_completion(42.0);
        partial.mark_exited(Some(1));
        assert!(!partial.is_finished());
    }

    #[test]
    fn test_bytes_downloaded_is_monotonic() {
        let job = TranscodeJob::new(TranscodeJobId::new(), "/tmp/x.ts");
        assert_eq!(job.bytes_downloaded(), None);

        assert_eq!(job.report_bytes_downloaded(500), 500);
        assert_eq!(job.report_bytes_downloaded(200), 500);
        assert_eq!(job.bytes_downloaded(), Some(500));
    }

    #[test]
    fn test_concurrent_reports_never_decrease() {
        let job = Arc::new(TranscodeJob::new(TranscodeJobId::new(), "/tmp/x.ts"));

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let job = Arc::clone(&job);
                std::thread::spawn(move || {
                    let mut last_seen = 0;
                    for i in 0..1000u64 {
                        // Interleaved, out-of-order reports from each thread.
                        let value = if i % 2 == 0 { i * 8 + t } else { i };
                        job.report_bytes_downloaded(value);
                        let now = job.bytes_downloaded().unwrap();
                        assert!(now >= last_seen);
                        last_seen = now;
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(job.bytes_downloaded(), Some(998 * 8 + 7));
    }

    #[test]
    fn test_reader_count_saturates() {
        let job = TranscodeJob::new(TranscodeJobId::new(), "/tmp/x.ts");
        assert_eq!(job.reader_attached(), 1);
        assert_eq!(job.reader_detached(), 0);
        assert_eq!(job.reader_detached(), 0);
    }
}
