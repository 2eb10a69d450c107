//! Single-range HTTP responses over a file that may still be growing.

use axum::http::{header, HeaderName, StatusCode};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tunerflow_common::paths::content_type_for_path;

use crate::live::{CopierSettings, CopyOutcome};
use crate::transcode::{TranscodeJob, TranscodeJobTracker};

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";
const CACHE_CONTROL: &str = "public, max-age=86400";

#[derive(Debug, thiserror::Error)]
pub enum RangeError {
    #[error("No byte range requested")]
    Missing,

    #[error("Malformed range: {0}")]
    Malformed(String),

    #[error("Multiple ranges are not supported")]
    MultipleRanges,

    #[error("Range not satisfiable")]
    Unsatisfiable,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RangeError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Io(e) if e.kind() == io::ErrorKind::NotFound => StatusCode::NOT_FOUND,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::RANGE_NOT_SATISFIABLE,
        }
    }
}

/// One `bytes=start-end` interval. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeSpec {
    /// Parse a `Range` header value.
    ///
    /// Supports formats:
    /// - bytes=0-499
    /// - bytes=500-
    /// - bytes=-500 (last 500 bytes, only when `total` is known)
    pub fn parse(header: &str, total: Option<u64>) -> Result<Self, RangeError> {
        let header = header.trim();
        let spec = header
            .strip_prefix("bytes=")
            .ok_or_else(|| RangeError::Malformed(header.to_string()))?
            .trim();

        if spec.is_empty() {
            return Err(RangeError::Missing);
        }
        if spec.contains(',') {
            return Err(RangeError::MultipleRanges);
        }

        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| RangeError::Malformed(header.to_string()))?;
        let parse = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| RangeError::Malformed(header.to_string()))
        };

        match (start.trim().is_empty(), end.trim().is_empty()) {
            (true, true) => Err(RangeError::Malformed(header.to_string())),
            (true, false) => {
                let suffix = parse(end)?;
                let total = total.ok_or(RangeError::Unsatisfiable)?;
                if suffix == 0 || total == 0 {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(Self {
                    start: total.saturating_sub(suffix),
                    end: Some(total - 1),
                })
            }
            (false, true) => Ok(Self {
                start: parse(start)?,
                end: None,
            }),
            (false, false) => {
                let start = parse(start)?;
                let end = parse(end)?;
                if end < start {
                    return Err(RangeError::Unsatisfiable);
                }
                Ok(Self { start, end: Some(end) })
            }
        }
    }
}

/// How a response ended and how much it sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeReport {
    pub outcome: CopyOutcome,
    pub bytes_written: u64,
}

/// Detaches the reader from the job however the response ends.
struct ReaderGuard<'a> {
    tracker: &'a dyn TranscodeJobTracker,
    job: &'a TranscodeJob,
}

impl<'a> ReaderGuard<'a> {
    fn attach(tracker: &'a dyn TranscodeJobTracker, job: &'a TranscodeJob) -> Self {
        tracker.on_reader_attached(job);
        Self { tracker, job }
    }
}

impl Drop for ReaderGuard<'_> {
    fn drop(&mut self) {
        self.tracker.on_reader_detached(self.job);
    }
}

/// Serves one response for a transcode output (or plain) file.
pub struct RangeResponseWriter {
    path: PathBuf,
    job: Option<Arc<TranscodeJob>>,
    tracker: Option<Arc<dyn TranscodeJobTracker>>,
    settings: CopierSettings,
    partial: bool,
    start: u64,
    /// Inclusive; provisional while the job is still running.
    end: Option<u64>,
    total: Option<u64>,
    content_length: Option<u64>,
    created_at: DateTime<Utc>,
}

impl RangeResponseWriter {
    /// Validate `range_header` against the file and work out the response shape.
    ///
    /// When the job has finished (or there is no job) the on-disk size is the
    /// total. Otherwise the range ends no later than the current size minus
    /// one and the total is reported as unknown.
    pub async fn new(
        range_header: &str,
        path: impl Into<PathBuf>,
        job: Option<Arc<TranscodeJob>>,
        settings: CopierSettings,
    ) -> Result<Self, RangeError> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let current_size = metadata.len();
        let finished = job.as_ref().map_or(true, |j| j.is_finished());
        let total = finished.then_some(current_size);

        let spec = RangeSpec::parse(range_header, total)?;
        let end = match total {
            Some(total) if spec.start >= total => return Err(RangeError::Unsatisfiable),
            Some(total) => spec.end.map_or(total - 1, |end| end.min(total - 1)),
            // Nothing past the live edge has been written yet.
            None if spec.start > current_size => return Err(RangeError::Unsatisfiable),
            None => {
                let provisional = current_size.saturating_sub(1).max(spec.start);
                spec.end.map_or(provisional, |end| end.min(provisional))
            }
        };
        let content_length = (end - spec.start)
            .checked_add(1)
            .ok_or(RangeError::Unsatisfiable)?;

        let created_at = created_at(job.as_deref(), &metadata);
        Ok(Self {
            path,
            job,
            tracker: None,
            settings,
            partial: true,
            start: spec.start,
            end: Some(end),
            total,
            content_length: Some(content_length),
            created_at,
        })
    }

    /// Whole-file response for requests without a `Range` header.
    ///
    /// Unbounded while the job is still running.
    pub async fn full(
        path: impl Into<PathBuf>,
        job: Option<Arc<TranscodeJob>>,
        settings: CopierSettings,
    ) -> Result<Self, RangeError> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path).await?;
        let finished = job.as_ref().map_or(true, |j| j.is_finished());
        let total = finished.then_some(metadata.len());

        let created_at = created_at(job.as_deref(), &metadata);
        Ok(Self {
            path,
            job,
            tracker: None,
            settings,
            partial: false,
            start: 0,
            end: total.map(|t| t.saturating_sub(1)),
            total,
            content_length: total,
            created_at,
        })
    }

    /// Tracker to notify when this response attaches to and leaves the job.
    pub fn with_tracker(mut self, tracker: Arc<dyn TranscodeJobTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn status(&self) -> StatusCode {
        if self.partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> Option<u64> {
        self.end
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn content_range(&self) -> Option<String> {
        if !self.partial {
            return None;
        }
        let end = self.end.unwrap_or(self.start);
        Some(match self.total {
            Some(total) => format!("bytes {}-{}/{}", self.start, end, total),
            None => format!("bytes {}-{}/*", self.start, end),
        })
    }

    pub fn headers(&self) -> Vec<(HeaderName, String)> {
        let mut headers = Vec::with_capacity(9);
        if let Some(range) = self.content_range() {
            headers.push((header::CONTENT_RANGE, range));
        }
        if let Some(length) = self.content_length {
            headers.push((header::CONTENT_LENGTH, length.to_string()));
        }
        headers.push((header::CONTENT_TYPE, content_type_for_path(&self.path).to_string()));
        headers.push((header::ACCEPT_RANGES, "bytes".to_string()));
        headers.push((header::CACHE_CONTROL, CACHE_CONTROL.to_string()));
        headers.push((header::LAST_MODIFIED, self.created_at.format(HTTP_DATE).to_string()));
        headers.push((
            header::EXPIRES,
            (self.created_at + ChronoDuration::days(1)).format(HTTP_DATE).to_string(),
        ));
        if let Some(stem) = self.path.file_stem() {
            headers.push((header::ETAG, format!("\"{}\"", stem.to_string_lossy())));
        }
        headers
    }

    /// Stream the selected bytes into `sink`, tailing the file while the job runs.
    pub async fn write_to<W>(&self, sink: &mut W, cancel: &CancellationToken) -> io::Result<RangeReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let _reader = match (&self.tracker, &self.job) {
            (Some(tracker), Some(job)) => Some(ReaderGuard::attach(tracker.as_ref(), job)),
            _ => None,
        };

        let report = self.copy_loop(sink, cancel).await?;
        match report.outcome {
            CopyOutcome::Disconnected => tracing::debug!(
                path = %self.path.display(),
                bytes = report.bytes_written,
                "Client disconnected from range response"
            ),
            outcome => tracing::debug!(
                path = %self.path.display(),
                bytes = report.bytes_written,
                ?outcome,
                "Range response finished"
            ),
        }
        Ok(report)
    }

    async fn copy_loop<W>(&self, sink: &mut W, cancel: &CancellationToken) -> io::Result<RangeReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut report = RangeReport {
            outcome: CopyOutcome::EndOfStream,
            bytes_written: 0,
        };

        let mut file = File::open(&self.path).await?;
        if self.start > 0 {
            file.seek(SeekFrom::Start(self.start)).await?;
        }

        let mut buf = vec![0u8; self.settings.buffer_size];
        let mut empty_reads = 0u32;

        loop {
            let want = match self.content_length {
                Some(length) => {
                    let remaining = length - report.bytes_written;
                    if remaining == 0 {
                        return Ok(report);
                    }
                    remaining.min(buf.len() as u64) as usize
                }
                None => buf.len(),
            };

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.outcome = CopyOutcome::Cancelled;
                    return Ok(report);
                }
                r = file.read(&mut buf[..want]) => r?,
            };

            if read > 0 {
                empty_reads = 0;
                if let Err(e) = sink.write_all(&buf[..read]).await {
                    if crate::live::is_disconnect(&e) {
                        report.outcome = CopyOutcome::Disconnected;
                        return Ok(report);
                    }
                    return Err(e);
                }
                report.bytes_written += read as u64;
                if let Some(job) = &self.job {
                    job.report_bytes_downloaded(self.start.saturating_add(report.bytes_written));
                }
                continue;
            }

            let Some(job) = &self.job else {
                // Plain file: EOF is final.
                return Ok(report);
            };

            empty_reads += 1;
            if empty_reads >= self.settings.empty_read_limit(true, job.has_exited()) {
                return Ok(report);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    report.outcome = CopyOutcome::Cancelled;
                    return Ok(report);
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }
}

fn created_at(job: Option<&TranscodeJob>, metadata: &std::fs::Metadata) -> DateTime<Utc> {
    match job {
        Some(job) => job.created_at(),
        None => metadata.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now()),
    }
}
