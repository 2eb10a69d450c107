//! Tailing copy from rotating segment files into an output sink.

use std::io::{self, SeekFrom};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::segments::SegmentFileSet;
use crate::config::CopierConfig;

/// Tells a copy loop whether more data can still arrive.
pub trait ProducerState: Send + Sync {
    /// True once the producer (tuner ingestion, encoder) will write nothing more.
    fn has_exited(&self) -> bool;
}

/// Tuning knobs for the copy loops.
#[derive(Debug, Clone)]
pub struct CopierSettings {
    pub buffer_size: usize,
    pub poll_interval: Duration,
    pub last_segment_empty_read_limit: u32,
    pub sealed_segment_empty_read_limit: u32,
    pub exited_empty_read_limit: u32,
    pub late_join_after: Duration,
    pub late_join_seek_back: u64,
}

impl From<&CopierConfig> for CopierSettings {
    fn from(cfg: &CopierConfig) -> Self {
        Self {
            buffer_size: cfg.buffer_size.max(1),
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
            last_segment_empty_read_limit: cfg.last_segment_empty_read_limit.max(1),
            sealed_segment_empty_read_limit: cfg.sealed_segment_empty_read_limit.max(1),
            exited_empty_read_limit: cfg.exited_empty_read_limit.max(1),
            late_join_after: Duration::from_secs(cfg.late_join_after_secs),
            late_join_seek_back: cfg.late_join_seek_back_bytes,
        }
    }
}

impl Default for CopierSettings {
    fn default() -> Self {
        Self::from(&CopierConfig::default())
    }
}

impl CopierSettings {
    /// Empty-read patience for the file currently being read.
    pub(crate) fn empty_read_limit(&self, is_last: bool, producer_exited: bool) -> u32 {
        if !is_last {
            self.sealed_segment_empty_read_limit
        } else if producer_exited {
            self.exited_empty_read_limit
        } else {
            self.last_segment_empty_read_limit
        }
    }
}

/// Per-consumer options.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    /// Start from the first segment instead of the most recent one.
    pub from_beginning: bool,
}

/// Why a copy loop stopped. None of these are failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The producer is done and the data ran out.
    EndOfStream,
    /// The cancellation token fired.
    Cancelled,
    /// The sink went away (client disconnected).
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyReport {
    pub outcome: CopyOutcome,
    pub bytes_copied: u64,
    pub segments_read: usize,
    /// Consecutive zero-byte reads seen right before stopping.
    pub trailing_empty_reads: u32,
}

pub(crate) fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted
    )
}

/// Result of draining one file.
enum FileEnd {
    Exhausted(u32),
    Stopped(CopyOutcome),
}

/// Copies from a segment set into a sink, following rotation.
pub struct SegmentFileCopier<'a> {
    segments: &'a SegmentFileSet,
    producer: &'a dyn ProducerState,
    settings: &'a CopierSettings,
    opened_at: Option<Instant>,
}

impl<'a> SegmentFileCopier<'a> {
    pub fn new(
        segments: &'a SegmentFileSet,
        producer: &'a dyn ProducerState,
        settings: &'a CopierSettings,
    ) -> Self {
        Self {
            segments,
            producer,
            settings,
            opened_at: None,
        }
    }

    /// When the stream opened; enables the late-join seek back.
    pub fn opened_at(mut self, opened_at: Option<Instant>) -> Self {
        self.opened_at = opened_at;
        self
    }

    pub async fn copy_to<W>(
        &self,
        sink: &mut W,
        options: CopyOptions,
        cancel: &CancellationToken,
    ) -> io::Result<CopyReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut report = CopyReport {
            outcome: CopyOutcome::EndOfStream,
            bytes_copied: 0,
            segments_read: 0,
            trailing_empty_reads: 0,
        };

        let Some(mut index) = self.wait_for_first_segment(cancel, &mut report).await else {
            return Ok(report);
        };
        if options.from_beginning {
            index = 0;
        }

        let mut seek_back = !options.from_beginning
            && self
                .opened_at
                .map(|t| t.elapsed() > self.settings.late_join_after)
                .unwrap_or(false);

        let mut buf = vec![0u8; self.settings.buffer_size];

        loop {
            let Some(path) = self.segments.get(index) else {
                return Ok(report);
            };

            let mut file = match File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    // Deleted underneath us; the stream is being torn down.
                    tracing::debug!(segment = %path.display(), "Segment disappeared");
                    return Ok(report);
                }
                Err(e) => return Err(e),
            };

            if seek_back {
                let len = file.metadata().await?.len();
                let pos = len.saturating_sub(self.settings.late_join_seek_back);
                file.seek(SeekFrom::Start(pos)).await?;
                seek_back = false;
            }

            report.segments_read += 1;
            match self
                .drain_file(&mut file, index, sink, &mut buf, cancel, &mut report)
                .await?
            {
                FileEnd::Stopped(outcome) => {
                    report.outcome = outcome;
                    return Ok(report);
                }
                FileEnd::Exhausted(empty_reads) => {
                    report.trailing_empty_reads = empty_reads;
                    // The list is re-read so segments created by rotation are seen.
                    if index + 1 < self.segments.len() {
                        index += 1;
                    } else {
                        report.outcome = CopyOutcome::EndOfStream;
                        return Ok(report);
                    }
                }
            }
        }
    }

    async fn wait_for_first_segment(
        &self,
        cancel: &CancellationToken,
        report: &mut CopyReport,
    ) -> Option<usize> {
        let mut empty_polls = 0u32;
        loop {
            let len = self.segments.len();
            if len > 0 {
                return Some(len - 1);
            }
            empty_polls += 1;
            let limit = self.settings.empty_read_limit(true, self.producer.has_exited());
            if empty_polls >= limit {
                report.trailing_empty_reads = empty_polls;
                return None;
            }
            if !self.pause(cancel).await {
                report.outcome = CopyOutcome::Cancelled;
                return None;
            }
        }
    }

    async fn drain_file<W>(
        &self,
        file: &mut File,
        index: usize,
        sink: &mut W,
        buf: &mut [u8],
        cancel: &CancellationToken,
        report: &mut CopyReport,
    ) -> io::Result<FileEnd>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut empty_reads = 0u32;

        loop {
            // Sampled before reading: an empty read only proves EOF on a
            // segment that was already sealed when the read started.
            let is_last = index + 1 >= self.segments.len();
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(FileEnd::Stopped(CopyOutcome::Cancelled)),
                r = file.read(buf) => r?,
            };

            if read > 0 {
                empty_reads = 0;
                if let Err(e) = sink.write_all(&buf[..read]).await {
                    if is_disconnect(&e) {
                        return Ok(FileEnd::Stopped(CopyOutcome::Disconnected));
                    }
                    return Err(e);
                }
                report.bytes_copied += read as u64;
                continue;
            }

            empty_reads += 1;
            let limit = self
                .settings
                .empty_read_limit(is_last, self.producer.has_exited());
            if empty_reads >= limit {
                return Ok(FileEnd::Exhausted(empty_reads));
            }

            if !self.pause(cancel).await {
                return Ok(FileEnd::Stopped(CopyOutcome::Cancelled));
            }
        }
    }

    /// Sleep one poll interval. Returns false if cancelled meanwhile.
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.settings.poll_interval) => true,
        }
    }
}
