//! A single open live source and the segment files it feeds.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tunerflow_common::{LiveStreamId, MediaSourceInfo};

use super::copier::{CopierSettings, CopyOptions, CopyReport, ProducerState, SegmentFileCopier};
use super::segments::{delete_with_retry, CleanupSettings, SegmentFileSet, SegmentWriter};
use super::source::{LiveSource, SourceConnection};
use super::{LiveStreamError, SharingKey};
use crate::config::LiveTvConfig;

/// Lifecycle of a [`TunerStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

/// Sent on the registry's completion channel when a stream starts closing.
#[derive(Debug, Clone)]
pub struct StreamClosed {
    pub id: LiveStreamId,
    pub key: Option<SharingKey>,
}

/// Sending half of the completion channel handed to each stream.
#[derive(Debug, Clone)]
pub struct CloseNotifier {
    tx: mpsc::UnboundedSender<StreamClosed>,
}

impl CloseNotifier {
    pub fn new(tx: mpsc::UnboundedSender<StreamClosed>) -> Self {
        Self { tx }
    }

    fn notify(&self, msg: StreamClosed) {
        // Receiver gone means the registry was dropped; nothing to tell.
        let _ = self.tx.send(msg);
    }
}

/// Per-stream settings derived from `[live_tv]`.
#[derive(Debug, Clone)]
pub struct LiveStreamSettings {
    pub temp_dir: PathBuf,
    pub extension: String,
    pub segment_max_bytes: u64,
    pub copier: CopierSettings,
    pub cleanup: CleanupSettings,
}

impl From<&LiveTvConfig> for LiveStreamSettings {
    fn from(cfg: &LiveTvConfig) -> Self {
        Self {
            temp_dir: cfg.transcode_temp_dir.clone(),
            extension: cfg.segment_extension.clone(),
            segment_max_bytes: cfg.segment_max_bytes,
            copier: CopierSettings::from(&cfg.copier),
            cleanup: CleanupSettings::from(&cfg.cleanup),
        }
    }
}

impl Default for LiveStreamSettings {
    fn default() -> Self {
        Self::from(&LiveTvConfig::default())
    }
}

/// What to open.
#[derive(Debug, Clone)]
pub struct LiveStreamOptions {
    pub source: LiveSource,
    pub media_source: MediaSourceInfo,
    pub key: Option<SharingKey>,
    pub enable_sharing: bool,
    pub tuner_host_id: Option<String>,
    pub tuner_device_id: Option<String>,
}

/// Serializable snapshot for the API.
#[derive(Debug, Clone, Serialize)]
pub struct LiveStreamInfo {
    pub id: LiveStreamId,
    pub key: Option<String>,
    pub state: StreamState,
    pub consumer_count: u32,
    pub enable_sharing: bool,
    pub tuner_host_id: Option<String>,
    pub tuner_device_id: Option<String>,
    pub opened_at: Option<DateTime<Utc>>,
    pub segment_count: usize,
    pub media_source: MediaSourceInfo,
}

#[derive(Debug, Clone, Copy)]
struct OpenedAt {
    instant: Instant,
    utc: DateTime<Utc>,
}

/// One live source connection, written to rotating temp segments and
/// read back by any number of consumers.
pub struct TunerStream {
    id: LiveStreamId,
    key: Option<SharingKey>,
    source: LiveSource,
    media_source: MediaSourceInfo,
    tuner_host_id: Option<String>,
    tuner_device_id: Option<String>,
    enable_sharing: AtomicBool,
    consumers: AtomicU32,
    state: watch::Sender<StreamState>,
    opened_at: Mutex<Option<OpenedAt>>,
    segments: Arc<SegmentFileSet>,
    cancel: CancellationToken,
    ingest_done: AtomicBool,
    ingest: Mutex<Option<JoinHandle<()>>>,
    notifier: Option<CloseNotifier>,
    settings: LiveStreamSettings,
    http: reqwest::Client,
}

impl TunerStream {
    pub fn new(
        options: LiveStreamOptions,
        settings: LiveStreamSettings,
        http: reqwest::Client,
        notifier: Option<CloseNotifier>,
    ) -> Arc<Self> {
        let id = LiveStreamId::new();
        let segments = Arc::new(SegmentFileSet::new(
            settings.temp_dir.clone(),
            id,
            settings.extension.clone(),
        ));
        let (state, _) = watch::channel(StreamState::Created);

        Arc::new(Self {
            id,
            key: options.key,
            source: options.source,
            media_source: options.media_source,
            tuner_host_id: options.tuner_host_id,
            tuner_device_id: options.tuner_device_id,
            enable_sharing: AtomicBool::new(options.enable_sharing),
            consumers: AtomicU32::new(0),
            state,
            opened_at: Mutex::new(None),
            segments,
            cancel: CancellationToken::new(),
            ingest_done: AtomicBool::new(false),
            ingest: Mutex::new(None),
            notifier,
            settings,
            http,
        })
    }

    pub fn id(&self) -> LiveStreamId {
        self.id
    }

    pub fn key(&self) -> Option<&SharingKey> {
        self.key.as_ref()
    }

    pub fn media_source(&self) -> &MediaSourceInfo {
        &self.media_source
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Open and still receiving from the source.
    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open && !self.ingest_done.load(Ordering::SeqCst)
    }

    pub fn is_sharing_enabled(&self) -> bool {
        self.enable_sharing.load(Ordering::SeqCst)
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumers.load(Ordering::SeqCst)
    }

    pub fn add_consumer(&self) -> u32 {
        self.consumers.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Returns the remaining count; never goes below zero.
    pub fn remove_consumer(&self) -> u32 {
        let previous = self
            .consumers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn segments(&self) -> &SegmentFileSet {
        &self.segments
    }

    pub fn opened_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at.lock().map(|o| o.utc)
    }

    /// Connect to the source and start writing segments.
    pub async fn open(self: &Arc<Self>, timeout: Duration) -> Result<(), LiveStreamError> {
        let started = self.state.send_if_modified(|s| {
            if *s == StreamState::Created {
                *s = StreamState::Opening;
                true
            } else {
                false
            }
        });
        if !started {
            return match self.state() {
                StreamState::Open => Ok(()),
                _ => Err(LiveStreamError::Closed),
            };
        }

        tracing::debug!(stream_id = %self.id, source = %self.source, "Opening live stream");

        let connect = tokio::time::timeout(timeout, self.source.connect(&self.http));
        let connected = tokio::select! {
            _ = self.cancel.cancelled() => Err(LiveStreamError::Closed),
            r = connect => match r {
                Ok(r) => r,
                Err(_) => Err(LiveStreamError::SourceUnavailable(format!(
                    "{} did not respond within {:?}",
                    self.source, timeout
                ))),
            },
        };

        let connection = match connected {
            Ok(c) => c,
            Err(e) => {
                self.abandon_open(None, None).await;
                return Err(e);
            }
        };

        let writer = match SegmentWriter::create(Arc::clone(&self.segments), self.settings.segment_max_bytes).await {
            Ok(w) => w,
            Err(e) => {
                self.abandon_open(Some(connection), None).await;
                return Err(e.into());
            }
        };

        let mut pending = Some((connection, writer));
        let now_open = {
            // Held across the transition so close() always finds the ingest handle.
            let mut ingest = self.ingest.lock();
            let now_open = self.state.send_if_modified(|s| {
                if *s == StreamState::Opening {
                    *s = StreamState::Open;
                    true
                } else {
                    false
                }
            });
            if now_open {
                *self.opened_at.lock() = Some(OpenedAt {
                    instant: Instant::now(),
                    utc: Utc::now(),
                });
                if let Some((connection, writer)) = pending.take() {
                    let stream = Arc::clone(self);
                    *ingest = Some(tokio::spawn(async move { stream.run_ingest(connection, writer).await }));
                }
            }
            now_open
        };

        if !now_open {
            // Closed while we were connecting.
            if let Some((connection, writer)) = pending {
                self.abandon_open(Some(connection), Some(writer)).await;
            }
            return Err(LiveStreamError::Closed);
        }

        tracing::info!(
            stream_id = %self.id,
            source = %self.source,
            sharing = self.is_sharing_enabled(),
            "Live stream opened"
        );
        Ok(())
    }

    async fn abandon_open(&self, connection: Option<SourceConnection>, writer: Option<SegmentWriter>) {
        if let Some(connection) = connection {
            connection.release().await;
        }
        if let Some(writer) = writer {
            let _ = writer.finish().await;
        }
        self.enable_sharing.store(false, Ordering::SeqCst);
        self.state.send_replace(StreamState::Closed);
        self.remove_segments().await;
    }

    async fn run_ingest(self: Arc<Self>, mut connection: SourceConnection, mut writer: SegmentWriter) {
        let mut written = 0u64;

        let result = loop {
            let chunk = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break Ok(()),
                c = connection.next_chunk() => c,
            };
            match chunk {
                Ok(Some(data)) => {
                    if let Err(e) = writer.write_chunk(&data).await {
                        break Err(LiveStreamError::Io(e));
                    }
                    written += data.len() as u64;
                }
                Ok(None) => {
                    tracing::info!(stream_id = %self.id, bytes = written, "Live source reached end of stream");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        connection.release().await;
        if let Err(e) = writer.finish().await {
            tracing::debug!(stream_id = %self.id, "Failed to flush final segment: {}", e);
        }
        self.ingest_done.store(true, Ordering::SeqCst);

        if let Err(e) = result {
            tracing::error!(stream_id = %self.id, bytes = written, "Live stream ingestion failed: {}", e);
            self.close();
        } else {
            tracing::debug!(stream_id = %self.id, bytes = written, "Ingestion stopped");
        }
    }

    /// Stop ingestion, cancel every reader and schedule temp-file removal.
    ///
    /// Safe to call any number of times.
    pub fn close(self: &Arc<Self>) {
        let closing = self.state.send_if_modified(|s| match s {
            StreamState::Closing | StreamState::Closed => false,
            _ => {
                *s = StreamState::Closing;
                true
            }
        });
        if !closing {
            return;
        }

        self.enable_sharing.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        if let Some(notifier) = &self.notifier {
            notifier.notify(StreamClosed {
                id: self.id,
                key: self.key.clone(),
            });
        }

        tracing::info!(stream_id = %self.id, "Closing live stream");

        let ingest = self.ingest.lock().take();
        let stream = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(handle) = ingest {
                if let Err(e) = handle.await {
                    tracing::warn!(stream_id = %stream.id, "Ingestion task ended abnormally: {}", e);
                }
            }
            stream.state.send_replace(StreamState::Closed);
            let total = stream.segments.len();
            let removed = stream.remove_segments().await;
            tracing::debug!(stream_id = %stream.id, removed, total, "Live stream closed");
        });
    }

    /// Resolves once the stream is `Closed` and its files have been handed to deletion.
    pub async fn wait_closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == StreamState::Closed).await;
    }

    /// Delete every segment file. Only acts once the stream is `Closed`.
    pub async fn delete_temp_files(&self) -> usize {
        if self.state() != StreamState::Closed {
            tracing::debug!(stream_id = %self.id, state = ?self.state(), "Not deleting files of a live stream");
            return 0;
        }
        self.remove_segments().await
    }

    async fn remove_segments(&self) -> usize {
        delete_with_retry(&self.segments.paths(), self.settings.cleanup).await
    }

    /// Copy the live data into `sink` until end of stream, close or `cancel`.
    pub async fn copy_to<W>(
        &self,
        sink: &mut W,
        options: CopyOptions,
        cancel: &CancellationToken,
    ) -> io::Result<CopyReport>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let token = self.cancel.child_token();
        let opened = self.opened_at.lock().map(|o| o.instant);
        let copier = SegmentFileCopier::new(&self.segments, self, &self.settings.copier).opened_at(opened);

        let copy = copier.copy_to(sink, options, &token);
        tokio::pin!(copy);

        let report = tokio::select! {
            r = &mut copy => r,
            _ = cancel.cancelled() => {
                token.cancel();
                copy.await
            }
        }?;

        tracing::debug!(
            stream_id = %self.id,
            outcome = ?report.outcome,
            bytes = report.bytes_copied,
            segments = report.segments_read,
            "Live copy finished"
        );
        Ok(report)
    }

    pub fn info(&self) -> LiveStreamInfo {
        LiveStreamInfo {
            id: self.id,
            key: self.key.as_ref().map(|k| k.to_string()),
            state: self.state(),
            consumer_count: self.consumer_count(),
            enable_sharing: self.is_sharing_enabled(),
            tuner_host_id: self.tuner_host_id.clone(),
            tuner_device_id: self.tuner_device_id.clone(),
            opened_at: self.opened_at(),
            segment_count: self.segments.len(),
            media_source: self.media_source.clone(),
        }
    }
}

impl ProducerState for TunerStream {
    fn has_exited(&self) -> bool {
        self.ingest_done.load(Ordering::SeqCst)
            || matches!(self.state(), StreamState::Closing | StreamState::Closed)
    }
}

impl std::fmt::Debug for TunerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunerStream")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}
