//! Sharing-key to open-stream map with per-key reference counting.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tunerflow_common::LiveStreamId;

use super::stream::{CloseNotifier, StreamClosed, TunerStream};
use super::{LiveStreamError, SharingKey};

type Slot = Arc<tokio::sync::Mutex<Option<Arc<TunerStream>>>>;

/// Result of [`StreamSharingRegistry::acquire`].
#[derive(Debug, Clone)]
pub struct Acquired {
    pub stream: Arc<TunerStream>,
    /// True when this call opened the source.
    pub is_new: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Other consumers are still attached.
    Released { remaining: u32 },
    /// That was the last consumer (or the stream was exclusive); it is closing.
    Closed,
    NotFound,
}

struct Registered {
    stream: Arc<TunerStream>,
    shared: bool,
}

/// Owns every open [`TunerStream`].
///
/// Acquires for the same sharing key serialize on that key's slot, so a
/// channel is opened at most once no matter how many requests race for it.
/// Different keys never wait on each other.
pub struct StreamSharingRegistry {
    slots: DashMap<SharingKey, Slot>,
    streams: DashMap<LiveStreamId, Registered>,
    closed_tx: mpsc::UnboundedSender<StreamClosed>,
    closed_rx: Mutex<Option<mpsc::UnboundedReceiver<StreamClosed>>>,
    shutting_down: AtomicBool,
}

impl Default for StreamSharingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSharingRegistry {
    pub fn new() -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        Self {
            slots: DashMap::new(),
            streams: DashMap::new(),
            closed_tx,
            closed_rx: Mutex::new(Some(closed_rx)),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Notifier to hand to streams opened for this registry.
    pub fn notifier(&self) -> CloseNotifier {
        CloseNotifier::new(self.closed_tx.clone())
    }

    /// Attach to the open stream for `key`, or open one with `open`.
    ///
    /// `open` must return an already opened stream. With `enable_sharing`
    /// false a new stream is always opened and never offered to others.
    /// Fails with [`LiveStreamError::Closed`] once [`close_all`] has started.
    ///
    /// [`close_all`]: Self::close_all
    pub async fn acquire<F, Fut>(
        &self,
        key: &SharingKey,
        enable_sharing: bool,
        open: F,
    ) -> Result<Acquired, LiveStreamError>
    where
        F: FnOnce(CloseNotifier) -> Fut,
        Fut: Future<Output = Result<Arc<TunerStream>, LiveStreamError>>,
    {
        if self.is_shutting_down() {
            return Err(LiveStreamError::Closed);
        }

        if !enable_sharing {
            let stream = open(self.notifier()).await?;
            stream.add_consumer();
            self.register(&stream, false);
            self.reject_if_shutting_down(&stream)?;
            tracing::info!(stream_id = %stream.id(), key = %key, "Opened exclusive live stream");
            return Ok(Acquired { stream, is_new: true });
        }

        let slot = Arc::clone(self.slots.entry(key.clone()).or_default().value());
        let mut current = slot.lock().await;
        if self.is_shutting_down() {
            return Err(LiveStreamError::Closed);
        }

        if let Some(existing) = current.as_ref() {
            if existing.is_open() && existing.is_sharing_enabled() {
                let consumers = existing.add_consumer();
                tracing::debug!(stream_id = %existing.id(), key = %key, consumers, "Reusing shared live stream");
                return Ok(Acquired {
                    stream: Arc::clone(existing),
                    is_new: false,
                });
            }
        }

        // Slot lock is held across the open so racing requests wait for it.
        let stream = open(self.notifier()).await?;
        stream.add_consumer();
        self.register(&stream, true);
        self.reject_if_shutting_down(&stream)?;
        *current = Some(Arc::clone(&stream));

        tracing::info!(stream_id = %stream.id(), key = %key, "Opened shared live stream");
        Ok(Acquired { stream, is_new: true })
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Close a stream that finished opening after shutdown began.
    ///
    /// Runs after registration, so a concurrent `close_all` either sees the
    /// stream in the map or has already raised the flag checked here.
    fn reject_if_shutting_down(&self, stream: &Arc<TunerStream>) -> Result<(), LiveStreamError> {
        if !self.is_shutting_down() {
            return Ok(());
        }
        tracing::debug!(stream_id = %stream.id(), "Closing live stream opened during shutdown");
        self.streams.remove(&stream.id());
        stream.close();
        Err(LiveStreamError::Closed)
    }

    fn register(&self, stream: &Arc<TunerStream>, shared: bool) {
        self.streams.insert(
            stream.id(),
            Registered {
                stream: Arc::clone(stream),
                shared,
            },
        );
    }

    /// Detach one consumer; the last one out closes the stream.
    pub async fn release(&self, id: &LiveStreamId) -> ReleaseOutcome {
        let Some((stream, shared)) = self
            .streams
            .get(id)
            .map(|r| (Arc::clone(&r.stream), r.shared))
        else {
            return ReleaseOutcome::NotFound;
        };

        if !shared {
            stream.remove_consumer();
            self.streams.remove(id);
            stream.close();
            return ReleaseOutcome::Closed;
        }

        let slot = stream
            .key()
            .and_then(|key| self.slots.get(key).map(|s| Arc::clone(s.value())));

        let remaining = match &slot {
            Some(slot) => {
                let mut current = slot.lock().await;
                let remaining = stream.remove_consumer();
                if remaining == 0 && current.as_ref().map(|s| s.id()) == Some(stream.id()) {
                    *current = None;
                }
                remaining
            }
            None => stream.remove_consumer(),
        };

        if remaining > 0 {
            tracing::debug!(stream_id = %id, remaining, "Live stream consumer released");
            return ReleaseOutcome::Released { remaining };
        }

        drop(slot);
        self.streams.remove(id);
        if let Some(key) = stream.key() {
            self.prune_slot(key);
        }
        stream.close();
        ReleaseOutcome::Closed
    }

    /// Add a consumer to an already registered stream, by id.
    ///
    /// Used by internal readers such as transcode jobs; each successful call
    /// must be paired with a [`release`](Self::release).
    pub async fn retain(&self, id: &LiveStreamId) -> Result<Arc<TunerStream>, LiveStreamError> {
        let not_found = || LiveStreamError::NotFound(format!("live stream {}", id));
        let (stream, shared) = self
            .streams
            .get(id)
            .map(|r| (Arc::clone(&r.stream), r.shared))
            .ok_or_else(not_found)?;

        let slot = stream
            .key()
            .filter(|_| shared)
            .and_then(|key| self.slots.get(key).map(|s| Arc::clone(s.value())));
        // Serialize with `release` so a stream at zero is not revived.
        let _current = match &slot {
            Some(slot) => Some(slot.lock().await),
            None => None,
        };

        if !stream.is_open() || !self.streams.contains_key(id) {
            return Err(LiveStreamError::Closed);
        }
        let consumers = stream.add_consumer();
        tracing::debug!(stream_id = %id, consumers, "Retained live stream");
        Ok(stream)
    }

    /// Drop the slot for `key` if it is empty and nobody is waiting on it.
    fn prune_slot(&self, key: &SharingKey) {
        self.slots.remove_if(key, |_, slot| {
            Arc::strong_count(slot) == 1 && slot.try_lock().map(|s| s.is_none()).unwrap_or(false)
        });
    }

    pub fn get(&self, id: &LiveStreamId) -> Option<Arc<TunerStream>> {
        self.streams.get(id).map(|r| Arc::clone(&r.stream))
    }

    pub fn list(&self) -> Vec<Arc<TunerStream>> {
        self.streams.iter().map(|r| Arc::clone(&r.stream)).collect()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Close everything and wait for temp files to be removed.
    ///
    /// Later acquires are refused.
    pub async fn close_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let streams = self.list();
        self.streams.clear();
        self.slots.clear();

        for stream in &streams {
            stream.close();
        }
        futures::future::join_all(streams.iter().map(|s| async move {
            s.wait_closed().await;
            s.delete_temp_files().await;
        }))
        .await;

        if !streams.is_empty() {
            tracing::info!(count = streams.len(), "Closed all live streams");
        }
    }

    /// Forget a stream that closed itself (source failure or explicit close).
    async fn forget(&self, event: &StreamClosed) {
        if self.streams.remove(&event.id).is_some() {
            tracing::debug!(stream_id = %event.id, "Removed closed live stream");
        }
        let Some(key) = &event.key else {
            return;
        };
        let slot = self.slots.get(key).map(|s| Arc::clone(s.value()));
        if let Some(slot) = slot {
            {
                let mut current = slot.lock().await;
                if current.as_ref().map(|s| s.id()) == Some(event.id) {
                    *current = None;
                }
            }
            drop(slot);
            self.prune_slot(key);
        }
    }

    /// Take the raw close-event receiver. Only the first caller gets it.
    pub fn take_close_events(&self) -> Option<mpsc::UnboundedReceiver<StreamClosed>> {
        self.closed_rx.lock().take()
    }

    /// Process close events in the background until the registry is dropped.
    pub fn spawn_close_listener(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self.take_close_events()?;
        let registry = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.forget(&event).await;
            }
        }))
    }
}
