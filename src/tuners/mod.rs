//! Tuner hosts: channel lineups and resolving a channel to a live source.
//!
//! Each configured `[[live_tv.tuners]]` entry becomes a [`TunerHost`]:
//! an HDHomeRun (HTTP streaming), a legacy HDHomeRun (control protocol +
//! UDP) or an M3U playlist.

pub mod control;
pub mod hdhomerun;
pub mod m3u;

pub use hdhomerun::{DeviceInfo, HdHomeRunClient, HdHomeRunHost, LineupEntry};
pub use m3u::M3uHost;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tunerflow_common::MediaSourceInfo;

use crate::config::{LiveTvConfig, TunerHostConfig, TunerKind};
use crate::live::{LiveSource, SharingKey};

#[derive(Debug, thiserror::Error)]
pub enum TunerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error message returned by the device itself.
    #[error("Device error: {0}")]
    Device(String),

    #[error("No free tuner: {0}")]
    NoFreeTuner(String),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Unknown tuner: {0}")]
    UnknownTuner(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination URL a legacy tuner streams to.
pub fn udp_target(host: &str, port: u16) -> String {
    format!("udp://{}:{}", host, port)
}

/// A channel as listed by a tuner host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelInfo {
    pub number: String,
    pub name: String,
    pub url: Option<String>,
    pub video_codec: Option<String>,
    pub audio_codec: Option<String>,
    pub hd: bool,
}

/// Everything needed to acquire a live stream for one channel.
#[derive(Debug, Clone)]
pub struct ResolvedChannel {
    pub source: LiveSource,
    pub media_source: MediaSourceInfo,
    pub key: SharingKey,
    pub enable_sharing: bool,
    pub tuner_host_id: String,
    pub device_id: Option<String>,
}

/// Common trait for tuner hosts
#[async_trait]
pub trait TunerHost: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> TunerKind;

    /// Current channel lineup
    async fn channels(&self) -> Result<Vec<ChannelInfo>, TunerError>;

    /// Resolve a channel number to an openable source
    async fn resolve(&self, channel: &str) -> Result<ResolvedChannel, TunerError>;
}

/// Create the host implementation for a config entry
pub fn create_host(config: &TunerHostConfig, http: Client) -> Arc<dyn TunerHost> {
    match config.kind {
        TunerKind::Hdhomerun | TunerKind::HdhomerunLegacy => Arc::new(HdHomeRunHost::new(config, http)),
        TunerKind::M3u => Arc::new(M3uHost::new(config, http)),
    }
}

/// Summary of a configured host for the API.
#[derive(Debug, Clone, Serialize)]
pub struct TunerHostSummary {
    pub id: String,
    pub kind: TunerKind,
}

/// All configured tuner hosts.
#[derive(Clone, Default)]
pub struct TunerManager {
    hosts: Vec<Arc<dyn TunerHost>>,
}

impl TunerManager {
    pub fn from_config(config: &LiveTvConfig, http: Client) -> Self {
        let hosts = config
            .tuners
            .iter()
            .map(|t| create_host(t, http.clone()))
            .collect();
        Self { hosts }
    }

    pub fn with_hosts(hosts: Vec<Arc<dyn TunerHost>>) -> Self {
        Self { hosts }
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn TunerHost>, TunerError> {
        self.hosts
            .iter()
            .find(|h| h.id() == id)
            .cloned()
            .ok_or_else(|| TunerError::UnknownTuner(id.to_string()))
    }

    pub fn summaries(&self) -> Vec<TunerHostSummary> {
        self.hosts
            .iter()
            .map(|h| TunerHostSummary {
                id: h.id().to_string(),
                kind: h.kind(),
            })
            .collect()
    }

    pub async fn lineup(&self, id: &str) -> Result<Vec<ChannelInfo>, TunerError> {
        self.get(id)?.channels().await
    }

    pub async fn resolve(&self, id: &str, channel: &str) -> Result<ResolvedChannel, TunerError> {
        let resolved = self.get(id)?.resolve(channel).await?;
        tracing::debug!(tuner = id, channel, source = %resolved.source, "Resolved channel");
        Ok(resolved)
    }
}
