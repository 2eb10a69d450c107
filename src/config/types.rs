use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub live_tv: LiveTvConfig,

    #[serde(default)]
    pub transcoding: TranscodingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// Base URL the server can use to reach itself (e.g. for encoder input).
    pub fn loopback_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LiveTvConfig {
    /// Directory receiving segment files and transcode output.
    #[serde(default = "default_temp_dir")]
    pub transcode_temp_dir: PathBuf,

    #[serde(default = "default_segment_extension")]
    pub segment_extension: String,

    /// Rotate to a new segment file once the active one exceeds this size.
    /// Zero disables rotation.
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,

    #[serde(default = "default_open_timeout")]
    pub open_timeout_secs: u64,

    #[serde(default)]
    pub tuners: Vec<TunerHostConfig>,

    #[serde(default)]
    pub copier: CopierConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("tunerflow").join("transcodes")
}
fn default_segment_extension() -> String {
    "ts".to_string()
}
fn default_segment_max_bytes() -> u64 {
    512 * 1024 * 1024
}
fn default_open_timeout() -> u64 {
    20
}

impl Default for LiveTvConfig {
    fn default() -> Self {
        Self {
            transcode_temp_dir: default_temp_dir(),
            segment_extension: default_segment_extension(),
            segment_max_bytes: default_segment_max_bytes(),
            open_timeout_secs: default_open_timeout(),
            tuners: Vec::new(),
            copier: CopierConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl LiveTvConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn tuner(&self, id: &str) -> Option<&TunerHostConfig> {
        self.tuners.iter().find(|t| t.id == id)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunerHostConfig {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: TunerKind,

    /// Device base URL (HDHomeRun) or playlist location (M3U).
    pub url: String,

    /// Allow several playback sessions to share one tuner connection.
    #[serde(default = "default_enable_sharing")]
    pub enable_stream_sharing: bool,

    /// Override the tuner count reported by discovery.
    #[serde(default)]
    pub tuner_count: Option<u32>,
}

fn default_enable_sharing() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TunerKind {
    /// HDHomeRun with HTTP streaming.
    Hdhomerun,
    /// Older HDHomeRun models driven over the control protocol, streaming UDP.
    HdhomerunLegacy,
    /// Channels listed in an M3U playlist.
    M3u,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CopierConfig {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Consecutive empty reads tolerated on the newest segment while the
    /// producer is still running.
    #[serde(default = "default_last_segment_limit")]
    pub last_segment_empty_read_limit: u32,

    /// Consecutive empty reads tolerated on a sealed (rotated-away) segment.
    #[serde(default = "default_sealed_segment_limit")]
    pub sealed_segment_empty_read_limit: u32,

    /// Consecutive empty reads tolerated once the producer has exited.
    #[serde(default = "default_exited_limit")]
    pub exited_empty_read_limit: u32,

    #[serde(default = "default_late_join_after")]
    pub late_join_after_secs: u64,

    #[serde(default = "default_late_join_seek_back")]
    pub late_join_seek_back_bytes: u64,
}

fn default_buffer_size() -> usize {
    81_920
}
fn default_poll_interval() -> u64 {
    50
}
fn default_last_segment_limit() -> u32 {
    u32::MAX
}
fn default_sealed_segment_limit() -> u32 {
    1
}
fn default_exited_limit() -> u32 {
    20
}
fn default_late_join_after() -> u64 {
    10
}
fn default_late_join_seek_back() -> u64 {
    20_000
}

impl Default for CopierConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            poll_interval_ms: default_poll_interval(),
            last_segment_empty_read_limit: default_last_segment_limit(),
            sealed_segment_empty_read_limit: default_sealed_segment_limit(),
            exited_empty_read_limit: default_exited_limit(),
            late_join_after_secs: default_late_join_after(),
            late_join_seek_back_bytes: default_late_join_seek_back(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CleanupConfig {
    #[serde(default = "default_delete_attempts")]
    pub delete_attempts: u32,

    #[serde(default = "default_delete_retry")]
    pub delete_retry_ms: u64,
}

fn default_delete_attempts() -> u32 {
    40
}
fn default_delete_retry() -> u64 {
    500
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_attempts: default_delete_attempts(),
            delete_retry_ms: default_delete_retry(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TranscodingConfig {
    /// Explicit ffmpeg binary; looked up on PATH when unset.
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    #[serde(default = "default_output_extension")]
    pub output_extension: String,

    /// Jobs with no readers for this long are killed and removed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,
}

fn default_output_extension() -> String {
    "ts".to_string()
}
fn default_idle_timeout() -> u64 {
    60
}
fn default_reap_interval() -> u64 {
    10
}

impl Default for TranscodingConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            output_extension: default_output_extension(),
            idle_timeout_secs: default_idle_timeout(),
            reap_interval_secs: default_reap_interval(),
        }
    }
}
