//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`] which points the live TV temp directory at a
//! scratch directory and builds a full [`AppContext`]. The [`with_server`]
//! constructor starts Axum on a random port for HTTP-level testing.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use tempfile::TempDir;
use tunerflow::config::Config;
use tunerflow::server::{create_router, AppContext};

pub struct TestHarness {
    pub ctx: AppContext,
    pub temp: TempDir,
}

impl TestHarness {
    /// Create a new harness with default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Create a harness from `config`, with fast copier timings and a
    /// scratch temp directory.
    pub fn with_config(mut config: Config) -> Self {
        let temp = tempfile::tempdir().expect("failed to create temp dir");
        config.live_tv.transcode_temp_dir = temp.path().join("transcodes");
        std::fs::create_dir_all(&config.live_tv.transcode_temp_dir).expect("failed to create transcode dir");

        config.live_tv.open_timeout_secs = 5;
        config.live_tv.copier.poll_interval_ms = 10;
        config.live_tv.copier.exited_empty_read_limit = 5;
        config.live_tv.cleanup.delete_attempts = 3;
        config.live_tv.cleanup.delete_retry_ms = 10;

        let ctx = AppContext::new(config).expect("failed to build context");
        Self { ctx, temp }
    }

    pub fn transcode_dir(&self) -> PathBuf {
        self.ctx.config.live_tv.transcode_temp_dir.clone()
    }

    /// Write `data` to a file in the scratch directory.
    pub fn write_file(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.temp.path().join(name);
        std::fs::write(&path, data).expect("failed to write file");
        path
    }

    /// Start an Axum server on a random port and return the harness together
    /// with the bound socket address.
    pub async fn with_server() -> (Self, SocketAddr) {
        Self::with_server_config(Config::default()).await
    }

    /// Start an Axum server with custom config on a random port.
    pub async fn with_server_config(config: Config) -> (Self, SocketAddr) {
        let harness = Self::with_config(config);
        let addr = harness.serve().await;
        (harness, addr)
    }

    async fn serve(&self) -> SocketAddr {
        self.ctx.start_background_tasks();
        let app = create_router(self.ctx.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind random port");
        let addr = listener.local_addr().expect("failed to get local addr");

        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });

        addr
    }
}

/// Deterministic test payload: `len` bytes counting 0..=255.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}
