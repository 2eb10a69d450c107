use crate::config::Config;
use crate::live::{LiveStreamSettings, StreamSharingRegistry};
use crate::transcode::{start_reaper, JobRegistry, TranscodeSettings};
use crate::tuners::TunerManager;
use anyhow::{Context, Result};
use axum::{
    http::{header, Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod error;
pub mod routes_live;
pub mod routes_transcode;
pub mod routes_tuners;

pub use error::ApiError;

/// Connect timeout for requests to tuner devices and channel URLs.
const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application context
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    /// Open live streams, keyed for sharing
    pub streams: Arc<StreamSharingRegistry>,
    /// Running and finished transcode jobs
    pub jobs: Arc<JobRegistry>,
    pub tuners: TunerManager,
    pub http: reqwest::Client,
    /// Cancelled when the server shuts down; every response copier watches it
    pub shutdown: CancellationToken,
}

impl AppContext {
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(HTTP_CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        let streams = Arc::new(StreamSharingRegistry::new());
        let jobs = JobRegistry::new(TranscodeSettings::from(&config)).with_streams(Arc::clone(&streams));

        Ok(Self {
            tuners: TunerManager::from_config(&config.live_tv, http.clone()),
            jobs: Arc::new(jobs),
            streams,
            config: Arc::new(config),
            http,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn live_settings(&self) -> LiveStreamSettings {
        LiveStreamSettings::from(&self.config.live_tv)
    }

    /// Start the background tasks the context depends on: the stream close
    /// listener and the transcode reaper.
    pub fn start_background_tasks(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(2);
        if let Some(listener) = self.streams.spawn_close_listener() {
            handles.push(listener);
        }
        handles.push(start_reaper(Arc::clone(&self.jobs), self.shutdown.clone()));
        handles
    }

    /// Close every stream and kill every job.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.streams.close_all().await;
        self.jobs.shutdown().await;
    }
}

/// Create the Axum router with all routes
pub fn create_router(ctx: AppContext) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::RANGE])
        .expose_headers([
            header::CONTENT_RANGE,
            header::CONTENT_LENGTH,
            header::ACCEPT_RANGES,
            header::ETAG,
        ]);

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_routes())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

fn api_routes() -> Router<AppContext> {
    routes_live::live_routes()
        .merge(routes_transcode::transcode_routes())
        .merge(routes_tuners::tuner_routes())
}

async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

/// Start the HTTP server
pub async fn start_server(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;

    tokio::fs::create_dir_all(&config.live_tv.transcode_temp_dir)
        .await
        .with_context(|| format!("Failed to create temp dir {:?}", config.live_tv.transcode_temp_dir))?;

    let ctx = AppContext::new(config)?;

    tracing::info!("Starting server on {}", addr);
    let listener = TcpListener::bind(addr).await?;

    serve(listener, ctx, shutdown_signal()).await
}

/// Serve `ctx` on `listener` until `signal` resolves, then tear down.
pub async fn serve<S>(listener: TcpListener, ctx: AppContext, signal: S) -> Result<()>
where
    S: Future<Output = ()> + Send + 'static,
{
    let background = ctx.start_background_tasks();
    let app = create_router(ctx.clone());

    let token = ctx.shutdown.clone();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = signal => {},
                _ = token.cancelled() => {},
            }
            // Open response bodies only end once their copiers stop.
            token.cancel();
        })
        .await;

    tracing::info!("Shutting down...");
    ctx.shutdown().await;
    for handle in background {
        handle.abort();
    }

    result?;
    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => {}
            Err(e) => {
                tracing::error!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
