//! Live stream routes.
//!
//! A client opens (or joins) a channel with `POST /live/streams`, reads the
//! transport stream from `/live/streams/:stream_id/stream.ts` as often as it
//! likes, and gives its reference back with `DELETE`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tunerflow_common::paths::content_type_for_path;
use tunerflow_common::{LiveStreamId, MediaProtocol, MediaSourceInfo};

use super::{ApiError, AppContext};
use crate::live::{
    CopyOptions, CopyOutcome, LiveSource, LiveStreamError, LiveStreamInfo, LiveStreamOptions, ReleaseOutcome, SharingKey,
    TunerStream,
};
use crate::streaming::{pipe_body, PIPE_CAPACITY};

/// Sharing-key namespace for sources that did not come from a tuner host.
const DIRECT_SOURCE: &str = "direct";

pub fn live_routes() -> Router<AppContext> {
    Router::new()
        .route("/live/streams", get(list_streams).post(open_stream))
        .route("/live/streams/:stream_id", get(get_stream).delete(release_stream))
        .route("/live/streams/:stream_id/stream.ts", get(stream_live))
}

// ============================================================================
// Request/Response types
// ============================================================================

/// Either a tuner channel (`tuner_id` + `channel`) or a direct source (`path`).
#[derive(Debug, Deserialize)]
pub struct OpenStreamRequest {
    pub tuner_id: Option<String>,
    pub channel: Option<String>,
    /// URL or local file path of a direct source.
    pub path: Option<String>,
    pub protocol: Option<MediaProtocol>,
    /// Overrides the tuner's sharing setting for this request only when false.
    pub enable_sharing: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct OpenStreamResponse {
    pub id: LiveStreamId,
    pub is_new: bool,
    pub consumer_count: u32,
    pub stream_url: String,
    pub stream: LiveStreamInfo,
}

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub from_beginning: bool,
}

#[derive(Debug, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReleaseResponse {
    Released { remaining: u32 },
    Closed,
}

// ============================================================================
// Handlers
// ============================================================================

async fn list_streams(State(ctx): State<AppContext>) -> Json<Vec<LiveStreamInfo>> {
    Json(ctx.streams.list().iter().map(|s| s.info()).collect())
}

async fn get_stream(
    State(ctx): State<AppContext>,
    Path(stream_id): Path<String>,
) -> Result<Json<LiveStreamInfo>, ApiError> {
    let stream = find_stream(&ctx, &stream_id)?;
    Ok(Json(stream.info()))
}

async fn open_stream(
    State(ctx): State<AppContext>,
    Json(req): Json<OpenStreamRequest>,
) -> Result<(StatusCode, Json<OpenStreamResponse>), ApiError> {
    let options = stream_options(&ctx, &req).await?;
    let key = options
        .key
        .clone()
        .ok_or_else(|| ApiError::bad_request("source has no sharing key"))?;
    let enable_sharing = options.enable_sharing;

    let settings = ctx.live_settings();
    let timeout = ctx.config.live_tv.open_timeout();
    let http = ctx.http.clone();

    let acquired = ctx
        .streams
        .acquire(&key, enable_sharing, move |notifier| async move {
            let stream = TunerStream::new(options, settings, http, Some(notifier));
            stream.open(timeout).await?;
            Ok::<_, LiveStreamError>(stream)
        })
        .await?;

    let stream = acquired.stream;
    let status = if acquired.is_new { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(OpenStreamResponse {
            id: stream.id(),
            is_new: acquired.is_new,
            consumer_count: stream.consumer_count(),
            stream_url: format!("/api/live/streams/{}/stream.ts", stream.id()),
            stream: stream.info(),
        }),
    ))
}

async fn release_stream(
    State(ctx): State<AppContext>,
    Path(stream_id): Path<String>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    let id = parse_stream_id(&stream_id)?;
    match ctx.streams.release(&id).await {
        ReleaseOutcome::Released { remaining } => Ok(Json(ReleaseResponse::Released { remaining })),
        ReleaseOutcome::Closed => Ok(Json(ReleaseResponse::Closed)),
        ReleaseOutcome::NotFound => Err(ApiError::not_found(format!("live stream {}", stream_id))),
    }
}

async fn stream_live(
    State(ctx): State<AppContext>,
    Path(stream_id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, ApiError> {
    let stream = find_stream(&ctx, &stream_id)?;
    if !stream.is_open() && stream.segments().is_empty() {
        return Err(ApiError::from(LiveStreamError::Closed));
    }

    let content_type = stream
        .segments()
        .get(0)
        .map(|p| content_type_for_path(&p))
        .unwrap_or("video/mp2t");

    let cancel = ctx.shutdown.child_token();
    let options = CopyOptions {
        from_beginning: query.from_beginning,
    };

    let body = pipe_body(PIPE_CAPACITY, move |mut pipe| async move {
        match stream.copy_to(&mut pipe, options, &cancel).await {
            Ok(report) if report.outcome == CopyOutcome::EndOfStream => {
                tracing::debug!(stream_id = %stream.id(), bytes = report.bytes_copied, "Live response complete");
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(stream_id = %stream.id(), "Live response failed: {}", e),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|e| ApiError::new(tunerflow_common::Error::internal(e.to_string())))
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_stream_id(raw: &str) -> Result<LiveStreamId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid live stream id: {}", raw)))
}

fn find_stream(ctx: &AppContext, raw: &str) -> Result<Arc<TunerStream>, ApiError> {
    let id = parse_stream_id(raw)?;
    ctx.streams
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("live stream {}", raw)))
}

async fn stream_options(ctx: &AppContext, req: &OpenStreamRequest) -> Result<LiveStreamOptions, ApiError> {
    match (&req.tuner_id, &req.channel, &req.path) {
        (Some(tuner_id), Some(channel), _) => {
            let resolved = ctx.tuners.resolve(tuner_id, channel).await?;
            Ok(LiveStreamOptions {
                source: resolved.source,
                media_source: resolved.media_source,
                key: Some(resolved.key),
                enable_sharing: resolved.enable_sharing && req.enable_sharing.unwrap_or(true),
                tuner_host_id: Some(resolved.tuner_host_id),
                tuner_device_id: resolved.device_id,
            })
        }
        (None, None, Some(path)) => {
            let protocol = match req.protocol {
                Some(protocol) => protocol,
                None => guess_protocol(path),
            };
            let media_source = MediaSourceInfo::live_ts(path.clone(), protocol, path.clone());
            Ok(LiveStreamOptions {
                source: LiveSource::Provided {
                    media_source: media_source.clone(),
                },
                media_source,
                key: Some(SharingKey::new(DIRECT_SOURCE, path.clone())),
                enable_sharing: req.enable_sharing.unwrap_or(true),
                tuner_host_id: None,
                tuner_device_id: None,
            })
        }
        _ => Err(ApiError::bad_request("expected tuner_id and channel, or path")),
    }
}

fn guess_protocol(path: &str) -> MediaProtocol {
    path.split_once("://")
        .and_then(|(scheme, _)| scheme.parse().ok())
        .unwrap_or(MediaProtocol::File)
}
