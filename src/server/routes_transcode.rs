//! Transcode job routes.
//!
//! Jobs remux a live stream (or any URL ffmpeg can read) into a growing
//! output file that clients fetch with ordinary range requests.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tunerflow_common::{LiveStreamId, TranscodeJobId};

use super::{ApiError, AppContext};
use crate::live::CopierSettings;
use crate::streaming::{pipe_body, RangeResponseWriter, PIPE_CAPACITY};
use crate::transcode::{TranscodeJob, TranscodeJobInfo, TranscodeJobTracker};

/// How often to look for an encoder's first output.
const OUTPUT_POLL: Duration = Duration::from_millis(100);

pub fn transcode_routes() -> Router<AppContext> {
    Router::new()
        .route("/transcodes", get(list_jobs).post(start_job))
        .route("/transcodes/:job_id", get(get_job).delete(delete_job))
        .route("/transcodes/:job_id/stream", get(stream_job))
}

#[derive(Debug, Deserialize)]
pub struct StartTranscodeRequest {
    /// Live stream to remux; read back through this server.
    pub stream_id: Option<LiveStreamId>,
    /// Any other input ffmpeg can open.
    pub input_url: Option<String>,
    /// Known input duration in 100ns ticks.
    pub run_time_ticks: Option<i64>,
}

async fn list_jobs(State(ctx): State<AppContext>) -> Json<Vec<TranscodeJobInfo>> {
    Json(ctx.jobs.list().iter().map(|j| j.info()).collect())
}

async fn get_job(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
) -> Result<Json<TranscodeJobInfo>, ApiError> {
    let job = find_job(&ctx, &job_id)?;
    Ok(Json(job.info()))
}

async fn start_job(
    State(ctx): State<AppContext>,
    Json(req): Json<StartTranscodeRequest>,
) -> Result<(StatusCode, Json<TranscodeJobInfo>), ApiError> {
    let input_url = match (&req.stream_id, &req.input_url) {
        (Some(stream_id), _) => {
            if ctx.streams.get(stream_id).is_none() {
                return Err(ApiError::not_found(format!("live stream {}", stream_id)));
            }
            format!(
                "{}/api/live/streams/{}/stream.ts",
                ctx.config.server.loopback_base_url(),
                stream_id
            )
        }
        (None, Some(url)) => url.clone(),
        (None, None) => return Err(ApiError::bad_request("expected stream_id or input_url")),
    };

    let job = ctx
        .jobs
        .start_transcode(&input_url, req.stream_id, req.run_time_ticks)
        .await?;
    Ok((StatusCode::CREATED, Json(job.info())))
}

async fn delete_job(State(ctx): State<AppContext>, Path(job_id): Path<String>) -> Result<StatusCode, ApiError> {
    let id = parse_job_id(&job_id)?;
    match ctx.jobs.remove(&id).await {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::not_found(format!("transcode job {}", job_id))),
    }
}

/// Serve the job's output, honoring a single `Range`.
async fn stream_job(
    State(ctx): State<AppContext>,
    Path(job_id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let job = find_job(&ctx, &job_id)?;
    wait_for_output(&job, ctx.config.live_tv.open_timeout()).await;

    let settings = CopierSettings::from(&ctx.config.live_tv.copier);
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    let writer = match range {
        Some(range) => RangeResponseWriter::new(range, job.output_path(), Some(Arc::clone(&job)), settings).await?,
        None => RangeResponseWriter::full(job.output_path(), Some(Arc::clone(&job)), settings).await?,
    };
    let tracker: Arc<dyn TranscodeJobTracker> = ctx.jobs.clone();
    let writer = writer.with_tracker(tracker);

    let mut response = Response::builder().status(writer.status());
    for (name, value) in writer.headers() {
        response = response.header(name, value);
    }

    let cancel = ctx.shutdown.child_token();
    let body = pipe_body(PIPE_CAPACITY, move |mut pipe| async move {
        if let Err(e) = writer.write_to(&mut pipe, &cancel).await {
            tracing::warn!(job_id = %job.id(), "Transcode response failed: {}", e);
        }
    });

    response
        .body(body)
        .map_err(|e| ApiError::new(tunerflow_common::Error::internal(e.to_string())))
}

fn parse_job_id(raw: &str) -> Result<TranscodeJobId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid transcode job id: {}", raw)))
}

fn find_job(ctx: &AppContext, raw: &str) -> Result<Arc<TranscodeJob>, ApiError> {
    let id = parse_job_id(raw)?;
    ctx.jobs
        .get(&id)
        .ok_or_else(|| ApiError::not_found(format!("transcode job {}", raw)))
}

/// Give a just-started encoder a moment to create its output file.
async fn wait_for_output(job: &TranscodeJob, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !job.has_exited() && Instant::now() < deadline {
        if tokio::fs::try_exists(job.output_path()).await.unwrap_or(false) {
            return;
        }
        tokio::time::sleep(OUTPUT_POLL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcode_routes_creation() {
        let _router: Router<AppContext> = transcode_routes();
    }

    #[tokio::test]
    async fn test_wait_for_output_returns_once_job_exits() {
        let job = TranscodeJob::new(TranscodeJobId::new(), "/nonexistent/out.ts");
        job.mark_exited(Some(1));
        tokio::time::timeout(Duration::from_secs(1), wait_for_output(&job, Duration::from_secs(30)))
            .await
            .unwrap();
    }
}
