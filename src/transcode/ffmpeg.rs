//! ffmpeg invocation and `-progress` output parsing.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use super::{TranscodeError, TranscodeJob};

/// One meaningful `-progress` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressLine {
    /// `out_time_us=` (microseconds of output written).
    OutTime(i64),
    /// `progress=end`.
    End,
}

pub fn parse_progress_line(line: &str) -> Option<ProgressLine> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        // Older builds report microseconds under out_time_ms.
        "out_time_us" | "out_time_ms" => value.trim().parse().ok().map(ProgressLine::OutTime),
        "progress" if value.trim() == "end" => Some(ProgressLine::End),
        _ => None,
    }
}

/// Percentage of `run_time_ticks` (100ns units) covered by `out_time_us`.
pub fn completion_percent(out_time_us: i64, run_time_ticks: Option<i64>) -> Option<f64> {
    let total_us = run_time_ticks? / 10;
    if total_us <= 0 || out_time_us < 0 {
        return None;
    }
    Some((out_time_us as f64 / total_us as f64 * 100.0).min(100.0))
}

/// Locate ffmpeg: explicit path first, then `PATH`.
pub fn find_ffmpeg(configured: Option<&Path>) -> Result<PathBuf, TranscodeError> {
    if let Some(path) = configured {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        tracing::warn!("Configured ffmpeg not found at {:?}, searching PATH", path);
    }
    which::which("ffmpeg").map_err(|_| TranscodeError::EncoderNotFound("ffmpeg".to_string()))
}

/// Remux the input to MPEG-TS, reporting progress on stdout.
pub fn remux_args(input_url: &str, output: &Path) -> Vec<String> {
    vec![
        "-hide_banner".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        "-fflags".to_string(),
        "+genpts".to_string(),
        "-i".to_string(),
        input_url.to_string(),
        "-map".to_string(),
        "0".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-f".to_string(),
        "mpegts".to_string(),
        "-progress".to_string(),
        "pipe:1".to_string(),
        "-nostats".to_string(),
        "-y".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Apply progress lines to `job` until the reader ends.
pub async fn watch_progress<R>(reader: R, job: &TranscodeJob)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match parse_progress_line(&line) {
            Some(ProgressLine::OutTime(us)) => {
                if let Some(percent) = completion_percent(us, job.run_time_ticks()) {
                    job.set_completion(percent);
                }
            }
            Some(ProgressLine::End) => job.set_completion(100.0),
            None => {}
        }
    }
}

/// Spawn the encoder for `job` and supervise it until exit or kill.
pub fn spawn_encoder(ffmpeg: &Path, args: &[String], job: Arc<TranscodeJob>) -> Result<JoinHandle<()>, TranscodeError> {
    tracing::debug!("FFmpeg args: {:?}", args);

    let mut child = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(TranscodeError::Spawn)?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    Ok(tokio::spawn(async move {
        let job_id = job.id();

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(job_id = %job_id, "ffmpeg: {}", line);
                }
            });
        }

        let progress = async {
            if let Some(stdout) = stdout {
                watch_progress(BufReader::new(stdout), &job).await;
            }
        };

        tokio::select! {
            _ = job.kill_token().cancelled() => {
                tracing::info!(job_id = %job_id, "Killing encoder");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(job_id = %job_id, "Failed to kill encoder: {}", e);
                }
            }
            _ = progress => {}
        }

        let code = match child.wait().await {
            Ok(status) => status.code(),
            Err(e) => {
                tracing::warn!(job_id = %job_id, "Failed waiting for encoder: {}", e);
                None
            }
        };
        job.mark_exited(code);

        match code {
            Some(0) => tracing::info!(job_id = %job_id, completion = ?job.completion_percentage(), "Encoder finished"),
            _ => tracing::debug!(job_id = %job_id, ?code, "Encoder exited"),
        }
    }))
}
