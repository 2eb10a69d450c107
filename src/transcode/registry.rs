//! In-process job tracking and idle-job reaping.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tunerflow_common::paths::transcode_output_path;
use tunerflow_common::{LiveStreamId, TranscodeJobId};

use super::ffmpeg::{find_ffmpeg, remux_args, spawn_encoder};
use super::{TranscodeError, TranscodeJob, TranscodeJobTracker};
use crate::config::{Config, TranscodingConfig};
use crate::live::{delete_with_retry, CleanupSettings, StreamSharingRegistry};

#[derive(Debug, Clone)]
pub struct TranscodeSettings {
    pub ffmpeg_path: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub output_extension: String,
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub cleanup: CleanupSettings,
}

impl From<&Config> for TranscodeSettings {
    fn from(config: &Config) -> Self {
        let TranscodingConfig {
            ffmpeg_path,
            output_extension,
            idle_timeout_secs,
            reap_interval_secs,
        } = &config.transcoding;
        Self {
            ffmpeg_path: ffmpeg_path.clone(),
            output_dir: config.live_tv.transcode_temp_dir.clone(),
            output_extension: output_extension.clone(),
            idle_timeout: Duration::from_secs(*idle_timeout_secs),
            reap_interval: Duration::from_secs((*reap_interval_secs).max(1)),
            cleanup: CleanupSettings::from(&config.live_tv.cleanup),
        }
    }
}

impl Default for TranscodeSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Thread-safe registry of transcode jobs.
pub struct JobRegistry {
    jobs: DashMap<TranscodeJobId, Arc<TranscodeJob>>,
    settings: TranscodeSettings,
    /// Live streams that jobs hold a consumer reference on.
    streams: Option<Arc<StreamSharingRegistry>>,
}

impl JobRegistry {
    pub fn new(settings: TranscodeSettings) -> Self {
        Self {
            jobs: DashMap::new(),
            settings,
            streams: None,
        }
    }

    /// Keep live streams that feed jobs open until the job is removed.
    pub fn with_streams(mut self, streams: Arc<StreamSharingRegistry>) -> Self {
        self.streams = Some(streams);
        self
    }

    pub fn settings(&self) -> &TranscodeSettings {
        &self.settings
    }

    /// Track a job whose output is produced elsewhere.
    pub fn register(&self, job: TranscodeJob) -> Arc<TranscodeJob> {
        let job = Arc::new(job);
        self.jobs.insert(job.id(), Arc::clone(&job));
        tracing::info!(
            job_id = %job.id(),
            output = %job.output_path().display(),
            "Registered transcode job"
        );
        job
    }

    /// Track a job that reads live stream `stream`.
    ///
    /// The job holds one consumer reference on the stream, dropped when the
    /// job is removed or reaped.
    pub async fn register_fed_by(
        &self,
        job: TranscodeJob,
        stream: LiveStreamId,
    ) -> Result<Arc<TranscodeJob>, TranscodeError> {
        if let Some(streams) = &self.streams {
            streams.retain(&stream).await?;
        }
        Ok(self.register(job.with_source_stream(stream)))
    }

    /// Start an ffmpeg remux of `input_url` into the temp directory.
    ///
    /// # Arguments
    /// * `input_url` - What ffmpeg reads (usually a live stream URL on this server).
    /// * `source_stream` - The live stream feeding the job, if any.
    /// * `run_time_ticks` - Known input duration, used for completion percentage.
    pub async fn start_transcode(
        &self,
        input_url: &str,
        source_stream: Option<LiveStreamId>,
        run_time_ticks: Option<i64>,
    ) -> Result<Arc<TranscodeJob>, TranscodeError> {
        let ffmpeg = find_ffmpeg(self.settings.ffmpeg_path.as_deref())?;
        tokio::fs::create_dir_all(&self.settings.output_dir).await?;

        let id = TranscodeJobId::new();
        let output = transcode_output_path(&self.settings.output_dir, &id, &self.settings.output_extension);
        let job = TranscodeJob::new(id, &output).with_run_time_ticks(run_time_ticks);
        let job = match source_stream {
            Some(stream) => self.register_fed_by(job, stream).await?,
            None => self.register(job),
        };

        if let Err(e) = spawn_encoder(&ffmpeg, &remux_args(input_url, &output), Arc::clone(&job)) {
            if let Some((_, job)) = self.jobs.remove(&id) {
                self.release_source(&job).await;
            }
            return Err(e);
        }
        Ok(job)
    }

    pub fn list(&self) -> Vec<Arc<TranscodeJob>> {
        self.jobs.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Kill a job and delete its output.
    pub async fn remove(&self, id: &TranscodeJobId) -> Option<Arc<TranscodeJob>> {
        let (_, job) = self.jobs.remove(id)?;
        self.dispose(&job).await;
        Some(job)
    }

    async fn dispose(&self, job: &TranscodeJob) {
        job.kill();
        self.release_source(job).await;
        delete_with_retry(&[job.output_path().to_path_buf()], self.settings.cleanup).await;
    }

    async fn release_source(&self, job: &TranscodeJob) {
        if let (Some(streams), Some(stream)) = (&self.streams, job.source_stream()) {
            let outcome = streams.release(&stream).await;
            tracing::debug!(job_id = %job.id(), stream_id = %stream, ?outcome, "Released job's live stream");
        }
    }

    /// Remove jobs nobody has read for `idle_timeout`.
    ///
    /// Running jobs are killed first. Returns the removed ids.
    pub async fn reap_idle(&self, now: Instant) -> Vec<TranscodeJobId> {
        let idle: Vec<Arc<TranscodeJob>> = self
            .jobs
            .iter()
            .filter(|e| e.active_readers() == 0 && e.idle_for(now) >= self.settings.idle_timeout)
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut removed = Vec::with_capacity(idle.len());
        for job in idle {
            // A reader may have attached since the scan.
            let taken = self
                .jobs
                .remove_if(&job.id(), |_, j| j.active_readers() == 0)
                .is_some();
            if !taken {
                continue;
            }
            tracing::info!(
                job_id = %job.id(),
                exited = job.has_exited(),
                idle_secs = job.idle_for(now).as_secs(),
                "Reaping idle transcode job"
            );
            self.dispose(&job).await;
            removed.push(job.id());
        }
        removed
    }

    /// Kill and remove every job.
    pub async fn shutdown(&self) {
        let ids: Vec<TranscodeJobId> = self.jobs.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.remove(&id).await;
        }
    }
}

impl TranscodeJobTracker for JobRegistry {
    fn get(&self, id: &TranscodeJobId) -> Option<Arc<TranscodeJob>> {
        self.jobs.get(id).map(|e| Arc::clone(e.value()))
    }

    fn on_reader_attached(&self, job: &TranscodeJob) {
        let readers = job.reader_attached();
        tracing::debug!(job_id = %job.id(), readers, "Reader attached");
    }

    fn on_reader_detached(&self, job: &TranscodeJob) {
        let readers = job.reader_detached();
        tracing::debug!(job_id = %job.id(), readers, "Reader detached");
    }
}

/// Start a background task that periodically reaps idle jobs.
///
/// # Arguments
/// * `registry` - The job registry to reap.
/// * `shutdown` - Stops the task when cancelled.
///
/// # Returns
/// A join handle for the background task.
pub fn start_reaper(registry: Arc<JobRegistry>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(registry.settings.reap_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let removed = registry.reap_idle(Instant::now()).await;
                    if !removed.is_empty() {
                        tracing::debug!(removed = removed.len(), "Reaped idle transcode jobs");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(dir: &std::path::Path) -> TranscodeSettings {
        TranscodeSettings {
            ffmpeg_path: None,
            output_dir: dir.to_path_buf(),
            output_extension: "ts".into(),
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
            cleanup: CleanupSettings {
                attempts: 2,
                retry_interval: Duration::from_millis(1),
            },
        }
    }

    #[tokio::test]
    async fn test_reap_only_idle_unread_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(settings(dir.path()));

        let idle_path = dir.path().join("idle.ts");
        let busy_path = dir.path().join("busy.ts");
        std::fs::write(&idle_path, b"x").unwrap();
        std::fs::write(&busy_path, b"x").unwrap();

        let idle = registry.register(TranscodeJob::new(TranscodeJobId::new(), &idle_path));
        let busy = registry.register(TranscodeJob::new(TranscodeJobId::new(), &busy_path));
        registry.on_reader_attached(&busy);

        // Not idle long enough yet.
        assert!(registry.reap_idle(Instant::now()).await.is_empty());

        let later = Instant::now() + Duration::from_secs(120);
        let removed = registry.reap_idle(later).await;
        assert_eq!(removed, vec![idle.id()]);
        assert!(idle.kill_token().is_cancelled());
        assert!(!idle_path.exists());

        assert!(registry.get(&busy.id()).is_some());
        assert!(busy_path.exists());

        registry.on_reader_detached(&busy);
        let removed = registry.reap_idle(Instant::now() + Duration::from_secs(120)).await;
        assert_eq!(removed, vec![busy.id()]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_remove_kills_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let registry = JobRegistry::new(settings(dir.path()));
        let path = dir.path().join("out.ts");
        std::fs::write(&path, b"data").unwrap();

        let job = registry.register(TranscodeJob::new(TranscodeJobId::new(), &path));
        let removed = registry.remove(&job.id()).await.unwrap();
        assert!(removed.kill_token().is_cancelled());
        assert!(!path.exists());
        assert!(registry.remove(&job.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_reaper_task_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(JobRegistry::new(settings(dir.path())));
        let shutdown = CancellationToken::new();
        let handle = start_reaper(Arc::clone(&registry), shutdown.clone());
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }
}
