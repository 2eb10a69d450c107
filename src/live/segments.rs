//! Rotating segment files written by a live stream.

use parking_lot::RwLock;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tunerflow_common::paths::segment_path;
use tunerflow_common::LiveStreamId;

use crate::config::CleanupConfig;

/// Ordered set of segment files belonging to one live stream.
///
/// Append-only: only the last path may still be growing.
#[derive(Debug)]
pub struct SegmentFileSet {
    dir: PathBuf,
    id: LiveStreamId,
    extension: String,
    paths: RwLock<Vec<PathBuf>>,
}

impl SegmentFileSet {
    pub fn new(dir: impl Into<PathBuf>, id: LiveStreamId, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            id,
            extension: extension.into(),
            paths: RwLock::new(Vec::new()),
        }
    }

    /// Rebuild the set from files already on disk.
    pub fn discover(dir: impl Into<PathBuf>, id: LiveStreamId, extension: impl Into<String>) -> Self {
        let set = Self::new(dir, id, extension);
        {
            let mut paths = set.paths.write();
            loop {
                let path = segment_path(&set.dir, &set.id, &set.extension, paths.len());
                if !path.exists() {
                    break;
                }
                paths.push(path);
            }
        }
        set
    }

    /// Snapshot of the current segment list, oldest first.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths.read().clone()
    }

    pub fn len(&self) -> usize {
        self.paths.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.read().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<PathBuf> {
        self.paths.read().get(index).cloned()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn next_path(&self) -> PathBuf {
        segment_path(&self.dir, &self.id, &self.extension, self.len())
    }

    /// Make a newly created segment visible to readers.
    pub fn publish(&self, path: PathBuf) {
        self.paths.write().push(path);
    }
}

/// Single writer appending to the active segment and rotating when full.
pub struct SegmentWriter {
    set: Arc<SegmentFileSet>,
    file: File,
    written: u64,
    max_bytes: u64,
}

impl SegmentWriter {
    /// Create the first segment file and publish it.
    pub async fn create(set: Arc<SegmentFileSet>, max_bytes: u64) -> io::Result<Self> {
        tokio::fs::create_dir_all(set.dir()).await?;
        let path = set.next_path();
        let file = File::create(&path).await?;
        set.publish(path);
        Ok(Self {
            set,
            file,
            written: 0,
            max_bytes,
        })
    }

    pub async fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if self.max_bytes > 0 && self.written >= self.max_bytes {
            self.rotate().await?;
        }
        self.file.write_all(data).await?;
        // Readers tail the file, so push the data out now.
        self.file.flush().await?;
        self.written += data.len() as u64;
        Ok(())
    }

    /// Seal the active segment and start the next one.
    pub async fn rotate(&mut self) -> io::Result<()> {
        self.file.flush().await?;
        let path = self.set.next_path();
        let file = File::create(&path).await?;
        tracing::debug!(segment = %path.display(), "Rotating live stream segment");
        self.file = file;
        self.written = 0;
        self.set.publish(path);
        Ok(())
    }

    pub async fn finish(mut self) -> io::Result<()> {
        self.file.flush().await
    }
}

/// Retry policy for deleting temp files.
#[derive(Debug, Clone, Copy)]
pub struct CleanupSettings {
    pub attempts: u32,
    pub retry_interval: Duration,
}

impl From<&CleanupConfig> for CleanupSettings {
    fn from(cfg: &CleanupConfig) -> Self {
        Self {
            attempts: cfg.delete_attempts.max(1),
            retry_interval: Duration::from_millis(cfg.delete_retry_ms),
        }
    }
}

impl Default for CleanupSettings {
    fn default() -> Self {
        Self::from(&CleanupConfig::default())
    }
}

/// Best-effort deletion of `paths`.
///
/// A missing file counts as deleted. Each round tries every path still
/// present; failures are retried for at most `settings.attempts` rounds in
/// total and then abandoned with a warning. Never returns an error. Returns
/// the number of paths that are gone afterwards.
pub async fn delete_with_retry(paths: &[PathBuf], settings: CleanupSettings) -> usize {
    let mut pending: Vec<&PathBuf> = paths.iter().collect();

    for attempt in 1..=settings.attempts {
        let mut failed = Vec::new();
        for path in pending {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!(path = %path.display(), attempt, "Temp file delete failed: {}", e);
                    failed.push(path);
                }
            }
        }
        pending = failed;

        if pending.is_empty() {
            return paths.len();
        }
        if attempt < settings.attempts {
            tokio::time::sleep(settings.retry_interval).await;
        }
    }

    for path in &pending {
        tracing::warn!(
            path = %path.display(),
            attempts = settings.attempts,
            "Giving up on deleting temp file"
        );
    }
    paths.len() - pending.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_cleanup() -> CleanupSettings {
        CleanupSettings {
            attempts: 3,
            retry_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_writer_rotates_and_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let set = Arc::new(SegmentFileSet::new(dir.path(), LiveStreamId::new(), "ts"));

        let mut writer = SegmentWriter::create(Arc::clone(&set), 10).await.unwrap();
        assert_eq!(set.len(), 1);

        writer.write_chunk(&[1u8; 10]).await.unwrap();
        assert_eq!(set.len(), 1);
        writer.write_chunk(&[2u8; 4]).await.unwrap();
        assert_eq!(set.len(), 2);
        writer.finish().await.unwrap();

        let paths = set.paths();
        assert_eq!(std::fs::read(&paths[0]).unwrap(), vec![1u8; 10]);
        assert_eq!(std::fs::read(&paths[1]).unwrap(), vec![2u8; 4]);
    }

    #[tokio::test]
    async fn test_discover_matches_written_order() {
        let dir = tempfile::tempdir().unwrap();
        let id = LiveStreamId::new();
        let set = Arc::new(SegmentFileSet::new(dir.path(), id, "ts"));
        let mut writer = SegmentWriter::create(Arc::clone(&set), 1).await.unwrap();
        for _ in 0..3 {
            writer.write_chunk(b"x").await.unwrap();
        }
        writer.finish().await.unwrap();

        let found = SegmentFileSet::discover(dir.path(), id, "ts");
        assert_eq!(found.paths(), set.paths());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ts");
        let b = dir.path().join("b.ts");
        std::fs::write(&a, b"data").unwrap();

        let paths = vec![a.clone(), b];
        assert_eq!(delete_with_retry(&paths, quick_cleanup()).await, 2);
        assert!(!a.exists());

        // Second pass over already-deleted paths neither fails nor blocks.
        let started = std::time::Instant::now();
        assert_eq!(delete_with_retry(&paths, quick_cleanup()).await, 2);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_delete_gives_up_without_error() {
        let dir = tempfile::tempdir().unwrap();
        // A non-empty directory cannot be removed with remove_file.
        let stubborn = dir.path().join("busy");
        std::fs::create_dir(&stubborn).unwrap();
        std::fs::write(stubborn.join("inner"), b"x").unwrap();

        let removed = delete_with_retry(&[stubborn.clone()], quick_cleanup()).await;
        assert_eq!(removed, 0);
        assert!(stubborn.exists());
    }

    #[tokio::test]
    async fn test_delete_shares_one_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..4 {
            let busy = dir.path().join(format!("busy{}", i));
            std::fs::create_dir(&busy).unwrap();
            std::fs::write(busy.join("inner"), b"x").unwrap();
            paths.push(busy);
        }
        let gone = dir.path().join("gone.ts");
        std::fs::write(&gone, b"data").unwrap();
        paths.push(gone.clone());

        let settings = CleanupSettings {
            attempts: 10,
            retry_interval: Duration::from_millis(50),
        };
        let started = std::time::Instant::now();
        let removed = delete_with_retry(&paths, settings).await;
        let elapsed = started.elapsed();

        assert_eq!(removed, 1);
        assert!(!gone.exists());
        // Nine sleeps for the whole set, not nine per stuck path.
        assert!(elapsed >= Duration::from_millis(450), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "elapsed {:?}", elapsed);
    }
}
