//! Path utilities for temp files written by live streams and transcodes.
//!
//! Segment files for a live stream are named deterministically so that any
//! reader can re-derive the full ordered list from the stream id alone:
//! segment 0 is `{id}.{ext}` and segment `n` is `{id}_{n}.{ext}`.

use std::path::{Path, PathBuf};

use crate::ids::{LiveStreamId, TranscodeJobId};

/// Path of segment `index` for the given stream.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use tunerflow_common::{paths::segment_path, LiveStreamId};
///
/// let id = LiveStreamId::new();
/// let dir = Path::new("/tmp/tf");
/// assert_eq!(segment_path(dir, &id, "ts", 0), dir.join(format!("{}.ts", id.simple())));
/// assert_eq!(segment_path(dir, &id, "ts", 2), dir.join(format!("{}_2.ts", id.simple())));
/// ```
#[must_use]
pub fn segment_path(dir: &Path, id: &LiveStreamId, extension: &str, index: usize) -> PathBuf {
    let name = if index == 0 {
        format!("{}.{}", id.simple(), extension)
    } else {
        format!("{}_{}.{}", id.simple(), index, extension)
    };
    dir.join(name)
}

/// Output path for a transcode job.
#[must_use]
pub fn transcode_output_path(dir: &Path, id: &TranscodeJobId, extension: &str) -> PathBuf {
    dir.join(format!("{}.{}", id.simple(), extension))
}

/// Guess a response content type from a file extension.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use tunerflow_common::paths::content_type_for_path;
///
/// assert_eq!(content_type_for_path(Path::new("live.ts")), "video/mp2t");
/// assert_eq!(content_type_for_path(Path::new("out.mkv")), "video/x-matroska");
/// assert_eq!(content_type_for_path(Path::new("blob")), "application/octet-stream");
/// ```
#[must_use]
pub fn content_type_for_path(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "ts" | "m2ts" | "mpegts" => "video/mp2t",
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "flv" => "video/x-flv",
        "aac" => "audio/aac",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_paths_are_ordered_and_distinct() {
        let id = LiveStreamId::new();
        let dir = Path::new("/var/tmp");
        let paths: Vec<_> = (0..4).map(|i| segment_path(dir, &id, "ts", i)).collect();
        for (i, a) in paths.iter().enumerate() {
            for b in paths.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert!(paths.iter().all(|p| p.starts_with(dir)));
    }

    #[test]
    fn test_transcode_output_path() {
        let id = TranscodeJobId::new();
        let path = transcode_output_path(Path::new("/t"), &id, "ts");
        assert_eq!(path.file_stem().unwrap().to_str().unwrap(), id.simple());
    }

    #[test]
    fn test_content_type_case_insensitive() {
        assert_eq!(content_type_for_path(Path::new("A.TS")), "video/mp2t");
        assert_eq!(content_type_for_path(Path::new("b.Mp4")), "video/mp4");
    }
}
