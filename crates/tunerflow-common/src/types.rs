//! Core type definitions for live media sources.
//!
//! A [`MediaSourceInfo`] describes where a playable stream comes from and what
//! it contains. It is the "origin media descriptor" attached to every open
//! live stream.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport used to reach a media source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaProtocol {
    /// Local file (possibly still growing).
    File,
    /// HTTP progressive stream.
    Http,
    /// Raw UDP datagrams.
    Udp,
}

impl fmt::Display for MediaProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Http => write!(f, "http"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for MediaProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(Self::File),
            "http" | "https" => Ok(Self::Http),
            "udp" => Ok(Self::Udp),
            _ => Err(format!("Invalid media protocol: {}", s)),
        }
    }
}

/// Descriptor of the media behind a live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSourceInfo {
    /// Source identifier (channel id, tuner-provided id, ...).
    pub id: String,
    /// Transport.
    pub protocol: MediaProtocol,
    /// URL or filesystem path, depending on protocol.
    pub path: String,
    /// Container format, e.g. `ts`.
    pub container: String,
    #[serde(default)]
    pub video_codec: Option<String>,
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub bitrate: Option<u64>,
    /// Known duration in 100ns ticks; `None` for unbounded live streams.
    #[serde(default)]
    pub run_time_ticks: Option<i64>,
    /// True for broadcast sources with no natural end.
    #[serde(default = "default_true")]
    pub is_infinite_stream: bool,
}

fn default_true() -> bool {
    true
}

impl MediaSourceInfo {
    /// Descriptor for an MPEG-TS live channel reachable at `path`.
    pub fn live_ts(id: impl Into<String>, protocol: MediaProtocol, path: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol,
            path: path.into(),
            container: "ts".to_string(),
            video_codec: None,
            audio_codec: None,
            bitrate: None,
            run_time_ticks: None,
            is_infinite_stream: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_serialization() {
        let json = serde_json::to_string(&MediaProtocol::Http).unwrap();
        assert_eq!(json, r#""http""#);
        let back: MediaProtocol = serde_json::from_str(r#""udp""#).unwrap();
        assert_eq!(back, MediaProtocol::Udp);
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("https".parse::<MediaProtocol>().unwrap(), MediaProtocol::Http);
        assert_eq!("file".parse::<MediaProtocol>().unwrap(), MediaProtocol::File);
        assert!("rtsp".parse::<MediaProtocol>().is_err());
    }

    #[test]
    fn test_live_ts_defaults() {
        let info = MediaSourceInfo::live_ts("5.1", MediaProtocol::Http, "http://hdhr/auto/v5.1");
        assert_eq!(info.container, "ts");
        assert!(info.is_infinite_stream);
        assert!(info.run_time_ticks.is_none());
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let json = r#"{"id":"a","protocol":"file","path":"/x.ts","container":"ts"}"#;
        let info: MediaSourceInfo = serde_json::from_str(json).unwrap();
        assert!(info.is_infinite_stream);
        assert!(info.video_codec.is_none());
    }
}
