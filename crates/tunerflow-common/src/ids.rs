//! Typed ID wrappers for type safety across tunerflow.
//!
//! This module provides newtype wrappers around UUIDs to prevent mixing different
//! types of identifiers (e.g., using a TranscodeJobId where a LiveStreamId is expected).

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

/// Process-unique identifier for an open live stream.
///
/// Also used as the base name of the stream's temp segment files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LiveStreamId(Uuid);

impl LiveStreamId {
    /// Generate a new random live stream ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hyphen-free form, suitable for file names.
    #[must_use]
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for LiveStreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for LiveStreamId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<LiveStreamId> for Uuid {
    fn from(id: LiveStreamId) -> Self {
        id.0
    }
}

impl FromStr for LiveStreamId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for LiveStreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a transcode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TranscodeJobId(Uuid);

impl TranscodeJobId {
    /// Generate a new random transcode job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Hyphen-free form, suitable for file names.
    #[must_use]
    pub fn simple(&self) -> String {
        self.0.simple().to_string()
    }
}

impl Default for TranscodeJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TranscodeJobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<TranscodeJobId> for Uuid {
    fn from(id: TranscodeJobId) -> Self {
        id.0
    }
}

impl FromStr for TranscodeJobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl std::fmt::Display for TranscodeJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(LiveStreamId::new(), LiveStreamId::new());
        assert_ne!(TranscodeJobId::new(), TranscodeJobId::new());
    }

    #[test]
    fn test_uuid_conversion() {
        let uuid = Uuid::new_v4();
        let id = LiveStreamId::from(uuid);
        let back: Uuid = id.into();
        assert_eq!(uuid, back);
    }

    #[test]
    fn test_parse_and_display() {
        let id = TranscodeJobId::new();
        let parsed: TranscodeJobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<LiveStreamId>().is_err());
    }

    #[test]
    fn test_simple_has_no_hyphens() {
        let id = LiveStreamId::new();
        let simple = id.simple();
        assert_eq!(simple.len(), 32);
        assert!(!simple.contains('-'));
    }

    #[test]
    fn test_serde_transparent() {
        let uuid = Uuid::new_v4();
        let id = LiveStreamId::from(uuid);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", uuid));
        let back: LiveStreamId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
