use async_trait::async_trait;
use reqwest::Client;
use tunerflow_common::{MediaProtocol, MediaSourceInfo};

use super::{ChannelInfo, ResolvedChannel, TunerError, TunerHost};
use crate::config::{TunerHostConfig, TunerKind};
use crate::live::{LiveSource, SharingKey};

/// One playlist entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct M3uEntry {
    pub number: String,
    pub name: String,
    pub url: String,
}

/// Parse an extended M3U playlist.
///
/// The channel number comes from `tvg-chno`, then `tvg-id`, then the
/// 1-based position in the playlist.
pub fn parse_playlist(content: &str) -> Vec<M3uEntry> {
    let mut entries = Vec::new();
    let mut pending: Option<(Option<String>, String)> = None;

    for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if let Some(info) = line.strip_prefix("#EXTINF:") {
            let number = attribute(info, "tvg-chno").or_else(|| attribute(info, "tvg-id"));
            let name = info
                .rsplit_once(',')
                .map(|(_, n)| n.trim().to_string())
                .unwrap_or_default();
            pending = Some((number, name));
        } else if line.starts_with('#') {
            continue;
        } else {
            let (number, name) = pending.take().unwrap_or((None, String::new()));
            let number = number.unwrap_or_else(|| (entries.len() + 1).to_string());
            let name = if name.is_empty() { number.clone() } else { name };
            entries.push(M3uEntry {
                number,
                name,
                url: line.to_string(),
            });
        }
    }

    entries
}

fn attribute(info: &str, key: &str) -> Option<String> {
    let start = info.find(&format!("{}=\"", key))? + key.len() + 2;
    let len = info[start..].find('"')?;
    let value = &info[start..start + len];
    (!value.is_empty()).then(|| value.to_string())
}

fn protocol_for(url: &str) -> MediaProtocol {
    match url.split_once("://").map(|(scheme, _)| scheme.to_ascii_lowercase()) {
        Some(scheme) => scheme.parse().unwrap_or(MediaProtocol::Http),
        None => MediaProtocol::File,
    }
}

/// Channels from an M3U playlist (local path or URL).
pub struct M3uHost {
    config: TunerHostConfig,
    http: Client,
}

impl M3uHost {
    pub fn new(config: &TunerHostConfig, http: Client) -> Self {
        Self {
            config: config.clone(),
            http,
        }
    }

    async fn load(&self) -> Result<Vec<M3uEntry>, TunerError> {
        let content = if self.config.url.contains("://") {
            self.http
                .get(&self.config.url)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?
        } else {
            tokio::fs::read_to_string(&self.config.url).await?
        };
        Ok(parse_playlist(&content))
    }
}

#[async_trait]
impl TunerHost for M3uHost {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> TunerKind {
        TunerKind::M3u
    }

    async fn channels(&self) -> Result<Vec<ChannelInfo>, TunerError> {
        Ok(self
            .load()
            .await?
            .into_iter()
            .map(|e| ChannelInfo {
                number: e.number,
                name: e.name,
                url: Some(e.url),
                video_codec: None,
                audio_codec: None,
                hd: false,
            })
            .collect())
    }

    async fn resolve(&self, channel: &str) -> Result<ResolvedChannel, TunerError> {
        let entry = self
            .load()
            .await?
            .into_iter()
            .find(|e| e.number == channel)
            .ok_or_else(|| TunerError::ChannelNotFound(format!("{} in playlist {}", channel, self.config.id)))?;

        let protocol = protocol_for(&entry.url);
        let media_source = MediaSourceInfo::live_ts(format!("{}_{}", self.config.id, channel), protocol, &entry.url);

        Ok(ResolvedChannel {
            source: LiveSource::Provided {
                media_source: media_source.clone(),
            },
            media_source,
            key: SharingKey::new(&self.config.id, channel),
            enable_sharing: self.config.enable_stream_sharing,
            tuner_host_id: self.config.id.clone(),
            device_id: None,
        })
    }
}
