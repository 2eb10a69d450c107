use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tunerflow_common::{MediaProtocol, MediaSourceInfo};

use super::{udp_target, ChannelInfo, ResolvedChannel, TunerError, TunerHost};
use crate::config::{TunerHostConfig, TunerKind};
use crate::live::{LiveSource, SharingKey};

/// `discover.json` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "TunerCount", default = "default_tuner_count")]
    pub tuner_count: u32,
    #[serde(rename = "BaseURL", default)]
    pub base_url: Option<String>,
    #[serde(rename = "LineupURL", default)]
    pub lineup_url: Option<String>,
    #[serde(rename = "ModelNumber", default)]
    pub model_number: Option<String>,
    #[serde(rename = "FirmwareVersion", default)]
    pub firmware_version: Option<String>,
    #[serde(rename = "FriendlyName", default)]
    pub friendly_name: Option<String>,
}

fn default_tuner_count() -> u32 {
    2
}

/// One `lineup.json` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineupEntry {
    #[serde(rename = "GuideNumber")]
    pub guide_number: String,
    #[serde(rename = "GuideName", default)]
    pub guide_name: String,
    #[serde(rename = "URL", default)]
    pub url: Option<String>,
    #[serde(rename = "VideoCodec", default)]
    pub video_codec: Option<String>,
    #[serde(rename = "AudioCodec", default)]
    pub audio_codec: Option<String>,
    #[serde(rename = "HD", default)]
    pub hd: u8,
}

/// HTTP discovery client for HDHomeRun devices.
pub struct HdHomeRunClient {
    http: Client,
    /// Device info by base URL; devices don't change model at runtime.
    model_cache: Mutex<HashMap<String, DeviceInfo>>,
}

impl HdHomeRunClient {
    pub fn new(http: Client) -> Self {
        Self {
            http,
            model_cache: Mutex::new(HashMap::new()),
        }
    }

    /// `GET {base}/discover.json`, cached per base URL.
    pub async fn discover(&self, base_url: &str) -> Result<DeviceInfo, TunerError> {
        let base_url = base_url.trim_end_matches('/');
        let cached = self.model_cache.lock().get(base_url).cloned();
        if let Some(info) = cached {
            return Ok(info);
        }

        let info: DeviceInfo = self
            .http
            .get(format!("{}/discover.json", base_url))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        tracing::debug!(
            base_url,
            device_id = %info.device_id,
            tuners = info.tuner_count,
            model = info.model_number.as_deref().unwrap_or("unknown"),
            "Discovered HDHomeRun"
        );
        self.model_cache.lock().insert(base_url.to_string(), info.clone());
        Ok(info)
    }

    pub async fn lineup(&self, base_url: &str, device: &DeviceInfo) -> Result<Vec<LineupEntry>, TunerError> {
        let url = device
            .lineup_url
            .clone()
            .unwrap_or_else(|| format!("{}/lineup.json", base_url.trim_end_matches('/')));

        let entries = self
            .http
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(entries)
    }

    pub fn forget(&self, base_url: &str) {
        self.model_cache.lock().remove(base_url.trim_end_matches('/'));
    }
}

/// A configured HDHomeRun, streaming over HTTP or (legacy) UDP.
pub struct HdHomeRunHost {
    config: TunerHostConfig,
    client: HdHomeRunClient,
}

impl HdHomeRunHost {
    pub fn new(config: &TunerHostConfig, http: Client) -> Self {
        Self {
            config: config.clone(),
            client: HdHomeRunClient::new(http),
        }
    }

    fn is_legacy(&self) -> bool {
        self.config.kind == TunerKind::HdhomerunLegacy
    }

    fn device_host(&self) -> Result<String, TunerError> {
        let url = reqwest::Url::parse(&self.config.url)
            .map_err(|e| TunerError::Protocol(format!("bad device url {}: {}", self.config.url, e)))?;
        url.host_str()
            .map(str::to_string)
            .ok_or_else(|| TunerError::Protocol(format!("device url has no host: {}", self.config.url)))
    }
}

#[async_trait]
impl TunerHost for HdHomeRunHost {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> TunerKind {
        self.config.kind
    }

    async fn channels(&self) -> Result<Vec<ChannelInfo>, TunerError> {
        let device = self.client.discover(&self.config.url).await?;
        let lineup = self.client.lineup(&self.config.url, &device).await?;
        Ok(lineup
            .into_iter()
            .map(|e| ChannelInfo {
                number: e.guide_number,
                name: e.guide_name,
                url: e.url,
                video_codec: e.video_codec,
                audio_codec: e.audio_codec,
                hd: e.hd != 0,
            })
            .collect())
    }

    async fn resolve(&self, channel: &str) -> Result<ResolvedChannel, TunerError> {
        let device = self.client.discover(&self.config.url).await?;
        let lineup = self.client.lineup(&self.config.url, &device).await?;
        let entry = lineup
            .into_iter()
            .find(|e| e.guide_number == channel)
            .ok_or_else(|| TunerError::ChannelNotFound(format!("{} on tuner {}", channel, self.config.id)))?;

        let (source, mut media_source) = if self.is_legacy() {
            let host = self.device_host()?;
            let tuner_count = self.config.tuner_count.unwrap_or(device.tuner_count);
            // The real port is picked when the stream opens.
            let path = udp_target(&host, 0);
            (
                LiveSource::HdHomeRunUdp {
                    host,
                    channel: entry.guide_number.clone(),
                    tuner_count,
                },
                MediaSourceInfo::live_ts(format!("{}_{}", self.config.id, channel), MediaProtocol::Udp, path),
            )
        } else {
            let url = entry
                .url
                .clone()
                .ok_or_else(|| TunerError::Protocol(format!("lineup entry {} has no URL", channel)))?;
            (
                LiveSource::HdHomeRunHttp { url: url.clone() },
                MediaSourceInfo::live_ts(format!("{}_{}", self.config.id, channel), MediaProtocol::Http, url),
            )
        };
        media_source.video_codec = entry.video_codec.map(|c| c.to_lowercase());
        media_source.audio_codec = entry.audio_codec.map(|c| c.to_lowercase());

        Ok(ResolvedChannel {
            source,
            media_source,
            key: SharingKey::new(&self.config.id, channel),
            enable_sharing: self.config.enable_stream_sharing,
            tuner_host_id: self.config.id.clone(),
            device_id: Some(device.device_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_device() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/discover.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "FriendlyName": "HDHomeRun CONNECT",
                "ModelNumber": "HDHR4-2US",
                "FirmwareVersion": "20200101",
                "DeviceID": "1040ABCD",
                "TunerCount": 2,
                "BaseURL": server.uri(),
                "LineupURL": format!("{}/lineup.json", server.uri()),
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/lineup.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"GuideNumber": "5.1", "GuideName": "WABC-HD", "VideoCodec": "MPEG2", "AudioCodec": "AC3", "HD": 1,
                 "URL": format!("{}/auto/v5.1", server.uri())},
                {"GuideNumber": "7.1", "GuideName": "WXYZ", "URL": format!("{}/auto/v7.1", server.uri())},
            ])))
            .mount(&server)
            .await;
        server
    }

    fn host_config(server: &MockServer, kind: TunerKind) -> TunerHostConfig {
        TunerHostConfig {
            id: "hdhr".to_string(),
            kind,
            url: server.uri(),
            enable_stream_sharing: true,
            tuner_count: None,
        }
    }

    #[tokio::test]
    async fn test_discover_is_cached() {
        let server = mock_device().await;
        let client = HdHomeRunClient::new(Client::new());

        let first = client.discover(&server.uri()).await.unwrap();
        let second = client.discover(&format!("{}/", server.uri())).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.device_id, "1040ABCD");
        assert_eq!(first.tuner_count, 2);
        // `.expect(1)` on the mock verifies the cache on drop.
    }

    #[tokio::test]
    async fn test_channels_from_lineup() {
        let server = mock_device().await;
        let host = HdHomeRunHost::new(&host_config(&server, TunerKind::Hdhomerun), Client::new());

        let channels = host.channels().await.unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(channels[0].number, "5.1");
        assert!(channels[0].hd);
        assert!(!channels[1].hd);
    }

    #[tokio::test]
    async fn test_resolve_http_channel() {
        let server = mock_device().await;
        let host = HdHomeRunHost::new(&host_config(&server, TunerKind::Hdhomerun), Client::new());

        let resolved = host.resolve("5.1").await.unwrap();
        assert!(matches!(&resolved.source, LiveSource::HdHomeRunHttp { url } if url.ends_with("/auto/v5.1")));
        assert_eq!(resolved.key, SharingKey::new("hdhr", "5.1"));
        assert_eq!(resolved.device_id.as_deref(), Some("1040ABCD"));
        assert_eq!(resolved.media_source.video_codec.as_deref(), Some("mpeg2"));

        let err = host.resolve("99.1").await.unwrap_err();
        assert!(matches!(err, TunerError::ChannelNotFound(_)));
    }

    #[tokio::test]
    async fn test_resolve_legacy_channel() {
        let server = mock_device().await;
        let mut config = host_config(&server, TunerKind::HdhomerunLegacy);
        config.tuner_count = Some(4);
        let host = HdHomeRunHost::new(&config, Client::new());

        let resolved = host.resolve("7.1").await.unwrap();
        match resolved.source {
            LiveSource::HdHomeRunUdp {
                host,
                channel,
                tuner_count,
            } => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(channel, "7.1");
                assert_eq!(tuner_count, 4);
            }
            other => panic!("unexpected source {:?}", other),
        }
        assert_eq!(resolved.media_source.protocol, MediaProtocol::Udp);
    }
}
