//! Tuner lineup and HDHomeRun-backed live streams against a mocked device.

mod common;

use common::{payload, TestHarness};
use tunerflow::config::{Config, TunerHostConfig, TunerKind};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn mock_device(channel_data: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    let uri = server.uri();

    Mock::given(method("GET"))
        .and(path("/discover.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "DeviceID": "1234ABCD",
            "TunerCount": 2,
            "ModelNumber": "HDHR5-2US",
            "LineupURL": format!("{uri}/lineup.json"),
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/lineup.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
            { "GuideNumber": "5.1", "GuideName": "KVOS", "URL": format!("{uri}/auto/v5.1"), "VideoCodec": "MPEG2", "HD": 1 },
            { "GuideNumber": "9.1", "GuideName": "BUSY", "URL": format!("{uri}/auto/v9.1") },
        ])))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/auto/v5.1"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(channel_data))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/auto/v9.1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    server
}

fn config_for(device: &MockServer) -> Config {
    let mut config = Config::default();
    config.live_tv.tuners.push(TunerHostConfig {
        id: "hdhr".to_string(),
        kind: TunerKind::Hdhomerun,
        url: device.uri(),
        enable_stream_sharing: true,
        tuner_count: None,
    });
    config
}

#[tokio::test]
async fn lineup_lists_device_channels() {
    let device = mock_device(Vec::new()).await;
    let (_h, addr) = TestHarness::with_server_config(config_for(&device)).await;

    let resp = reqwest::get(format!("http://{addr}/api/tuners/hdhr/lineup")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let lineup: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(lineup.as_array().unwrap().len(), 2);
    assert_eq!(lineup[0]["number"], "5.1");
    assert_eq!(lineup[0]["name"], "KVOS");
    assert_eq!(lineup[0]["hd"], true);
    assert_eq!(lineup[1]["hd"], false);
}

#[tokio::test]
async fn channel_stream_plays_to_end_of_source() {
    let data = payload(188 * 200);
    let device = mock_device(data.clone()).await;
    let (_h, addr) = TestHarness::with_server_config(config_for(&device)).await;
    let client = reqwest::Client::new();
    let request = serde_json::json!({ "tuner_id": "hdhr", "channel": "5.1" });

    let resp = client
        .post(format!("http://{addr}/api/live/streams"))
        .json(&request)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let opened: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(opened["stream"]["tuner_host_id"], "hdhr");
    assert_eq!(opened["stream"]["key"], "hdhr/5.1");
    assert_eq!(opened["stream"]["media_source"]["video_codec"], "mpeg2");
    let stream_url = opened["stream_url"].as_str().unwrap().to_string();

    // The device body ends, so the copy ends once the producer has stopped.
    let body = client
        .get(format!("http://{addr}{stream_url}?from_beginning=true"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(&body[..], &data[..]);

    // An ended source is not offered to new consumers.
    let reopened: serde_json::Value = client
        .post(format!("http://{addr}/api/live/streams"))
        .json(&request)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(reopened["is_new"], true);
    assert_ne!(reopened["id"], opened["id"]);
}

#[tokio::test]
async fn busy_tuner_is_503() {
    let device = mock_device(Vec::new()).await;
    let (h, addr) = TestHarness::with_server_config(config_for(&device)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/live/streams"))
        .json(&serde_json::json!({ "tuner_id": "hdhr", "channel": "9.1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    assert!(h.ctx.streams.is_empty());
}

#[tokio::test]
async fn unknown_channel_is_404() {
    let device = mock_device(Vec::new()).await;
    let (_h, addr) = TestHarness::with_server_config(config_for(&device)).await;

    let resp = reqwest::Client::new()
        .post(format!("http://{addr}/api/live/streams"))
        .json(&serde_json::json!({ "tuner_id": "hdhr", "channel": "99.9" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
