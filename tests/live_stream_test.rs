//! Live stream integration tests.
//!
//! Opens direct file sources through the HTTP API and checks sharing,
//! playback from the beginning, and release semantics.

mod common;

use common::{payload, TestHarness};
use std::time::Duration;

async fn open(client: &reqwest::Client, addr: std::net::SocketAddr, body: serde_json::Value) -> reqwest::Response {
    client
        .post(format!("http://{addr}/api/live/streams"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

/// Read at least `len` bytes from a (possibly endless) response body.
async fn read_at_least(mut resp: reqwest::Response, len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    while out.len() < len {
        let chunk = tokio::time::timeout(Duration::from_secs(5), resp.chunk())
            .await
            .expect("timed out waiting for stream data")
            .unwrap()
            .expect("stream ended early");
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn shared_stream_opens_once_and_closes_on_last_release() {
    let (h, addr) = TestHarness::with_server().await;
    let data = payload(188 * 100);
    let source = h.write_file("channel.ts", &data);
    let client = reqwest::Client::new();
    let request = serde_json::json!({ "path": source.to_string_lossy() });

    let resp = open(&client, addr, request.clone()).await;
    assert_eq!(resp.status(), 201);
    let first: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(first["is_new"], true);
    assert_eq!(first["consumer_count"], 1);
    let id = first["id"].as_str().unwrap().to_string();

    let resp = open(&client, addr, request).await;
    assert_eq!(resp.status(), 200);
    let second: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(second["is_new"], false);
    assert_eq!(second["consumer_count"], 2);
    assert_eq!(second["id"], id.as_str());

    let list: serde_json::Value = client
        .get(format!("http://{addr}/api/live/streams"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["state"], "open");

    // Historical playback starts at the first byte ingested.
    let resp = client
        .get(format!("http://{addr}/api/live/streams/{id}/stream.ts?from_beginning=true"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "video/mp2t");
    let got = read_at_least(resp, data.len()).await;
    assert_eq!(&got[..data.len()], &data[..]);

    let released: serde_json::Value = client
        .delete(format!("http://{addr}/api/live/streams/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(released["result"], "released");
    assert_eq!(released["remaining"], 1);

    let closed: serde_json::Value = client
        .delete(format!("http://{addr}/api/live/streams/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(closed["result"], "closed");

    let resp = client
        .get(format!("http://{addr}/api/live/streams/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    // Segment files are deleted in the background once closed.
    let dir = h.transcode_dir();
    let mut empty = false;
    for _ in 0..100 {
        if std::fs::read_dir(&dir).unwrap().next().is_none() {
            empty = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(empty, "segment files were not removed");
}

#[tokio::test]
async fn exclusive_requests_get_their_own_streams() {
    let (h, addr) = TestHarness::with_server().await;
    let source = h.write_file("exclusive.ts", &payload(188 * 10));
    let client = reqwest::Client::new();
    let request = serde_json::json!({ "path": source.to_string_lossy(), "enable_sharing": false });

    let a: serde_json::Value = open(&client, addr, request.clone()).await.json().await.unwrap();
    let b: serde_json::Value = open(&client, addr, request).await.json().await.unwrap();

    assert_eq!(a["is_new"], true);
    assert_eq!(b["is_new"], true);
    assert_ne!(a["id"], b["id"]);
    assert_eq!(h.ctx.streams.len(), 2);

    // Exclusive streams close on their first release.
    let id = a["id"].as_str().unwrap();
    let closed: serde_json::Value = client
        .delete(format!("http://{addr}/api/live/streams/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(closed["result"], "closed");
    assert_eq!(h.ctx.streams.len(), 1);
}

#[tokio::test]
async fn missing_source_file_is_rejected() {
    let (h, addr) = TestHarness::with_server().await;
    let client = reqwest::Client::new();
    let missing = h.temp.path().join("missing.ts");

    let resp = open(&client, addr, serde_json::json!({ "path": missing.to_string_lossy() })).await;
    assert_eq!(resp.status(), 400);
    assert!(h.ctx.streams.is_empty());
}

#[tokio::test]
async fn shutdown_closes_open_streams() {
    let (h, addr) = TestHarness::with_server().await;
    let source = h.write_file("shutdown.ts", &payload(188 * 10));
    let client = reqwest::Client::new();

    let resp = open(&client, addr, serde_json::json!({ "path": source.to_string_lossy() })).await;
    assert_eq!(resp.status(), 201);
    let stream = h.ctx.streams.list().pop().unwrap();

    h.ctx.shutdown().await;
    assert_eq!(stream.state(), tunerflow::live::StreamState::Closed);
    assert!(stream.segments().paths().iter().all(|p| !p.exists()));
}

#[tokio::test]
async fn transcode_job_keeps_its_source_stream_open() {
    let (h, addr) = TestHarness::with_server().await;
    let source = h.write_file("fed.ts", &payload(188 * 10));
    let client = reqwest::Client::new();

    let opened: serde_json::Value = open(&client, addr, serde_json::json!({ "path": source.to_string_lossy() }))
        .await
        .json()
        .await
        .unwrap();
    let id: tunerflow_common::LiveStreamId = opened["id"].as_str().unwrap().parse().unwrap();

    let output = h.transcode_dir().join("fed-output.ts");
    std::fs::write(&output, b"").unwrap();
    let job = h
        .ctx
        .jobs
        .register_fed_by(tunerflow::transcode::TranscodeJob::new(tunerflow_common::TranscodeJobId::new(), &output), id)
        .await
        .unwrap();
    assert_eq!(job.source_stream(), Some(id));

    // The HTTP consumer leaves; the job's reference keeps the stream open.
    let released: serde_json::Value = client
        .delete(format!("http://{addr}/api/live/streams/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(released["result"], "released");
    let stream = h.ctx.streams.get(&id).unwrap();
    assert_eq!(stream.state(), tunerflow::live::StreamState::Open);

    h.ctx.jobs.remove(&job.id()).await.unwrap();
    stream.wait_closed().await;
    assert!(h.ctx.streams.get(&id).is_none());
}
