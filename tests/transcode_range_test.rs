//! Range requests against transcode job output over HTTP.

mod common;

use common::{payload, TestHarness};
use std::sync::Arc;
use std::time::Duration;
use tunerflow::transcode::TranscodeJob;
use tunerflow_common::TranscodeJobId;

fn register_job(h: &TestHarness, name: &str, data: &[u8], finished: bool) -> Arc<TranscodeJob> {
    let path = h.transcode_dir().join(name);
    std::fs::write(&path, data).unwrap();
    let job = TranscodeJob::new(TranscodeJobId::new(), &path);
    if finished {
        job.set_completion(100.0);
        job.mark_exited(Some(0));
    }
    h.ctx.jobs.register(job)
}

#[tokio::test]
async fn finished_job_serves_exact_range() {
    let (h, addr) = TestHarness::with_server().await;
    let data = payload(1_000_000);
    let job = register_job(&h, "finished.ts", &data, true);

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/api/transcodes/{}/stream", job.id()))
        .header("Range", "bytes=500000-")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 206);
    let headers = resp.headers().clone();
    assert_eq!(headers["content-range"], "bytes 500000-999999/1000000");
    assert_eq!(headers["content-length"], "500000");
    assert_eq!(headers["accept-ranges"], "bytes");
    assert_eq!(headers["etag"], "\"finished\"");
    assert_eq!(headers["cache-control"], "public, max-age=86400");
    assert!(headers.contains_key("last-modified"));
    assert!(headers.contains_key("expires"));

    let body = resp.bytes().await.unwrap();
    assert_eq!(&body[..], &data[500_000..]);

    // Reader detaches once the response is done.
    for _ in 0..50 {
        if job.active_readers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(job.active_readers(), 0);
    assert_eq!(job.bytes_downloaded(), Some(1_000_000));
}

#[tokio::test]
async fn running_job_reports_unknown_total() {
    let (h, addr) = TestHarness::with_server().await;
    let data = payload(200_000);
    let job = register_job(&h, "running.ts", &data, false);

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/api/transcodes/{}/stream", job.id()))
        .header("Range", "bytes=0-")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 206);
    assert_eq!(resp.headers()["content-range"], "bytes 0-199999/*");
    assert_eq!(resp.headers()["content-length"], "200000");
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 200_000);
}

#[tokio::test]
async fn multiple_ranges_are_416() {
    let (h, addr) = TestHarness::with_server().await;
    let job = register_job(&h, "multi.ts", &payload(1000), true);

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/api/transcodes/{}/stream", job.id()))
        .header("Range", "bytes=0-10,20-30")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 416);
    assert!(resp.bytes().await.unwrap().is_empty());
    assert_eq!(job.active_readers(), 0);
}

#[tokio::test]
async fn no_range_serves_whole_file() {
    let (h, addr) = TestHarness::with_server().await;
    let data = payload(50_000);
    let job = register_job(&h, "whole.ts", &data, true);

    let resp = reqwest::get(format!("http://{addr}/api/transcodes/{}/stream", job.id()))
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"], "50000");
    assert!(!resp.headers().contains_key("content-range"));
    assert_eq!(&resp.bytes().await.unwrap()[..], &data[..]);
}

#[tokio::test]
async fn delete_removes_job_and_output() {
    let (h, addr) = TestHarness::with_server().await;
    let job = register_job(&h, "delete.ts", &payload(100), true);
    let client = reqwest::Client::new();

    let list: serde_json::Value = client
        .get(format!("http://{addr}/api/transcodes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);
    assert_eq!(list[0]["has_exited"], true);

    let resp = client
        .delete(format!("http://{addr}/api/transcodes/{}", job.id()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);
    assert!(!job.output_path().exists());
    assert!(job.kill_token().is_cancelled());

    let resp = client
        .get(format!("http://{addr}/api/transcodes/{}", job.id()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
