use anyhow::Result;
use async_trait::async_trait;
use breadcrumb_pipeline::fetch::HttpClient;
use breadcrumb_pipeline::normalize::Normalizer;
use breadcrumb_pipeline::output::read_snapshot;
use breadcrumb_pipeline::pipeline::{self, GatherConfig};
use breadcrumb_pipeline::publish::PublishState;
use breadcrumb_pipeline::record::{FETCHED_AT_KEY, VEHICLE_TAG_KEY};
use breadcrumb_pipeline::services::message_queue::{MessageSink, PendingAck, TopicPath};
use bytes::Bytes;
use futures::FutureExt;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Serves canned `(status, body)` replies keyed by the `vehicle_id` query parameter.
struct StubBreadcrumbApi {
    replies: HashMap<String, (u16, String)>,
}

impl StubBreadcrumbApi {
    fn new(replies: &[(&str, u16, Value)]) -> Self {
        Self {
            replies: replies
                .iter()
                .map(|(id, status, body)| (id.to_string(), (*status, body.to_string())))
                .collect(),
        }
    }
}

#[async_trait]
impl HttpClient for StubBreadcrumbApi {
    async fn execute(&self, req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let vehicle_id = req
            .url()
            .query_pairs()
            .find(|(k, _)| k == "vehicle_id")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();
        let (status, body) = self
            .replies
            .get(&vehicle_id)
            .cloned()
            .unwrap_or((404, r#"{"error":"unknown vehicle"}"#.to_string()));
        let resp = http::Response::builder().status(status).body(body).unwrap();
        Ok(reqwest::Response::from(resp))
    }
}

/// Records every payload and acknowledges it immediately.
#[derive(Default)]
struct MemorySink {
    published: Mutex<Vec<(String, Bytes)>>,
    closed: AtomicBool,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn submit(&self, topic: &TopicPath, payload: Bytes) -> Result<PendingAck> {
        self.published
            .lock()
            .unwrap()
            .push((topic.subject(), payload));
        Ok(async { Ok(()) }.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn topic() -> TopicPath {
    TopicPath::new("test-project", "lab-breadcrumbs-topic").unwrap()
}

fn snapshot_path(name: &str) -> PathBuf {
    let path = env::temp_dir().join(name);
    let _ = fs::remove_file(&path);
    path
}

fn breadcrumb(vehicle: u32, time: &str, meters: u32) -> Value {
    json!({
        "VEHICLE_ID": vehicle,
        "time": time,
        "GPS_LATITUDE": 45.52,
        "GPS_LONGITUDE": -122.67,
        "METERS": meters,
    })
}

#[tokio::test]
async fn test_partial_success_run() {
    let api = StubBreadcrumbApi::new(&[
        (
            "3003",
            200,
            json!([
                breadcrumb(3003, "2025-10-30T07:00:00", 10),
                breadcrumb(3003, "2025-10-30T07:00:05", 42),
            ]),
        ),
        ("3007", 500, json!({"error": "internal"})),
    ]);
    let sink = MemorySink::default();
    let config = GatherConfig::new(vec!["3003".to_string(), "3007".to_string()]);
    let path = snapshot_path("breadcrumb_pipeline_it_partial.json");

    let report = pipeline::run(&api, &sink, &topic(), &config, &path, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.gather.records.len(), 2);
    assert_eq!(report.gather.vehicles_ok, 1);
    assert_eq!(report.gather.vehicles_failed.len(), 1);
    assert_eq!(report.gather.vehicles_failed[0].vehicle_id, "3007");
    assert_eq!(report.gather.vehicles_failed[0].error.kind(), "http_status");

    let snapshot = read_snapshot(&path).unwrap();
    assert_eq!(snapshot, report.gather.records);

    let publish = report.publish.as_ref().unwrap();
    assert_eq!(publish.state, PublishState::Done);
    assert_eq!((publish.submitted, publish.acknowledged, publish.failed), (2, 2, 0));
    report.ensure_delivered().unwrap();

    let published = sink.published.lock().unwrap();
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|(subject, _)| subject == "test-project.lab-breadcrumbs-topic"));
    let body: Value = serde_json::from_slice(&published[1].1).unwrap();
    assert_eq!(body["METERS"], 42);
    assert!(body[FETCHED_AT_KEY].as_str().is_some_and(|s| !s.is_empty()));
    assert!(sink.closed.load(Ordering::SeqCst));

    fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_target_date_falls_back_to_raw_batch() {
    let raw = json!([
        breadcrumb(3003, "2025-10-29T06:00:00", 1),
        breadcrumb(3003, "2025-10-29T06:00:05", 2),
        breadcrumb(3003, "2025-10-29T06:00:10", 3),
    ]);
    let api = StubBreadcrumbApi::new(&[("3003", 200, raw)]);
    let sink = MemorySink::default();
    let mut config = GatherConfig::new(vec!["3003".to_string()]);
    config.normalizer = Normalizer {
        target_date: Some("2025-10-30".to_string()),
        tag_vehicle: true,
    };
    let path = snapshot_path("breadcrumb_pipeline_it_fallback.json");

    let report = pipeline::run(&api, &sink, &topic(), &config, &path, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.gather.records.len(), 3);
    assert!(
        report
            .gather
            .records
            .iter()
            .all(|r| r.get(VEHICLE_TAG_KEY) == Some(&json!("3003")))
    );
    assert_eq!(report.publish.as_ref().unwrap().acknowledged, 3);

    fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_target_date_keeps_matching_day_only() {
    let raw = json!([
        breadcrumb(3010, "2025-10-29T23:59:55", 1),
        breadcrumb(3010, "2025-10-30T00:00:00", 2),
    ]);
    let api = StubBreadcrumbApi::new(&[("3010", 200, raw)]);
    let sink = MemorySink::default();
    let mut config = GatherConfig::new(vec!["3010".to_string()]);
    config.normalizer.target_date = Some("2025-10-30".to_string());
    let path = snapshot_path("breadcrumb_pipeline_it_filter.json");

    let report = pipeline::run(&api, &sink, &topic(), &config, &path, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.gather.records.len(), 1);
    assert_eq!(report.gather.records[0].get("METERS"), Some(&json!(2)));

    fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_interrupted_run_keeps_snapshot_and_skips_publish() {
    let api = StubBreadcrumbApi::new(&[("3003", 200, json!([breadcrumb(3003, "t", 1)]))]);
    let sink = MemorySink::default();
    let config = GatherConfig::new(vec!["3003".to_string()]);
    let path = snapshot_path("breadcrumb_pipeline_it_interrupted.json");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let report = pipeline::run(&api, &sink, &topic(), &config, &path, &cancel)
        .await
        .unwrap();

    assert!(report.publish.is_none());
    assert!(report.ensure_delivered().is_err());
    assert!(read_snapshot(&path).unwrap().is_empty());
    assert!(sink.published.lock().unwrap().is_empty());
    assert!(sink.closed.load(Ordering::SeqCst));

    fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_replay_publishes_snapshot() {
    let api = StubBreadcrumbApi::new(&[(
        "3003",
        200,
        json!([breadcrumb(3003, "a", 1), breadcrumb(3003, "b", 2)]),
    )]);
    let config = GatherConfig::new(vec!["3003".to_string()]);
    let path = snapshot_path("breadcrumb_pipeline_it_replay.json");

    let first = MemorySink::default();
    pipeline::run(&api, &first, &topic(), &config, &path, &CancellationToken::new())
        .await
        .unwrap();

    let second = MemorySink::default();
    let report = pipeline::replay(&second, &topic(), &path, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.acknowledged, 2);
    let first_bodies: Vec<_> = first.published.lock().unwrap().iter().map(|(_, b)| b.clone()).collect();
    let second_bodies: Vec<_> = second.published.lock().unwrap().iter().map(|(_, b)| b.clone()).collect();
    assert_eq!(first_bodies, second_bodies);

    fs::remove_file(&path).unwrap();
}

#[tokio::test]
async fn test_replay_missing_snapshot_fails_and_closes_sink() {
    let sink = MemorySink::default();
    let path = snapshot_path("breadcrumb_pipeline_it_no_snapshot.json");

    let result = pipeline::replay(&sink, &topic(), &path, &CancellationToken::new()).await;

    assert!(result.is_err());
    assert!(sink.published.lock().unwrap().is_empty());
    assert!(sink.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_collect_snapshots_before_any_queue_exists() {
    let api = StubBreadcrumbApi::new(&[
        ("3003", 200, json!([breadcrumb(3003, "a", 1)])),
        ("3007", 500, json!({"error": "internal"})),
    ]);
    let config = GatherConfig::new(vec!["3003".to_string(), "3007".to_string()]);
    let path = snapshot_path("breadcrumb_pipeline_it_collect.json");

    let gather = pipeline::collect(&api, &config, &path, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(read_snapshot(&path).unwrap(), gather.records);
    assert_eq!(gather.records.len(), 1);

    let sink = MemorySink::default();
    let report = pipeline::deliver(&sink, &topic(), gather, &CancellationToken::new()).await;
    assert_eq!(report.publish.as_ref().unwrap().acknowledged, 1);
    assert!(sink.closed.load(Ordering::SeqCst));

    fs::remove_file(&path).unwrap();
}
