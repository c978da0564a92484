//! HTTP intake routes driven end-to-end against the in-memory bus

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use slopeguard_connectors::bus::{BusPublisher, InMemoryBus, TopicTable};
use slopeguard_connectors::http::{self, IntakeConfig};
use slopeguard_connectors::IngestContext;
use slopeguard_core::{ManualClock, Source, StatsAggregator, Validator, ValidatorConfig};

const BOUNDARY: &str = "slopeguard-test-boundary";

struct Harness {
    app: Router,
    bus: InMemoryBus,
    stats: Arc<StatsAggregator>,
    ctx: IngestContext,
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 1, 8, 30, 0).unwrap()
}

async fn harness(config: IntakeConfig) -> Harness {
    let clock = Arc::new(ManualClock::new(now()));
    let bus = InMemoryBus::new();
    let publisher = Arc::new(BusPublisher::new(bus.clone(), TopicTable::default()));
    publisher.connect().await.unwrap();
    let stats = Arc::new(StatsAggregator::with_capacity(64, clock.clone()));
    let ctx = IngestContext::new(
        Arc::new(Validator::with_clock(ValidatorConfig::default(), clock)),
        publisher,
        Arc::clone(&stats),
    );

    Harness {
        app: http::routes(ctx.clone(), config),
        bus,
        stats,
        ctx,
    }
}

fn tilt(sensor_id: &str, seq: u64) -> Value {
    json!({
        "sensor_id": sensor_id,
        "timestamp": now().to_rfc3339(),
        "sensor_type": "tiltmeter",
        "sequence_number": seq,
        "battery_level": 76.0,
        "measurements": {"tilt_x": {"value": 0.42, "unit": "deg"}, "tilt_y": -0.1}
    })
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_files(uri: &str, files: &[(&str, &str, &str)]) -> Request<Body> {
    let mut body = String::new();
    for (name, content_type, content) in files {
        body.push_str(&format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{name}\"\r\nContent-Type: {content_type}\r\n\r\n{content}\r\n"
        ));
    }
    body.push_str(&format!("--{BOUNDARY}--\r\n"));

    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn batch_of_three_with_one_missing_sensor_id() {
    let h = harness(IntakeConfig::default()).await;
    let bad = tilt("", 3);

    let (status, body) = call(
        &h.app,
        post_json(
            "/sensor-readings/batch",
            &json!({"readings": [tilt("tm-1", 1), bad, tilt("tm-2", 1)]}),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["validCount"], 2);
    assert_eq!(body["invalidCount"], 1);
    assert_eq!(body["metrics"]["totalRecords"], 3);
    assert_eq!(body["errors"][0]["index"], 1);

    let raw = h.bus.messages_on("raw-sensor-data");
    let keys: Vec<_> = raw.iter().map(|m| m.key.as_str()).collect();
    assert_eq!(keys, ["tm-1", "tm-2"]);
    assert_eq!(raw[0].header("source"), Some("batch"));
    assert_eq!(h.bus.transactions_begun(), 1);
    assert_eq!(h.bus.messages_on("batch-processing-results").len(), 1);
    assert_eq!(h.bus.messages_on("data-quality-metrics").len(), 1);

    let summary = h.stats.summary();
    let batch = summary.sources[&Source::Batch];
    assert_eq!(batch.received, 3);
    assert_eq!(batch.processed, 2);
    assert_eq!(batch.rejected, 1);
}

#[tokio::test]
async fn oversized_batch_rejected_before_validation() {
    let h = harness(IntakeConfig {
        max_batch_size: 2,
        ..IntakeConfig::default()
    })
    .await;

    let readings: Vec<Value> = (0..3).map(|i| tilt("tm-9", i)).collect();
    let (status, body) = call(&h.app, post_json("/sensor-readings/batch", &json!({"readings": readings}))).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], false);
    assert!(h.bus.messages().is_empty());
    // nothing reached the dedup cache
    assert!(h.ctx.validator.cache().is_empty());
    assert_eq!(h.stats.summary().sources[&Source::Batch].rejected, 3);
}

#[tokio::test]
async fn batch_publish_failure_leaves_nothing_on_the_bus() {
    let h = harness(IntakeConfig::default()).await;
    h.bus.fail_nth_send(2);

    let readings = vec![tilt("a", 1), tilt("b", 1), tilt("c", 1)];
    let (status, _) = call(&h.app, post_json("/sensor-readings/batch", &json!({"readings": readings}))).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(h.bus.messages_on("raw-sensor-data").is_empty());
    assert!(h.bus.messages_on("batch-processing-results").is_empty());
    assert_eq!(h.ctx.publisher.stats().transactions_aborted, 1);
}

#[tokio::test]
async fn single_reading_defaults_timestamp() {
    let h = harness(IntakeConfig::default()).await;
    let mut reading = tilt("tm-4", 8);
    reading.as_object_mut().unwrap().remove("timestamp");

    let (status, body) = call(&h.app, post_json("/sensor-reading", &reading)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["sensorId"], "tm-4");

    let raw = h.bus.messages_on("raw-sensor-data");
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].header("source"), Some("http"));
    let published: Value = serde_json::from_slice(&raw[0].payload).unwrap();
    let stamped = DateTime::parse_from_rfc3339(published["timestamp"].as_str().unwrap()).unwrap();
    assert_eq!(stamped.with_timezone(&Utc), now());
}

#[tokio::test]
async fn single_rejection_returns_findings() {
    let h = harness(IntakeConfig::default()).await;
    let mut reading = tilt("tm-5", 1);
    reading["measurements"]["tilt_x"] = json!(140.0);

    let (status, body) = call(&h.app, post_json("/sensor-reading", &reading)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["errors"][0], "Invalid measurement value for tilt_x: 140");
    assert!(body["qualityScore"].as_f64().unwrap() < 1.0);
    assert!(h.bus.messages().is_empty());

    let http = h.stats.summary().sources[&Source::Http];
    assert_eq!((http.received, http.rejected), (1, 1));
}

#[tokio::test]
async fn single_reading_with_bus_down() {
    let h = harness(IntakeConfig::default()).await;
    h.ctx.publisher.disconnect().await.unwrap();

    let (status, body) = call(&h.app, post_json("/sensor-reading", &tilt("tm-6", 1))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "Not connected");
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let h = harness(IntakeConfig::default()).await;
    let request = Request::builder()
        .method("POST")
        .uri("/sensor-readings/batch")
        .header("content-type", "application/json")
        .body(Body::from("{\"readings\": 7}"))
        .unwrap();

    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

#[tokio::test]
async fn csv_and_json_files_validated_as_one_batch() {
    let h = harness(IntakeConfig::default()).await;
    let at = now().to_rfc3339();
    let csv = format!(
        "sensor_id,timestamp,sensor_type,measurement_displacement_x,battery_level\n\
         ext-1,{at},extensometer,2.5,60\n\
         ext-2,{at},extensometer,not-a-number,60\n"
    );
    let json_file = json!([tilt("tm-7", 1)]).to_string();

    let (status, body) = call(
        &h.app,
        post_files(
            "/upload",
            &[("site-a.csv", "text/csv", &csv), ("site-b.json", "application/json", &json_file)],
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metrics"]["totalRecords"], 3);
    assert_eq!(body["validCount"], 2);
    assert_eq!(body["errors"][0]["index"], 1);
    assert_eq!(body["errors"][0]["sensorId"], "ext-2");

    let keys: Vec<_> = h
        .bus
        .messages_on("raw-sensor-data")
        .into_iter()
        .map(|m| m.key)
        .collect();
    assert_eq!(keys, ["ext-1", "tm-7"]);
}

#[tokio::test]
async fn upload_file_checks() {
    let h = harness(IntakeConfig {
        max_file_size: 64,
        ..IntakeConfig::default()
    })
    .await;

    let (status, _) = call(&h.app, post_files("/upload", &[("notes.txt", "text/plain", "hi")])).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let (status, _) = call(&h.app, post_files("/upload/json", &[("a.csv", "text/csv", "sensor_id\n")])).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let big = "x".repeat(65);
    let (status, body) = call(&h.app, post_files("/upload/csv", &[("big.csv", "text/csv", &big)])).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], false);

    assert!(h.bus.messages().is_empty());
}

#[tokio::test]
async fn upload_bounded_by_batch_size_after_parsing() {
    let h = harness(IntakeConfig {
        max_batch_size: 2,
        ..IntakeConfig::default()
    })
    .await;
    let at = now().to_rfc3339();
    let csv = format!(
        "sensor_id,timestamp,sensor_type,measurement_strain\n\
         sg-1,{at},strain_gauge,10\n\
         sg-2,{at},strain_gauge,11\n\
         sg-3,{at},strain_gauge,12\n"
    );

    let (status, body) = call(&h.app, post_files("/upload/csv", &[("gauges.csv", "text/csv", &csv)])).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["success"], false);
    assert!(h.ctx.validator.cache().is_empty());
    assert!(h.bus.messages().is_empty());
    assert_eq!(h.stats.summary().sources[&Source::Batch].rejected, 3);
}

#[tokio::test]
async fn stats_route_reports_summary() {
    let h = harness(IntakeConfig::default()).await;
    call(&h.app, post_json("/sensor-reading", &tilt("tm-8", 1))).await;

    let request = Request::builder().uri("/stats").body(Body::empty()).unwrap();
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totalReceived"], 1);
    assert_eq!(body["totalProcessed"], 1);
    assert_eq!(body["sources"]["http"]["received"], 1);
}
