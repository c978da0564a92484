//! Network-server webhooks: signature guard, decode, publish

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use tower::ServiceExt;

use slopeguard_connectors::bus::{BusPublisher, InMemoryBus, TopicTable};
use slopeguard_connectors::lorawan::{self, SignatureGuard, WebhookConfig, SIGNATURE_HEADER};
use slopeguard_connectors::IngestContext;
use slopeguard_core::{ManualClock, Source, StatsAggregator, Validator, ValidatorConfig};

const SECRET: &str = "ns-shared-secret";

struct Harness {
    app: Router,
    bus: InMemoryBus,
    stats: Arc<StatsAggregator>,
}

async fn harness(secret: Option<&str>) -> Harness {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 12, 2, 6, 0, 0).unwrap()));
    let bus = InMemoryBus::new();
    let publisher = Arc::new(BusPublisher::new(bus.clone(), TopicTable::default()));
    publisher.connect().await.unwrap();
    let stats = Arc::new(StatsAggregator::with_capacity(64, clock.clone()));
    let ctx = IngestContext::new(
        Arc::new(Validator::with_clock(ValidatorConfig::default(), clock)),
        publisher,
        Arc::clone(&stats),
    );

    let config = WebhookConfig {
        secret: secret.map(str::to_string),
        ..WebhookConfig::default()
    };
    Harness {
        app: lorawan::routes(ctx, config),
        bus,
        stats,
    }
}

fn port1_uplink(f_cnt: u64) -> Value {
    json!({
        "deviceInfo": {"devEui": "0004a30b001c2f11", "deviceName": "bench-north-2"},
        "fPort": 1,
        "fCnt": f_cnt,
        "data": STANDARD.encode([0x00, 0xFA, 0x09, 0xC4, 0x00, 0x64, 0xFF, 0x38, 0x55]),
        "rxInfo": [
            {"gatewayId": "gw-1", "rssi": -109.0, "snr": 1.5},
            {"gatewayId": "gw-2", "rssi": -88.0, "snr": 7.0,
             "location": {"latitude": -26.2, "longitude": 28.04}}
        ]
    })
}

fn post(uri: &str, body: &[u8], signature: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_vec())).unwrap()
}

fn signed(uri: &str, body: &[u8]) -> Request<Body> {
    let signature = SignatureGuard::new(Some(SECRET)).sign(body).unwrap();
    post(uri, body, Some(&signature))
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn signed_uplink_is_decoded_and_published() {
    let h = harness(Some(SECRET)).await;
    let body = port1_uplink(41).to_string();

    let (status, response) = call(&h.app, signed("/webhook/uplink", body.as_bytes())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["success"], true);
    assert_eq!(response["sensorId"], "bench-north-2");

    let raw = h.bus.messages_on("raw-sensor-data");
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0].key, "bench-north-2");
    assert_eq!(raw[0].header("source"), Some("lorawan"));
    assert_eq!(raw[0].header("sensor-type"), Some("multi_sensor"));

    let reading: Value = serde_json::from_slice(&raw[0].payload).unwrap();
    assert_eq!(reading["signal_strength"], -88.0);
    assert_eq!(reading["sequence_number"], 41);
    assert_eq!(reading["battery_level"], 85.0);
    assert_eq!(reading["location"]["latitude"], -26.2);

    let lorawan = h.stats.summary().sources[&Source::Lorawan];
    assert_eq!((lorawan.received, lorawan.processed), (1, 1));
}

#[tokio::test]
async fn wrong_signature_rejected_before_decoding() {
    let h = harness(Some(SECRET)).await;
    let body = port1_uplink(1).to_string();
    let forged = SignatureGuard::new(Some("not-the-secret"))
        .sign(body.as_bytes())
        .unwrap();

    for signature in [None, Some(forged.as_str()), Some("sha256=00ff")] {
        let (status, response) = call(&h.app, post("/webhook/uplink", body.as_bytes(), signature)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response["success"], false);
    }

    // an undecodable body is still an auth failure, not a decode failure
    let (status, _) = call(&h.app, post("/webhook/uplink", b"\x00 not json", Some(&forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    assert!(h.bus.messages().is_empty());
    assert_eq!(h.stats.summary().sources[&Source::Lorawan].rejected, 4);
}

#[tokio::test]
async fn guard_covers_lifecycle_routes() {
    let h = harness(Some(SECRET)).await;
    let body = json!({"deviceInfo": {"devEui": "70b3d57ed0041234"}}).to_string();

    for uri in ["/webhook/join", "/webhook/status", "/webhook/error"] {
        let (status, _) = call(&h.app, post(uri, body.as_bytes(), None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{}", uri);
    }
    assert!(h.bus.messages().is_empty());
}

#[tokio::test]
async fn decode_failures_are_bad_requests() {
    let h = harness(None).await;

    let mut short = port1_uplink(2);
    short["data"] = json!(STANDARD.encode([0x00, 0xFA, 0x09]));
    let (status, response) = call(&h.app, post("/webhook/uplink", short.to_string().as_bytes(), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["error"].as_str().unwrap().contains("port 1"));

    let mut unknown = port1_uplink(3);
    unknown["fPort"] = json!(99);
    let (status, _) = call(&h.app, post("/webhook/uplink", unknown.to_string().as_bytes(), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(h.bus.messages().is_empty());
}

#[tokio::test]
async fn replayed_uplink_is_unprocessable() {
    let h = harness(None).await;
    let body = port1_uplink(7).to_string();

    let (first, _) = call(&h.app, post("/webhook/uplink", body.as_bytes(), None)).await;
    let (second, response) = call(&h.app, post("/webhook/uplink", body.as_bytes(), None)).await;

    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(response["errors"][0], "Duplicate sensor reading detected");
    assert_eq!(h.bus.messages_on("raw-sensor-data").len(), 1);
}

#[tokio::test]
async fn lifecycle_events_published() {
    let h = harness(Some(SECRET)).await;
    let body = json!({
        "deviceInfo": {"devEui": "70b3d57ed0041234", "deviceName": "toe-drain-1"},
        "time": "2025-12-02T05:59:00Z",
        "devAddr": "01ab5f3c"
    })
    .to_string();

    for uri in ["/webhook/join", "/webhook/status", "/webhook/error"] {
        let (status, response) = call(&h.app, signed(uri, body.as_bytes())).await;
        assert_eq!(status, StatusCode::OK, "{}", uri);
        assert_eq!(response["success"], true);
    }

    let events = h.bus.messages_on("device-events");
    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.key == "70b3d57ed0041234"));

    let kinds: Vec<String> = events
        .iter()
        .map(|e| {
            let event: Value = serde_json::from_slice(&e.payload).unwrap();
            assert_eq!(event["details"]["devAddr"], "01ab5f3c");
            event["eventType"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, ["join", "status", "error"]);

    // lifecycle traffic never touches the telemetry path
    assert!(h.bus.messages_on("raw-sensor-data").is_empty());
}

#[tokio::test]
async fn uplink_stats_carry_quality_metrics() {
    let h = harness(None).await;
    let mut late = port1_uplink(12);
    late["time"] = json!("2025-12-02T05:00:00Z");
    let body = late.to_string();

    let (first, _) = call(&h.app, post("/webhook/uplink", body.as_bytes(), None)).await;
    let (replay, _) = call(&h.app, post("/webhook/uplink", body.as_bytes(), None)).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(replay, StatusCode::UNPROCESSABLE_ENTITY);

    let entries = h.stats.recent(Source::Lorawan);
    assert_eq!(entries.len(), 2);

    let accepted = entries[0].metrics;
    assert_eq!((accepted.total_records, accepted.valid_records), (1, 1));
    assert_eq!(accepted.stale_data_count, 1);
    assert!(accepted.average_quality_score < 1.0);

    let rejected = entries[1].metrics;
    assert_eq!((rejected.total_records, rejected.invalid_records), (1, 1));
    assert_eq!(rejected.duplicate_count, 1);
    assert_eq!((entries[1].received, entries[1].rejected), (1, 1));
}
