//! LoRaWAN Network-Server Webhook Adapter
//!
//! ## Overview
//!
//! The network server forwards device traffic as HTTP webhooks:
//!
//! | Route                  | Body                 | Effect                               |
//! |------------------------|----------------------|--------------------------------------|
//! | `POST /webhook/uplink` | [`UplinkEnvelope`]   | decode, validate, publish reading    |
//! | `POST /webhook/join`   | [`LifecycleEnvelope`]| device event `join`                  |
//! | `POST /webhook/status` | [`LifecycleEnvelope`]| device event `status`                |
//! | `POST /webhook/error`  | [`LifecycleEnvelope`]| device event `error`                 |
//!
//! ## Request Pipeline
//!
//! ```text
//! raw body ──▶ SignatureGuard ──▶ JSON envelope ──▶ decoder ──▶ Validator ──▶ BusPublisher
//!                 │ 401               │ 400            │ 400       │ 422          │ 503
//! ```
//!
//! The guard runs on the raw bytes before anything is parsed, so a wrong
//! signature is rejected even for a perfectly formed payload. With no
//! secret configured the guard lets everything through and the service
//! logs a warning at start-up.

pub mod decoder;
mod envelope;

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info_span, warn, Instrument};

use slopeguard_core::{DataQualityMetrics, SensorReading, Source};

use crate::bus::DeviceEvent;
use crate::{ConnectorError, ConnectorResult, IngestContext};

pub use decoder::{decode, DecodeError, DecodedPayload, FieldKind, FieldLayout, PortLayout, PORT_LAYOUTS};
pub use envelope::{DeviceInfo, GatewayLocation, LifecycleEnvelope, RxInfo, UplinkEnvelope};

/// Header carrying `sha256=<hex digest>`
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Shared HMAC secret; `None` disables verification
    pub secret: Option<String>,
    pub max_body_bytes: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_body_bytes: 1024 * 1024,
        }
    }
}

/// HMAC-SHA256 verification of the raw request body
#[derive(Clone)]
pub struct SignatureGuard {
    secret: Option<Arc<[u8]>>,
}

impl SignatureGuard {
    pub fn new(secret: Option<&str>) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(|s| Arc::from(s.as_bytes())),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Header value for `body`, or `None` when no secret is set
    pub fn sign(&self, body: &[u8]) -> Option<String> {
        let mut mac = self.mac()?.ok()?;
        mac.update(body);
        Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
    }

    /// Constant-time check of `header` against the body digest
    pub fn verify(&self, header: Option<&str>, body: &[u8]) -> ConnectorResult<()> {
        let mut mac = match self.mac() {
            None => return Ok(()),
            Some(mac) => mac?,
        };

        let provided = header
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConnectorError::Authentication("missing webhook signature".into()))?;
        let digest = provided.strip_prefix("sha256=").unwrap_or(provided);
        let expected = hex::decode(digest)
            .map_err(|_| ConnectorError::Authentication("malformed webhook signature".into()))?;

        mac.update(body);
        mac.verify_slice(&expected)
            .map_err(|_| ConnectorError::Authentication("webhook signature mismatch".into()))
    }

    fn mac(&self) -> Option<ConnectorResult<HmacSha256>> {
        let secret = self.secret.as_ref()?;
        Some(
            HmacSha256::new_from_slice(secret)
                .map_err(|e| ConnectorError::Config(format!("webhook secret: {}", e))),
        )
    }
}

#[derive(Clone)]
struct WebhookState {
    ctx: IngestContext,
    guard: SignatureGuard,
    max_body_bytes: usize,
}

/// Webhook routes with the signature guard in front of all of them
pub fn routes(ctx: IngestContext, config: WebhookConfig) -> Router {
    let guard = SignatureGuard::new(config.secret.as_deref());
    if !guard.is_enabled() {
        warn!("webhook signature verification disabled: no secret configured");
    }

    let state = WebhookState {
        ctx,
        guard,
        max_body_bytes: config.max_body_bytes,
    };

    Router::new()
        .route("/webhook/uplink", post(uplink))
        .route("/webhook/join", post(join))
        .route("/webhook/status", post(status))
        .route("/webhook/error", post(error))
        .route_layer(middleware::from_fn_with_state(state.clone(), verify_signature))
        .with_state(state)
}

async fn verify_signature(
    State(state): State<WebhookState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return ConnectorError::Malformed(format!("unreadable body: {}", err)).into_response()
        }
    };

    let header = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    if let Err(err) = state.guard.verify(header, &bytes) {
        warn!(path = %parts.uri.path(), error = %err, "webhook rejected");
        if parts.uri.path().ends_with("/uplink") {
            let timer = state.ctx.stats.start(Source::Lorawan);
            state
                .ctx
                .stats
                .record(timer.finish(1, 0, 1, DataQualityMetrics::default()));
        }
        return err.into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

async fn uplink(State(state): State<WebhookState>, body: Bytes) -> Response {
    let span = info_span!("lorawan_uplink", dev_eui = tracing::field::Empty);
    async move {
        let timer = state.ctx.stats.start(Source::Lorawan);
        let (metrics, outcome) = handle_uplink(&state.ctx, &body).await;

        let processed = u64::from(outcome.is_ok());
        state
            .ctx
            .stats
            .record(timer.finish(1, processed, 1 - processed, metrics));

        match outcome {
            Ok(body) => (StatusCode::OK, Json(body)).into_response(),
            Err(err) => err.into_response(),
        }
    }
    .instrument(span)
    .await
}

/// Envelope and decode failures carry empty metrics; every scored uplink
/// carries its one-record quality metrics whether accepted or not.
async fn handle_uplink(ctx: &IngestContext, body: &[u8]) -> (DataQualityMetrics, ConnectorResult<Value>) {
    let reading = match parse_uplink(ctx, body) {
        Ok(reading) => reading,
        Err(err) => return (DataQualityMetrics::default(), Err(err)),
    };
    let sensor_id = reading.sensor_id.clone();

    let (accepted, result, metrics) = ctx.validator.validate_reading_with_metrics(reading);
    let Some(reading) = accepted else {
        debug!(sensor_id = %sensor_id, errors = ?result.errors, "uplink rejected");
        return (metrics, Err(ConnectorError::Rejected(result)));
    };

    if let Err(err) = ctx
        .publisher
        .publish_reading(&reading, result.quality_score, Source::Lorawan)
        .await
    {
        return (metrics, Err(err));
    }

    (
        metrics,
        Ok(json!({
            "success": true,
            "sensorId": sensor_id,
            "qualityScore": result.quality_score,
            "warnings": result.warnings,
        })),
    )
}

fn parse_uplink(ctx: &IngestContext, body: &[u8]) -> ConnectorResult<SensorReading> {
    let envelope: UplinkEnvelope = serde_json::from_slice(body)?;
    tracing::Span::current().record("dev_eui", envelope.device_info.dev_eui.as_str());
    Ok(envelope.into_reading(ctx.validator.now())?)
}

async fn join(State(state): State<WebhookState>, body: Bytes) -> Response {
    lifecycle(&state.ctx, "join", &body).await
}

async fn status(State(state): State<WebhookState>, body: Bytes) -> Response {
    lifecycle(&state.ctx, "status", &body).await
}

async fn error(State(state): State<WebhookState>, body: Bytes) -> Response {
    lifecycle(&state.ctx, "error", &body).await
}

async fn lifecycle(ctx: &IngestContext, event_type: &str, body: &[u8]) -> Response {
    let result = async {
        let details: Value = serde_json::from_slice(body)?;
        let envelope: LifecycleEnvelope = serde_json::from_value(details.clone())?;
        let event = DeviceEvent::new(
            envelope.device_info.dev_eui.clone(),
            event_type,
            envelope.time.unwrap_or_else(|| ctx.validator.now()),
            details,
        );
        ctx.publisher.publish_device_event(&event).await?;
        Ok::<_, ConnectorError>(envelope.device_info.dev_eui)
    }
    .await;

    match result {
        Ok(device_id) => {
            debug!(device_id = %device_id, event_type, "device event published");
            (StatusCode::OK, Json(json!({"success": true}))).into_response()
        }
        Err(err) => {
            warn!(event_type, error = %err, "device event not published");
            err.into_response()
        }
    }
}
