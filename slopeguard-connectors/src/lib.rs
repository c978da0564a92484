//! Protocol Adapters and Bus Publisher for Slope Telemetry Ingestion
//!
//! ## Overview
//!
//! Field data reaches the service over three independent paths. Each adapter
//! owns its own message-handling loop and converges on the same passive
//! services: the shared [`Validator`], the [`bus::BusPublisher`], and the
//! [`StatsAggregator`].
//!
//! ```text
//!  mesh nodes ──MQTT──▶ mqtt::MqttAdapter ──┐
//!  LoRaWAN NS ──HTTPS─▶ lorawan::routes  ───┼──▶ Validator ──▶ BusPublisher ──▶ bus
//!  tools/UI   ──HTTP──▶ http::routes     ───┘         │
//!                                                     └──────▶ StatsAggregator
//! ```
//!
//! ## Adapter Selection Guide
//!
//! ### MQTT
//!
//! **Used by:** wireless mesh nodes publishing JSON to a broker.
//!
//! - Topic shape routes the message (`sensors/{id}/data`, `devices/{id}/status`, `alerts`)
//! - No response channel; outcomes are visible in logs and stats only
//! - Reconnects on a fixed interval up to a capped attempt count
//!
//! ### LoRaWAN webhooks
//!
//! **Used by:** the LoRaWAN network server forwarding uplinks.
//!
//! - HMAC-SHA256 signature checked over the raw body before parsing
//! - Binary payloads decoded per `fPort` from a declarative field table
//! - Radio metadata (RSSI, gateway location, frame counter) enriches the record
//!
//! ### HTTP intake
//!
//! **Used by:** manual entry, backfills, and file uploads.
//!
//! - Single record, JSON batch, or multipart CSV/JSON files
//! - Batch and file limits are enforced before any validation work
//!
//! ## Error Handling
//!
//! Per-record problems never abort a batch; they come back alongside the
//! accepted subset. Per-request problems (bad signature, oversized batch,
//! unsupported file) stop the request with a [`ConnectorError`], which maps
//! onto an HTTP status through its `IntoResponse` impl.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use slopeguard_connectors::{bus::{BusPublisher, InMemoryBus, TopicTable}, IngestContext};
//! use slopeguard_core::{StatsAggregator, Validator, ValidatorConfig};
//!
//! # async fn example() -> Result<(), slopeguard_connectors::ConnectorError> {
//! let publisher = Arc::new(BusPublisher::new(InMemoryBus::new(), TopicTable::default()));
//! publisher.connect().await?;
//!
//! let ctx = IngestContext::new(
//!     Arc::new(Validator::new(ValidatorConfig::default())),
//!     publisher,
//!     Arc::new(StatsAggregator::new()),
//! );
//! let app = slopeguard_connectors::http::routes(ctx.clone(), Default::default());
//! # let _ = app;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use slopeguard_core::{StatsAggregator, ValidationResult, Validator};

pub mod bus;
pub mod health;
pub mod http;
pub mod lorawan;
pub mod mqtt;

pub use lorawan::decoder::DecodeError;

/// Common connector errors
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Not connected")]
    NotConnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Payload decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Outbound encoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Inbound body could not be parsed
    #[error("Malformed request: {0}")]
    Malformed(String),

    #[error("Batch of {size} records exceeds the limit of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),

    #[error("File {name} is {size} bytes, limit is {max}")]
    FileTooLarge { name: String, size: usize, max: usize },

    #[error("Record rejected by validation")]
    Rejected(ValidationResult),
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

impl ConnectorError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotConnected | Self::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Decode(_) | Self::Malformed(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BatchTooLarge { .. } | Self::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::UnsupportedFile(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::Rejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl From<serde_json::Error> for ConnectorError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

impl IntoResponse for ConnectorError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::Rejected(result) => json!({
                "success": false,
                "error": self.to_string(),
                "errors": result.errors,
                "warnings": result.warnings,
                "qualityScore": result.quality_score,
            }),
            _ => json!({
                "success": false,
                "error": self.to_string(),
                "code": status.as_u16(),
            }),
        };
        (status, Json(body)).into_response()
    }
}

/// Async send seam shared by the bus publisher and the MQTT outbound client
#[async_trait::async_trait]
pub trait AsyncConnector: Send + Sync {
    /// Send raw bytes to a topic
    async fn send(&self, topic: &str, data: &[u8]) -> ConnectorResult<()>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> ConnectionStats;
}

/// Connection statistics common to all connectors
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    /// Total messages sent successfully
    pub messages_sent: u64,
    /// Total messages failed to send
    pub messages_failed: u64,
    /// Total payload bytes sent
    pub bytes_sent: u64,
    pub transactions_committed: u64,
    pub transactions_aborted: u64,
    /// Number of reconnections
    pub reconnections: u32,
    /// Last error message
    pub last_error: Option<String>,
}

impl ConnectionStats {
    pub(crate) fn record_sent(&mut self, bytes: usize) {
        self.messages_sent += 1;
        self.bytes_sent += bytes as u64;
    }

    pub(crate) fn record_failure(&mut self, err: &ConnectorError) {
        self.messages_failed += 1;
        self.last_error = Some(err.to_string());
    }
}

/// Shared services handed to every adapter
#[derive(Clone)]
pub struct IngestContext {
    pub validator: Arc<Validator>,
    pub publisher: Arc<bus::BusPublisher>,
    pub stats: Arc<StatsAggregator>,
}

impl IngestContext {
    pub fn new(
        validator: Arc<Validator>,
        publisher: Arc<bus::BusPublisher>,
        stats: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            validator,
            publisher,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ConnectorError::NotConnected.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            ConnectorError::Authentication("bad signature".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ConnectorError::BatchTooLarge { size: 1001, max: 1000 }.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ConnectorError::UnsupportedFile("notes.txt".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
        assert_eq!(
            ConnectorError::Decode(DecodeError::UnknownPort(9)).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn stats_track_last_error() {
        let mut stats = ConnectionStats::default();
        stats.record_sent(12);
        stats.record_failure(&ConnectorError::NotConnected);
        assert_eq!(stats.messages_sent, 1);
        assert_eq!(stats.bytes_sent, 12);
        assert_eq!(stats.messages_failed, 1);
        assert_eq!(stats.last_error.as_deref(), Some("Not connected"));
    }
}
