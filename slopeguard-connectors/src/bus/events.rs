//! Domain events carried on the bus besides raw readings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use slopeguard_core::{DataQualityMetrics, Source};

/// Severity carried in the `alert-level` header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub alert_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sensor_id: Option<String>,
    #[serde(default)]
    pub level: AlertLevel,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Original alert body as received
    #[serde(default)]
    pub payload: Value,
}

impl Alert {
    /// Build from an inbound alert payload, filling what it omits
    pub fn from_payload(payload: Value, received_at: DateTime<Utc>) -> Self {
        let text = |field: &str| payload.get(field).and_then(Value::as_str).map(str::to_string);

        let level = payload
            .get("level")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        Self {
            alert_id: text("alert_id")
                .or_else(|| text("id"))
                .unwrap_or_else(|| format!("alert-{}", received_at.timestamp_millis())),
            sensor_id: text("sensor_id"),
            level,
            message: text("message").unwrap_or_default(),
            timestamp: received_at,
            payload,
        }
    }
}

/// Device lifecycle event sent to the device-events topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub device_id: String,
    /// `join`, `status`, `error`, or a broker status report
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl DeviceEvent {
    pub fn new(
        device_id: impl Into<String>,
        event_type: impl Into<String>,
        timestamp: DateTime<Utc>,
        details: Value,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            event_type: event_type.into(),
            timestamp,
            details,
        }
    }
}

/// Outcome summary of one batch or upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub source: Source,
    pub accepted: u64,
    pub rejected: u64,
    pub metrics: DataQualityMetrics,
    pub timestamp: DateTime<Utc>,
}

impl BatchResult {
    pub fn new(source: Source, metrics: DataQualityMetrics, timestamp: DateTime<Utc>) -> Self {
        Self {
            batch_id: format!("{}-{}", source, timestamp.timestamp_nanos_opt().unwrap_or_default()),
            source,
            accepted: metrics.valid_records,
            rejected: metrics.invalid_records,
            metrics,
            timestamp,
        }
    }
}
