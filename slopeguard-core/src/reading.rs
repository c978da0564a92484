//! Canonical Sensor Record Model
//!
//! Every adapter converges on [`SensorReading`]. The shape is pure data: the
//! validator is the only component that sets quality flags, and nothing
//! mutates a reading once it has been handed to the publisher.
//!
//! Input payloads are screened through [`CandidateReading`], a deliberately
//! loose mirror of the canonical shape where every field is optional. The
//! conversion into a `SensorReading` is where schema errors originate.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::errors::{SchemaError, SchemaResult};

/// Sensor type assigned when the payload does not name one
pub const UNKNOWN_SENSOR_TYPE: &str = "unknown";

/// Ingestion path a record or stats entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// Wireless mesh pub/sub broker
    Mqtt,
    /// Long-range radio uplinks delivered by webhook
    Lorawan,
    /// Single-record HTTP submission
    Http,
    /// HTTP batch and file upload
    Batch,
}

impl Source {
    /// Tag used in logs, headers and the stats summary
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Mqtt => "mqtt",
            Source::Lorawan => "lorawan",
            Source::Http => "http",
            Source::Batch => "batch",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One named physical quantity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Measurement {
    /// Must be finite to ever be valid
    pub value: f64,
    /// Free-form unit label, empty when the source gave none
    pub unit: String,
}

impl Measurement {
    /// Build a measurement from a value and unit label
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenientFloat {
    Number(f64),
    Text(String),
}

impl LenientFloat {
    fn resolve<E: serde::de::Error>(self) -> Result<f64, E> {
        match self {
            LenientFloat::Number(v) => Ok(v),
            LenientFloat::Text(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| E::custom(format!("measurement value '{}' is not a number", s))),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MeasurementRepr {
    Full {
        value: LenientFloat,
        #[serde(default)]
        unit: String,
    },
    Bare(LenientFloat),
}

// Accepts `{"value": 1.0, "unit": "mm"}`, a bare number, or a numeric string.
// Strings such as "NaN" parse to non-finite values so the validator can
// reject them explicitly instead of failing the whole record as malformed.
impl<'de> Deserialize<'de> for Measurement {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match MeasurementRepr::deserialize(deserializer)? {
            MeasurementRepr::Full { value, unit } => Ok(Measurement {
                value: value.resolve()?,
                unit,
            }),
            MeasurementRepr::Bare(value) => Ok(Measurement {
                value: value.resolve()?,
                unit: String::new(),
            }),
        }
    }
}

/// Per-record quality annotations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityFlags {
    pub is_valid: bool,
    pub is_calibrated: bool,
    pub is_within_range: bool,
    pub has_drift: bool,
    pub has_noise: bool,
    pub is_suspicious: bool,
    pub battery_low: bool,
    pub communication_error: bool,
}

/// Installation coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
}

/// Canonical sensor record published on the raw-sensor-data topic
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub sensor_id: String,
    /// Observation time reported by the source
    pub timestamp: DateTime<Utc>,
    /// Ingestion time, always assigned by the pipeline
    pub processing_timestamp: DateTime<Utc>,
    pub sensor_type: String,
    pub measurements: HashMap<String, Measurement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery_level: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    pub quality_flags: QualityFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Original encoded payload, kept for audit
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_raw_data"
    )]
    pub raw_data: Option<Vec<u8>>,
}

fn serialize_raw_data<S: serde::Serializer>(
    raw: &Option<Vec<u8>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match raw {
        Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
        None => serializer.serialize_none(),
    }
}

impl SensorReading {
    /// Minimal reading used by decoders before enrichment
    pub fn new(
        sensor_id: impl Into<String>,
        sensor_type: impl Into<String>,
        timestamp: DateTime<Utc>,
        processing_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            sensor_id: sensor_id.into(),
            timestamp,
            processing_timestamp,
            sensor_type: sensor_type.into(),
            measurements: HashMap::new(),
            battery_level: None,
            signal_strength: None,
            sequence_number: None,
            quality_flags: QualityFlags::default(),
            location: None,
            raw_data: None,
        }
    }

    /// Add or replace a measurement
    pub fn with_measurement(mut self, name: impl Into<String>, value: f64, unit: &str) -> Self {
        self.measurements
            .insert(name.into(), Measurement::new(value, unit));
        self
    }
}

/// Loosely typed mirror of [`SensorReading`] used to screen raw payloads
#[derive(Debug, Default, Deserialize)]
pub struct CandidateReading {
    pub sensor_id: Option<String>,
    pub timestamp: Option<Value>,
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub measurements: HashMap<String, Measurement>,
    pub battery_level: Option<f64>,
    pub signal_strength: Option<f64>,
    pub sequence_number: Option<u64>,
    #[serde(default)]
    pub quality_flags: QualityFlags,
    pub location: Option<Location>,
    /// Base64 text when supplied over JSON
    pub raw_data: Option<String>,
}

impl CandidateReading {
    /// Deserialize from an untyped payload
    pub fn from_value(raw: &Value) -> SchemaResult<Self> {
        if !raw.is_object() {
            return Err(SchemaError::NotAnObject);
        }
        Ok(CandidateReading::deserialize(raw)?)
    }

    /// Enforce the required fields and produce a canonical record
    pub fn into_reading(self, processing_timestamp: DateTime<Utc>) -> SchemaResult<SensorReading> {
        let sensor_id = self
            .sensor_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or(SchemaError::MissingField("sensor_id"))?;

        let timestamp = match self.timestamp {
            Some(value) => parse_timestamp(&value)?,
            None => return Err(SchemaError::MissingField("timestamp")),
        };

        let sensor_type = self
            .sensor_type
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| UNKNOWN_SENSOR_TYPE.to_string());

        let raw_data = match self.raw_data {
            Some(text) => Some(
                STANDARD
                    .decode(text.as_bytes())
                    .map_err(|e| SchemaError::Malformed(format!("raw_data is not base64: {}", e)))?,
            ),
            None => None,
        };

        Ok(SensorReading {
            sensor_id,
            timestamp,
            processing_timestamp,
            sensor_type,
            measurements: self.measurements,
            battery_level: self.battery_level,
            signal_strength: self.signal_strength,
            sequence_number: self.sequence_number,
            quality_flags: self.quality_flags,
            location: self.location,
            raw_data,
        })
    }
}

/// Parse an RFC 3339 string or integer epoch milliseconds
pub fn parse_timestamp(value: &Value) -> SchemaResult<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| SchemaError::InvalidTimestamp(text.clone())),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| SchemaError::InvalidTimestamp(n.to_string())),
        other => Err(SchemaError::InvalidTimestamp(other.to_string())),
    }
}

/// Outcome of scoring one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Always within `[0, 1]`
    pub quality_score: f64,
}

impl ValidationResult {
    /// Short-circuit result for payloads that never reached scoring
    pub fn rejected(error: impl fmt::Display) -> Self {
        Self {
            is_valid: false,
            errors: vec![error.to_string()],
            warnings: Vec::new(),
            quality_score: 0.0,
        }
    }
}

/// Batch-scoped quality aggregate
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataQualityMetrics {
    pub total_records: u64,
    pub valid_records: u64,
    pub invalid_records: u64,
    pub low_battery_count: u64,
    pub communication_error_count: u64,
    pub stale_data_count: u64,
    pub duplicate_count: u64,
    /// Mean over valid records only, 0 when none are valid
    pub average_quality_score: f64,
}

/// One adapter invocation as seen by the stats aggregator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionStats {
    pub timestamp: DateTime<Utc>,
    pub source: Source,
    pub received: u64,
    pub processed: u64,
    pub rejected: u64,
    pub processing_time_ms: f64,
    pub error_rate: f64,
    pub metrics: DataQualityMetrics,
}

impl IngestionStats {
    /// Build an entry, deriving the error rate from the counts
    pub fn new(
        timestamp: DateTime<Utc>,
        source: Source,
        received: u64,
        processed: u64,
        rejected: u64,
        elapsed: Duration,
        metrics: DataQualityMetrics,
    ) -> Self {
        let error_rate = if received == 0 {
            0.0
        } else {
            rejected as f64 / received as f64
        };

        Self {
            timestamp,
            source,
            received,
            processed,
            rejected,
            processing_time_ms: elapsed.as_secs_f64() * 1000.0,
            error_rate,
            metrics,
        }
    }
}
