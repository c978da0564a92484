//! Upload file parsing into untyped candidate records
//!
//! Rows are turned into JSON objects shaped like a single-reading request
//! body, so uploads go through exactly the same validation as the API.
//! Every column named `measurement_<name>` becomes measurement `<name>`;
//! the cell text is kept as-is and parsed leniently by the record model,
//! which lets a non-numeric cell reject just its own row.

use csv::{ReaderBuilder, StringRecord, Trim};
use serde_json::{Map, Number, Value};

use crate::{ConnectorError, ConnectorResult};

pub const MEASUREMENT_PREFIX: &str = "measurement_";

/// Kind of upload, decided from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFormat {
    Csv,
    Json,
}

impl UploadFormat {
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "csv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    pub fn parse(&self, name: &str, bytes: &[u8]) -> ConnectorResult<Vec<Value>> {
        match self {
            Self::Csv => parse_csv(name, bytes),
            Self::Json => parse_json(name, bytes),
        }
    }
}

/// One object per data row
pub fn parse_csv(name: &str, bytes: &[u8]) -> ConnectorResult<Vec<Value>> {
    let mut reader = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .from_reader(bytes);

    let headers = reader
        .headers()
        .map_err(|e| ConnectorError::Malformed(format!("{}: unreadable header: {}", name, e)))?
        .clone();

    reader
        .records()
        .enumerate()
        .map(|(i, row)| {
            let row = row.map_err(|e| {
                ConnectorError::Malformed(format!("{}: row {}: {}", name, i + 1, e))
            })?;
            Ok(row_to_value(&headers, &row))
        })
        .collect()
}

/// A single object or an array of objects
pub fn parse_json(name: &str, bytes: &[u8]) -> ConnectorResult<Vec<Value>> {
    let body: Value = serde_json::from_slice(bytes)
        .map_err(|e| ConnectorError::Malformed(format!("{}: {}", name, e)))?;
    match body {
        Value::Array(items) => Ok(items),
        object @ Value::Object(_) => Ok(vec![object]),
        _ => Err(ConnectorError::Malformed(format!(
            "{}: expected an object or an array of objects",
            name
        ))),
    }
}

fn row_to_value(headers: &StringRecord, row: &StringRecord) -> Value {
    let mut record = Map::new();
    let mut measurements = Map::new();
    let mut location = Map::new();

    for (header, cell) in headers.iter().zip(row.iter()) {
        if cell.is_empty() {
            continue;
        }

        if let Some(measurement) = header.strip_prefix(MEASUREMENT_PREFIX) {
            if !measurement.is_empty() {
                measurements.insert(measurement.to_string(), Value::String(cell.to_string()));
            }
            continue;
        }

        match header {
            "sensor_id" | "sensor_type" => {
                record.insert(header.to_string(), Value::String(cell.to_string()));
            }
            "timestamp" => {
                // integer cells are epoch milliseconds
                let value = cell
                    .parse::<i64>()
                    .map(|ms| Value::Number(ms.into()))
                    .unwrap_or_else(|_| Value::String(cell.to_string()));
                record.insert(header.to_string(), value);
            }
            "sequence_number" => {
                record.insert(header.to_string(), integer_or_text(cell));
            }
            "battery_level" | "signal_strength" => {
                record.insert(header.to_string(), number_or_text(cell));
            }
            "latitude" | "longitude" | "elevation" => {
                location.insert(header.to_string(), number_or_text(cell));
            }
            _ => {}
        }
    }

    if !measurements.is_empty() {
        record.insert("measurements".into(), Value::Object(measurements));
    }
    if location.contains_key("latitude") && location.contains_key("longitude") {
        record.insert("location".into(), Value::Object(location));
    }

    Value::Object(record)
}

fn number_or_text(cell: &str) -> Value {
    cell.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(cell.to_string()))
}

fn integer_or_text(cell: &str) -> Value {
    cell.parse::<u64>()
        .map(|n| Value::Number(n.into()))
        .unwrap_or_else(|_| Value::String(cell.to_string()))
}
