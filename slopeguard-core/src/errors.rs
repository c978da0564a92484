//! Error Types for Record-Level Screening Failures
//!
//! ## Design Philosophy
//!
//! Every error in this module is fatal to exactly one candidate record and
//! never to the batch it arrived in. The validator collects them into the
//! `errors` list of a [`ValidationResult`](crate::reading::ValidationResult)
//! as display strings, so the `Display` text of each variant is part of the
//! public contract: HTTP clients receive it verbatim.
//!
//! ## Error Categories
//!
//! ### Structural
//! - `SchemaError`: the payload cannot be turned into a canonical record
//!   (missing `sensor_id`, unparseable timestamp, wrong JSON types)
//!
//! ### Physical plausibility
//! - `ReadingError::InvalidMeasurement`: NaN, infinity, or a value outside
//!   the configured range for its `(sensor_type, measurement)` pair
//!
//! ### Replay
//! - `ReadingError::Duplicate`: the dedup key was already accepted within
//!   the staleness window
//!
//! ## Error Handling Strategy
//!
//! ```rust
//! use slopeguard_core::errors::ReadingError;
//!
//! let err = ReadingError::InvalidMeasurement {
//!     name: "tilt_x".into(),
//!     value: 120.0,
//! };
//! assert_eq!(err.to_string(), "Invalid measurement value for tilt_x: 120");
//! ```

use thiserror::Error;

/// Result type for record parsing
pub type SchemaResult<T> = Result<T, SchemaError>;

/// The candidate payload does not have the canonical shape
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    /// Required field absent or empty
    #[error("Schema validation failed: missing required field '{0}'")]
    MissingField(&'static str),

    /// Timestamp present but not RFC 3339 or epoch milliseconds
    #[error("Schema validation failed: invalid timestamp '{0}'")]
    InvalidTimestamp(String),

    /// Payload is not a JSON object
    #[error("Schema validation failed: expected a JSON object")]
    NotAnObject,

    /// Any other deserialization failure
    #[error("Schema validation failed: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for SchemaError {
    fn from(err: serde_json::Error) -> Self {
        SchemaError::Malformed(err.to_string())
    }
}

/// Hard failures found while scoring a parsed record
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReadingError {
    /// Non-finite or out-of-range measurement
    #[error("Invalid measurement value for {name}: {value}")]
    InvalidMeasurement {
        /// Measurement key as submitted
        name: String,
        /// Offending value
        value: f64,
    },

    /// Dedup key seen within the staleness window
    #[error("Duplicate sensor reading detected")]
    Duplicate,
}
