//! Core record model and validation engine for SlopeGuard ingestion
//!
//! Every protocol adapter converges on the types in this crate:
//! - [`reading::SensorReading`]: the canonical record
//! - [`validators::Validator`]: quality scoring, range checks, duplicate detection
//! - [`stats::StatsAggregator`]: rolling per-source counters
//!
//! Pure library; no network I/O. Time is read through [`time::Clock`] so
//! staleness and cache eviction are testable without sleeping.
//!
//! ```no_run
//! use slopeguard_core::{Validator, ValidatorConfig};
//! use serde_json::json;
//!
//! let validator = Validator::new(ValidatorConfig::default());
//!
//! let result = validator.validate_one(&json!({
//!     "sensor_id": "piezo-7",
//!     "timestamp": "2025-09-14T06:30:00Z",
//!     "sensor_type": "piezometer",
//!     "measurements": {"water_level": {"value": 12.4, "unit": "m"}}
//! }));
//!
//! if !result.is_valid {
//!     // errors and warnings are human readable
//!     eprintln!("{:?}", result.errors);
//! }
//! ```

#![deny(unsafe_code)]

pub mod buffer;
pub mod constants;
pub mod errors;
pub mod reading;
pub mod stats;
pub mod time;
pub mod validators;

// Public API
pub use errors::{ReadingError, SchemaError, SchemaResult};
pub use reading::{
    DataQualityMetrics, IngestionStats, Location, Measurement, QualityFlags, SensorReading,
    Source, ValidationResult,
};
pub use stats::{StatsAggregator, StatsSummary, StatsTimer};
pub use time::{Clock, ManualClock, SystemClock};
pub use validators::{AcceptedReading, BatchValidation, InvalidRecord, Validator, ValidatorConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_exists() {
        assert!(!VERSION.is_empty());
    }
}
