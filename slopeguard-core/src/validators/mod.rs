//! Quality Scoring and Acceptance of Candidate Records
//!
//! ## Overview
//!
//! The [`Validator`] is the one stateful screen every adapter passes its
//! candidates through. It parses untyped payloads into the canonical shape,
//! scores them, and remembers what it accepted so redeliveries are caught.
//!
//! ## Scoring
//!
//! Each record starts at 1.0; penalties are order-independent and the
//! result is floored at 0:
//!
//! | Finding                                   | Kind    | Penalty |
//! |-------------------------------------------|---------|---------|
//! | `now - timestamp > max_data_age`          | warning | 0.1     |
//! | `battery_level < min_battery_level`       | warning | 0.1     |
//! | `signal_strength < max_signal_strength_db`| warning | 0.1     |
//! | dedup key already cached                  | error   | 0.5     |
//! | non-finite or out-of-range measurement    | error   | 0.2 each|
//!
//! A record is valid when it has no errors **and** its score is at least
//! `min_quality_score`. Payloads that cannot be parsed short-circuit with a
//! schema error and score 0.
//!
//! Signal strength is in dBm and negative: "weaker" means numerically
//! smaller, so -125 dBm is below a -120 dBm floor.
//!
//! ## Usage Example
//!
//! ```rust
//! use slopeguard_core::validators::{Validator, ValidatorConfig};
//! use serde_json::json;
//!
//! let validator = Validator::new(ValidatorConfig::default());
//! let result = validator.validate_one(&json!({
//!     "sensor_id": "inc-12",
//!     "timestamp": chrono::Utc::now().to_rfc3339(),
//!     "sensor_type": "tiltmeter",
//!     "measurements": {"tilt_x": {"value": 1.25, "unit": "deg"}}
//! }));
//! assert!(result.is_valid);
//! ```

mod batch;
pub mod dedup;
pub mod range;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::quality::{
    DUPLICATE_PENALTY, INVALID_MEASUREMENT_PENALTY, LOW_BATTERY_PENALTY, STALE_DATA_PENALTY,
    WEAK_SIGNAL_PENALTY,
};
use crate::constants::{
    DEFAULT_CACHE_SWEEP_INTERVAL_SECS, DEFAULT_MAX_DATA_AGE_SECS, DEFAULT_MAX_SIGNAL_STRENGTH_DB,
    DEFAULT_MIN_BATTERY_LEVEL, DEFAULT_MIN_QUALITY_SCORE,
};
use crate::errors::ReadingError;
use crate::reading::{CandidateReading, DataQualityMetrics, SensorReading, ValidationResult};
use crate::time::{elapsed_between, Clock, SystemClock};

pub use batch::{AcceptedReading, BatchValidation, InvalidRecord};
pub use dedup::{CacheSweeper, DedupKey, DuplicateCache};
pub use range::{Range, RangePolicy, DEFAULT_RANGE_POLICY};

use batch::MetricsAccumulator;

/// Tunables for scoring and cache maintenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    /// Staleness window and duplicate horizon, in seconds
    pub max_data_age_secs: u64,
    pub min_battery_level: f64,
    /// Weakest acceptable signal, dBm
    pub max_signal_strength_db: f64,
    pub min_quality_score: f64,
    pub cache_sweep_interval_secs: u64,
    /// Overlaid on [`DEFAULT_RANGE_POLICY`] when deserialized
    #[serde(deserialize_with = "range::merge_with_defaults")]
    pub ranges: RangePolicy,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            max_data_age_secs: DEFAULT_MAX_DATA_AGE_SECS,
            min_battery_level: DEFAULT_MIN_BATTERY_LEVEL,
            max_signal_strength_db: DEFAULT_MAX_SIGNAL_STRENGTH_DB,
            min_quality_score: DEFAULT_MIN_QUALITY_SCORE,
            cache_sweep_interval_secs: DEFAULT_CACHE_SWEEP_INTERVAL_SECS,
            ranges: DEFAULT_RANGE_POLICY.clone(),
        }
    }
}

impl ValidatorConfig {
    pub fn max_data_age(&self) -> Duration {
        Duration::from_secs(self.max_data_age_secs)
    }

    pub fn cache_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache_sweep_interval_secs)
    }
}

/// Non-error findings recorded while scoring, used by batch metrics
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Findings {
    pub stale: bool,
    pub low_battery: bool,
    pub duplicate: bool,
}

pub(crate) struct Scored {
    pub reading: Option<SensorReading>,
    pub result: ValidationResult,
    pub findings: Findings,
}

/// Stateful record screen shared by all adapters
pub struct Validator {
    config: ValidatorConfig,
    cache: Arc<DuplicateCache>,
    clock: Arc<dyn Clock>,
    sweeper: Mutex<Option<CacheSweeper>>,
}

impl Validator {
    /// Validator on the system clock
    pub fn new(config: ValidatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: ValidatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            cache: Arc::new(DuplicateCache::new()),
            clock,
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Current instant on the validator's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn cache(&self) -> &DuplicateCache {
        &self.cache
    }

    /// Score an untyped payload
    pub fn validate_one(&self, raw: &Value) -> ValidationResult {
        self.validate_candidate(raw).1
    }

    /// Score an untyped payload, returning the canonical record when valid
    pub fn validate_candidate(&self, raw: &Value) -> (Option<SensorReading>, ValidationResult) {
        let scored = self.score_value(raw);
        (scored.reading, scored.result)
    }

    /// Score a record an adapter already built in canonical form
    pub fn validate_reading(&self, reading: SensorReading) -> (Option<SensorReading>, ValidationResult) {
        let scored = self.score(reading);
        (scored.reading, scored.result)
    }

    /// [`validate_reading`](Self::validate_reading) plus the quality metrics
    /// of a one-record batch, counted the same way as [`validate_batch`](Self::validate_batch)
    pub fn validate_reading_with_metrics(
        &self,
        reading: SensorReading,
    ) -> (Option<SensorReading>, ValidationResult, DataQualityMetrics) {
        let scored = self.score(reading);
        let mut accumulator = MetricsAccumulator::default();
        accumulator.record(&scored);
        (scored.reading, scored.result, accumulator.finish())
    }

    /// Score every element independently; one bad record never affects the rest
    pub fn validate_batch(&self, raws: &[Value]) -> BatchValidation {
        let mut accumulator = MetricsAccumulator::default();
        let mut valid = Vec::new();
        let mut invalid = Vec::new();

        for (index, raw) in raws.iter().enumerate() {
            let scored = self.score_value(raw);
            accumulator.record(&scored);

            match scored.reading {
                Some(reading) => valid.push(AcceptedReading {
                    reading,
                    quality_score: scored.result.quality_score,
                    warnings: scored.result.warnings,
                }),
                None => invalid.push(InvalidRecord {
                    index,
                    raw: raw.clone(),
                    result: scored.result,
                }),
            }
        }

        BatchValidation {
            valid,
            invalid,
            metrics: accumulator.finish(),
        }
    }

    /// Evict expired dedup entries now
    pub fn sweep_cache(&self) -> usize {
        self.cache.sweep(self.clock.now(), self.config.max_data_age())
    }

    /// Start the periodic dedup sweep on the current tokio runtime
    ///
    /// Calling it again while a sweeper runs is a no-op.
    pub fn start_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().map_or(false, CacheSweeper::is_running) {
            return;
        }
        *slot = Some(CacheSweeper::spawn(
            Arc::clone(&self.cache),
            Arc::clone(&self.clock),
            self.config.cache_sweep_interval(),
            self.config.max_data_age(),
        ));
    }

    /// Stop the periodic sweep and wait for it
    pub async fn stop_sweeper(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            sweeper.stop().await;
        }
    }

    fn score_value(&self, raw: &Value) -> Scored {
        let parsed = CandidateReading::from_value(raw)
            .and_then(|candidate| candidate.into_reading(self.clock.now()));

        match parsed {
            Ok(reading) => self.score(reading),
            Err(err) => {
                log::debug!("rejecting candidate: {}", err);
                Scored {
                    reading: None,
                    result: ValidationResult::rejected(err),
                    findings: Findings::default(),
                }
            }
        }
    }

    fn score(&self, mut reading: SensorReading) -> Scored {
        let now = self.clock.now();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut findings = Findings::default();
        let mut penalty: f64 = 0.0;

        if reading.sensor_id.trim().is_empty() {
            return Scored {
                reading: None,
                result: ValidationResult::rejected(crate::errors::SchemaError::MissingField(
                    "sensor_id",
                )),
                findings,
            };
        }

        let age = elapsed_between(reading.timestamp, now);
        if age > self.config.max_data_age() {
            warnings.push(format!("Stale data: observation is {}s old", age.as_secs()));
            findings.stale = true;
            penalty += STALE_DATA_PENALTY;
        }

        if let Some(battery) = reading.battery_level {
            if battery < self.config.min_battery_level {
                warnings.push(format!("Low battery level: {}%", battery));
                findings.low_battery = true;
                penalty += LOW_BATTERY_PENALTY;
            }
        }

        if let Some(signal) = reading.signal_strength {
            if signal < self.config.max_signal_strength_db {
                warnings.push(format!("Weak signal strength: {} dBm", signal));
                penalty += WEAK_SIGNAL_PENALTY;
            }
        }

        let key = DedupKey::for_reading(&reading);
        if !self.cache.check_and_insert(key, now) {
            errors.push(ReadingError::Duplicate.to_string());
            findings.duplicate = true;
            penalty += DUPLICATE_PENALTY;
        }

        let mut within_range = true;
        let mut names: Vec<&String> = reading.measurements.keys().collect();
        names.sort();
        for name in names {
            let value = reading.measurements[name].value;
            if !self.config.ranges.accepts(&reading.sensor_type, name, value) {
                errors.push(
                    ReadingError::InvalidMeasurement {
                        name: name.clone(),
                        value,
                    }
                    .to_string(),
                );
                within_range = false;
                penalty += INVALID_MEASUREMENT_PENALTY;
            }
        }

        // Three decimals; accumulated 0.1 steps must land exactly on the threshold
        let quality_score = ((1.0 - penalty) * 1000.0).round().clamp(0.0, 1000.0) / 1000.0;
        let is_valid = errors.is_empty() && quality_score >= self.config.min_quality_score;

        if !is_valid {
            log::debug!(
                "reading from {} rejected (score {:.2}, {} errors)",
                reading.sensor_id,
                quality_score,
                errors.len()
            );
        }

        let result = ValidationResult {
            is_valid,
            errors,
            warnings,
            quality_score,
        };

        let reading = is_valid.then(|| {
            // a device-reported communication error keeps the flag down
            reading.quality_flags.is_valid = !reading.quality_flags.communication_error;
            reading.quality_flags.is_within_range = within_range;
            reading.quality_flags.battery_low |= findings.low_battery;
            reading
        });

        Scored {
            reading,
            result,
            findings,
        }
    }
}
