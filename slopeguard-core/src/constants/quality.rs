//! Quality Score Penalties and Thresholds
//!
//! The validator starts every record at a score of 1.0 and subtracts a fixed
//! penalty per finding, flooring at 0. Warnings cost little; hard errors cost
//! enough that a record carrying one can never be accepted anyway.

// ===== PENALTIES =====

/// Observation older than the staleness window.
pub const STALE_DATA_PENALTY: f64 = 0.1;

/// Battery below the configured minimum.
pub const LOW_BATTERY_PENALTY: f64 = 0.1;

/// Signal weaker (more negative dBm) than the configured floor.
pub const WEAK_SIGNAL_PENALTY: f64 = 0.1;

/// Dedup key already seen within the staleness window.
pub const DUPLICATE_PENALTY: f64 = 0.5;

/// Each non-finite or out-of-range measurement.
pub const INVALID_MEASUREMENT_PENALTY: f64 = 0.2;

// ===== THRESHOLDS =====

/// Minimum score for acceptance.
///
/// Three simultaneous warnings (stale, low battery, weak signal) still pass;
/// any further degradation does not.
pub const DEFAULT_MIN_QUALITY_SCORE: f64 = 0.7;

/// Battery percentage below which a low-battery warning is raised.
///
/// Field nodes on slopes are serviced on foot; 20% leaves roughly two weeks
/// of reporting at typical uplink intervals.
pub const DEFAULT_MIN_BATTERY_LEVEL: f64 = 20.0;

/// Weakest acceptable received signal in dBm.
///
/// LoRa demodulates down to about -120 dBm at SF7; anything below is
/// likely to be lossy.
pub const DEFAULT_MAX_SIGNAL_STRENGTH_DB: f64 = -120.0;
