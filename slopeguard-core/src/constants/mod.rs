//! Constants for SlopeGuard Core
//!
//! Centralized defaults used throughout the ingestion pipeline. Every value
//! here is only a default: the service configuration can override each one.
//!
//! ## Organization
//!
//! - **Quality**: Score penalties and acceptance thresholds
//! - **Time**: Staleness window and sweep cadence
//! - **Buffers**: Rolling window and request size limits

/// Quality score penalties and acceptance thresholds.
pub mod quality;

/// Staleness window and background task intervals.
pub mod time;

/// Rolling window sizes and request limits.
pub mod buffers;

pub use quality::{
    DEFAULT_MIN_BATTERY_LEVEL, DEFAULT_MIN_QUALITY_SCORE, DEFAULT_MAX_SIGNAL_STRENGTH_DB,
};

pub use time::{DEFAULT_CACHE_SWEEP_INTERVAL_SECS, DEFAULT_MAX_DATA_AGE_SECS};

pub use buffers::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_FILE_SIZE, STATS_WINDOW_SIZE};
