//! Time Windows and Intervals

/// Maximum observation age before a staleness warning, in seconds.
///
/// Also the horizon of duplicate detection: cache entries older than this
/// are evicted by the sweep.
pub const DEFAULT_MAX_DATA_AGE_SECS: u64 = 300;

/// Interval between duplicate-cache sweeps, in seconds.
pub const DEFAULT_CACHE_SWEEP_INTERVAL_SECS: u64 = 60;
