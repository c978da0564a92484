//! Buffer Sizes and Request Limits

/// Stats entries retained per source in the rolling window.
pub const STATS_WINDOW_SIZE: usize = 1000;

/// Maximum readings accepted in one HTTP batch request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Maximum uploaded file size in bytes (10 MiB).
pub const DEFAULT_MAX_FILE_SIZE: usize = 10 * 1024 * 1024;
