//! Rolling ingestion statistics
//!
//! Each adapter invocation produces one [`IngestionStats`] entry. The
//! aggregator keeps the most recent [`STATS_WINDOW_SIZE`] entries per
//! [`Source`] and folds them into a [`StatsSummary`] on demand:
//!
//! ```text
//! mqtt    ┌──────────── window ────────────┐
//! lorawan ├──────────── window ────────────┤ ──▶ summary()
//! http    ├──────────── window ────────────┤
//! batch   └──────────── window ────────────┘
//! ```
//!
//! ## Usage Example
//!
//! ```rust
//! use slopeguard_core::stats::StatsAggregator;
//! use slopeguard_core::reading::{DataQualityMetrics, Source};
//!
//! let stats = StatsAggregator::new();
//! let timer = stats.start(Source::Http);
//! // ... handle the request ...
//! stats.record(timer.finish(1, 1, 0, DataQualityMetrics::default()));
//!
//! assert_eq!(stats.summary().total_received, 1);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::buffer::CircularBuffer;
use crate::constants::STATS_WINDOW_SIZE;
use crate::reading::{DataQualityMetrics, IngestionStats, Source};
use crate::time::{Clock, SystemClock};

/// Measures one handled message or request
#[derive(Debug)]
pub struct StatsTimer {
    source: Source,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl StatsTimer {
    pub fn start(source: Source, started_at: DateTime<Utc>) -> Self {
        Self {
            source,
            started_at,
            started: Instant::now(),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    /// Close the measurement
    pub fn finish(
        self,
        received: u64,
        processed: u64,
        rejected: u64,
        metrics: DataQualityMetrics,
    ) -> IngestionStats {
        IngestionStats::new(
            self.started_at,
            self.source,
            received,
            processed,
            rejected,
            self.started.elapsed(),
            metrics,
        )
    }
}

/// Totals for a single source's window
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub entries: u64,
    pub received: u64,
    pub processed: u64,
    pub rejected: u64,
    pub error_rate: f64,
    pub average_processing_time_ms: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Global view merged over every source window
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_received: u64,
    pub total_processed: u64,
    pub total_rejected: u64,
    pub error_rate: f64,
    pub average_processing_time_ms: f64,
    pub sources: BTreeMap<Source, SourceSummary>,
}

/// Concurrent per-source rolling windows
pub struct StatsAggregator {
    windows: Mutex<HashMap<Source, CircularBuffer<IngestionStats>>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self::with_capacity(STATS_WINDOW_SIZE, Arc::new(SystemClock))
    }

    pub fn with_capacity(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            capacity,
            clock,
        }
    }

    /// Begin timing an invocation for `source`
    pub fn start(&self, source: Source) -> StatsTimer {
        StatsTimer::start(source, self.clock.now())
    }

    pub fn record(&self, entry: IngestionStats) {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .entry(entry.source)
            .or_insert_with(|| CircularBuffer::with_capacity(self.capacity))
            .push(entry);
    }

    /// Entries currently held for `source`, oldest first
    pub fn recent(&self, source: Source) -> Vec<IngestionStats> {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows
            .get(&source)
            .map(|window| window.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn summary(&self) -> StatsSummary {
        let windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        let mut summary = StatsSummary::default();
        let mut total_entries = 0u64;
        let mut total_time_ms = 0.0;

        for (source, window) in windows.iter() {
            let mut source_summary = SourceSummary::default();
            let mut time_ms = 0.0;

            for entry in window.iter() {
                source_summary.entries += 1;
                source_summary.received += entry.received;
                source_summary.processed += entry.processed;
                source_summary.rejected += entry.rejected;
                time_ms += entry.processing_time_ms;
                source_summary.last_seen = source_summary.last_seen.max(Some(entry.timestamp));
            }

            source_summary.error_rate = ratio(source_summary.rejected, source_summary.received);
            if source_summary.entries > 0 {
                source_summary.average_processing_time_ms = time_ms / source_summary.entries as f64;
            }

            summary.total_received += source_summary.received;
            summary.total_processed += source_summary.processed;
            summary.total_rejected += source_summary.rejected;
            total_entries += source_summary.entries;
            total_time_ms += time_ms;

            summary.sources.insert(*source, source_summary);
        }

        summary.error_rate = ratio(summary.total_rejected, summary.total_received);
        if total_entries > 0 {
            summary.average_processing_time_ms = total_time_ms / total_entries as f64;
        }

        summary
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn entry(source: Source, received: u64, rejected: u64, ms: u64) -> IngestionStats {
        IngestionStats::new(
            Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
            source,
            received,
            received - rejected,
            rejected,
            Duration::from_millis(ms),
            DataQualityMetrics::default(),
        )
    }

    #[test]
    fn empty_summary() {
        let summary = StatsAggregator::new().summary();
        assert_eq!(summary.total_received, 0);
        assert_eq!(summary.error_rate, 0.0);
        assert!(summary.sources.is_empty());
    }

    #[test]
    fn merges_sources() {
        let stats = StatsAggregator::new();
        stats.record(entry(Source::Mqtt, 10, 2, 4));
        stats.record(entry(Source::Mqtt, 10, 0, 8));
        stats.record(entry(Source::Batch, 20, 2, 30));

        let summary = stats.summary();
        assert_eq!(summary.total_received, 40);
        assert_eq!(summary.total_processed, 36);
        assert_eq!(summary.total_rejected, 4);
        assert!((summary.error_rate - 0.1).abs() < 1e-9);
        assert!((summary.average_processing_time_ms - 14.0).abs() < 1e-9);

        let mqtt = summary.sources[&Source::Mqtt];
        assert_eq!(mqtt.entries, 2);
        assert!((mqtt.error_rate - 0.1).abs() < 1e-9);
        assert!((mqtt.average_processing_time_ms - 6.0).abs() < 1e-9);
        assert!(!summary.sources.contains_key(&Source::Lorawan));
    }

    #[test]
    fn window_is_bounded() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap());
        let stats = StatsAggregator::with_capacity(3, Arc::new(clock));
        for received in 1..=5 {
            stats.record(entry(Source::Http, received, 0, 1));
        }

        let kept: Vec<u64> = stats.recent(Source::Http).iter().map(|e| e.received).collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(stats.summary().total_received, 12);
    }

    #[test]
    fn timer_uses_aggregator_clock() {
        let start = Utc.with_ymd_and_hms(2025, 4, 1, 9, 15, 0).unwrap();
        let stats = StatsAggregator::with_capacity(10, Arc::new(ManualClock::new(start)));

        let timer = stats.start(Source::Lorawan);
        assert_eq!(timer.source(), Source::Lorawan);
        let recorded = timer.finish(4, 3, 1, DataQualityMetrics::default());

        assert_eq!(recorded.timestamp, start);
        assert_eq!(recorded.error_rate, 0.25);
        assert!(recorded.processing_time_ms >= 0.0);
    }

    #[test]
    fn concurrent_recording() {
        let stats = Arc::new(StatsAggregator::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..250 {
                        stats.record(entry(Source::Mqtt, 1, 0, 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.summary().total_received, 1000);
    }
}
