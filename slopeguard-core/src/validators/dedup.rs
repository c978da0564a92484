//! Duplicate detection cache
//!
//! At-least-once transports redeliver. The cache remembers every dedup key
//! `sensor_id|timestamp_ms|sequence_number` for one staleness window:
//!
//! ```text
//! check_and_insert(k)   ── vacant ──▶ insert(k, now), accept
//!                       └─ occupied ─▶ reject as duplicate
//! sweep(now, max_age)   ── evict every k with now - seen > max_age
//! ```
//!
//! Detection therefore has a sliding horizon: a resubmission after the
//! window has lapsed and a sweep has run is indistinguishable from new data.
//!
//! The map is sharded (`dashmap`), so check-and-insert is atomic per key
//! while unrelated keys proceed in parallel, and a sweep only holds one
//! shard lock at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::reading::SensorReading;
use crate::time::{elapsed_between, Clock};

/// Replay identity of a reading
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey(String);

impl DedupKey {
    pub fn for_reading(reading: &SensorReading) -> Self {
        Self(format!(
            "{}|{}|{}",
            reading.sensor_id,
            reading.timestamp.timestamp_millis(),
            reading.sequence_number.unwrap_or(0)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Concurrent map of dedup key to last-seen instant
#[derive(Debug, Default)]
pub struct DuplicateCache {
    entries: DashMap<DedupKey, DateTime<Utc>>,
}

impl DuplicateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `key` if absent. Returns `false` when it was already present.
    pub fn check_and_insert(&self, key: DedupKey, now: DateTime<Utc>) -> bool {
        match self.entries.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        }
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Evict entries last seen more than `max_age` before `now`
    pub fn sweep(&self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, seen| elapsed_between(*seen, now) <= max_age);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Background task that sweeps a [`DuplicateCache`] on a fixed interval
///
/// Owned by the validator; dropping it aborts the task.
pub struct CacheSweeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CacheSweeper {
    /// Spawn on the current tokio runtime
    pub fn spawn(
        cache: Arc<DuplicateCache>,
        clock: Arc<dyn Clock>,
        interval: Duration,
        max_age: Duration,
    ) -> Self {
        let (tx, mut rx) = oneshot::channel();
        let period = interval.max(Duration::from_millis(10));

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let evicted = cache.sweep(clock.now(), max_age);
                        if evicted > 0 {
                            log::debug!("dedup sweep evicted {} entries, {} remain", evicted, cache.len());
                        }
                    }
                }
            }
        });

        Self {
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    /// Signal the task and wait for it to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map_or(false, |h| !h.is_finished())
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
