//! Batch outcome and quality metrics

use serde_json::Value;

use super::Scored;
use crate::reading::{DataQualityMetrics, SensorReading, ValidationResult};

/// An accepted batch element with the score it was accepted at
#[derive(Debug, Clone)]
pub struct AcceptedReading {
    pub reading: SensorReading,
    pub quality_score: f64,
    pub warnings: Vec<String>,
}

/// A rejected batch element with its position in the input
#[derive(Debug, Clone)]
pub struct InvalidRecord {
    pub index: usize,
    pub raw: Value,
    pub result: ValidationResult,
}

/// Partitioned batch, input order preserved in both halves
#[derive(Debug, Clone, Default)]
pub struct BatchValidation {
    pub valid: Vec<AcceptedReading>,
    pub invalid: Vec<InvalidRecord>,
    pub metrics: DataQualityMetrics,
}

impl BatchValidation {
    pub fn total(&self) -> usize {
        self.valid.len() + self.invalid.len()
    }

    pub fn readings(&self) -> impl Iterator<Item = &SensorReading> {
        self.valid.iter().map(|accepted| &accepted.reading)
    }
}

/// Running counters over scored records
///
/// Per-condition counts cover accepted records only, except duplicates which
/// are counted over every record since a duplicate is never accepted.
#[derive(Debug, Default)]
pub(crate) struct MetricsAccumulator {
    metrics: DataQualityMetrics,
    valid_score_sum: f64,
}

impl MetricsAccumulator {
    pub fn record(&mut self, scored: &Scored) {
        let m = &mut self.metrics;
        m.total_records += 1;

        if scored.findings.duplicate {
            m.duplicate_count += 1;
        }

        let Some(reading) = scored.reading.as_ref() else {
            m.invalid_records += 1;
            return;
        };

        m.valid_records += 1;
        self.valid_score_sum += scored.result.quality_score;

        if scored.findings.low_battery {
            m.low_battery_count += 1;
        }
        if scored.findings.stale {
            m.stale_data_count += 1;
        }
        if reading.quality_flags.communication_error {
            m.communication_error_count += 1;
        }
    }

    pub fn finish(mut self) -> DataQualityMetrics {
        self.metrics.average_quality_score = if self.metrics.valid_records == 0 {
            0.0
        } else {
            self.valid_score_sum / self.metrics.valid_records as f64
        };
        self.metrics
    }
}
