//! Physical plausibility ranges per sensor type
//!
//! The range policy is the single place that encodes what a sensor can
//! physically report. It is plain data: the default table below can be
//! extended or overridden from the service configuration, e.g.
//!
//! ```toml
//! [validator.ranges.piezometer]
//! water_level = [0, 250]
//! ```
//!
//! Lookups for sensor types or measurement names absent from the table
//! return `None`; such values are accepted as long as they are finite.

use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::{Deserialize, Deserializer, Serialize};

/// Closed interval `[min, max]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    /// Inclusive on both ends; NaN is never contained
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

impl From<[f64; 2]> for Range {
    fn from([min, max]: [f64; 2]) -> Self {
        Self { min, max }
    }
}

impl From<Range> for [f64; 2] {
    fn from(range: Range) -> Self {
        [range.min, range.max]
    }
}

/// `sensor_type → measurement name → Range`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RangePolicy {
    table: HashMap<String, HashMap<String, Range>>,
}

lazy_static! {
    /// Built-in table for slope-monitoring instrumentation
    pub static ref DEFAULT_RANGE_POLICY: RangePolicy = {
        let mut policy = RangePolicy::empty();

        let tilt = Range::new(-90.0, 90.0);
        policy.insert("tiltmeter", "tilt_x", tilt);
        policy.insert("tiltmeter", "tilt_y", tilt);

        let accel = Range::new(-50.0, 50.0);
        for axis in ["accel_x", "accel_y", "accel_z"] {
            policy.insert("accelerometer", axis, accel);
        }

        policy.insert("environmental", "temperature", Range::new(-50.0, 80.0));
        policy.insert("environmental", "humidity", Range::new(0.0, 100.0));
        policy.insert("environmental", "pressure", Range::new(0.0, 10_000.0));

        // Port-1 multi-sensor nodes report their board temperature
        policy.insert("multi_sensor", "temperature", Range::new(-40.0, 85.0));
        policy.insert("multi_sensor", "humidity", Range::new(0.0, 100.0));
        policy.insert("multi_sensor", "tilt_x", tilt);
        policy.insert("multi_sensor", "tilt_y", tilt);

        policy.insert("piezometer", "water_level", Range::new(0.0, 1000.0));
        policy.insert("piezometer", "pressure", Range::new(0.0, 10_000.0));

        policy.insert("strain_gauge", "strain", Range::new(-10_000.0, 10_000.0));

        let displacement = Range::new(-1000.0, 1000.0);
        for axis in ["displacement_x", "displacement_y", "displacement_z"] {
            policy.insert("extensometer", axis, displacement);
        }

        policy
    };
}

impl RangePolicy {
    /// Policy with no entries; every finite value passes
    pub fn empty() -> Self {
        Self {
            table: HashMap::new(),
        }
    }

    pub fn insert(&mut self, sensor_type: &str, measurement: &str, range: Range) {
        self.table
            .entry(sensor_type.to_string())
            .or_default()
            .insert(measurement.to_string(), range);
    }

    pub fn lookup(&self, sensor_type: &str, measurement: &str) -> Option<Range> {
        self.table
            .get(sensor_type)
            .and_then(|ranges| ranges.get(measurement))
            .copied()
    }

    /// Finite, and within the configured range when one exists
    pub fn accepts(&self, sensor_type: &str, measurement: &str, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        self.lookup(sensor_type, measurement)
            .map_or(true, |range| range.contains(value))
    }

    /// Overlay `other` on top of this policy, entry by entry
    pub fn merged(mut self, other: RangePolicy) -> Self {
        for (sensor_type, ranges) in other.table {
            let entry = self.table.entry(sensor_type).or_default();
            entry.extend(ranges);
        }
        self
    }

    /// First inverted or non-finite bound, as `sensor_type.measurement`
    pub fn find_invalid_bound(&self) -> Option<String> {
        self.table.iter().find_map(|(sensor_type, ranges)| {
            ranges.iter().find_map(|(name, range)| {
                let broken =
                    !range.min.is_finite() || !range.max.is_finite() || range.min > range.max;
                broken.then(|| format!("{}.{}", sensor_type, name))
            })
        })
    }

    pub fn sensor_types(&self) -> impl Iterator<Item = &str> {
        self.table.keys().map(String::as_str)
    }
}

/// Deserialize a policy and overlay it on the built-in defaults
pub fn merge_with_defaults<'de, D>(deserializer: D) -> Result<RangePolicy, D::Error>
where
    D: Deserializer<'de>,
{
    let custom = RangePolicy::deserialize(deserializer)?;
    Ok(DEFAULT_RANGE_POLICY.clone().merged(custom))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_bounds() {
        let policy = DEFAULT_RANGE_POLICY.clone();
        assert!(policy.accepts("tiltmeter", "tilt_x", 90.0));
        assert!(!policy.accepts("tiltmeter", "tilt_x", 90.01));
        assert!(policy.accepts("extensometer", "displacement_z", -1000.0));
        assert!(!policy.accepts("environmental", "humidity", -0.5));
        assert_eq!(
            policy.lookup("strain_gauge", "strain"),
            Some(Range::new(-10_000.0, 10_000.0))
        );
    }

    #[test]
    fn unknown_pairs_only_need_finite() {
        let policy = DEFAULT_RANGE_POLICY.clone();
        assert!(policy.accepts("geophone", "velocity", 1e9));
        assert!(policy.accepts("tiltmeter", "azimuth", -720.0));
        assert!(!policy.accepts("geophone", "velocity", f64::INFINITY));
        assert!(!policy.accepts("tiltmeter", "tilt_x", f64::NAN));
    }

    #[test]
    fn overlay_replaces_single_entries() {
        let mut custom = RangePolicy::empty();
        custom.insert("piezometer", "water_level", Range::new(0.0, 250.0));
        custom.insert("rain_gauge", "rainfall", Range::new(0.0, 500.0));

        let policy = DEFAULT_RANGE_POLICY.clone().merged(custom);
        assert!(!policy.accepts("piezometer", "water_level", 300.0));
        // untouched sibling survives the overlay
        assert!(policy.accepts("piezometer", "pressure", 300.0));
        assert!(!policy.accepts("rain_gauge", "rainfall", 501.0));
    }

    #[test]
    fn deserializes_from_pairs() {
        let json = r#"{"piezometer": {"water_level": [0, 120.5]}}"#;
        let policy: RangePolicy = serde_json::from_str(json).unwrap();
        assert_eq!(
            policy.lookup("piezometer", "water_level"),
            Some(Range::new(0.0, 120.5))
        );
    }

    #[test]
    fn detects_inverted_bounds() {
        let mut policy = RangePolicy::empty();
        assert!(policy.find_invalid_bound().is_none());
        policy.insert("strain_gauge", "strain", Range::new(5.0, -5.0));
        assert_eq!(policy.find_invalid_bound().as_deref(), Some("strain_gauge.strain"));
    }
}
