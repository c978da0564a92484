//! Topic-shape routing
//!
//! The broker topic decides what a message is:
//!
//! | Topic                     | Route                               |
//! |---------------------------|-------------------------------------|
//! | `sensors/{id}/data`       | [`TopicRoute::Telemetry`]           |
//! | `devices/{id}/status`     | [`TopicRoute::DeviceStatus`]        |
//! | `alerts`, `site/alerts/…` | [`TopicRoute::Alert`]               |
//!
//! Matching is by path segment, so prefixes such as `site-4/sensors/inc-1/data`
//! route the same way.

/// Where an inbound message goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRoute {
    Telemetry { sensor_id: String },
    DeviceStatus { device_id: String },
    Alert,
    Unknown,
}

/// Classify a concrete (non-wildcard) topic
///
/// ```
/// use slopeguard_connectors::mqtt::{route_topic, TopicRoute};
///
/// assert_eq!(
///     route_topic("sensors/inc-12/data"),
///     TopicRoute::Telemetry { sensor_id: "inc-12".into() }
/// );
/// assert_eq!(route_topic("alerts"), TopicRoute::Alert);
/// ```
pub fn route_topic(topic: &str) -> TopicRoute {
    let segments: Vec<&str> = topic.split('/').map(str::trim).collect();

    let id_after = |name: &str| {
        segments
            .iter()
            .position(|s| *s == name)
            .and_then(|i| segments.get(i + 1))
            .filter(|id| !id.is_empty() && !is_wildcard(id))
            .map(|id| id.to_string())
    };

    if let Some(sensor_id) = id_after("sensors") {
        return TopicRoute::Telemetry { sensor_id };
    }

    if segments.last() == Some(&"status") {
        if let Some(device_id) = id_after("devices") {
            return TopicRoute::DeviceStatus { device_id };
        }
    }

    if segments.contains(&"alerts") {
        return TopicRoute::Alert;
    }

    TopicRoute::Unknown
}

fn is_wildcard(segment: &str) -> bool {
    segment == "+" || segment == "#"
}
