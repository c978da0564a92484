//! Inbound message handling for the pub/sub adapter

use serde_json::Value;
use tracing::{debug, info_span, warn, Instrument, Span};

use slopeguard_core::{DataQualityMetrics, Source};

use super::topic::{route_topic, TopicRoute};
use crate::bus::{Alert, DeviceEvent};
use crate::IngestContext;

/// Counts for one handled message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleOutcome {
    pub received: u64,
    pub processed: u64,
    pub rejected: u64,
}

impl HandleOutcome {
    fn single(ok: bool) -> Self {
        Self {
            received: 1,
            processed: ok as u64,
            rejected: (!ok) as u64,
        }
    }
}

/// Routes broker messages to the validator and publisher
#[derive(Clone)]
pub struct MessageHandler {
    ctx: IngestContext,
}

impl MessageHandler {
    pub fn new(ctx: IngestContext) -> Self {
        Self { ctx }
    }

    /// Handle one message; never fails, every outcome lands in the stats
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> HandleOutcome {
        let span = info_span!(
            parent: Span::none(),
            "mqtt_message",
            topic = %topic,
            payload_size = payload.len(),
        );

        async {
            let timer = self.ctx.stats.start(Source::Mqtt);
            let (outcome, metrics) = self.dispatch(topic, payload).await;
            self.ctx.stats.record(timer.finish(
                outcome.received,
                outcome.processed,
                outcome.rejected,
                metrics,
            ));
            outcome
        }
        .instrument(span)
        .await
    }

    async fn dispatch(&self, topic: &str, payload: &[u8]) -> (HandleOutcome, DataQualityMetrics) {
        let body: Value = match serde_json::from_slice(payload) {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "dropping non-JSON message");
                return (HandleOutcome::single(false), DataQualityMetrics::default());
            }
        };

        match route_topic(topic) {
            TopicRoute::Telemetry { sensor_id } => self.telemetry(&sensor_id, body).await,
            TopicRoute::DeviceStatus { device_id } => {
                let event =
                    DeviceEvent::new(device_id, "status", self.ctx.validator.now(), body);
                let ok = self.ctx.publisher.publish_device_event(&event).await;
                log_publish_failure(&ok);
                (HandleOutcome::single(ok.is_ok()), DataQualityMetrics::default())
            }
            TopicRoute::Alert => {
                let alert = Alert::from_payload(body, self.ctx.validator.now());
                let ok = self.ctx.publisher.publish_alert(&alert).await;
                log_publish_failure(&ok);
                (HandleOutcome::single(ok.is_ok()), DataQualityMetrics::default())
            }
            TopicRoute::Unknown => {
                debug!("no route for topic");
                (HandleOutcome::single(false), DataQualityMetrics::default())
            }
        }
    }

    async fn telemetry(&self, sensor_id: &str, body: Value) -> (HandleOutcome, DataQualityMetrics) {
        let mut records = match body {
            Value::Array(items) => items,
            single => vec![single],
        };
        for record in records.iter_mut() {
            fill_sensor_id(record, sensor_id);
        }

        let batch = self.ctx.validator.validate_batch(&records);
        let mut outcome = HandleOutcome {
            received: records.len() as u64,
            processed: 0,
            rejected: batch.invalid.len() as u64,
        };

        for invalid in &batch.invalid {
            debug!(
                sensor_id = %sensor_id,
                index = invalid.index,
                errors = ?invalid.result.errors,
                "telemetry record rejected"
            );
        }

        for accepted in &batch.valid {
            let sent = self
                .ctx
                .publisher
                .publish_reading(&accepted.reading, accepted.quality_score, Source::Mqtt)
                .await;
            match sent {
                Ok(()) => outcome.processed += 1,
                Err(err) => {
                    warn!(sensor_id = %accepted.reading.sensor_id, error = %err, "publish failed");
                    outcome.rejected += 1;
                }
            }
        }

        (outcome, batch.metrics)
    }
}

/// Use the topic's sensor id when the record has none
fn fill_sensor_id(record: &mut Value, sensor_id: &str) {
    if let Value::Object(map) = record {
        let missing = map
            .get("sensor_id")
            .and_then(Value::as_str)
            .map_or(true, |id| id.trim().is_empty());
        if missing {
            map.insert("sensor_id".into(), Value::String(sensor_id.to_string()));
        }
    }
}

fn log_publish_failure<T>(result: &crate::ConnectorResult<T>) {
    if let Err(err) = result {
        warn!(error = %err, "publish failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusPublisher, InMemoryBus, TopicTable};
    use slopeguard_core::{Clock, ManualClock, StatsAggregator, Validator, ValidatorConfig};
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;

    async fn handler() -> (InMemoryBus, Arc<StatsAggregator>, MessageHandler, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 8, 20, 10, 0, 0).unwrap());
        let bus = InMemoryBus::new();
        let publisher = Arc::new(BusPublisher::new(bus.clone(), TopicTable::default()));
        publisher.connect().await.unwrap();
        let stats = Arc::new(StatsAggregator::new());
        let ctx = IngestContext::new(
            Arc::new(Validator::with_clock(ValidatorConfig::default(), Arc::new(clock.clone()))),
            publisher,
            Arc::clone(&stats),
        );
        (bus, stats, MessageHandler::new(ctx), clock)
    }

    #[tokio::test]
    async fn telemetry_fills_sensor_id_from_topic() {
        let (bus, _, handler, clock) = handler().await;
        let body = json!({
            "timestamp": clock.now().to_rfc3339(),
            "sensor_type": "tiltmeter",
            "measurements": {"tilt_x": 0.4}
        });

        let outcome = handler
            .handle("sensors/inc-5/data", body.to_string().as_bytes())
            .await;
        assert_eq!(outcome, HandleOutcome { received: 1, processed: 1, rejected: 0 });

        let published = bus.messages_on("raw-sensor-data");
        assert_eq!(published[0].key, "inc-5");
        assert_eq!(published[0].header("source"), Some("mqtt"));
    }

    #[tokio::test]
    async fn telemetry_array_partial() {
        let (bus, stats, handler, clock) = handler().await;
        let now = clock.now().to_rfc3339();
        let body = json!([
            {"sensor_id": "ext-1", "timestamp": now, "sensor_type": "extensometer",
             "measurements": {"displacement_x": 2.0}},
            {"timestamp": now, "sensor_type": "extensometer",
             "measurements": {"displacement_x": 5000.0}},
        ]);

        let outcome = handler
            .handle("sensors/ext-9/data", body.to_string().as_bytes())
            .await;
        assert_eq!(outcome, HandleOutcome { received: 2, processed: 1, rejected: 1 });
        assert_eq!(bus.messages().len(), 1);

        let summary = stats.summary();
        assert_eq!(summary.sources[&Source::Mqtt].received, 2);
        assert_eq!(summary.total_rejected, 1);
    }

    #[tokio::test]
    async fn bad_json_dropped_and_counted() {
        let (bus, stats, handler, _) = handler().await;
        let outcome = handler.handle("sensors/x/data", b"{not json").await;
        assert_eq!(outcome.rejected, 1);
        assert!(bus.messages().is_empty());
        assert_eq!(stats.summary().total_received, 1);
    }

    #[tokio::test]
    async fn status_and_alert_routes() {
        let (bus, _, handler, _) = handler().await;

        handler
            .handle("devices/gw-2/status", br#"{"uptime": 3600, "battery": 91}"#)
            .await;
        handler
            .handle("alerts", br#"{"id": "al-1", "level": "critical", "message": "tilt rate"}"#)
            .await;

        let events = bus.messages_on("device-events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key, "gw-2");
        let event: Value = serde_json::from_slice(&events[0].payload).unwrap();
        assert_eq!(event["eventType"], "status");
        assert_eq!(event["details"]["uptime"], 3600);

        let alerts = bus.messages_on("alerts");
        assert_eq!(alerts[0].key, "al-1");
        assert_eq!(alerts[0].header("alert-level"), Some("critical"));
    }

    #[tokio::test]
    async fn unknown_topic_counted_as_rejected() {
        let (bus, stats, handler, _) = handler().await;
        let outcome = handler.handle("weather/today", b"{}").await;
        assert_eq!(outcome.rejected, 1);
        assert!(bus.messages().is_empty());
        assert_eq!(stats.summary().total_rejected, 1);
    }
}
