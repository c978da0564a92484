//! Bus Publisher: Keyed, Topic-Routed, Transactional Writes
//!
//! ## Overview
//!
//! One shared [`BusPublisher`] sits between every adapter and the message
//! bus. It owns a single transport connection and:
//! - routes each message class to its own topic ([`TopicTable`])
//! - keys every message by a stable entity id so per-entity order holds
//! - copies selected fields into headers for cheap downstream filtering
//! - publishes multi-record batches inside one transaction
//!
//! ## Message Classes
//!
//! | Class           | Default topic              | Key        | Headers                              |
//! |-----------------|----------------------------|------------|--------------------------------------|
//! | Raw reading     | `raw-sensor-data`          | sensor id  | `quality-score`, `sensor-type`, `source` |
//! | Processed       | `processed-sensor-data`    | sensor id  | `sensor-type`                        |
//! | Alert           | `alerts`                   | alert id   | `alert-level`                        |
//! | Device event    | `device-events`            | device id  |                                      |
//! | Batch result    | `batch-processing-results` | batch id   | `source`                             |
//! | Quality metrics | `data-quality-metrics`     | source     | `source`                             |
//!
//! ## Connection Lifetime
//!
//! ```text
//!   new() ──▶ connect() ──▶ [sends allowed] ──▶ disconnect()
//!                 ▲                                 │
//!                 └─────────────────────────────────┘
//! ```
//!
//! Outside a connected lifetime every send fails fast with
//! [`ConnectorError::NotConnected`]. Sends are serialized through one async
//! mutex around the transport; concurrent callers queue on it.
//!
//! ## Transactions
//!
//! [`BusPublisher::send_transactional`] begins a transaction, sends each
//! message, and commits. The first failing send aborts the transaction so
//! none of the batch becomes visible.

mod events;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use slopeguard_core::{AcceptedReading, DataQualityMetrics, SensorReading, Source};

use crate::{ConnectionStats, ConnectorError, ConnectorResult};

pub use events::{Alert, AlertLevel, BatchResult, DeviceEvent};
#[cfg(feature = "kafka")]
pub use kafka::KafkaBus;
pub use memory::InMemoryBus;

/// One record as written to the bus
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            headers: Vec::new(),
            payload,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Broker client behind the publisher
///
/// Calls arrive one at a time; the publisher holds the transport behind a
/// mutex for the duration of each call and of each transaction.
#[async_trait::async_trait]
pub trait BusTransport: Send {
    async fn connect(&mut self) -> ConnectorResult<()>;

    async fn disconnect(&mut self) -> ConnectorResult<()>;

    async fn send(&mut self, message: &BusMessage) -> ConnectorResult<()>;

    async fn begin_transaction(&mut self) -> ConnectorResult<()>;

    async fn commit_transaction(&mut self) -> ConnectorResult<()>;

    async fn abort_transaction(&mut self) -> ConnectorResult<()>;
}

/// Topic per message class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicTable {
    pub raw_readings: String,
    pub processed: String,
    pub alerts: String,
    pub device_events: String,
    pub batch_results: String,
    pub quality_metrics: String,
}

impl Default for TopicTable {
    fn default() -> Self {
        Self {
            raw_readings: "raw-sensor-data".into(),
            processed: "processed-sensor-data".into(),
            alerts: "alerts".into(),
            device_events: "device-events".into(),
            batch_results: "batch-processing-results".into(),
            quality_metrics: "data-quality-metrics".into(),
        }
    }
}

/// Which transport the service runs against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BusBackend {
    /// In-process log, development and tests
    #[default]
    Memory,
    Kafka,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub backend: BusBackend,
    /// Comma separated `host:port` list
    pub brokers: String,
    pub client_id: String,
    pub transactional_id: String,
    /// Producer retries on transient broker errors
    pub retries: u32,
    pub send_timeout_ms: u64,
    pub topics: TopicTable,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            backend: BusBackend::Memory,
            brokers: "localhost:9092".into(),
            client_id: "slopeguard-ingest".into(),
            transactional_id: "slopeguard-ingest-tx".into(),
            retries: 5,
            send_timeout_ms: 5_000,
            topics: TopicTable::default(),
        }
    }
}

/// Shared keyed, topic-routed publisher
pub struct BusPublisher {
    transport: AsyncMutex<Box<dyn BusTransport>>,
    topics: TopicTable,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    stats: Mutex<ConnectionStats>,
}

impl BusPublisher {
    pub fn new(transport: impl BusTransport + 'static, topics: TopicTable) -> Self {
        Self::from_boxed(Box::new(transport), topics)
    }

    pub fn from_boxed(transport: Box<dyn BusTransport>, topics: TopicTable) -> Self {
        Self {
            transport: AsyncMutex::new(transport),
            topics,
            connected: AtomicBool::new(false),
            ever_connected: AtomicBool::new(false),
            stats: Mutex::new(ConnectionStats::default()),
        }
    }

    pub fn topics(&self) -> &TopicTable {
        &self.topics
    }

    pub async fn connect(&self) -> ConnectorResult<()> {
        let mut transport = self.transport.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Err(err) = transport.connect().await {
            self.with_stats(|s| s.last_error = Some(err.to_string()));
            return Err(err);
        }

        if self.ever_connected.swap(true, Ordering::AcqRel) {
            self.with_stats(|s| s.reconnections += 1);
        }
        self.connected.store(true, Ordering::Release);
        tracing::info!("bus publisher connected");
        Ok(())
    }

    pub async fn disconnect(&self) -> ConnectorResult<()> {
        let mut transport = self.transport.lock().await;
        if !self.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        transport.disconnect().await?;
        tracing::info!("bus publisher disconnected");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConnectionStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Raw reading keyed by sensor id
    pub async fn publish_reading(
        &self,
        reading: &SensorReading,
        quality_score: f64,
        source: Source,
    ) -> ConnectorResult<()> {
        let message = self.reading_message(reading, quality_score, source)?;
        self.send_one(message).await
    }

    /// All accepted readings of a batch in one transaction
    pub async fn publish_readings(
        &self,
        readings: &[AcceptedReading],
        source: Source,
    ) -> ConnectorResult<()> {
        let messages = readings
            .iter()
            .map(|accepted| self.reading_message(&accepted.reading, accepted.quality_score, source))
            .collect::<ConnectorResult<Vec<_>>>()?;
        self.send_transactional(messages).await
    }

    /// Derived analytics result keyed by sensor id
    pub async fn publish_processed<T: Serialize + ?Sized>(
        &self,
        sensor_id: &str,
        sensor_type: &str,
        result: &T,
    ) -> ConnectorResult<()> {
        let message = BusMessage::new(&self.topics.processed, sensor_id, encode(result)?)
            .with_header("sensor-type", sensor_type);
        self.send_one(message).await
    }

    pub async fn publish_alert(&self, alert: &Alert) -> ConnectorResult<()> {
        let message = BusMessage::new(&self.topics.alerts, &alert.alert_id, encode(alert)?)
            .with_header("alert-level", alert.level.as_str());
        self.send_one(message).await
    }

    pub async fn publish_device_event(&self, event: &DeviceEvent) -> ConnectorResult<()> {
        let message = BusMessage::new(&self.topics.device_events, &event.device_id, encode(event)?);
        self.send_one(message).await
    }

    pub async fn publish_batch_result(&self, result: &BatchResult) -> ConnectorResult<()> {
        let message = BusMessage::new(&self.topics.batch_results, &result.batch_id, encode(result)?)
            .with_header("source", result.source.as_str());
        self.send_one(message).await
    }

    pub async fn publish_quality_metrics(
        &self,
        source: Source,
        metrics: &DataQualityMetrics,
    ) -> ConnectorResult<()> {
        let message = BusMessage::new(&self.topics.quality_metrics, source.as_str(), encode(metrics)?)
            .with_header("source", source.as_str());
        self.send_one(message).await
    }

    /// Send `messages` all-or-nothing
    pub async fn send_transactional(&self, messages: Vec<BusMessage>) -> ConnectorResult<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let mut transport = self.transport.lock().await;
        self.ensure_connected()?;

        transport.begin_transaction().await?;

        let mut bytes = 0usize;
        for message in &messages {
            if let Err(err) = transport.send(message).await {
                tracing::warn!(
                    topic = %message.topic,
                    key = %message.key,
                    error = %err,
                    "transactional send failed, aborting batch"
                );
                let abort = transport.abort_transaction().await;
                self.with_stats(|s| {
                    s.transactions_aborted += 1;
                    s.messages_failed += messages.len() as u64;
                    s.last_error = Some(err.to_string());
                });
                if let Err(abort_err) = abort {
                    tracing::error!(error = %abort_err, "transaction abort failed");
                }
                return Err(err);
            }
            bytes += message.payload.len();
        }

        if let Err(err) = transport.commit_transaction().await {
            tracing::warn!(error = %err, "transaction commit failed, aborting batch");
            let abort = transport.abort_transaction().await;
            self.with_stats(|s| {
                s.transactions_aborted += 1;
                s.messages_failed += messages.len() as u64;
                s.last_error = Some(err.to_string());
            });
            if let Err(abort_err) = abort {
                tracing::error!(error = %abort_err, "transaction abort failed");
            }
            return Err(err);
        }

        self.with_stats(|s| {
            s.transactions_committed += 1;
            s.messages_sent += messages.len() as u64;
            s.bytes_sent += bytes as u64;
        });
        Ok(())
    }

    async fn send_one(&self, message: BusMessage) -> ConnectorResult<()> {
        let mut transport = self.transport.lock().await;
        self.ensure_connected()?;

        match transport.send(&message).await {
            Ok(()) => {
                self.with_stats(|s| s.record_sent(message.payload.len()));
                Ok(())
            }
            Err(err) => {
                self.with_stats(|s| s.record_failure(&err));
                Err(err)
            }
        }
    }

    fn ensure_connected(&self) -> ConnectorResult<()> {
        if self.is_connected() {
            Ok(())
        } else {
            let err = ConnectorError::NotConnected;
            self.with_stats(|s| s.record_failure(&err));
            Err(err)
        }
    }

    fn reading_message(
        &self,
        reading: &SensorReading,
        quality_score: f64,
        source: Source,
    ) -> ConnectorResult<BusMessage> {
        Ok(
            BusMessage::new(&self.topics.raw_readings, &reading.sensor_id, encode(reading)?)
                .with_header("quality-score", format!("{:.3}", quality_score))
                .with_header("sensor-type", reading.sensor_type.as_str())
                .with_header("source", source.as_str()),
        )
    }

    fn with_stats(&self, update: impl FnOnce(&mut ConnectionStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> ConnectorResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ConnectorError::Serialization(e.to_string()))
}
