//! Kafka transport (feature `kafka`)
//!
//! Idempotent, ordered producer: one in-flight request per connection,
//! `acks=all`, bounded retries. Transactions map one-to-one onto the
//! producer's transactional API; the blocking control calls run on the
//! blocking pool.

use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use super::{BusConfig, BusMessage, BusTransport};
use crate::{ConnectorError, ConnectorResult};

pub struct KafkaBus {
    config: BusConfig,
    producer: Option<FutureProducer>,
}

impl KafkaBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            producer: None,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.send_timeout_ms)
    }

    fn producer(&self) -> ConnectorResult<FutureProducer> {
        self.producer.clone().ok_or(ConnectorError::NotConnected)
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.config.brokers)
            .set("client.id", &self.config.client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("max.in.flight.requests.per.connection", "1")
            .set("retries", self.config.retries.to_string())
            .set("message.timeout.ms", self.config.send_timeout_ms.to_string())
            .set("transactional.id", &self.config.transactional_id);
        config
    }

    async fn control<F>(&self, op: &'static str, call: F) -> ConnectorResult<()>
    where
        F: FnOnce(FutureProducer, Duration) -> rdkafka::error::KafkaResult<()> + Send + 'static,
    {
        let producer = self.producer()?;
        let timeout = self.timeout();
        tokio::task::spawn_blocking(move || call(producer, timeout))
            .await
            .map_err(|e| ConnectorError::Transport(format!("{} task failed: {}", op, e)))?
            .map_err(|e| ConnectorError::Transport(format!("{}: {}", op, e)))
    }
}

#[async_trait::async_trait]
impl BusTransport for KafkaBus {
    async fn connect(&mut self) -> ConnectorResult<()> {
        let producer: FutureProducer = self
            .client_config()
            .create()
            .map_err(|e| ConnectorError::Config(format!("kafka producer: {}", e)))?;
        self.producer = Some(producer);

        if let Err(err) = self
            .control("init_transactions", |p, t| p.init_transactions(t))
            .await
        {
            self.producer = None;
            return Err(err);
        }

        tracing::info!(brokers = %self.config.brokers, "kafka producer ready");
        Ok(())
    }

    async fn disconnect(&mut self) -> ConnectorResult<()> {
        if let Some(producer) = self.producer.take() {
            let timeout = self.timeout();
            let flushed = tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| ConnectorError::Transport(e.to_string()))?;
            flushed.map_err(|e| ConnectorError::Transport(format!("flush: {}", e)))?;
        }
        Ok(())
    }

    async fn send(&mut self, message: &BusMessage) -> ConnectorResult<()> {
        let producer = self.producer()?;

        let headers = message
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_bytes()),
                })
            });

        let record = FutureRecord::to(&message.topic)
            .key(&message.key)
            .payload(&message.payload)
            .headers(headers);

        producer
            .send(record, Timeout::After(self.timeout()))
            .await
            .map(|_| ())
            .map_err(|(err, _)| ConnectorError::Transport(err.to_string()))
    }

    async fn begin_transaction(&mut self) -> ConnectorResult<()> {
        self.producer()?
            .begin_transaction()
            .map_err(|e| ConnectorError::Transport(format!("begin_transaction: {}", e)))
    }

    async fn commit_transaction(&mut self) -> ConnectorResult<()> {
        self.control("commit_transaction", |p, t| p.commit_transaction(t))
            .await
    }

    async fn abort_transaction(&mut self) -> ConnectorResult<()> {
        self.control("abort_transaction", |p, t| p.abort_transaction(t))
            .await
    }
}
