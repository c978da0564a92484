//! MQTT Pub/Sub Adapter for Mesh Telemetry
//!
//! ## Overview
//!
//! Owns one long-lived broker connection. On every successful connect it
//! subscribes to the three fixed patterns from [`MqttConfig`] and feeds each
//! inbound publish to the [`MessageHandler`].
//!
//! ## Connection State Machine
//!
//! ```text
//!            run()
//! Disconnected ──▶ Connecting ──ConnAck──▶ Connected
//!                      │                      │ poll error
//!                      │ poll error           ▼
//!                      └──────────────▶ Reconnecting { attempt }
//!                                             │   │
//!                         ConnAck (attempt=0) │   │ attempt > max_reconnect_attempts
//!                              ┌──────────────┘   ▼
//!                              ▼                Failed (terminal)
//!                          Connected
//! ```
//!
//! The state is published on a `tokio::sync::watch` channel; the health
//! surface and the outbound [`MqttPublisher`] both read it. `Failed` is
//! terminal: the supervisor exits and health reports the broker down.
//!
//! ## Reconnect Policy
//!
//! Fixed interval between attempts, hard cap on consecutive failures. A
//! `ConnAck` resets the counter. There is no per-message retry.
//!
//! ## Dispatch
//!
//! Inbound publishes go through a bounded queue to one dispatch task that
//! runs the handler, so bus latency never delays keep-alive traffic on the
//! event loop. Arrival order is kept. A full queue holds the poll loop back
//! until the handler catches up; on exit the queue is drained.

mod handler;
mod topic;

use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, Publish, QoS};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{AsyncConnector, ConnectionStats, ConnectorError, ConnectorResult, IngestContext};

pub use handler::{HandleOutcome, MessageHandler};
pub use topic::{route_topic, TopicRoute};

/// Broker connection and subscription settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub username: Option<String>,
    pub password: Option<String>,
    pub telemetry_topic: String,
    pub status_topic: String,
    pub alert_topic: String,
    pub reconnect_interval_secs: u64,
    pub max_reconnect_attempts: u32,
    /// Request channel capacity between client handles and the event loop
    pub channel_capacity: usize,
    /// Inbound publishes buffered ahead of the handler
    pub handler_queue_capacity: usize,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "localhost".into(),
            port: 1883,
            client_id: "slopeguard-ingest".into(),
            keep_alive_secs: 30,
            username: None,
            password: None,
            telemetry_topic: "sensors/+/data".into(),
            status_topic: "devices/+/status".into(),
            alert_topic: "alerts".into(),
            reconnect_interval_secs: 5,
            max_reconnect_attempts: 10,
            channel_capacity: 100,
            handler_queue_capacity: 256,
        }
    }
}

impl MqttConfig {
    pub fn subscriptions(&self) -> [&str; 3] {
        [&self.telemetry_topic, &self.status_topic, &self.alert_topic]
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            interval: Duration::from_secs(self.reconnect_interval_secs),
            max_attempts: self.max_reconnect_attempts,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user, pass);
        }
        options
    }
}

/// Broker connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Failed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

/// What to do after a failed connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// `attempt` counts consecutive failures, starting at 1
    pub fn on_failure(&self, attempt: u32) -> ReconnectDecision {
        if attempt > self.max_attempts {
            ReconnectDecision::GiveUp
        } else {
            ReconnectDecision::RetryAfter(self.interval)
        }
    }
}

/// Supervising task around the rumqttc event loop
pub struct MqttAdapter {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: EventLoop,
    handler: MessageHandler,
    state: watch::Sender<ConnectionState>,
}

impl MqttAdapter {
    /// Build the adapter; nothing connects until [`run`](Self::run)
    pub fn new(config: MqttConfig, ctx: IngestContext) -> Self {
        let (client, eventloop) = AsyncClient::new(config.options(), config.channel_capacity.max(1));
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            client,
            eventloop,
            handler: MessageHandler::new(ctx),
            state,
        }
    }

    /// Outbound handle on this adapter's connection
    pub fn publisher(&self) -> MqttPublisher {
        MqttPublisher {
            client: self.client.clone(),
            state: self.state.subscribe(),
            stats: std::sync::Mutex::new(ConnectionStats::default()),
        }
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Drive the connection until cancelled or the reconnect cap is exceeded
    #[instrument(
        name = "mqtt_adapter",
        skip_all,
        fields(broker = %format!("{}:{}", self.config.host, self.config.port))
    )]
    pub async fn run(mut self, shutdown: CancellationToken) -> ConnectionState {
        let (inbound, dispatch) =
            spawn_dispatch(self.handler.clone(), self.config.handler_queue_capacity);

        let final_state = self.drive(&shutdown, &inbound).await;

        drop(inbound);
        if let Err(err) = dispatch.await {
            error!(error = %err, "mqtt dispatch task ended abnormally");
        }
        final_state
    }

    async fn drive(
        &mut self,
        shutdown: &CancellationToken,
        inbound: &mpsc::Sender<Publish>,
    ) -> ConnectionState {
        let policy = self.config.reconnect_policy();
        let mut attempt = 0u32;
        self.set_state(ConnectionState::Connecting);

        info!(topics = ?self.config.subscriptions(), "starting MQTT adapter");

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!("shutdown signal received");
                    return self.stop().await;
                }
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if attempt > 0 {
                        info!(attempts = attempt, "reconnected to MQTT broker");
                    } else {
                        info!("connected to MQTT broker");
                    }
                    attempt = 0;
                    self.subscribe_all();
                    self.set_state(ConnectionState::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if inbound.capacity() == 0 {
                        warn!("handler queue full, holding the event loop");
                    }
                    let topic = publish.topic.clone();
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            warn!(topic = %topic, "shutdown while queue full, message dropped");
                            return self.stop().await;
                        }
                        sent = inbound.send(publish) => {
                            if sent.is_err() {
                                error!("mqtt dispatch task is gone");
                                self.set_state(ConnectionState::Failed);
                                return ConnectionState::Failed;
                            }
                        }
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("subscription acknowledged");
                }
                Ok(_) => {}
                Err(err) => {
                    attempt += 1;
                    error!(error = %err, attempt, "MQTT connection error");

                    match policy.on_failure(attempt) {
                        ReconnectDecision::GiveUp => {
                            error!(
                                max_attempts = policy.max_attempts,
                                "max reconnect attempts reached, giving up"
                            );
                            self.set_state(ConnectionState::Failed);
                            return ConnectionState::Failed;
                        }
                        ReconnectDecision::RetryAfter(delay) => {
                            warn!(
                                attempt,
                                max_attempts = policy.max_attempts,
                                "retrying MQTT connection"
                            );
                            self.set_state(ConnectionState::Reconnecting { attempt });
                            tokio::select! {
                                _ = shutdown.cancelled() => {
                                    self.set_state(ConnectionState::Disconnected);
                                    return ConnectionState::Disconnected;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    async fn stop(&mut self) -> ConnectionState {
        let _ = self.client.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        ConnectionState::Disconnected
    }

    fn subscribe_all(&self) {
        for topic in self.config.subscriptions() {
            match self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                Ok(()) => debug!(topic, "subscribe requested"),
                Err(err) => error!(topic, error = %err, "subscribe request failed"),
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }
}

/// Handler task fed from a bounded queue; ends once every sender is dropped
/// and the queue is empty
fn spawn_dispatch(handler: MessageHandler, capacity: usize) -> (mpsc::Sender<Publish>, JoinHandle<()>) {
    let (inbound, mut queue) = mpsc::channel::<Publish>(capacity.max(1));
    let task = tokio::spawn(async move {
        while let Some(publish) = queue.recv().await {
            handler.handle(&publish.topic, &publish.payload).await;
        }
    });
    (inbound, task)
}

/// Outbound publishes for diagnostics and test traffic
pub struct MqttPublisher {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    stats: std::sync::Mutex<ConnectionStats>,
}

impl MqttPublisher {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub async fn publish(&self, topic: &str, payload: &[u8]) -> ConnectorResult<()> {
        let result = if self.state().is_connected() {
            self.client
                .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
                .await
                .map_err(|e| ConnectorError::Transport(e.to_string()))
        } else {
            Err(ConnectorError::NotConnected)
        };

        let mut stats = self.stats.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &result {
            Ok(()) => stats.record_sent(payload.len()),
            Err(err) => stats.record_failure(err),
        }
        result
    }
}

#[async_trait::async_trait]
impl AsyncConnector for MqttPublisher {
    async fn send(&self, topic: &str, data: &[u8]) -> ConnectorResult<()> {
        self.publish(topic, data).await
    }

    fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    fn stats(&self) -> ConnectionStats {
        self.stats
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
