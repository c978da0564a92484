//! SlopeGuard Ingest - slope telemetry ingestion service
//!
//! Accepts field telemetry over MQTT, LoRaWAN network-server webhooks and
//! HTTP, screens every record through one shared validator, and publishes
//! the accepted records to the message bus.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: HTTP on 0.0.0.0:8080, MQTT on localhost:1883, in-memory bus
//! slopeguard-ingest
//!
//! # With a configuration file and a different port
//! slopeguard-ingest --config /etc/slopeguard/ingest.toml --port 9000
//! ```
//!
//! # Endpoints
//!
//! - `POST /sensor-reading`, `POST /sensor-readings/batch` - record intake
//! - `POST /upload`, `/upload/csv`, `/upload/json` - file intake
//! - `POST /webhook/{uplink,join,status,error}` - network-server webhooks
//! - `GET /stats` - ingestion statistics
//! - `GET /health` - dependency status

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slopeguard_connectors::bus::{BusBackend, BusConfig, BusPublisher, BusTransport, InMemoryBus};
use slopeguard_connectors::health::{self, HealthState};
use slopeguard_connectors::mqtt::MqttAdapter;
use slopeguard_connectors::{http, lorawan, IngestContext};
use slopeguard_core::{StatsAggregator, Validator};

use crate::config::IngestConfig;

/// SlopeGuard telemetry ingestion service
#[derive(Parser, Debug)]
#[command(name = "slopeguard-ingest")]
#[command(about = "Slope-stability telemetry ingestion service")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides the config file)
    #[arg(short, long)]
    bind: Option<String>,

    /// HTTP server port (overrides the config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => IngestConfig::load(path)?,
        None => IngestConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate().context("invalid configuration")?;

    run(config).await
}

async fn run(config: IngestConfig) -> Result<()> {
    let shutdown = CancellationToken::new();

    let validator = Arc::new(Validator::new(config.validator.clone()));
    validator.start_sweeper();

    let publisher = Arc::new(BusPublisher::from_boxed(
        transport(&config.bus)?,
        config.bus.topics.clone(),
    ));
    publisher.connect().await.context("connecting to the message bus")?;

    let stats = Arc::new(StatsAggregator::new());
    let ctx = IngestContext::new(Arc::clone(&validator), Arc::clone(&publisher), stats);

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let broker = if config.mqtt.enabled {
        let adapter = MqttAdapter::new(config.mqtt.clone(), ctx.clone());
        let state = adapter.state();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let final_state = adapter.run(token).await;
            info!(state = ?final_state, "mqtt adapter stopped");
        }));
        Some(state)
    } else {
        info!("mqtt adapter disabled");
        None
    };

    let app = Router::new()
        .merge(http::routes(ctx.clone(), config.intake.clone()))
        .merge(lorawan::routes(ctx.clone(), config.webhook.clone()))
        .merge(health::routes(HealthState::new(ctx, broker)))
        .layer(TraceLayer::new_for_http());

    let addr = config.server.addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;

    info!("SlopeGuard Ingest v{}", slopeguard_core::VERSION);
    info!("HTTP server: http://{}", addr);
    info!(backend = ?config.bus.backend, brokers = %config.bus.brokers, "message bus connected");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("http server")?;

    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(error = %err, "background task ended abnormally");
        }
    }
    validator.stop_sweeper().await;
    if let Err(err) = publisher.disconnect().await {
        warn!(error = %err, "bus disconnect failed");
    }

    info!("shutdown complete");
    Ok(())
}

fn transport(config: &BusConfig) -> Result<Box<dyn BusTransport>> {
    match config.backend {
        BusBackend::Memory => {
            warn!("in-memory bus backend: published messages never leave this process");
            Ok(Box::new(InMemoryBus::new()))
        }
        #[cfg(feature = "kafka")]
        BusBackend::Kafka => Ok(Box::new(slopeguard_connectors::bus::KafkaBus::new(
            config.clone(),
        ))),
        #[cfg(not(feature = "kafka"))]
        BusBackend::Kafka => anyhow::bail!("bus.backend = \"kafka\" needs a build with the `kafka` feature"),
    }
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("received shutdown signal"),
            Err(err) => {
                warn!(error = %err, "cannot listen for ctrl-c");
                token.cancelled().await;
            }
        },
        _ = token.cancelled() => {}
    }
    token.cancel();
}
