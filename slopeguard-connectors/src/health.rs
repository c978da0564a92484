//! Readiness surface: one boolean per dependency plus the stats summary

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use slopeguard_core::StatsSummary;

use crate::mqtt::ConnectionState;
use crate::IngestContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dependencies {
    /// Absent when the pub/sub adapter is disabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broker: Option<bool>,
    pub bus: bool,
    pub validator: bool,
}

impl Dependencies {
    pub fn all_up(&self) -> bool {
        self.broker.unwrap_or(true) && self.bus && self.validator
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub dependencies: Dependencies,
    pub stats: StatsSummary,
}

impl HealthReport {
    pub fn status_code(&self) -> StatusCode {
        match self.status {
            HealthStatus::Healthy => StatusCode::OK,
            HealthStatus::Degraded => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for HealthReport {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

#[derive(Clone)]
pub struct HealthState {
    ctx: IngestContext,
    broker: Option<watch::Receiver<ConnectionState>>,
}

impl HealthState {
    /// `broker` is the pub/sub adapter's state channel, `None` when disabled
    pub fn new(ctx: IngestContext, broker: Option<watch::Receiver<ConnectionState>>) -> Self {
        Self { ctx, broker }
    }

    pub fn report(&self) -> HealthReport {
        let dependencies = Dependencies {
            broker: self.broker.as_ref().map(|rx| rx.borrow().is_connected()),
            bus: self.ctx.publisher.is_connected(),
            validator: true,
        };

        HealthReport {
            status: if dependencies.all_up() {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            dependencies,
            stats: self.ctx.stats.summary(),
        }
    }
}

pub fn routes(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

async fn health(State(state): State<HealthState>) -> HealthReport {
    state.report()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusPublisher, InMemoryBus, TopicTable};
    use slopeguard_core::{StatsAggregator, Validator, ValidatorConfig};
    use std::sync::Arc;

    fn ctx() -> IngestContext {
        IngestContext::new(
            Arc::new(Validator::new(ValidatorConfig::default())),
            Arc::new(BusPublisher::new(InMemoryBus::new(), TopicTable::default())),
            Arc::new(StatsAggregator::new()),
        )
    }

    #[tokio::test]
    async fn degraded_until_bus_connects() {
        let ctx = ctx();
        let state = HealthState::new(ctx.clone(), None);

        let report = state.report();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(report.dependencies.validator);

        ctx.publisher.connect().await.unwrap();
        let report = state.report();
        assert_eq!(report.status, HealthStatus::Healthy);

        let body = serde_json::to_value(&report).unwrap();
        assert!(body["dependencies"].get("broker").is_none());
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn broker_state_drives_status() {
        let ctx = ctx();
        ctx.publisher.connect().await.unwrap();
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let state = HealthState::new(ctx, Some(rx));

        assert_eq!(state.report().dependencies.broker, Some(false));
        assert_eq!(state.report().status, HealthStatus::Degraded);

        tx.send(ConnectionState::Connected).unwrap();
        assert_eq!(state.report().status, HealthStatus::Healthy);

        tx.send(ConnectionState::Failed).unwrap();
        assert_eq!(state.report().status, HealthStatus::Degraded);
    }
}
