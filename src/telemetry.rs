use anyhow::{Context, Result};
use axum::http::StatusCode;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::db::Database;
use crate::ephemeral::EphemeralStore;

/// Structured logging, `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Install the global Prometheus recorder backing `GET /metrics`.
pub fn install_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Handle that renders without being the global recorder.
#[cfg(test)]
pub fn detached_metrics() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

/// Health check status for the server
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: &'static str,
    pub ephemeral_store: bool,
    pub durable_store: bool,
    pub timestamp: i64,
}

impl HealthStatus {
    pub async fn check(store: &dyn EphemeralStore, db: &Database) -> Self {
        let (ephemeral_store, durable_store) = tokio::join!(store.ping(), db.ping());
        // The hot path fails open without the ephemeral store.
        let status = match (durable_store, ephemeral_store) {
            (false, _) => "unavailable",
            (true, false) => "degraded",
            (true, true) => "ok",
        };
        Self {
            status,
            ephemeral_store,
            durable_store,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn http_status(&self) -> StatusCode {
        if self.durable_store {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}
