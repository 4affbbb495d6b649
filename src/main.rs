mod db;
mod ephemeral;
mod error;
mod handlers;
mod models;
mod redis_client;
mod routes;
mod security;
mod settings;
mod state;
mod telemetry;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::settings::Settings;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    telemetry::init_tracing();

    let settings = Settings::from_env()?;
    let metrics = telemetry::install_metrics()?;
    let shutdown = CancellationToken::new();

    info!("initializing moderation pipeline");
    let state = state::AppState::new(&settings, metrics, shutdown.clone()).await?;

    let app = routes::create_router(state, settings.request_timeout);

    let listener = TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "gatekeeper listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("server stopped");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM and cancel in-flight platform syncs.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown requested");
    shutdown.cancel();
}
