use std::sync::Arc;

use anyhow::Context;

use stockhold_api::app::{build_app, services};
use stockhold_api::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    stockhold_observability::init();

    let config = ServerConfig::from_env().context("invalid configuration")?;
    let (services, background) = services::build_services(&config)
        .await
        .context("failed to start backends")?;
    tracing::info!(backend = services.backend, "stock services ready");

    let app = build_app(Arc::new(services));

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "failed to listen for shutdown signal");
            }
        })
        .await
        .context("server error")?;

    tracing::info!("shutting down background workers");
    background.shutdown().await;
    Ok(())
}
