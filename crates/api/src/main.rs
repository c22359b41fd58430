use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;

use geobus_api::app::{AppServices, build_app};
use geobus_infra::{AppConfig, Pipeline};
use geobus_observability::LogFormat;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    geobus_observability::init(LogFormat::from_env());

    let config = AppConfig::from_env().context("invalid configuration")?;
    tracing::info!(?config, "configuration loaded");

    let pipeline = Pipeline::start(&config)
        .await
        .context("failed to start ingestion pipeline")?;

    let services = Arc::new(AppServices::new(&pipeline, &config));
    let app = build_app(services);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed");

    pipeline.shutdown().await;
    served
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
