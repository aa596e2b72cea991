use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use provisioner::{app::AppContext, config, routes};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    // Fail fast if a required secret is missing
    let _ = config::JWT_SECRET.as_str();
    let _ = config::WEBHOOK_SECRET.as_str();

    let ctx = Arc::new(
        AppContext::from_env()
            .await
            .context("failed to build provisioning context")?,
    );
    let poll_interval = Duration::from_secs(*config::WORKER_POLL_INTERVAL_SECS);
    let _worker = ctx.spawn_worker(poll_interval);
    tracing::info!(?poll_interval, "job worker started");

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = routes::app(ctx)
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
