//! Health probes and the metrics listener
//!
//! `/healthz` and `/readyz` answer on the probe address as soon as the
//! process is up. The metrics address answers `/metrics` with a pointer to
//! the OTLP pipeline; the actual instruments are pushed via OpenTelemetry
//! when `OTEL_EXPORTER_OTLP_ENDPOINT` is configured.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use tokio::task::JoinHandle;
use tracing::info;

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics() -> &'static str {
    // Metrics are pushed over OTLP; this endpoint exists so deployments can
    // probe that the pipeline process is alive.
    "# machina metrics are exported via OTLP (OTEL_EXPORTER_OTLP_ENDPOINT)\n"
}

/// Start the probe and metrics listeners; returns the supervising task
pub async fn spawn(
    health_address: SocketAddr,
    metrics_address: SocketAddr,
) -> anyhow::Result<JoinHandle<()>> {
    let health_router = Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(healthz));
    let metrics_router = Router::new().route("/metrics", get(metrics));

    let health_listener = tokio::net::TcpListener::bind(health_address)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind health probe address {health_address}: {e}"))?;
    let metrics_listener = tokio::net::TcpListener::bind(metrics_address)
        .await
        .map_err(|e| anyhow::anyhow!("cannot bind metrics address {metrics_address}: {e}"))?;

    info!(%health_address, %metrics_address, "probe and metrics listeners up");

    let handle = tokio::spawn(async move {
        let health = async {
            let _ = axum::serve(health_listener, health_router).await;
        };
        let metrics = async {
            let _ = axum::serve(metrics_listener, metrics_router).await;
        };
        tokio::join!(health, metrics);
    });

    Ok(handle)
}
