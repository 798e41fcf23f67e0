use cloudgate_core::PreparedStatementCache;
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub const PREPARED_CACHE_SIZE_GAUGE: &str = "proxy_prepared_statement_cache_size";

/// Installs the Prometheus recorder and serves it with health endpoints.
pub async fn install_exporter(listen_addr: &str) -> anyhow::Result<()> {
    let metrics_handle = PrometheusBuilder::new().install_recorder()?;
    let listener = TcpListener::bind(listen_addr).await?;
    info!("metrics listening on {listen_addr}");
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || {
                let metrics_handle = metrics_handle.clone();
                async move { metrics_handle.render() }
            }),
        )
        .route("/health", axum::routing::get(|| async { "ok" }))
        .route("/ready", axum::routing::get(|| async { "ok" }));
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            error!("metrics server failed: {err}");
        }
    });
    Ok(())
}

/// Publishes the prepared statement cache size every `interval` until
/// `shutdown` fires.
pub fn spawn_cache_reporter(
    cache: Arc<PreparedStatementCache>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    gauge!(PREPARED_CACHE_SIZE_GAUGE).set(cache.size() as f64);
                }
            }
        }
    })
}
