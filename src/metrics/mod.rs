//! Prometheus endpoint for the transmit path.
//!
//! Enabled with the `metrics` feature. [`WorkerStats`](crate::stats::WorkerStats)
//! forwards its updates to the recorder installed by [`init`] when the binary is
//! started with `--metrics`:
//! ```bash
//! ptp4u-tx --metrics --metrics-addr 127.0.0.1:9090
//! curl http://127.0.0.1:9090/metrics
//! ```

pub mod worker_metrics;

use std::net::SocketAddr;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Errors raised while starting the metrics endpoint.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// The Prometheus recorder could not be built or installed.
    #[error("Failed to build metrics recorder: {0}")]
    RecorderBuild(String),
    /// The HTTP listener could not be bound.
    #[error("Failed to bind metrics server: {0}")]
    BindError(#[from] std::io::Error),
}

/// Handle to the running metrics server.
pub struct MetricsServer {
    /// Cancelled to stop the HTTP server gracefully.
    cancel: CancellationToken,
}

impl MetricsServer {
    /// Signals the HTTP server to stop serving and exit.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Installs the Prometheus recorder and serves `/metrics` on `addr`.
pub async fn init(addr: SocketAddr) -> Result<MetricsServer, MetricsError> {
    // Error queue reads per TX timestamp, up to the default retry bound.
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Suffix("_attempts".to_string()),
            &[1.0, 2.0, 3.0, 5.0, 10.0, 20.0, 50.0, 100.0],
        )
        .map_err(|e| MetricsError::RecorderBuild(e.to_string()))?
        .install_recorder()
        .map_err(|e| MetricsError::RecorderBuild(e.to_string()))?;

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    let app = Router::new().route("/metrics", get(move || render(handle.clone())));

    let listener = TcpListener::bind(addr).await?;
    log::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                cancel_clone.cancelled().await;
            })
            .await
            .ok();
    });

    Ok(MetricsServer { cancel })
}

/// Renders the current metrics in the Prometheus text format.
async fn render(handle: PrometheusHandle) -> String {
    handle.render()
}
