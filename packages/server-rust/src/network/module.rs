//! The default socket layer: axum over a TCP listener.
//!
//! The server stops accepting connections once the lockdown controller
//! signals shutdown, either because a lockdown drained or because the
//! process is stopping.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::entry::{ListenHandle, SocketLayer};
use super::handlers::{
    health_handler, liveness_handler, metrics_handler, readiness_handler, ws_upgrade_handler,
    AppState,
};
use super::middleware::build_http_layers;
use crate::config::ConfigStore;
use crate::crash::LockdownController;

/// HTTP/WebSocket socket layer. Defaults come from the live config at the
/// moment `listen` is called.
pub struct HttpSocketLayer {
    config: Arc<ConfigStore>,
    lockdown: Arc<LockdownController>,
    metrics: Option<PrometheusHandle>,
}

impl HttpSocketLayer {
    #[must_use]
    pub fn new(
        config: Arc<ConfigStore>,
        lockdown: Arc<LockdownController>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            config,
            lockdown,
            metrics,
        }
    }

    /// Assembles the router.
    ///
    /// Routes:
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- liveness probe
    /// - `GET /health/ready` -- readiness probe
    /// - `GET /metrics` -- Prometheus exposition
    /// - `GET /ws` -- WebSocket session
    pub fn build_router(&self, network: &NetworkConfig) -> Router {
        let state = AppState {
            lockdown: Arc::clone(&self.lockdown),
            config: Arc::new(network.clone()),
            metrics: self.metrics.clone(),
            start_time: Instant::now(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .route("/metrics", get(metrics_handler))
            .route("/ws", get(ws_upgrade_handler))
            .layer(build_http_layers(network))
            .with_state(state)
    }
}

#[async_trait]
impl SocketLayer for HttpSocketLayer {
    async fn listen(
        &self,
        port: Option<u16>,
        bind_address: Option<String>,
        workers: Option<usize>,
    ) -> anyhow::Result<ListenHandle> {
        let network = NetworkConfig::resolve(&self.config.current(), port, bind_address, workers);
        let listener = TcpListener::bind(network.addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, workers = network.workers, "listening");

        let router = self.build_router(&network);
        let mut stop = self.lockdown.shutdown_receiver();
        let task = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = stop.wait_for(|stopped| *stopped).await;
                })
                .await?;
            info!("socket layer stopped");
            Ok::<_, anyhow::Error>(())
        });

        Ok(ListenHandle { local_addr, task })
    }
}
