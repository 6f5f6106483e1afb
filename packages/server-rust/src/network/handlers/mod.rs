//! HTTP and WebSocket handlers.

pub mod health;
pub mod session;

pub use health::{health_handler, liveness_handler, metrics_handler, readiness_handler};
pub use session::ws_upgrade_handler;

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;

use super::NetworkConfig;
use crate::crash::LockdownController;

/// Shared state passed to all axum handlers via `State` extraction.
#[derive(Clone)]
pub struct AppState {
    /// Lockdown flag, health state, and session admission.
    pub lockdown: Arc<LockdownController>,
    pub config: Arc<NetworkConfig>,
    /// Renders `/metrics`; absent when no recorder is installed.
    pub metrics: Option<PrometheusHandle>,
    pub start_time: Instant,
}
