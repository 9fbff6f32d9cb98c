//! WebSocket relay between a remotely controlled workout and the fitness
//! devices taking part in it.
//!
//! Devices connect over a websocket, register an identity and then receive
//! synthetic performance metrics, coaching feedback and system commands.
//! Commands originate from a polled remote document (see [`reconcile`]) or
//! from the HTTP command endpoint.

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod feedback;
pub mod handlers;
pub mod hub;
pub mod protocol;
pub mod reconcile;
pub mod registry;
pub mod remote;
pub mod router;
pub mod telemetry;
pub mod websocket;
pub mod workout;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{ConnectionSettings, RelayConfig};
pub use error::RelayError;
pub use hub::RelayHub;

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    pub hub: RelayHub,
    pub connection: Arc<ConnectionSettings>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(hub: RelayHub, connection: ConnectionSettings) -> Self {
        Self {
            hub,
            connection: Arc::new(connection),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }
}

/// Devices connect on `/` or `/ws`; the remaining routes are for operators.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket::websocket_handler))
        .route("/ws", get(websocket::websocket_handler))
        .route("/healthz", get(handlers::health_check))
        .route("/devices", get(handlers::list_devices))
        .route("/devices/:target/commands", post(handlers::send_command))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
