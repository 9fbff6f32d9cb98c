use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::error::RelayError;
use crate::protocol::SystemCommand;
use crate::registry::DeviceListing;
use crate::AppState;

pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub async fn list_devices(State(state): State<AppState>) -> Json<Vec<DeviceListing>> {
    Json(state.hub.registry().list_devices())
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub action: &'static str,
    pub delivered: Vec<String>,
    pub failed: usize,
}

/// Send a system command to `"all"`, a device index, or a device id.
pub async fn send_command(
    State(state): State<AppState>,
    Path(target): Path<String>,
    payload: Result<Json<SystemCommand>, JsonRejection>,
) -> Response {
    let command = match payload {
        Ok(Json(command)) => command,
        Err(rejection) => {
            warn!(target_device = %target, error = %rejection, "rejected command body");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": rejection.body_text() })),
            )
                .into_response();
        }
    };

    let action = command.action();
    match state.hub.dispatch_command(&target, command) {
        Ok(report) => Json(CommandResponse {
            action,
            delivered: report.delivered,
            failed: report.failed,
        })
        .into_response(),
        Err(err @ RelayError::UnresolvedTarget(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
