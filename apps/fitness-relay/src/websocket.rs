use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::RelayError;
use crate::feedback;
use crate::protocol::DeviceMessage;
use crate::AppState;

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

/// Drive one device connection from accept to close.
async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (handle, mut rx) = ConnectionHandle::open(state.connection.outbound_buffer);
    let connection = handle.id();
    state.hub.registry().connect(handle.clone());
    gauge!(
        "fitness_relay_connections",
        state.hub.registry().connection_count() as f64
    );
    info!(%connection, %remote_addr, "device connected");

    // Forward queued relay messages to the socket.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(err) => {
                    warn!(%connection, error = %err, "failed to serialize relay message");
                    continue;
                }
            };
            if sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        debug!(%connection, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(%connection, error = %err, "websocket read failed");
                break;
            }
        };

        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    reject(
                        connection,
                        RelayError::MalformedMessage("binary frame is not UTF-8".into()),
                    );
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match serde_json::from_str::<DeviceMessage>(&text) {
            Ok(message) => handle_device_message(message, &handle, &state).await,
            Err(err) => reject(connection, RelayError::MalformedMessage(err.to_string())),
        }
    }

    match state.hub.registry().unregister(connection) {
        Some(departure) => info!(
            %connection,
            device_id = %departure.device_id,
            index = ?departure.index,
            "device disconnected"
        ),
        None => info!(%connection, "unregistered connection closed"),
    }
    gauge!(
        "fitness_relay_connections",
        state.hub.registry().connection_count() as f64
    );
    writer.abort();
}

fn reject(connection: ConnectionId, err: RelayError) {
    counter!("fitness_relay_malformed_messages_total", 1);
    warn!(%connection, error = %err, "dropping device message");
}

async fn handle_device_message(message: DeviceMessage, handle: &ConnectionHandle, state: &AppState) {
    let connection = handle.id();
    match message {
        DeviceMessage::DeviceRegister {
            device_id,
            exercise_type,
        } => {
            if device_id.trim().is_empty() {
                reject(
                    connection,
                    RelayError::MalformedMessage("device_register without deviceId".into()),
                );
                return;
            }
            let index = state.hub.registry().register(handle, &device_id);
            counter!("fitness_relay_registrations_total", 1);
            info!(
                %connection,
                device_id = %device_id,
                index,
                exercise = exercise_type.as_deref().unwrap_or("none"),
                "device registered"
            );
        }
        DeviceMessage::BiometricData { device_id, data } => {
            debug!(
                %connection,
                device_id = device_id.as_deref().unwrap_or("unknown"),
                heart_rate = ?data.heart_rate,
                rep_count = ?data.rep_count,
                "biometric data"
            );
        }
        DeviceMessage::RepDetection { device_id, data } => {
            info!(
                %connection,
                device_id = device_id.as_deref().unwrap_or("unknown"),
                rep_count = ?data.rep_count,
                exercise = data.exercise_type.as_deref().unwrap_or("unknown"),
                "rep detected"
            );
        }
        DeviceMessage::PoseData { data, .. } => {
            tokio::time::sleep(state.connection.pose_feedback_delay).await;
            let category = data.exercise_type.as_deref().unwrap_or_default();
            let line = feedback::synthesize(category, &mut rand::thread_rng());
            debug!(%connection, category, severity = ?line.severity, "pose feedback");
            // Failures are logged by the router.
            let _ = state.hub.router().send_to(handle, line.into_message());
        }
    }
}
