use metrics::counter;
use tracing::{debug, warn};

use crate::connection::ConnectionHandle;
use crate::error::RelayError;
use crate::protocol::RelayMessage;
use crate::registry::{DeviceRegistry, Target};

/// Outcome of a fan-out.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Device ids the message was queued for.
    pub delivered: Vec<String>,
    pub failed: usize,
}

/// Delivers relay messages to one connection, one device, or every device.
///
/// Failures are isolated per recipient: a dead or saturated connection is
/// logged and skipped, never retried, and never stops the rest of a fan-out.
#[derive(Clone)]
pub struct MessageRouter {
    registry: DeviceRegistry,
}

impl MessageRouter {
    pub fn new(registry: DeviceRegistry) -> Self {
        Self { registry }
    }

    pub fn send_to(
        &self,
        connection: &ConnectionHandle,
        message: RelayMessage,
    ) -> Result<(), RelayError> {
        let kind = message_kind(&message);
        match connection.try_send(message) {
            Ok(()) => {
                counter!("fitness_relay_messages_sent_total", 1, "type" => kind);
                Ok(())
            }
            Err(err) => {
                counter!("fitness_relay_delivery_failures_total", 1, "type" => kind);
                warn!(connection = %connection.id(), error = %err, "dropping {kind} message");
                Err(err)
            }
        }
    }

    pub fn send_to_resolved(&self, target: &Target, message: RelayMessage) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        match target {
            Target::All => {
                let recipients = self.registry.open_devices();
                debug!(recipients = recipients.len(), "fanning out to all devices");
                for (device_id, connection) in recipients {
                    match self.send_to(&connection, message.clone()) {
                        Ok(()) => report.delivered.push(device_id),
                        Err(_) => report.failed += 1,
                    }
                }
            }
            Target::Device(device_id) => match self.registry.connection_for(device_id) {
                Some(connection) if connection.is_open() => {
                    match self.send_to(&connection, message) {
                        Ok(()) => report.delivered.push(device_id.clone()),
                        Err(_) => report.failed += 1,
                    }
                }
                _ => {
                    warn!(device_id = %device_id, "device not found or not connected");
                    report.failed += 1;
                }
            },
        }
        report
    }
}

fn message_kind(message: &RelayMessage) -> &'static str {
    match message {
        RelayMessage::AiFeedback(_) => "ai_feedback",
        RelayMessage::SystemCommand(_) => "system_command",
        RelayMessage::PerformanceMetrics(_) => "performance_metrics",
    }
}
