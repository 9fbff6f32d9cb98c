use metrics::counter;
use tracing::info;

use crate::error::RelayError;
use crate::protocol::{RelayMessage, SystemCommand};
use crate::registry::DeviceRegistry;
use crate::remote::RemoteStateCache;
use crate::router::{DeliveryReport, MessageRouter};
use crate::workout::TelemetryGenerator;

/// The shared core handed to the connection handlers, the HTTP routes and
/// both background loops.
#[derive(Clone)]
pub struct RelayHub {
    registry: DeviceRegistry,
    router: MessageRouter,
    telemetry: TelemetryGenerator,
    remote: RemoteStateCache,
}

impl RelayHub {
    pub fn new(remote: RemoteStateCache) -> Self {
        let registry = DeviceRegistry::new();
        Self {
            router: MessageRouter::new(registry.clone()),
            telemetry: TelemetryGenerator::new(remote.clone()),
            registry,
            remote,
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    pub fn telemetry(&self) -> &TelemetryGenerator {
        &self.telemetry
    }

    pub fn remote(&self) -> &RemoteStateCache {
        &self.remote
    }

    /// Resolve `target` and send it `command`.
    ///
    /// Start and stop also flip the workout state of every device the command
    /// reached, which is what makes the synthetic metrics ramp up or settle.
    pub fn dispatch_command(
        &self,
        target: &str,
        command: SystemCommand,
    ) -> Result<DeliveryReport, RelayError> {
        let resolved = self.registry.resolve(target)?;
        let report = self
            .router
            .send_to_resolved(&resolved, RelayMessage::SystemCommand(command.clone()));
        counter!("fitness_relay_commands_total", 1, "action" => command.action());

        for device_id in &report.delivered {
            match &command {
                SystemCommand::SelectExercise { exercise_type } => {
                    info!(device_id = %device_id, exercise = %exercise_type, "exercise selected");
                }
                SystemCommand::StartWorkout => {
                    self.telemetry.start_workout(device_id);
                    info!(device_id = %device_id, "workout started; metrics now active");
                }
                SystemCommand::StopWorkout => {
                    let summary = self.telemetry.stop_workout(device_id);
                    info!(
                        device_id = %device_id,
                        reps = summary.rep_count,
                        duration_secs = summary.duration_secs,
                        "workout stopped; metrics now passive"
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;

    #[test_timeout::timeout]
    fn start_and_stop_toggle_workout_state_for_recipients() {
        let hub = RelayHub::new(RemoteStateCache::new());
        let (a, mut rx_a) = ConnectionHandle::open(8);
        let (b, mut rx_b) = ConnectionHandle::open(8);
        hub.registry().register(&a, "a");
        hub.registry().register(&b, "b");

        let report = hub
            .dispatch_command("all", SystemCommand::StartWorkout)
            .unwrap();
        assert_eq!(report.delivered.len(), 2);
        assert!(hub.telemetry().workout("a").unwrap().active);
        assert!(hub.telemetry().workout("b").unwrap().active);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());

        hub.dispatch_command("2", SystemCommand::StopWorkout).unwrap();
        assert!(hub.telemetry().workout("a").unwrap().active);
        assert!(!hub.telemetry().workout("b").unwrap().active);
    }

    #[test_timeout::timeout]
    fn unresolved_target_is_reported() {
        let hub = RelayHub::new(RemoteStateCache::new());
        let err = hub
            .dispatch_command("1", SystemCommand::StartWorkout)
            .unwrap_err();
        assert!(matches!(err, RelayError::UnresolvedTarget(ref id) if id == "1"));
        assert_eq!(hub.telemetry().tracked_devices(), 0);
    }
}
