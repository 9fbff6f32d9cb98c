use std::thread;
use std::time::Duration;

use metrics::counter;
use tracing::{info, warn};

use crate::hub::RelayHub;
use crate::protocol::SystemCommand;
use crate::remote::{RemoteState, RemoteStateSource};

/// Name the devices use for a remote exercise code.
pub fn exercise_name(code: i64) -> &'static str {
    match code {
        2 => "lateral-raises",
        3 => "squats",
        4 => "bicep-curls",
        _ => "Hr Only",
    }
}

/// Edge detector over the polled remote state.
///
/// Exercise and start flag are latched independently. A latch that has
/// never seen a value always fires on its first observation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reconciler {
    last_exercise: Option<i64>,
    last_start_flag: Option<bool>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last_exercise = None;
        self.last_start_flag = None;
    }

    /// Commands implied by `state`, exercise selection first.
    pub fn observe(&mut self, state: &RemoteState) -> Vec<SystemCommand> {
        let mut commands = Vec::new();

        if self.last_exercise != Some(state.exercise) {
            self.last_exercise = Some(state.exercise);
            commands.push(SystemCommand::SelectExercise {
                exercise_type: exercise_name(state.exercise).to_string(),
            });
        }

        if self.last_start_flag != Some(state.start_flag) {
            self.last_start_flag = Some(state.start_flag);
            commands.push(if state.start_flag {
                SystemCommand::StartWorkout
            } else {
                SystemCommand::StopWorkout
            });
        }

        commands
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Device the remote commands are addressed to (index or id).
    pub target: String,
    pub poll_interval: Duration,
    /// How often to re-check for a device while none is connected.
    pub idle_interval: Duration,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            target: "1".to_string(),
            poll_interval: Duration::from_millis(500),
            idle_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No device connected; nothing fetched.
    Waiting,
    FetchFailed,
    /// Fetched; this many commands were issued.
    Polled(usize),
}

/// Polls the remote store and turns changes into device commands.
///
/// Runs on its own OS thread because fetching blocks; it touches the rest
/// of the relay only through the registry, the router and the state cache.
pub struct ReconciliationLoop<S> {
    source: S,
    hub: RelayHub,
    settings: ReconcileSettings,
    reconciler: Reconciler,
    waiting_for_device: bool,
    fetch_failing: bool,
}

impl<S: RemoteStateSource> ReconciliationLoop<S> {
    pub fn new(source: S, hub: RelayHub, settings: ReconcileSettings) -> Self {
        Self {
            source,
            hub,
            settings,
            reconciler: Reconciler::new(),
            waiting_for_device: false,
            fetch_failing: false,
        }
    }

    pub fn tick(&mut self) -> TickOutcome {
        if self.hub.registry().registered_count() == 0 {
            if !self.waiting_for_device {
                info!("waiting for a device connection before polling remote state");
                self.waiting_for_device = true;
            }
            return TickOutcome::Waiting;
        }

        if self.waiting_for_device {
            info!("device connected; polling remote state");
            self.waiting_for_device = false;
            self.reconciler.reset();
        }

        let state = match self.hub.remote().refresh(&mut self.source) {
            Ok(state) => state,
            Err(err) => {
                counter!("fitness_relay_remote_fetch_errors_total", 1);
                if !self.fetch_failing {
                    warn!(error = %err, "remote state unavailable; will keep retrying");
                    self.fetch_failing = true;
                }
                return TickOutcome::FetchFailed;
            }
        };

        if self.fetch_failing {
            info!("remote state connection restored");
            self.fetch_failing = false;
        }

        let commands = self.reconciler.observe(&state);
        let issued = commands.len();
        for command in commands {
            info!(
                device = %self.settings.target,
                action = command.action(),
                "remote state changed"
            );
            // Unresolved targets are already logged by the registry.
            let _ = self.hub.dispatch_command(&self.settings.target, command);
        }
        TickOutcome::Polled(issued)
    }

    pub fn run(mut self) {
        info!(
            source = %self.source.describe(),
            device = %self.settings.target,
            "starting remote state reconciliation"
        );
        loop {
            let pause = match self.tick() {
                TickOutcome::Waiting => self.settings.idle_interval,
                _ => self.settings.poll_interval,
            };
            thread::sleep(pause);
        }
    }

    pub fn spawn(self) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("remote-state-poll".into())
            .spawn(move || self.run())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::protocol::RelayMessage;
    use crate::remote::tests::ScriptedSource;
    use crate::remote::RemoteStateCache;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn state(exercise: i64, start_flag: bool) -> RemoteState {
        RemoteState {
            exercise,
            start_flag,
            ..RemoteState::default()
        }
    }

    fn select(name: &str) -> SystemCommand {
        SystemCommand::SelectExercise {
            exercise_type: name.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<RelayMessage>) -> Vec<SystemCommand> {
        let mut commands = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let RelayMessage::SystemCommand(command) = message {
                commands.push(command);
            }
        }
        commands
    }

    #[test_timeout::timeout]
    fn exercise_codes_map_to_names() {
        assert_eq!(exercise_name(1), "Hr Only");
        assert_eq!(exercise_name(2), "lateral-raises");
        assert_eq!(exercise_name(3), "squats");
        assert_eq!(exercise_name(4), "bicep-curls");
        assert_eq!(exercise_name(0), "Hr Only");
        assert_eq!(exercise_name(99), "Hr Only");
    }

    #[test_timeout::timeout]
    fn first_observation_always_fires() {
        let mut reconciler = Reconciler::new();
        assert_eq!(
            reconciler.observe(&state(1, false)),
            [select("Hr Only"), SystemCommand::StopWorkout]
        );
    }

    #[test_timeout::timeout]
    fn scripted_sequence_emits_each_change_once_in_order() {
        let mut reconciler = Reconciler::new();
        let mut emitted = Vec::new();
        for snapshot in [state(1, false), state(2, false), state(2, true)] {
            emitted.extend(reconciler.observe(&snapshot));
        }
        assert_eq!(
            emitted,
            [
                select("Hr Only"),
                SystemCommand::StopWorkout,
                select("lateral-raises"),
                SystemCommand::StartWorkout,
            ]
        );
    }

    #[test_timeout::timeout]
    fn repeated_snapshot_is_idempotent() {
        let mut reconciler = Reconciler::new();
        reconciler.observe(&state(3, true));
        for _ in 0..5 {
            assert!(reconciler.observe(&state(3, true)).is_empty());
        }
    }

    #[test_timeout::timeout]
    fn same_tick_change_selects_before_starting() {
        let mut reconciler = Reconciler::new();
        reconciler.observe(&state(1, false));
        assert_eq!(
            reconciler.observe(&state(4, true)),
            [select("bicep-curls"), SystemCommand::StartWorkout]
        );
    }

    #[test_timeout::timeout]
    fn loop_waits_for_a_device_before_fetching() {
        let hub = RelayHub::new(RemoteStateCache::new());
        let source = ScriptedSource::documents(vec![json!({ "exercise": 3 })]);
        let mut poller = ReconciliationLoop::new(source, hub.clone(), ReconcileSettings::default());

        assert_eq!(poller.tick(), TickOutcome::Waiting);
        assert_eq!(poller.tick(), TickOutcome::Waiting);
        assert_eq!(poller.source.fetches, 0);

        let (handle, mut rx) = ConnectionHandle::open(16);
        hub.registry().connect(handle.clone());
        hub.registry().register(&handle, "primary");

        assert_eq!(poller.tick(), TickOutcome::Polled(2));
        assert_eq!(
            drain(&mut rx),
            [select("squats"), SystemCommand::StopWorkout]
        );
        assert_eq!(poller.tick(), TickOutcome::Polled(0));
        assert!(drain(&mut rx).is_empty());
    }

    #[test_timeout::timeout]
    fn reconnect_after_idle_replays_current_state() {
        let hub = RelayHub::new(RemoteStateCache::new());
        let source = ScriptedSource::documents(vec![json!({ "exercise": 2, "startFlag": true })]);
        let mut poller = ReconciliationLoop::new(source, hub.clone(), ReconcileSettings::default());

        let (first, mut rx_first) = ConnectionHandle::open(16);
        hub.registry().register(&first, "primary");
        assert_eq!(poller.tick(), TickOutcome::Polled(2));
        assert_eq!(
            drain(&mut rx_first),
            [select("lateral-raises"), SystemCommand::StartWorkout]
        );

        hub.registry().unregister(first.id());
        assert_eq!(poller.tick(), TickOutcome::Waiting);

        let (second, mut rx_second) = ConnectionHandle::open(16);
        hub.registry().register(&second, "primary");
        // Index 1 is gone for good, so address the device by id.
        poller.settings.target = "primary".into();
        assert_eq!(poller.tick(), TickOutcome::Polled(2));
        assert_eq!(
            drain(&mut rx_second),
            [select("lateral-raises"), SystemCommand::StartWorkout]
        );
    }

    #[test_timeout::timeout]
    fn fetch_errors_leave_latches_alone() {
        let hub = RelayHub::new(RemoteStateCache::new());
        let source = ScriptedSource::new(vec![
            Ok(Some(json!({ "exercise": 1, "startFlag": false }))),
            Err("timeout".into()),
            Err("timeout".into()),
            Ok(Some(json!({ "exercise": 1, "startFlag": true }))),
        ]);
        let mut poller = ReconciliationLoop::new(source, hub.clone(), ReconcileSettings::default());
        let (handle, mut rx) = ConnectionHandle::open(16);
        hub.registry().register(&handle, "primary");

        assert_eq!(poller.tick(), TickOutcome::Polled(2));
        assert_eq!(poller.tick(), TickOutcome::FetchFailed);
        assert!(poller.fetch_failing);
        assert_eq!(poller.tick(), TickOutcome::FetchFailed);
        assert_eq!(poller.tick(), TickOutcome::Polled(1));
        assert!(!poller.fetch_failing);

        assert_eq!(
            drain(&mut rx),
            [
                select("Hr Only"),
                SystemCommand::StopWorkout,
                SystemCommand::StartWorkout
            ]
        );
        assert!(hub.telemetry().workout("primary").unwrap().active);
    }

    #[test_timeout::timeout]
    fn missing_target_drops_commands_but_keeps_latches() {
        let hub = RelayHub::new(RemoteStateCache::new());
        let source = ScriptedSource::documents(vec![json!({ "exercise": 2 })]);
        let settings = ReconcileSettings {
            target: "7".into(),
            ..ReconcileSettings::default()
        };
        let mut poller = ReconciliationLoop::new(source, hub.clone(), settings);
        let (handle, mut rx) = ConnectionHandle::open(16);
        hub.registry().register(&handle, "primary");

        assert_eq!(poller.tick(), TickOutcome::Polled(2));
        assert_eq!(poller.tick(), TickOutcome::Polled(0));
        assert!(drain(&mut rx).is_empty());
    }
}
