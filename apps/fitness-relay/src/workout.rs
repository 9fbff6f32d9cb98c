use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rand::Rng;

use crate::protocol::{now_millis, MetricsSnapshot};
use crate::remote::RemoteStateCache;

const MAX_SYNTHETIC_HEART_RATE: i64 = 180;
const RAMP_SECONDS: f64 = 60.0;
const RAMP_BEATS: f64 = 60.0;

/// Per-device workout bookkeeping behind the synthetic metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutState {
    pub started_at: Instant,
    pub rep_count: u64,
    pub active: bool,
    pub base_heart_rate: i64,
}

impl WorkoutState {
    fn fresh<R: Rng + ?Sized>(now: Instant, rng: &mut R) -> Self {
        Self {
            started_at: now,
            rep_count: 0,
            active: false,
            base_heart_rate: rng.gen_range(65..=75),
        }
    }

    pub fn elapsed_secs(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.started_at).as_secs()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkoutSummary {
    pub rep_count: u64,
    pub duration_secs: u64,
}

/// Synthesizes performance metrics per device, blending in live readings
/// from the remote state cache whenever the store reports a heart rate.
///
/// Workout state is keyed by device id and outlives the connection, so a
/// device that reconnects under the same id resumes its workout.
#[derive(Clone)]
pub struct TelemetryGenerator {
    workouts: Arc<Mutex<HashMap<String, WorkoutState>>>,
    remote: RemoteStateCache,
}

impl TelemetryGenerator {
    pub fn new(remote: RemoteStateCache) -> Self {
        Self {
            workouts: Arc::new(Mutex::new(HashMap::new())),
            remote,
        }
    }

    pub fn compute_metrics(&self, device_id: &str) -> MetricsSnapshot {
        self.compute_metrics_at(device_id, Instant::now(), &mut rand::thread_rng())
    }

    pub fn compute_metrics_at<R: Rng + ?Sized>(
        &self,
        device_id: &str,
        now: Instant,
        rng: &mut R,
    ) -> MetricsSnapshot {
        let remote = self.remote.snapshot();
        let mut workouts = self.workouts.lock();
        let state = workouts
            .entry(device_id.to_string())
            .or_insert_with(|| WorkoutState::fresh(now, rng));

        let elapsed = state.elapsed_secs(now);
        let remote_reps = u64::try_from(remote.rep_count).ok();

        if remote.heart_rate > 0.0 {
            if let Some(reps) = remote_reps {
                state.rep_count = reps;
            }
        }

        let synthetic_heart_rate = if state.active {
            let intensity = (elapsed as f64 / RAMP_SECONDS).min(1.0);
            let jitter = rng.gen_range(-5..=5) as f64;
            let rate = (state.base_heart_rate as f64 + RAMP_BEATS * intensity + jitter) as i64;
            rate.min(MAX_SYNTHETIC_HEART_RATE)
        } else {
            state.base_heart_rate + rng.gen_range(-3..=3)
        };

        let heart_rate = if remote.heart_rate > 0.0 {
            remote.heart_rate
        } else {
            synthetic_heart_rate as f64
        };
        let rep_count = remote_reps.unwrap_or(state.rep_count);
        let pulse = heart_rate + rng.gen_range(-2..=2) as f64;
        let calories = (elapsed as f64 * 0.15 + rep_count as f64 * 1.2) as u64;

        MetricsSnapshot {
            heart_rate,
            pulse,
            rep_count,
            workout_duration: elapsed,
            calories_burned: calories,
            timestamp: now_millis(),
        }
    }

    /// Mark the device's workout active and restart its clock and rep count.
    pub fn start_workout(&self, device_id: &str) {
        self.start_workout_at(device_id, Instant::now());
    }

    pub fn start_workout_at(&self, device_id: &str, now: Instant) {
        let mut workouts = self.workouts.lock();
        let state = workouts
            .entry(device_id.to_string())
            .or_insert_with(|| WorkoutState::fresh(now, &mut rand::thread_rng()));
        state.active = true;
        state.started_at = now;
        state.rep_count = 0;
    }

    pub fn stop_workout(&self, device_id: &str) -> WorkoutSummary {
        let now = Instant::now();
        let mut workouts = self.workouts.lock();
        let state = workouts
            .entry(device_id.to_string())
            .or_insert_with(|| WorkoutState::fresh(now, &mut rand::thread_rng()));
        state.active = false;
        WorkoutSummary {
            rep_count: state.rep_count,
            duration_secs: state.elapsed_secs(now),
        }
    }

    pub fn workout(&self, device_id: &str) -> Option<WorkoutState> {
        self.workouts.lock().get(device_id).cloned()
    }

    pub fn tracked_devices(&self) -> usize {
        self.workouts.lock().len()
    }
}
