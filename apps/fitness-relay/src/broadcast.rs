use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::feedback;
use crate::hub::RelayHub;
use crate::protocol::RelayMessage;

#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    pub interval: Duration,
    pub feedback_interval: Duration,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            feedback_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub metrics_sent: usize,
    pub feedback_sent: usize,
    pub failed: usize,
}

/// Periodically pushes metrics to every open device, plus a feedback line
/// whenever a device's feedback is due.
pub struct BroadcastLoop {
    hub: RelayHub,
    settings: BroadcastSettings,
    /// Feedback is owed once `now` is past this instant. Only this loop
    /// touches it.
    next_feedback: HashMap<String, Instant>,
}

impl BroadcastLoop {
    pub fn new(hub: RelayHub, settings: BroadcastSettings) -> Self {
        Self {
            hub,
            settings,
            next_feedback: HashMap::new(),
        }
    }

    pub fn tick(&mut self, now: Instant) -> BroadcastReport {
        self.tick_with(now, &mut rand::thread_rng())
    }

    pub fn tick_with<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let devices = self.hub.registry().open_devices();
        self.next_feedback
            .retain(|device_id, _| devices.iter().any(|(id, _)| id == device_id));
        if devices.is_empty() {
            return report;
        }

        let router = self.hub.router();
        for (device_id, connection) in &devices {
            let metrics = self.hub.telemetry().compute_metrics(device_id);
            match router.send_to(connection, RelayMessage::PerformanceMetrics(metrics)) {
                Ok(()) => report.metrics_sent += 1,
                Err(_) => report.failed += 1,
            }

            let due = self
                .next_feedback
                .get(device_id)
                .map_or(true, |next| now > *next);
            if !due {
                continue;
            }
            let category = feedback::random_category(rng);
            let line = feedback::synthesize(category, rng);
            debug!(
                device_id = %device_id,
                category,
                severity = ?line.severity,
                "sending periodic feedback"
            );
            match router.send_to(connection, line.into_message()) {
                Ok(()) => report.feedback_sent += 1,
                Err(_) => report.failed += 1,
            }
            self.next_feedback
                .insert(device_id.clone(), now + self.settings.feedback_interval);
        }

        report
    }

    pub fn spawn(mut self) -> JoinHandle<()> {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::spawn(async move {
            info!(
                interval_ms = self.settings.interval.as_millis() as u64,
                "starting periodic broadcast"
            );
            // The first tick completes immediately; start one interval in.
            interval.tick().await;
            loop {
                interval.tick().await;
                let _ = self.tick(Instant::now());
            }
        })
    }
}
