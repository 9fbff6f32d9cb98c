use serde::{Deserialize, Serialize};

/// Messages sent from a device to the relay.
///
/// Every frame is an envelope `{type, deviceId, data}`; anything whose `type`
/// is not listed here fails to parse and is dropped by the connection handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceMessage {
    /// Bind the connection to a device identity.
    DeviceRegister {
        #[serde(rename = "deviceId", default)]
        device_id: String,
        #[serde(rename = "exerciseType", default)]
        exercise_type: Option<String>,
    },
    /// Heart rate and rep count as measured on the device.
    BiometricData {
        #[serde(rename = "deviceId", default)]
        device_id: Option<String>,
        #[serde(default)]
        data: BiometricReport,
    },
    /// A classified pose; answered with one feedback message.
    PoseData {
        #[serde(rename = "deviceId", default)]
        device_id: Option<String>,
        #[serde(default)]
        data: PoseReport,
    },
    /// A completed repetition.
    RepDetection {
        #[serde(rename = "deviceId", default)]
        device_id: Option<String>,
        #[serde(default)]
        data: RepReport,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BiometricReport {
    pub heart_rate: Option<f64>,
    pub rep_count: Option<i64>,
    pub exercise_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PoseReport {
    pub exercise_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RepReport {
    pub rep_count: Option<i64>,
    pub exercise_type: Option<String>,
}

/// Messages sent from the relay to a device, framed as `{type, payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum RelayMessage {
    AiFeedback(FeedbackPayload),
    SystemCommand(SystemCommand),
    PerformanceMetrics(MetricsSnapshot),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeedbackPayload {
    pub timestamp: i64,
    pub feedback: String,
}

/// Workout control actions. Also accepted verbatim as the body of the HTTP
/// command endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SystemCommand {
    SelectExercise {
        #[serde(rename = "exerciseType")]
        exercise_type: String,
    },
    StartWorkout,
    StopWorkout,
}

impl SystemCommand {
    pub fn action(&self) -> &'static str {
        match self {
            SystemCommand::SelectExercise { .. } => "select_exercise",
            SystemCommand::StartWorkout => "start_workout",
            SystemCommand::StopWorkout => "stop_workout",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Synthetic rates are whole beats; a rate taken from the remote store is
    /// passed through as reported.
    #[serde(serialize_with = "whole_or_fractional")]
    pub heart_rate: f64,
    #[serde(serialize_with = "whole_or_fractional")]
    pub pulse: f64,
    pub rep_count: u64,
    /// Seconds since the workout (or the device's first metrics) started.
    pub workout_duration: u64,
    pub calories_burned: u64,
    /// Epoch milliseconds.
    pub timestamp: i64,
}

// Whole numbers go out as JSON integers, so `72.0` is written as `72`.
fn whole_or_fractional<S: serde::Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
    if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        serializer.serialize_i64(*value as i64)
    } else {
        serializer.serialize_f64(*value)
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
