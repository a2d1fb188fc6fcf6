use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a device (its serial).
pub type DeviceId = String;

/// Unique identifier for a task.
pub type TaskId = Uuid;

/// Unique identifier for this node within the fleet.
pub type NodeId = String;

/// Reachability / activity state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Busy,
    Error,
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Busy => "busy",
            DeviceStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A time-bounded, exclusive assignment of one task to one device.
///
/// At most one live (non-expired) lease exists per device at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLease {
    pub device_id: DeviceId,
    pub task_id: TaskId,
    pub assigned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub persona_id: Option<String>,
}

impl TaskLease {
    /// Whether the lease deadline has passed at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

/// An automation task handed down by the central queue.
///
/// The body is an opaque command plus a parameter object — drover routes
/// it to the device-control daemon without interpreting it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: TaskId,
    /// Daemon-side command name, e.g. a script identifier.
    pub command: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub persona_id: Option<String>,
    /// Expected duration hint, used for pacing only.
    #[serde(default)]
    pub target_duration_secs: Option<u64>,
}

/// Terminal state of one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Completed,
    Failed,
    Timeout,
}

/// What a runner (or the reap step) reports back to the central queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub status: OutcomeStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn completed(result: Option<serde_json::Value>) -> Self {
        Self {
            status: OutcomeStatus::Completed,
            result,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn timeout() -> Self {
        Self {
            status: OutcomeStatus::Timeout,
            result: None,
            error: Some("task exceeded wall-clock budget".into()),
        }
    }
}

/// Per-device liveness payload sent with each heartbeat report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceReport {
    pub battery: Option<u8>,
    pub status: DeviceStatus,
}
