use serde::{Deserialize, Serialize};

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{DeviceId, DeviceStatus, OutcomeStatus, TaskId, TaskSpec};

/// Events flowing through the node — the handoff between the heartbeat
/// loop, the task runner, the tunnel, and any log sink.
///
/// The heartbeat loop only ever *emits* `NewTask`; execution happens in
/// the task runner. That separation is what keeps task latency from
/// stalling the next tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    // ── Task lifecycle ─────────────────────────────────────────
    NewTask {
        device_id: DeviceId,
        task: TaskSpec,
        persona_id: Option<String>,
    },
    TaskCompleted {
        device_id: DeviceId,
        task_id: TaskId,
        status: OutcomeStatus,
    },
    /// Emitted once per lease reclaimed by the reap step.
    TaskTimedOut {
        device_id: DeviceId,
        task_id: TaskId,
    },

    // ── Device lifecycle ───────────────────────────────────────
    DeviceUpdated {
        device_id: DeviceId,
        status: DeviceStatus,
    },

    // ── Tunnel lifecycle ───────────────────────────────────────
    TunnelConnected,
    TunnelDisconnected {
        reason: String,
    },

    // ── System ─────────────────────────────────────────────────
    HeartbeatError {
        message: String,
    },
    Shutdown,
}

/// A broadcast-based event bus for node-wide pub/sub.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<Event>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: Event) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
