use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Wire messages exchanged over the tunnel, tagged the way the central
/// authority expects them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TunnelMessage {
    /// First message after connect: who this node is.
    Identify { node_id: String, version: String },
    IdentifyAck {
        server: String,
        timestamp: i64,
    },

    /// Server-initiated liveness check; the node answers with an ack.
    Heartbeat { timestamp: i64 },
    HeartbeatAck { timestamp: i64 },

    /// Command pushed down for a specific device.
    Dispatch {
        target: String,
        command: String,
        #[serde(default)]
        payload: Value,
    },
    DispatchAck {
        success: bool,
        #[serde(default)]
        error: Option<String>,
        timestamp: i64,
    },

    /// Periodic node status pushed upstream.
    StatusReport {
        payload: Value,
        timestamp: i64,
    },

    /// The server is going away; the node keeps reconnecting.
    ServerShutdown,
}
