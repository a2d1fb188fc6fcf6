use thiserror::Error;

/// Unified error type for the entire drover node.
#[derive(Error, Debug)]
pub enum DroverError {
    // ── Dependency errors ──────────────────────────────────────
    #[error("device daemon error: {0}")]
    Daemon(String),

    #[error("task queue error: {0}")]
    Queue(String),

    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// Fail-fast rejection from the circuit breaker: the named dependency
    /// is cooling down and no call was attempted.
    #[error("circuit open for {dependency}, retry in {remaining_ms}ms")]
    CircuitOpen {
        dependency: String,
        remaining_ms: u64,
    },

    // ── Coordination errors ────────────────────────────────────
    #[error("device {device} already holds a live lease")]
    LeaseConflict { device: String },

    #[error("no lease for task {task_id} on device {device}")]
    LeaseNotFound { device: String, task_id: String },

    #[error("unknown device: {0}")]
    UnknownDevice(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    // ── Generic wrappers ───────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl DroverError {
    /// Whether this error is a breaker fail-fast rather than a real
    /// dependency failure. Callers use this to skip instead of retrying.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, DroverError::CircuitOpen { .. })
    }
}

pub type Result<T> = std::result::Result<T, DroverError>;
