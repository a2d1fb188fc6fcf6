use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

use drover_core::{DroverError, Result};

/// State of one dependency's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    /// Set while the single half-open probe is running.
    probe_in_flight: bool,
}

impl Default for Circuit {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// Serializable view of one circuit, for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub dependency: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Cooldown left before a probe is allowed, 0 unless open.
    pub remaining_ms: u64,
}

/// Per-named-dependency fault isolator.
///
/// Circuits are created lazily on first call and transition only inside
/// this type: `Closed → Open` after `failure_threshold` consecutive
/// failures, `Open → HalfOpen` once `open_duration` has elapsed, and
/// `HalfOpen → Closed` (probe success) or back to `Open` (probe failure,
/// cooldown restarted).
pub struct CircuitBreaker {
    circuits: DashMap<String, Circuit>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            circuits: DashMap::new(),
            failure_threshold,
            open_duration,
        }
    }

    /// Run `f` guarded by the circuit for `name`.
    ///
    /// While the circuit is open and cooling down, fails immediately with
    /// [`DroverError::CircuitOpen`] without invoking `f` — no load on a
    /// known-bad dependency. In half-open, exactly one probe is let
    /// through; concurrent callers fail fast.
    pub async fn call<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit(name)?;

        // A caller-side timeout can drop this future mid-flight; an
        // admitted call that never settles counts as a failure so a
        // hanging dependency cannot wedge a half-open probe.
        let mut cancel_guard = CancelGuard {
            breaker: self,
            name,
            armed: true,
        };

        let result = f().await;
        cancel_guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success(name);
                Ok(value)
            }
            Err(e) => {
                self.on_failure(name);
                Err(e)
            }
        }
    }

    /// Gate a call: decide fail-fast vs. proceed, moving open circuits to
    /// half-open when the cooldown has elapsed. Lock is released before
    /// the caller awaits anything.
    fn admit(&self, name: &str) -> Result<()> {
        let mut circuit = self.circuits.entry(name.to_string()).or_default();

        match circuit.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = circuit
                    .last_failure_at
                    .map(|t| t.elapsed())
                    .unwrap_or(self.open_duration);
                if elapsed < self.open_duration {
                    let remaining = self.open_duration - elapsed;
                    return Err(DroverError::CircuitOpen {
                        dependency: name.to_string(),
                        remaining_ms: remaining.as_millis() as u64,
                    });
                }
                info!(dependency = name, "circuit half-open, probing");
                circuit.state = CircuitState::HalfOpen;
                circuit.probe_in_flight = true;
                Ok(())
            }
            CircuitState::HalfOpen => {
                if circuit.probe_in_flight {
                    return Err(DroverError::CircuitOpen {
                        dependency: name.to_string(),
                        remaining_ms: 0,
                    });
                }
                circuit.probe_in_flight = true;
                Ok(())
            }
        }
    }

    fn on_success(&self, name: &str) {
        let mut circuit = self.circuits.entry(name.to_string()).or_default();
        if circuit.state == CircuitState::HalfOpen {
            info!(dependency = name, "circuit closed");
        }
        circuit.state = CircuitState::Closed;
        circuit.failure_count = 0;
        circuit.probe_in_flight = false;
    }

    fn on_failure(&self, name: &str) {
        let mut circuit = self.circuits.entry(name.to_string()).or_default();
        circuit.failure_count += 1;
        circuit.last_failure_at = Some(Instant::now());
        circuit.probe_in_flight = false;

        if circuit.state == CircuitState::HalfOpen {
            // Probe failed — reopen and restart the cooldown.
            circuit.state = CircuitState::Open;
            error!(dependency = name, "half-open probe failed, circuit reopened");
        } else if circuit.failure_count >= self.failure_threshold {
            circuit.state = CircuitState::Open;
            error!(
                dependency = name,
                failures = circuit.failure_count,
                cooldown_ms = self.open_duration.as_millis() as u64,
                "circuit opened"
            );
        } else {
            warn!(
                dependency = name,
                failures = circuit.failure_count,
                threshold = self.failure_threshold,
                "dependency failure"
            );
        }
    }

    /// Current state of every known circuit.
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|entry| {
                let circuit = entry.value();
                let remaining_ms = match circuit.state {
                    CircuitState::Open => circuit
                        .last_failure_at
                        .map(|t| self.open_duration.saturating_sub(t.elapsed()))
                        .unwrap_or_default()
                        .as_millis() as u64,
                    _ => 0,
                };
                CircuitSnapshot {
                    dependency: entry.key().clone(),
                    state: circuit.state,
                    failure_count: circuit.failure_count,
                    remaining_ms,
                }
            })
            .collect();
        snapshots.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        snapshots
    }

    /// State of one dependency, if it has been called before.
    pub fn state_of(&self, name: &str) -> Option<CircuitState> {
        self.circuits.get(name).map(|c| c.state)
    }
}

struct CancelGuard<'a> {
    breaker: &'a CircuitBreaker,
    name: &'a str,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!(dependency = self.name, "guarded call cancelled mid-flight");
            self.breaker.on_failure(self.name);
        }
    }
}
