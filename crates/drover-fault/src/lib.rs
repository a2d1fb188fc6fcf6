//! # drover-fault
//!
//! Fault isolation for outbound calls: a per-named-dependency circuit
//! breaker plus a retry wrapper with linear backoff.
//!
//! The intended composition is retry *inside* breaker:
//!
//! ```ignore
//! breaker.call("device-daemon", || with_retry(|| daemon.invoke(...), 3, base)).await
//! ```
//!
//! so the retries of one logical call count as a single circuit-breaker
//! failure — transient blips don't open the circuit, sustained outages do.

mod breaker;
mod retry;

pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use retry::with_retry;
