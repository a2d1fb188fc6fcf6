//! # drover-runtime
//!
//! The node runtime — the loops that keep the fleet moving.
//!
//! ## Architecture
//!
//! ```text
//!   Tunnel ──────────────┐
//!     │ Dispatch         │ StatusReport
//!     ▼                  │
//!   ┌──────────────────────────────┐
//!   │        Heartbeat Loop        │  30s tick:
//!   │  reap leases → events        │  never executes tasks,
//!   │  query daemon → fan-out      │  only assigns
//!   │  report devices → leases     │
//!   └──────────────┬───────────────┘
//!                  │ NewTask (event bus)
//!                  ▼
//!   ┌──────────────────────────────┐
//!   │         Task Runner          │  per event:
//!   │  try-lock → breaker+retry    │  drop when the lock is held,
//!   │  → outcome → release         │  execute otherwise
//!   └──────────────────────────────┘
//! ```
//!
//! The heartbeat loop emitting events instead of calling the runner is
//! the core anti-re-entrancy invariant: task latency can never stall the
//! next tick.

mod bridge;
mod context;
mod heartbeat;
mod runner;

pub use bridge::run_dispatch_bridge;
pub use context::{DEP_DAEMON, DEP_QUEUE, FleetContext};
pub use heartbeat::{HeartbeatService, HeartbeatStats};
pub use runner::TaskRunner;
