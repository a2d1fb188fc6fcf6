//! # drover-guard
//!
//! Mutual-exclusion guards and bounded housekeeping:
//!
//! - [`DeviceGuards`] — per-device non-blocking command/exploration
//!   flags. Acquire is test-and-set and fails fast; there is no queue,
//!   so there is nothing to deadlock on.
//! - [`ArtifactSweeper`] — oldest-first deletion of generated artifacts
//!   beyond a retention cap, with pinning for files an in-flight task
//!   still references.

mod locks;
mod retention;

pub use locks::{Activity, ActivityGuard, DeviceGuards, GuardStatus};
pub use retention::{ArtifactPin, ArtifactSweeper};
