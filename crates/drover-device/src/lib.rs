//! # drover-device
//!
//! Client for the local device-control daemon (the phoneboard controller
//! that actually drives the Android devices). drover talks to it over a
//! small HTTP API; command failures surface as [`drover_core::DroverError::Daemon`]
//! so the circuit breaker can count them.
//!
//! The [`DeviceControl`] trait is the seam the runtime depends on — tests
//! substitute an in-memory implementation.

mod daemon;

pub use daemon::{DaemonClient, DaemonDevice, DeviceControl};
