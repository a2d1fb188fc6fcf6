//! # drover-state
//!
//! The in-memory authoritative view of every known device: status, last
//! heartbeat time, and current task lease. Pure in-memory — no I/O, no
//! retries; the heartbeat loop owns persistence to the central queue.
//!
//! All mutation goes through [`DeviceStore`] methods, and only the
//! heartbeat loop and task runner call them. Devices are removed only by
//! explicit [`DeviceStore::deregister`], never implicitly.

mod store;

pub use store::{DevicePatch, DeviceRecord, DeviceStore};
