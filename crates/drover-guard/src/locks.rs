use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use drover_core::DeviceId;

/// The two mutually independent activities a device can be busy with.
///
/// Command execution and autonomous exploration exclude *themselves*, not
/// each other: two flags instead of one lock, so a command is never
/// starved by a long exploration session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Command,
    Exploration,
}

impl Activity {
    fn name(self) -> &'static str {
        match self {
            Activity::Command => "command",
            Activity::Exploration => "exploration",
        }
    }
}

#[derive(Debug, Default)]
struct Flags {
    executing: bool,
    exploring: bool,
}

/// Per-device held-flag view for the status endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardStatus {
    pub device: DeviceId,
    pub executing: bool,
    pub exploring: bool,
}

/// Non-blocking activity locks, one pair of flags per device.
///
/// Cheap to clone — clones share the same flag table.
#[derive(Clone, Default)]
pub struct DeviceGuards {
    flags: Arc<DashMap<DeviceId, Flags>>,
}

impl DeviceGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to take the command lock for a device. Returns `None`
    /// immediately when already held — never blocks, never queues.
    /// The returned guard releases on drop, so the lock is cleared on
    /// every exit path including panics.
    pub fn try_acquire_command(&self, serial: &str) -> Option<ActivityGuard> {
        self.try_acquire(serial, Activity::Command)
    }

    /// Same fail-fast discipline for the independent exploration lock.
    pub fn try_acquire_exploration(&self, serial: &str) -> Option<ActivityGuard> {
        self.try_acquire(serial, Activity::Exploration)
    }

    fn try_acquire(&self, serial: &str, activity: Activity) -> Option<ActivityGuard> {
        let mut entry = self.flags.entry(serial.to_string()).or_default();
        let held = match activity {
            Activity::Command => &mut entry.executing,
            Activity::Exploration => &mut entry.exploring,
        };
        if *held {
            warn!(device = %serial, activity = activity.name(), "lock already held, skipping");
            return None;
        }
        *held = true;
        debug!(device = %serial, activity = activity.name(), "lock acquired");
        Some(ActivityGuard {
            guards: self.clone(),
            device: serial.to_string(),
            activity,
        })
    }

    fn release(&self, serial: &str, activity: Activity) {
        if let Some(mut entry) = self.flags.get_mut(serial) {
            match activity {
                Activity::Command => entry.executing = false,
                Activity::Exploration => entry.exploring = false,
            }
            debug!(device = %serial, activity = activity.name(), "lock released");
        }
    }

    pub fn is_executing(&self, serial: &str) -> bool {
        self.flags.get(serial).is_some_and(|f| f.executing)
    }

    pub fn is_exploring(&self, serial: &str) -> bool {
        self.flags.get(serial).is_some_and(|f| f.exploring)
    }

    /// Devices with at least one flag held, for the operator surface.
    pub fn held(&self) -> Vec<GuardStatus> {
        let mut held: Vec<GuardStatus> = self
            .flags
            .iter()
            .filter(|e| e.executing || e.exploring)
            .map(|e| GuardStatus {
                device: e.key().clone(),
                executing: e.executing,
                exploring: e.exploring,
            })
            .collect();
        held.sort_by(|a, b| a.device.cmp(&b.device));
        held
    }
}

/// RAII handle for a held activity flag — dropping it releases the lock.
pub struct ActivityGuard {
    guards: DeviceGuards,
    device: DeviceId,
    activity: Activity,
}

impl ActivityGuard {
    pub fn device(&self) -> &str {
        &self.device
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.guards.release(&self.device, self.activity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_acquire_fails_then_release_recovers() {
        let guards = DeviceGuards::new();

        let held = guards.try_acquire_command("d1");
        assert!(held.is_some());
        assert!(guards.try_acquire_command("d1").is_none());

        drop(held);
        assert!(guards.try_acquire_command("d1").is_some());
    }

    #[test]
    fn command_and_exploration_are_independent() {
        let guards = DeviceGuards::new();

        let _cmd = guards.try_acquire_command("d1").unwrap();
        // Exploration is a different activity, not the same resource.
        let _exp = guards.try_acquire_exploration("d1").unwrap();

        assert!(guards.is_executing("d1"));
        assert!(guards.is_exploring("d1"));
    }

    #[test]
    fn devices_do_not_share_flags() {
        let guards = DeviceGuards::new();

        let _d1 = guards.try_acquire_command("d1").unwrap();
        assert!(guards.try_acquire_command("d2").is_some());
    }

    #[test]
    fn denied_acquire_leaves_the_holder_untouched() {
        let guards = DeviceGuards::new();

        let holder = guards.try_acquire_command("d1").unwrap();
        assert!(guards.try_acquire_command("d1").is_none());
        assert!(guards.is_executing("d1"));
        assert_eq!(holder.device(), "d1");
    }

    #[test]
    fn guard_releases_even_when_the_task_panics() {
        let guards = DeviceGuards::new();

        let inner = guards.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.try_acquire_command("d1").unwrap();
            panic!("task blew up");
        }));
        assert!(result.is_err());
        assert!(!guards.is_executing("d1"));
    }

    #[test]
    fn held_reports_only_held_devices() {
        let guards = DeviceGuards::new();

        let _d1 = guards.try_acquire_command("d1").unwrap();
        let released = guards.try_acquire_command("d2").unwrap();
        drop(released);

        let held = guards.held();
        assert_eq!(held.len(), 1);
        assert_eq!(held[0].device, "d1");
        assert!(held[0].executing);
    }
}
