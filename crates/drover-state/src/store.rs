use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use drover_core::{DeviceId, DeviceStatus, DroverError, Result, TaskId, TaskLease};

/// Everything the node knows about one device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub serial: DeviceId,
    pub status: DeviceStatus,
    pub battery: Option<u8>,
    pub model: Option<String>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub lease: Option<TaskLease>,
}

impl DeviceRecord {
    fn new(serial: DeviceId) -> Self {
        Self {
            serial,
            status: DeviceStatus::Offline,
            battery: None,
            model: None,
            last_heartbeat_at: None,
            lease: None,
        }
    }

    /// Whether this record currently holds a live (non-expired) lease.
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.lease.as_ref().is_some_and(|l| !l.is_expired(now))
    }
}

/// A partial update merged into a [`DeviceRecord`] by [`DeviceStore::upsert`].
#[derive(Debug, Clone, Default)]
pub struct DevicePatch {
    pub status: Option<DeviceStatus>,
    pub battery: Option<u8>,
    pub model: Option<String>,
}

impl DevicePatch {
    pub fn status(status: DeviceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// A patch carries liveness when it proves the device was just seen:
    /// a battery reading, or an explicit online status.
    fn is_liveness_bearing(&self) -> bool {
        self.battery.is_some() || self.status == Some(DeviceStatus::Online)
    }
}

/// The single shared mutable structure of the node.
///
/// Writers are the heartbeat loop (liveness, lease assignment, reap) and
/// the task runner (execution outcome); everyone else reads snapshots.
#[derive(Default)]
pub struct DeviceStore {
    devices: RwLock<HashMap<DeviceId, DeviceRecord>>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a patch into a device record, creating the record if the
    /// device is unknown. Liveness-bearing patches stamp
    /// `last_heartbeat_at`. Never removes anything.
    pub fn upsert(&self, serial: &str, patch: DevicePatch) {
        let mut devices = self.devices.write();
        let record = devices
            .entry(serial.to_string())
            .or_insert_with(|| DeviceRecord::new(serial.to_string()));

        if patch.is_liveness_bearing() {
            record.last_heartbeat_at = Some(Utc::now());
        }
        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(battery) = patch.battery {
            record.battery = Some(battery);
        }
        if let Some(model) = patch.model {
            record.model = Some(model);
        }
    }

    /// Attach a lease to a device, enforcing the single-live-lease
    /// invariant locally rather than trusting the central queue.
    pub fn assign_lease(&self, lease: TaskLease) -> Result<()> {
        let mut devices = self.devices.write();
        let record = devices
            .entry(lease.device_id.clone())
            .or_insert_with(|| DeviceRecord::new(lease.device_id.clone()));

        if record.has_live_lease(Utc::now()) {
            return Err(DroverError::LeaseConflict {
                device: lease.device_id.clone(),
            });
        }

        debug!(device = %lease.device_id, task = %lease.task_id, "lease assigned");
        record.status = DeviceStatus::Busy;
        record.lease = Some(lease);
        Ok(())
    }

    /// Clear a lease after its task reported an outcome. The device
    /// becomes eligible for reassignment.
    pub fn complete_lease(&self, serial: &str, task_id: TaskId) -> Result<TaskLease> {
        let mut devices = self.devices.write();
        let record = devices
            .get_mut(serial)
            .ok_or_else(|| DroverError::UnknownDevice(serial.to_string()))?;

        match record.lease.take() {
            Some(lease) if lease.task_id == task_id => {
                record.status = DeviceStatus::Online;
                Ok(lease)
            }
            other => {
                // Not ours to clear — put it back.
                record.lease = other;
                Err(DroverError::LeaseNotFound {
                    device: serial.to_string(),
                    task_id: task_id.to_string(),
                })
            }
        }
    }

    /// Scan all devices and reclaim leases whose deadline has passed.
    /// Each lease is cleared exactly once; the device flips back to
    /// `Online` so it can be reassigned.
    pub fn reap(&self, now: DateTime<Utc>) -> Vec<TaskLease> {
        let mut devices = self.devices.write();
        let mut reclaimed = Vec::new();

        for record in devices.values_mut() {
            let expired = record.lease.as_ref().is_some_and(|l| l.is_expired(now));
            if expired {
                if let Some(lease) = record.lease.take() {
                    info!(
                        device = %record.serial,
                        task = %lease.task_id,
                        assigned_at = %lease.assigned_at,
                        "lease reclaimed"
                    );
                    record.status = DeviceStatus::Online;
                    reclaimed.push(lease);
                }
            }
        }

        reclaimed
    }

    /// An immutable copy of every record, ordered by serial.
    /// Mutating the returned records does not touch the store.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        let devices = self.devices.read();
        let mut records: Vec<DeviceRecord> = devices.values().cloned().collect();
        records.sort_by(|a, b| a.serial.cmp(&b.serial));
        records
    }

    pub fn get(&self, serial: &str) -> Option<DeviceRecord> {
        self.devices.read().get(serial).cloned()
    }

    /// Explicit removal — the only way a device leaves the store.
    pub fn deregister(&self, serial: &str) -> bool {
        let removed = self.devices.write().remove(serial).is_some();
        if removed {
            info!(device = %serial, "device deregistered");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Count of devices per status, for the operator surface.
    pub fn status_counts(&self) -> HashMap<DeviceStatus, usize> {
        let devices = self.devices.read();
        let mut counts = HashMap::new();
        for record in devices.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn lease(serial: &str, ttl_secs: i64) -> TaskLease {
        let now = Utc::now();
        TaskLease {
            device_id: serial.to_string(),
            task_id: Uuid::new_v4(),
            assigned_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            persona_id: None,
        }
    }

    #[test]
    fn upsert_creates_then_merges() {
        let store = DeviceStore::new();
        store.upsert(
            "R58M1234",
            DevicePatch {
                status: Some(DeviceStatus::Online),
                battery: Some(80),
                model: None,
            },
        );
        store.upsert(
            "R58M1234",
            DevicePatch {
                model: Some("SM-G960".into()),
                ..Default::default()
            },
        );

        let record = store.get("R58M1234").unwrap();
        assert_eq!(record.status, DeviceStatus::Online);
        assert_eq!(record.battery, Some(80));
        assert_eq!(record.model.as_deref(), Some("SM-G960"));
    }

    #[test]
    fn liveness_stamp_only_on_liveness_patches() {
        let store = DeviceStore::new();
        store.upsert("d1", DevicePatch::status(DeviceStatus::Error));
        assert!(store.get("d1").unwrap().last_heartbeat_at.is_none());

        store.upsert("d1", DevicePatch::status(DeviceStatus::Online));
        assert!(store.get("d1").unwrap().last_heartbeat_at.is_some());
    }

    #[test]
    fn second_live_lease_is_rejected() {
        let store = DeviceStore::new();
        store.assign_lease(lease("d1", 300)).unwrap();

        let err = store.assign_lease(lease("d1", 300)).unwrap_err();
        assert!(matches!(err, DroverError::LeaseConflict { .. }));
    }

    #[test]
    fn expired_lease_can_be_replaced_after_reap() {
        let store = DeviceStore::new();
        store.assign_lease(lease("d1", -1)).unwrap();
        let reclaimed = store.reap(Utc::now());
        assert_eq!(reclaimed.len(), 1);

        store.assign_lease(lease("d1", 300)).unwrap();
    }

    #[test]
    fn reap_never_reclaims_twice() {
        let store = DeviceStore::new();
        store.assign_lease(lease("d1", -1)).unwrap();

        assert_eq!(store.reap(Utc::now()).len(), 1);
        assert_eq!(store.reap(Utc::now()).len(), 0);
        assert_eq!(store.get("d1").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn reap_leaves_live_leases_alone() {
        let store = DeviceStore::new();
        store.assign_lease(lease("d1", 300)).unwrap();
        store.assign_lease(lease("d2", -1)).unwrap();

        let reclaimed = store.reap(Utc::now());
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].device_id, "d2");
        assert!(store.get("d1").unwrap().lease.is_some());
    }

    #[test]
    fn complete_lease_requires_matching_task() {
        let store = DeviceStore::new();
        let l = lease("d1", 300);
        let task_id = l.task_id;
        store.assign_lease(l).unwrap();

        assert!(store.complete_lease("d1", Uuid::new_v4()).is_err());
        // Mismatch must not have cleared the lease.
        assert!(store.get("d1").unwrap().lease.is_some());

        store.complete_lease("d1", task_id).unwrap();
        assert!(store.get("d1").unwrap().lease.is_none());
        assert_eq!(store.get("d1").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn snapshot_is_detached_from_the_store() {
        let store = DeviceStore::new();
        store.upsert("d1", DevicePatch::status(DeviceStatus::Online));

        let mut snap = store.snapshot();
        snap[0].status = DeviceStatus::Error;

        assert_eq!(store.get("d1").unwrap().status, DeviceStatus::Online);
    }

    #[test]
    fn deregister_is_the_only_removal() {
        let store = DeviceStore::new();
        store.upsert("d1", DevicePatch::default());
        store.reap(Utc::now());
        assert_eq!(store.len(), 1);

        assert!(store.deregister("d1"));
        assert!(store.is_empty());
        assert!(!store.deregister("d1"));
    }
}
