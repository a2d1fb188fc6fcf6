use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use drover_config::DroverConfig;
use drover_core::{
    DeviceReport, DeviceStatus, DroverError, Event, OutcomeStatus, Result, TaskId, TaskLease,
    TaskOutcome, TaskSpec,
};
use drover_device::{DaemonDevice, DeviceControl};
use drover_queue::{HeartbeatResponse, TaskQueue};
use drover_runtime::{FleetContext, HeartbeatService, TaskRunner};

// ── Mocks ──────────────────────────────────────────────────────

#[derive(Default)]
struct MockDaemon {
    devices: Mutex<Vec<DaemonDevice>>,
    invocations: AtomicU32,
    fail_list: AtomicBool,
    hang_invoke: AtomicBool,
    fail_invoke: AtomicBool,
    busy: AtomicBool,
}

#[async_trait]
impl DeviceControl for MockDaemon {
    async fn list_devices(
        &self,
        _online_only: bool,
        _timeout: Duration,
    ) -> Result<Vec<DaemonDevice>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(DroverError::Daemon("connection refused".into()));
        }
        Ok(self.devices.lock().clone())
    }

    async fn invoke(&self, _serial: &str, _command: &str, _params: &Value) -> Result<Value> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self.hang_invoke.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_invoke.load(Ordering::SeqCst) {
            return Err(DroverError::Daemon("script crashed".into()));
        }
        Ok(json!({"ok": true}))
    }

    async fn is_busy(&self, _serial: &str) -> Result<bool> {
        Ok(self.busy.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
struct MockQueue {
    /// serial → task handed out on the next report for that device.
    assignments: Mutex<HashMap<String, TaskSpec>>,
    fail_for: Mutex<Vec<String>>,
    outcomes: Mutex<Vec<(TaskId, OutcomeStatus)>>,
    reports: AtomicU32,
}

#[async_trait]
impl TaskQueue for MockQueue {
    async fn report_heartbeat(
        &self,
        _node_id: &str,
        serial: &str,
        _report: &DeviceReport,
    ) -> Result<HeartbeatResponse> {
        if self.fail_for.lock().iter().any(|s| s == serial) {
            return Err(DroverError::Queue("rpc failed".into()));
        }
        self.reports.fetch_add(1, Ordering::SeqCst);
        let task = self.assignments.lock().remove(serial);
        Ok(HeartbeatResponse {
            task,
            persona_id: None,
        })
    }

    async fn report_outcome(&self, task_id: TaskId, outcome: &TaskOutcome) -> Result<()> {
        self.outcomes.lock().push((task_id, outcome.status));
        Ok(())
    }
}

// ── Helpers ────────────────────────────────────────────────────

fn online_device(serial: &str) -> DaemonDevice {
    DaemonDevice {
        serial: serial.into(),
        model: Some("SM-G960".into()),
        battery: Some(90),
        status: "device".into(),
    }
}

fn task_for(command: &str) -> TaskSpec {
    TaskSpec {
        id: Uuid::new_v4(),
        command: command.into(),
        params: json!({"url": "https://example.com/v/abc"}),
        persona_id: None,
        target_duration_secs: Some(60),
    }
}

fn expired_lease(serial: &str, task_id: TaskId) -> TaskLease {
    let now = chrono::Utc::now();
    TaskLease {
        device_id: serial.into(),
        task_id,
        assigned_at: now - chrono::Duration::seconds(301),
        expires_at: now - chrono::Duration::seconds(1),
        persona_id: None,
    }
}

struct Harness {
    ctx: Arc<FleetContext>,
    daemon: Arc<MockDaemon>,
    queue: Arc<MockQueue>,
}

fn harness(config: DroverConfig) -> Harness {
    let daemon = Arc::new(MockDaemon::default());
    let queue = Arc::new(MockQueue::default());
    let ctx = FleetContext::new(
        config,
        Arc::clone(&daemon) as Arc<dyn DeviceControl>,
        Arc::clone(&queue) as Arc<dyn TaskQueue>,
    );
    Harness { ctx, daemon, queue }
}

async fn next_matching(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
    mut pred: impl FnMut(&Event) -> bool,
) -> Option<Event> {
    loop {
        match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
            Ok(Ok(event)) if pred(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ── Heartbeat ──────────────────────────────────────────────────

#[tokio::test]
async fn tick_reports_devices_and_emits_assignments() {
    let h = harness(DroverConfig::default());
    *h.daemon.devices.lock() = vec![online_device("d1"), online_device("d2")];
    let task = task_for("watch");
    let task_id = task.id;
    h.queue.assignments.lock().insert("d1".into(), task);

    let mut rx = h.ctx.events.subscribe();
    let service = HeartbeatService::new(Arc::clone(&h.ctx), None);
    service.tick().await;

    let event = next_matching(&mut rx, |e| matches!(e, Event::NewTask { .. }))
        .await
        .expect("expected a NewTask event");
    match event {
        Event::NewTask { device_id, task, .. } => {
            assert_eq!(device_id, "d1");
            assert_eq!(task.id, task_id);
        }
        _ => unreachable!(),
    }

    // Both devices went through the store; only d1 holds a lease.
    let d1 = h.ctx.store.get("d1").unwrap();
    assert_eq!(d1.status, DeviceStatus::Busy);
    assert!(d1.lease.is_some());
    assert!(d1.last_heartbeat_at.is_some());

    let d2 = h.ctx.store.get("d2").unwrap();
    assert_eq!(d2.status, DeviceStatus::Online);
    assert!(d2.lease.is_none());

    assert_eq!(h.queue.reports.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_report_leaves_prior_state_untouched() {
    let h = harness(DroverConfig::default());
    *h.daemon.devices.lock() = vec![online_device("d1"), online_device("d2")];
    h.queue.fail_for.lock().push("d1".into());

    // d1 was seen on an earlier round.
    let service = HeartbeatService::new(Arc::clone(&h.ctx), None);
    {
        h.queue.fail_for.lock().clear();
        service.tick().await;
    }
    let before = h.ctx.store.get("d1").unwrap();

    // Now d1's report fails — no false offline flip, timestamp frozen.
    h.queue.fail_for.lock().push("d1".into());
    service.tick().await;

    let after = h.ctx.store.get("d1").unwrap();
    assert_eq!(after.status, DeviceStatus::Online);
    assert_eq!(after.last_heartbeat_at, before.last_heartbeat_at);

    // d2 kept reporting fine both rounds.
    assert!(h.ctx.store.get("d2").unwrap().last_heartbeat_at >= before.last_heartbeat_at);
}

#[tokio::test]
async fn expired_lease_is_reaped_exactly_once() {
    let h = harness(DroverConfig::default());
    let task_id = Uuid::new_v4();
    h.ctx.store.assign_lease(expired_lease("d1", task_id)).unwrap();

    let mut rx = h.ctx.events.subscribe();
    let service = HeartbeatService::new(Arc::clone(&h.ctx), None);
    service.tick().await;

    match next_matching(&mut rx, |e| matches!(e, Event::TaskTimedOut { .. })).await {
        Some(Event::TaskTimedOut {
            device_id,
            task_id: reclaimed,
        }) => {
            assert_eq!(device_id, "d1");
            assert_eq!(reclaimed, task_id);
        }
        other => panic!("expected TaskTimedOut, got {other:?}"),
    }

    // The queue saw the timeout outcome once.
    assert_eq!(
        h.queue.outcomes.lock().as_slice(),
        &[(task_id, OutcomeStatus::Timeout)]
    );
    assert!(h.ctx.store.get("d1").unwrap().lease.is_none());
    assert_eq!(h.ctx.store.get("d1").unwrap().status, DeviceStatus::Online);

    // A second tick must not reclaim it again.
    service.tick().await;
    assert_eq!(h.queue.outcomes.lock().len(), 1);
    assert!(
        next_matching(&mut rx, |e| matches!(e, Event::TaskTimedOut { .. }))
            .await
            .is_none()
    );
}

#[tokio::test]
async fn unreachable_daemon_skips_the_tick_and_recovers() {
    let h = harness(DroverConfig::default());
    *h.daemon.devices.lock() = vec![online_device("d1")];
    h.daemon.fail_list.store(true, Ordering::SeqCst);

    let mut rx = h.ctx.events.subscribe();
    let service = HeartbeatService::new(Arc::clone(&h.ctx), None);
    service.tick().await;

    assert!(
        next_matching(&mut rx, |e| matches!(e, Event::HeartbeatError { .. }))
            .await
            .is_some()
    );
    assert!(h.ctx.store.is_empty());

    // The next scheduled tick finds the daemon back.
    h.daemon.fail_list.store(false, Ordering::SeqCst);
    service.tick().await;
    assert_eq!(h.ctx.store.get("d1").unwrap().status, DeviceStatus::Online);
}

#[tokio::test]
async fn assignment_to_a_leased_device_is_ignored() {
    let h = harness(DroverConfig::default());
    *h.daemon.devices.lock() = vec![online_device("d1")];

    // d1 already holds a live lease from a previous round.
    let now = chrono::Utc::now();
    let held = Uuid::new_v4();
    h.ctx
        .store
        .assign_lease(TaskLease {
            device_id: "d1".into(),
            task_id: held,
            assigned_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            persona_id: None,
        })
        .unwrap();

    // The queue hands out another task anyway — local invariant wins.
    h.queue
        .assignments
        .lock()
        .insert("d1".into(), task_for("watch"));

    let mut rx = h.ctx.events.subscribe();
    let service = HeartbeatService::new(Arc::clone(&h.ctx), None);
    service.tick().await;

    assert!(
        next_matching(&mut rx, |e| matches!(e, Event::NewTask { .. }))
            .await
            .is_none()
    );
    assert_eq!(h.ctx.store.get("d1").unwrap().lease.unwrap().task_id, held);
}

// ── Task runner ────────────────────────────────────────────────

/// Runner tests that assert on lock release turn the post-task
/// cooldown off; it holds the lock for seconds by design.
fn runner_config() -> DroverConfig {
    let mut config = DroverConfig::default();
    config.schedule.post_task_cooldown = false;
    config
}

#[tokio::test]
async fn runner_executes_and_reports_completion() {
    let h = harness(runner_config());
    let task = task_for("watch");
    let task_id = task.id;

    let now = chrono::Utc::now();
    h.ctx
        .store
        .assign_lease(TaskLease {
            device_id: "d1".into(),
            task_id,
            assigned_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            persona_id: None,
        })
        .unwrap();

    let runner = TaskRunner::new(Arc::clone(&h.ctx));
    tokio::spawn(runner.run());
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.ctx.events.publish(Event::NewTask {
        device_id: "d1".into(),
        task,
        persona_id: None,
    });

    let queue = Arc::clone(&h.queue);
    assert!(
        wait_until(move || {
            queue
                .outcomes
                .lock()
                .contains(&(task_id, OutcomeStatus::Completed))
        })
        .await
    );
    assert_eq!(h.daemon.invocations.load(Ordering::SeqCst), 1);

    // Lease cleared, lock released, device back online.
    let d1 = h.ctx.store.get("d1").unwrap();
    assert!(d1.lease.is_none());
    assert_eq!(d1.status, DeviceStatus::Online);
    assert!(!h.ctx.guards.is_executing("d1"));
}

#[tokio::test]
async fn held_lock_drops_the_assignment() {
    let h = harness(runner_config());

    let holder = h.ctx.guards.try_acquire_command("d1").unwrap();

    let runner = TaskRunner::new(Arc::clone(&h.ctx));
    tokio::spawn(runner.run());
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.ctx.events.publish(Event::NewTask {
        device_id: "d1".into(),
        task: task_for("watch"),
        persona_id: None,
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Dropped on the floor: nothing executed, the holder is untouched.
    assert_eq!(h.daemon.invocations.load(Ordering::SeqCst), 0);
    assert!(h.ctx.guards.is_executing("d1"));

    // After release the next assignment goes through.
    drop(holder);
    h.ctx.events.publish(Event::NewTask {
        device_id: "d1".into(),
        task: task_for("watch"),
        persona_id: None,
    });
    let daemon = Arc::clone(&h.daemon);
    assert!(wait_until(move || daemon.invocations.load(Ordering::SeqCst) == 1).await);
}

#[tokio::test]
async fn failed_task_reports_failure_and_marks_the_device() {
    // Retries back off in real time; shrink the base delay.
    let mut config = runner_config();
    config.retry.base_delay_ms = 1;
    let h = harness(config);
    h.daemon.fail_invoke.store(true, Ordering::SeqCst);

    let task = task_for("watch");
    let task_id = task.id;

    let runner = TaskRunner::new(Arc::clone(&h.ctx));
    tokio::spawn(runner.run());
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.ctx.events.publish(Event::NewTask {
        device_id: "d1".into(),
        task,
        persona_id: None,
    });

    let queue = Arc::clone(&h.queue);
    assert!(
        wait_until(move || {
            queue
                .outcomes
                .lock()
                .contains(&(task_id, OutcomeStatus::Failed))
        })
        .await
    );
    // All three retries burned inside one logical call.
    assert_eq!(h.daemon.invocations.load(Ordering::SeqCst), 3);
    assert_eq!(h.ctx.store.get("d1").unwrap().status, DeviceStatus::Error);
    assert!(!h.ctx.guards.is_executing("d1"));
}

#[tokio::test]
async fn foreign_daemon_work_skips_execution() {
    let h = harness(runner_config());
    h.daemon.busy.store(true, Ordering::SeqCst);

    let runner = TaskRunner::new(Arc::clone(&h.ctx));
    tokio::spawn(runner.run());
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.ctx.events.publish(Event::NewTask {
        device_id: "d1".into(),
        task: task_for("watch"),
        persona_id: None,
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(h.daemon.invocations.load(Ordering::SeqCst), 0);
    assert!(h.queue.outcomes.lock().is_empty());
    assert!(!h.ctx.guards.is_executing("d1"));
}

#[tokio::test]
async fn cooldown_holds_the_lock_after_completion() {
    // Default config keeps the post-task cooldown on; its shortest
    // possible pause (peak tier) is five seconds.
    let h = harness(DroverConfig::default());
    let task = task_for("watch");
    let task_id = task.id;

    let runner = TaskRunner::new(Arc::clone(&h.ctx));
    tokio::spawn(runner.run());
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.ctx.events.publish(Event::NewTask {
        device_id: "d1".into(),
        task,
        persona_id: None,
    });

    let queue = Arc::clone(&h.queue);
    assert!(
        wait_until(move || {
            queue
                .outcomes
                .lock()
                .contains(&(task_id, OutcomeStatus::Completed))
        })
        .await
    );

    // Outcome is in, but the device is still pacing.
    assert!(h.ctx.guards.is_executing("d1"));
}

#[tokio::test]
async fn overrunning_task_leaves_the_lease_for_reap() {
    let mut config = runner_config();
    config.heartbeat.lease_timeout_ms = 100;
    let h = harness(config);
    h.daemon.hang_invoke.store(true, Ordering::SeqCst);

    let task = task_for("watch");
    let task_id = task.id;
    let now = chrono::Utc::now();
    h.ctx
        .store
        .assign_lease(TaskLease {
            device_id: "d1".into(),
            task_id,
            assigned_at: now,
            expires_at: now + chrono::Duration::milliseconds(100),
            persona_id: None,
        })
        .unwrap();

    let runner = TaskRunner::new(Arc::clone(&h.ctx));
    tokio::spawn(runner.run());
    tokio::time::sleep(Duration::from_millis(20)).await;

    h.ctx.events.publish(Event::NewTask {
        device_id: "d1".into(),
        task,
        persona_id: None,
    });

    // The wall-clock budget trips; the lease must survive for reap.
    let ctx = Arc::clone(&h.ctx);
    assert!(
        wait_until(move || {
            ctx.store
                .get("d1")
                .is_some_and(|r| r.status == DeviceStatus::Error)
        })
        .await
    );
    assert!(h.ctx.store.get("d1").unwrap().lease.is_some());
    assert!(!h.ctx.guards.is_executing("d1"));

    // The next tick converts it into a timeout, exactly once.
    let mut rx = h.ctx.events.subscribe();
    let service = HeartbeatService::new(Arc::clone(&h.ctx), None);
    service.tick().await;

    assert!(
        next_matching(&mut rx, |e| matches!(e, Event::TaskTimedOut { .. }))
            .await
            .is_some()
    );
    assert_eq!(
        h.queue.outcomes.lock().as_slice(),
        &[(task_id, OutcomeStatus::Timeout)]
    );
}
