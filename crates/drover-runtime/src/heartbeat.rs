use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use drover_core::{DeviceReport, DeviceStatus, Event, TaskLease, TaskOutcome};
use drover_device::DaemonDevice;
use drover_state::DevicePatch;
use drover_tunnel::{TunnelHandle, TunnelMessage};

use crate::context::{DEP_DAEMON, DEP_QUEUE, FleetContext};

/// Counters the status endpoint exposes so operators can tell a healthy
/// quiet fleet from a stalled one.
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    pub ticks: AtomicU64,
    pub last_reap_count: AtomicU64,
    pub last_reported: AtomicU64,
    pub last_tick_ms: AtomicU64,
}

/// The periodic liveness reporter.
///
/// Each tick reaps timed-out leases, asks the daemon which devices are
/// reachable, reports each one to the central queue in parallel, and
/// emits a `NewTask` event for every lease the queue hands back. It
/// never executes a task itself.
pub struct HeartbeatService {
    ctx: Arc<FleetContext>,
    tunnel: Option<TunnelHandle>,
    ticking: AtomicBool,
    stats: Arc<HeartbeatStats>,
}

impl HeartbeatService {
    pub fn new(ctx: Arc<FleetContext>, tunnel: Option<TunnelHandle>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            tunnel,
            ticking: AtomicBool::new(false),
            stats: Arc::new(HeartbeatStats::default()),
        })
    }

    pub fn stats(&self) -> Arc<HeartbeatStats> {
        Arc::clone(&self.stats)
    }

    /// Drive ticks on the configured period until shutdown. The first
    /// tick fires immediately.
    pub async fn run(self: Arc<Self>) {
        let interval = self.ctx.config.heartbeat.interval();
        info!(
            node = %self.ctx.node_id(),
            interval_ms = interval.as_millis() as u64,
            lease_timeout_ms = self.ctx.config.heartbeat.lease_timeout_ms,
            "heartbeat service started"
        );

        let mut shutdown = self.ctx.events.subscribe();
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                event = shutdown.recv() => {
                    if matches!(event, Ok(Event::Shutdown) | Err(tokio::sync::broadcast::error::RecvError::Closed)) {
                        info!("heartbeat service stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One heartbeat round. Re-entrant-safe: an overlapping call aborts
    /// instead of stacking up behind a slow tick.
    pub async fn tick(&self) {
        if self
            .ticking
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("previous heartbeat tick still running, skipping");
            return;
        }

        let started = tokio::time::Instant::now();
        self.reap_expired().await;
        self.report_round().await;

        let elapsed = started.elapsed().as_millis() as u64;
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        self.stats.last_tick_ms.store(elapsed, Ordering::Relaxed);
        debug!(elapsed_ms = elapsed, "heartbeat tick complete");

        self.send_status_report().await;
        self.ticking.store(false, Ordering::SeqCst);
    }

    /// Step (a): reclaim expired leases. Emits exactly one `TaskTimedOut`
    /// per lease and reports the timeout outcome to the queue — the lease
    /// deadline is authoritative, so this is the single reporting point
    /// for overrun tasks.
    async fn reap_expired(&self) {
        let reclaimed = self.ctx.store.reap(Utc::now());
        self.stats
            .last_reap_count
            .store(reclaimed.len() as u64, Ordering::Relaxed);

        if reclaimed.is_empty() {
            return;
        }
        info!(count = reclaimed.len(), "reclaimed timed-out leases");

        for lease in reclaimed {
            self.ctx.events.publish(Event::TaskTimedOut {
                device_id: lease.device_id.clone(),
                task_id: lease.task_id,
            });

            let outcome = TaskOutcome::timeout();
            let queue = &self.ctx.queue;
            if let Err(e) = self
                .ctx
                .breaker
                .call(DEP_QUEUE, || queue.report_outcome(lease.task_id, &outcome))
                .await
            {
                warn!(task = %lease.task_id, error = %e, "failed to report lease timeout");
            }
        }
    }

    /// Steps (b)-(d): query the daemon, fan the per-device reports out,
    /// and turn assignments into events.
    async fn report_round(&self) {
        let daemon_timeout = self.ctx.config.heartbeat.daemon_timeout();
        let daemon = &self.ctx.daemon;
        let devices = match self
            .ctx
            .breaker
            .call(DEP_DAEMON, || daemon.list_devices(true, daemon_timeout))
            .await
        {
            Ok(devices) => devices,
            Err(e) => {
                // A dead daemon skips the tick; the process keeps
                // running and tries again next period.
                error!(error = %e, "device daemon unreachable, skipping tick");
                self.ctx.events.publish(Event::HeartbeatError {
                    message: e.to_string(),
                });
                return;
            }
        };

        let online: Vec<DaemonDevice> = devices.into_iter().filter(|d| d.is_online()).collect();
        debug!(devices = online.len(), "reporting device liveness");
        if online.is_empty() {
            self.stats.last_reported.store(0, Ordering::Relaxed);
            return;
        }

        // Fan-out with a concurrency cap: all devices in flight at once
        // would be self-inflicted backpressure on the queue.
        let semaphore = Arc::new(Semaphore::new(
            self.ctx.config.heartbeat.report_concurrency.max(1),
        ));
        let mut join_set = JoinSet::new();

        for device in online {
            let ctx = Arc::clone(&self.ctx);
            let semaphore = Arc::clone(&semaphore);
            let node_id = self.ctx.node_id().to_string();
            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let report = DeviceReport {
                    battery: device.battery,
                    status: DeviceStatus::Online,
                };
                let queue = &ctx.queue;
                let result = ctx
                    .breaker
                    .call(DEP_QUEUE, || {
                        queue.report_heartbeat(&node_id, &device.serial, &report)
                    })
                    .await;
                (device, result)
            });
        }

        let mut reported: u64 = 0;
        while let Some(joined) = join_set.join_next().await {
            let Ok((device, result)) = joined else {
                continue;
            };
            match result {
                Ok(response) => {
                    reported += 1;
                    self.apply_report(&device, response.task, response.persona_id);
                }
                Err(e) if e.is_circuit_open() => {
                    // Fail-fast skip, not a fresh failure; the cooldown
                    // is already running.
                    debug!(device = %device.serial, error = %e, "queue circuit open, report skipped");
                }
                Err(e) => {
                    // One failed report must not flip the device offline
                    // or disturb the others — prior state stands.
                    warn!(device = %device.serial, error = %e, "device report failed");
                }
            }
        }
        self.stats.last_reported.store(reported, Ordering::Relaxed);
    }

    /// Record a successful report and emit an assignment event if the
    /// queue handed this device a task.
    fn apply_report(
        &self,
        device: &DaemonDevice,
        task: Option<drover_core::TaskSpec>,
        persona_id: Option<String>,
    ) {
        let prior = self.ctx.store.get(&device.serial);
        let busy = prior
            .as_ref()
            .is_some_and(|r| r.has_live_lease(Utc::now()));
        let was_online = prior
            .map(|r| r.status == DeviceStatus::Online)
            .unwrap_or(false);

        // A leased device stays Busy; the report still refreshes battery
        // and the liveness stamp.
        self.ctx.store.upsert(
            &device.serial,
            DevicePatch {
                status: (!busy).then_some(DeviceStatus::Online),
                battery: device.battery,
                model: device.model.clone(),
            },
        );
        if !was_online && !busy {
            self.ctx.events.publish(Event::DeviceUpdated {
                device_id: device.serial.clone(),
                status: DeviceStatus::Online,
            });
        }

        let Some(task) = task else { return };

        let now = Utc::now();
        let lease = TaskLease {
            device_id: device.serial.clone(),
            task_id: task.id,
            assigned_at: now,
            expires_at: now
                + chrono::Duration::milliseconds(self.ctx.config.heartbeat.lease_timeout_ms as i64),
            persona_id: persona_id.clone().or_else(|| task.persona_id.clone()),
        };

        match self.ctx.store.assign_lease(lease) {
            Ok(()) => {
                info!(device = %device.serial, task = %task.id, "task assigned");
                self.ctx.events.publish(Event::NewTask {
                    device_id: device.serial.clone(),
                    task,
                    persona_id,
                });
            }
            Err(e) => {
                // The queue is not trusted to enforce uniqueness; the
                // local lease invariant is.
                warn!(device = %device.serial, task = %task.id, error = %e,
                    "queue assigned a task to a device with a live lease, ignoring");
            }
        }
    }

    /// Push a node status summary up the tunnel after each tick.
    async fn send_status_report(&self) {
        let Some(ref tunnel) = self.tunnel else { return };
        tunnel
            .send(TunnelMessage::StatusReport {
                payload: json!({
                    "node_id": self.ctx.node_id(),
                    "devices": self.ctx.store.len(),
                    "reported": self.stats.last_reported.load(Ordering::Relaxed),
                    "reclaimed": self.stats.last_reap_count.load(Ordering::Relaxed),
                    "tier": self.ctx.schedule.current_tier().to_string(),
                }),
                timestamp: Utc::now().timestamp_millis(),
            })
            .await;
    }
}
