use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use drover_core::{DeviceStatus, Event, OutcomeStatus, TaskId, TaskOutcome, TaskSpec};
use drover_fault::with_retry;
use drover_state::DevicePatch;

use crate::context::{DEP_DAEMON, DEP_QUEUE, FleetContext};

/// Consumes `NewTask` events and executes them, one command per device
/// at a time.
///
/// The runner never queues work: when the device's command lock is held
/// the event is dropped and logged — the sender retries via the next
/// heartbeat's fresh lease, not the runner.
pub struct TaskRunner {
    ctx: Arc<FleetContext>,
}

impl TaskRunner {
    pub fn new(ctx: Arc<FleetContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Drain assignment events until shutdown. Execution is spawned per
    /// task so a long command never blocks the consumer loop.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.ctx.events.subscribe();
        info!("task runner started");

        loop {
            match rx.recv().await {
                Ok(Event::NewTask {
                    device_id,
                    task,
                    persona_id,
                }) => self.dispatch(device_id, task, persona_id),
                Ok(Event::Shutdown) => {
                    info!("task runner stopping");
                    return;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "task runner lagged behind the event bus");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    fn dispatch(&self, device_id: String, task: TaskSpec, persona_id: Option<String>) {
        let Some(guard) = self.ctx.guards.try_acquire_command(&device_id) else {
            // Deliberately lost: the stale lease expires and the next
            // heartbeat round hands out a fresh one.
            info!(device = %device_id, task = %task.id, "command lock held, dropping assignment");
            return;
        };

        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            // The guard travels into the task and releases on drop, so
            // the lock clears on every exit path.
            let _guard = guard;
            execute(ctx, device_id, task, persona_id).await;
        });
    }
}

/// Run one task body under the breaker/retry wrapper and a hard
/// wall-clock budget matching the lease timeout.
async fn execute(ctx: Arc<FleetContext>, device_id: String, task: TaskSpec, _persona: Option<String>) {
    let budget = ctx.config.heartbeat.lease_timeout();
    let retries = ctx.config.retry.max_retries;
    let base_delay = ctx.config.retry.base_delay();
    let started = tokio::time::Instant::now();

    let daemon = &ctx.daemon;

    // The daemon may be running something drover never started (manual
    // intervention, another controller). Don't stack a command on top.
    if let Ok(true) = daemon.is_busy(&device_id).await {
        info!(device = %device_id, task = %task.id, "daemon busy with foreign work, skipping");
        return;
    }

    info!(device = %device_id, task = %task.id, command = %task.command, "task started");

    let body = ctx.breaker.call(DEP_DAEMON, || {
        with_retry(
            || daemon.invoke(&device_id, &task.command, &task.params),
            retries,
            base_delay,
        )
    });

    match tokio::time::timeout(budget, body).await {
        Ok(Ok(result)) => {
            let elapsed = started.elapsed().as_secs();
            info!(device = %device_id, task = %task.id, elapsed_secs = elapsed, "task completed");

            clear_lease(&ctx, &device_id, task.id);
            report_outcome(&ctx, task.id, &TaskOutcome::completed(Some(result))).await;
            ctx.events.publish(Event::TaskCompleted {
                device_id: device_id.clone(),
                task_id: task.id,
                status: OutcomeStatus::Completed,
            });
            cooldown(&ctx, &device_id).await;
        }
        Ok(Err(e)) => {
            warn!(device = %device_id, task = %task.id, error = %e, "task failed");

            clear_lease(&ctx, &device_id, task.id);
            ctx.store
                .upsert(&device_id, DevicePatch::status(DeviceStatus::Error));
            report_outcome(&ctx, task.id, &TaskOutcome::failed(e.to_string())).await;
            ctx.events.publish(Event::TaskCompleted {
                device_id: device_id.clone(),
                task_id: task.id,
                status: OutcomeStatus::Failed,
            });
            cooldown(&ctx, &device_id).await;
        }
        Err(_) => {
            // Budget exceeded. The lease stays in place so the next
            // heartbeat tick reaps it — that reap is the single point
            // that emits the timeout event and reports the outcome.
            warn!(
                device = %device_id,
                task = %task.id,
                budget_secs = budget.as_secs(),
                "task exceeded wall-clock budget, leaving lease for reap"
            );
            ctx.store
                .upsert(&device_id, DevicePatch::status(DeviceStatus::Error));
        }
    }
}

/// Pace consecutive commands per device: keep the lock through a
/// tier-derived pause, so cadence follows the time of day. Assignments
/// arriving during the pause are dropped and re-leased later.
async fn cooldown(ctx: &FleetContext, device_id: &str) {
    if !ctx.config.schedule.post_task_cooldown {
        return;
    }
    let tier = ctx.schedule.current_tier();
    let pause = ctx.schedule.sleep_duration(tier);
    debug!(device = %device_id, tier = %tier, pause_ms = pause.as_millis() as u64, "post-task cooldown");
    tokio::time::sleep(pause).await;
}

fn clear_lease(ctx: &FleetContext, device_id: &str, task_id: TaskId) {
    // Direct dispatches carry no lease; a reaped lease may already be
    // gone. Neither is an error here.
    if let Err(e) = ctx.store.complete_lease(device_id, task_id) {
        debug!(device = %device_id, task = %task_id, error = %e, "no lease to clear");
    }
}

async fn report_outcome(ctx: &FleetContext, task_id: TaskId, outcome: &TaskOutcome) {
    let queue = &ctx.queue;
    if let Err(e) = ctx
        .breaker
        .call(DEP_QUEUE, || queue.report_outcome(task_id, outcome))
        .await
    {
        warn!(task = %task_id, error = %e, "failed to report task outcome");
    }
}
