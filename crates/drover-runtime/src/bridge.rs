use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use drover_core::{Event, EventBus, TaskSpec};
use drover_tunnel::TunnelMessage;

/// Forward tunnel dispatches onto the event bus as task assignments.
///
/// A `Dispatch` pushed by the central authority becomes a `NewTask`
/// event like any queue assignment, so the runner's lock discipline and
/// fault isolation apply to it unchanged.
pub async fn run_dispatch_bridge(events: EventBus, mut inbound: mpsc::Receiver<TunnelMessage>) {
    info!("dispatch bridge started");
    while let Some(msg) = inbound.recv().await {
        match msg {
            TunnelMessage::Dispatch {
                target,
                command,
                payload,
            } => {
                let task = TaskSpec {
                    id: Uuid::new_v4(),
                    command,
                    params: payload,
                    persona_id: None,
                    target_duration_secs: None,
                };
                info!(device = %target, task = %task.id, command = %task.command,
                    "dispatch from central authority");
                events.publish(Event::NewTask {
                    device_id: target,
                    task,
                    persona_id: None,
                });
            }
            other => debug!(message = ?other, "dispatch bridge ignoring message"),
        }
    }
    info!("dispatch bridge stopped");
}
