//! # drover-queue
//!
//! Client for the central task-queue store. Two RPCs matter to the node:
//! `report_heartbeat` (per-device liveness in, at most one task lease
//! out) and `report_outcome` (terminal task status back). Failures
//! surface as [`drover_core::DroverError::Queue`] for the circuit
//! breaker to count.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use url::Url;

use drover_core::{DeviceReport, DroverError, Result, TaskId, TaskOutcome, TaskSpec};

/// What the queue hands back for one device's heartbeat: optionally a
/// task to lease to that device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub task: Option<TaskSpec>,
    #[serde(default)]
    pub persona_id: Option<String>,
}

/// The queue seam the runtime depends on; tests use an in-memory impl.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Report one device's liveness; the queue may answer with a task.
    async fn report_heartbeat(
        &self,
        node_id: &str,
        serial: &str,
        report: &DeviceReport,
    ) -> Result<HeartbeatResponse>;

    /// Report a task's terminal status.
    async fn report_outcome(&self, task_id: TaskId, outcome: &TaskOutcome) -> Result<()>;
}

/// HTTP RPC implementation.
#[derive(Debug)]
pub struct QueueClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
}

impl QueueClient {
    pub fn new(base_url: &str, api_key: Option<String>, request_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| DroverError::Config(format!("invalid queue URL '{base_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DroverError::Queue(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn rpc(&self, name: &str) -> Result<Url> {
        self.base_url
            .join(&format!("/rpc/{name}"))
            .map_err(|e| DroverError::Queue(format!("bad RPC name '{name}': {e}")))
    }

    async fn post(&self, name: &str, body: serde_json::Value) -> Result<reqwest::Response> {
        let mut request = self.http.post(self.rpc(name)?).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DroverError::Queue(format!("{name} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(DroverError::Queue(format!(
                "{name} returned HTTP {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl TaskQueue for QueueClient {
    async fn report_heartbeat(
        &self,
        node_id: &str,
        serial: &str,
        report: &DeviceReport,
    ) -> Result<HeartbeatResponse> {
        let response = self
            .post(
                "device_heartbeat",
                json!({
                    "node_id": node_id,
                    "device_serial": serial,
                    "battery": report.battery,
                    "status": report.status,
                }),
            )
            .await?;

        let body: HeartbeatResponse = response
            .json()
            .await
            .map_err(|e| DroverError::Queue(format!("bad heartbeat payload: {e}")))?;

        if let Some(ref task) = body.task {
            debug!(device = %serial, task = %task.id, "queue assigned a task");
        }
        Ok(body)
    }

    async fn report_outcome(&self, task_id: TaskId, outcome: &TaskOutcome) -> Result<()> {
        self.post(
            "report_outcome",
            json!({
                "task_id": task_id,
                "status": outcome.status,
                "result": outcome.result,
                "error": outcome.error,
            }),
        )
        .await?;
        Ok(())
    }
}
