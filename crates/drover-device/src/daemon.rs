use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;
use url::Url;

use drover_core::{DroverError, Result};

/// A device as reported by the control daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonDevice {
    pub serial: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub battery: Option<u8>,
    /// Raw daemon state string; "device" (adb convention) or "online"
    /// both mean reachable.
    #[serde(default)]
    pub status: String,
}

impl DaemonDevice {
    pub fn is_online(&self) -> bool {
        matches!(self.status.as_str(), "device" | "online")
    }
}

#[derive(Debug, Deserialize)]
struct DevicesResponse {
    #[serde(default)]
    devices: Vec<DaemonDevice>,
}

#[derive(Debug, Deserialize)]
struct ScriptStatusResponse {
    #[serde(default)]
    running: bool,
}

/// What the heartbeat loop and task runner need from the daemon.
#[async_trait]
pub trait DeviceControl: Send + Sync {
    /// Currently known devices, optionally filtered to reachable ones.
    /// Bounded by `timeout` so a wedged daemon cannot stall a tick.
    async fn list_devices(&self, online_only: bool, timeout: Duration)
    -> Result<Vec<DaemonDevice>>;

    /// Run a command (script) on one device and return its result.
    async fn invoke(&self, serial: &str, command: &str, params: &Value) -> Result<Value>;

    /// Whether the daemon is already running something on this device.
    async fn is_busy(&self, serial: &str) -> Result<bool>;
}

/// HTTP implementation against the daemon's local API.
#[derive(Debug)]
pub struct DaemonClient {
    http: reqwest::Client,
    base_url: Url,
}

impl DaemonClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| DroverError::Config(format!("invalid daemon URL '{base_url}': {e}")))?;
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DroverError::Daemon(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| DroverError::Daemon(format!("bad endpoint '{path}': {e}")))
    }
}

#[async_trait]
impl DeviceControl for DaemonClient {
    async fn list_devices(
        &self,
        online_only: bool,
        timeout: Duration,
    ) -> Result<Vec<DaemonDevice>> {
        let mut url = self.endpoint("/api/devices")?;
        if online_only {
            url.query_pairs_mut().append_pair("q", "online");
        }

        let response = self
            .http
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| DroverError::Daemon(format!("device list failed: {e}")))?;

        if !response.status().is_success() {
            return Err(DroverError::Daemon(format!(
                "device list returned HTTP {}",
                response.status()
            )));
        }

        let body: DevicesResponse = response
            .json()
            .await
            .map_err(|e| DroverError::Daemon(format!("bad device list payload: {e}")))?;

        debug!(count = body.devices.len(), "daemon device list");
        Ok(body.devices)
    }

    async fn invoke(&self, serial: &str, command: &str, params: &Value) -> Result<Value> {
        let url = self.endpoint(&format!("/api/devices/{serial}/script/run"))?;

        let response = self
            .http
            .post(url)
            .json(&json!({
                "name": command,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| DroverError::Daemon(format!("invoke '{command}' on {serial}: {e}")))?;

        if !response.status().is_success() {
            return Err(DroverError::Daemon(format!(
                "invoke '{command}' on {serial} returned HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| DroverError::Daemon(format!("bad invoke result from {serial}: {e}")))
    }

    async fn is_busy(&self, serial: &str) -> Result<bool> {
        let url = self.endpoint(&format!("/api/devices/{serial}/script/status"))?;

        // A missing status endpoint or transport error means "not
        // running" — the daemon forgets finished scripts.
        let response = match self.http.get(url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return Ok(false),
        };

        let status: ScriptStatusResponse = response.json().await.unwrap_or(ScriptStatusResponse {
            running: false,
        });
        Ok(status.running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adb_and_daemon_status_strings_both_mean_online() {
        let online = DaemonDevice {
            serial: "R58M1234".into(),
            model: None,
            battery: None,
            status: "device".into(),
        };
        assert!(online.is_online());

        let offline = DaemonDevice {
            status: "offline".into(),
            ..online.clone()
        };
        assert!(!offline.is_online());
    }

    #[test]
    fn device_list_payload_tolerates_missing_fields() {
        let body: DevicesResponse = serde_json::from_str(
            r#"{"devices": [
                {"serial": "R58M1", "status": "device", "battery": 84, "model": "SM-G960"},
                {"serial": "R58M2"}
            ]}"#,
        )
        .unwrap();

        assert_eq!(body.devices.len(), 2);
        assert_eq!(body.devices[0].battery, Some(84));
        assert!(body.devices[1].model.is_none());
        assert!(!body.devices[1].is_online());
    }

    #[test]
    fn invalid_base_url_is_a_config_error() {
        let err = DaemonClient::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, DroverError::Config(_)));
    }
}
