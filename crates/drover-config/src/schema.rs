use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration — maps to `drover.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    pub node: NodeConfig,
    pub heartbeat: HeartbeatConfig,
    pub breaker: BreakerConfig,
    pub retry: RetryConfig,
    pub schedule: ScheduleConfig,
    pub retention: RetentionConfig,
    pub daemon: DaemonConfig,
    pub queue: QueueConfig,
    pub tunnel: TunnelConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

// ── Node ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Fleet-wide identifier of this node. Falls back to the hostname.
    pub id: String,
    /// Human-readable label shown in dashboards.
    pub name: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        let id = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "node-unknown".into());
        Self { id, name: None }
    }
}

// ── Heartbeat ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Tick period in milliseconds.
    pub interval_ms: u64,
    /// Task lease timeout — the authoritative task deadline.
    pub lease_timeout_ms: u64,
    /// Bound on the device-control daemon query per tick.
    pub daemon_timeout_ms: u64,
    /// Cap on in-flight per-device reports to the central queue.
    pub report_concurrency: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            lease_timeout_ms: 300_000,
            daemon_timeout_ms: 5_000,
            report_concurrency: 8,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_millis(self.lease_timeout_ms)
    }

    pub fn daemon_timeout(&self) -> Duration {
        Duration::from_millis(self.daemon_timeout_ms)
    }
}

// ── Circuit breaker ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before a dependency's circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before a half-open probe is allowed.
    pub open_duration_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 600_000,
        }
    }
}

impl BreakerConfig {
    pub fn open_duration(&self) -> Duration {
        Duration::from_millis(self.open_duration_ms)
    }
}

// ── Retry ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

// ── Activity schedule ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Hours (0-23) around which activity peaks, ±1 hour each.
    pub peak_hours: Vec<u32>,
    /// Start of the quiet window, inclusive (hour 0-23).
    pub quiet_start_hour: u32,
    /// End of the quiet window, exclusive (hour 0-23).
    pub quiet_end_hour: u32,
    /// Sleep range outside peak/quiet windows.
    pub normal_sleep_min_ms: u64,
    pub normal_sleep_max_ms: u64,
    /// Hold a device's command lock for a tier-derived pause after each
    /// task, pacing consecutive commands per device.
    pub post_task_cooldown: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            peak_hours: vec![10, 14, 20],
            quiet_start_hour: 0,
            quiet_end_hour: 6,
            normal_sleep_min_ms: 5_000,
            normal_sleep_max_ms: 100_000,
            post_task_cooldown: true,
        }
    }
}

// ── Artifact retention ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Directory holding generated artifacts (screenshots etc.).
    pub artifact_dir: PathBuf,
    /// Keep at most this many artifacts; oldest deleted first.
    pub max_artifacts: usize,
    /// Sweep period.
    pub sweep_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("artifacts"),
            max_artifacts: 100,
            sweep_interval_ms: 3_600_000,
        }
    }
}

impl RetentionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

// ── Device-control daemon ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Base URL of the local device-control daemon.
    pub base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9317".into(),
            request_timeout_ms: 5_000,
        }
    }
}

impl DaemonConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ── Central task queue ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Base URL of the central task-queue RPC endpoint.
    pub base_url: String,
    /// Bearer token for the queue API.
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".into(),
            api_key: None,
            request_timeout_ms: 10_000,
        }
    }
}

impl QueueConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ── Tunnel ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,
    /// WebSocket URL of the central authority.
    pub url: String,
    /// Reconnect backoff is exponential, capped here.
    pub reconnect_max_delay_ms: u64,
    /// Outbound messages buffered while disconnected (oldest dropped).
    pub outbound_buffer: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "wss://127.0.0.1:8443/tunnel".into(),
            reconnect_max_delay_ms: 5_000,
            outbound_buffer: 256,
        }
    }
}

impl TunnelConfig {
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

// ── Server ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address for the status API.
    pub listen: String,
    /// Enable CORS (for dashboard development).
    pub cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3700".into(),
            cors: false,
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
    /// Output format: "pretty", "json", "compact".
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

// ── Default for root ───────────────────────────────────────────

impl Default for DroverConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            breaker: BreakerConfig::default(),
            retry: RetryConfig::default(),
            schedule: ScheduleConfig::default(),
            retention: RetentionConfig::default(),
            daemon: DaemonConfig::default(),
            queue: QueueConfig::default(),
            tunnel: TunnelConfig::default(),
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

/// A single config validation issue.
#[derive(Debug)]
pub struct ConfigWarning {
    pub field: String,
    pub message: String,
    pub severity: WarningSeverity,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarningSeverity {
    Error,
    Warning,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let icon = match self.severity {
            WarningSeverity::Error => "❌",
            WarningSeverity::Warning => "⚠️ ",
        };
        write!(f, "{} {}: {}", icon, self.field, self.message)?;
        if let Some(ref h) = self.hint {
            write!(f, "\n   ↳ {}", h)?;
        }
        Ok(())
    }
}

impl DroverConfig {
    /// Validate the config and return a list of warnings/errors.
    /// Returns `Err` with all messages joined if any severity is Error.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, String> {
        let mut warnings = Vec::new();

        if self.node.id.is_empty() {
            warnings.push(ConfigWarning {
                field: "node.id".into(),
                message: "node id is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set a stable fleet-wide identifier, e.g. 'node-seoul-01'".into()),
            });
        }

        if self.heartbeat.interval_ms == 0 {
            warnings.push(ConfigWarning {
                field: "heartbeat.interval_ms".into(),
                message: "heartbeat interval is 0 — the loop would spin".into(),
                severity: WarningSeverity::Error,
                hint: Some("30000 (30s) is the usual period".into()),
            });
        }

        if self.heartbeat.lease_timeout_ms < self.heartbeat.interval_ms {
            warnings.push(ConfigWarning {
                field: "heartbeat.lease_timeout_ms".into(),
                message: "lease timeout is shorter than the heartbeat interval — leases would expire before the first reap".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Use a multiple of the interval, e.g. 300000 (5min)".into()),
            });
        }

        if self.heartbeat.report_concurrency == 0 {
            warnings.push(ConfigWarning {
                field: "heartbeat.report_concurrency".into(),
                message: "report concurrency is 0 — no device reports would be sent".into(),
                severity: WarningSeverity::Error,
                hint: Some("8 in-flight reports is a reasonable cap".into()),
            });
        }

        if self.breaker.failure_threshold == 0 {
            warnings.push(ConfigWarning {
                field: "breaker.failure_threshold".into(),
                message: "threshold 0 would open circuits on the first call".into(),
                severity: WarningSeverity::Error,
                hint: Some("5 consecutive failures is the default".into()),
            });
        }

        for &h in &self.schedule.peak_hours {
            if h > 23 {
                warnings.push(ConfigWarning {
                    field: "schedule.peak_hours".into(),
                    message: format!("peak hour {h} is out of range"),
                    severity: WarningSeverity::Error,
                    hint: Some("Hours are 0-23".into()),
                });
            }
        }
        if self.schedule.quiet_start_hour > 23 || self.schedule.quiet_end_hour > 24 {
            warnings.push(ConfigWarning {
                field: "schedule.quiet_window".into(),
                message: format!(
                    "quiet window {}..{} is out of range",
                    self.schedule.quiet_start_hour, self.schedule.quiet_end_hour
                ),
                severity: WarningSeverity::Error,
                hint: Some("Start is 0-23, end is 0-24 (exclusive)".into()),
            });
        }
        if self.schedule.normal_sleep_min_ms > self.schedule.normal_sleep_max_ms {
            warnings.push(ConfigWarning {
                field: "schedule.normal_sleep_min_ms".into(),
                message: "sleep min exceeds sleep max".into(),
                severity: WarningSeverity::Error,
                hint: None,
            });
        }

        if self.retention.max_artifacts == 0 {
            warnings.push(ConfigWarning {
                field: "retention.max_artifacts".into(),
                message: "cap of 0 deletes every artifact on each sweep".into(),
                severity: WarningSeverity::Warning,
                hint: Some("100 is the default cap".into()),
            });
        }

        if self.tunnel.enabled && self.tunnel.url.is_empty() {
            warnings.push(ConfigWarning {
                field: "tunnel.url".into(),
                message: "tunnel enabled but no URL configured".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set e.g. 'wss://central.example.com:8443/tunnel' or disable the tunnel".into()),
            });
        }

        if self.server.listen.is_empty() {
            warnings.push(ConfigWarning {
                field: "server.listen".into(),
                message: "listen address is empty".into(),
                severity: WarningSeverity::Error,
                hint: Some("Set to e.g. '127.0.0.1:3700'".into()),
            });
        } else if self.server.listen.starts_with("0.0.0.0") {
            warnings.push(ConfigWarning {
                field: "server.listen".into(),
                message: "binding to 0.0.0.0 — status API is accessible from all interfaces".into(),
                severity: WarningSeverity::Warning,
                hint: Some("Use '127.0.0.1:3700' for local-only access".into()),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.level".into(),
                message: format!("unknown log level '{}'", self.logging.level),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_levels.join(", "))),
            });
        }
        let valid_formats = ["pretty", "json", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            warnings.push(ConfigWarning {
                field: "logging.format".into(),
                message: format!("unknown log format '{}'", self.logging.format),
                severity: WarningSeverity::Warning,
                hint: Some(format!("Valid values: {}", valid_formats.join(", "))),
            });
        }

        let errors: Vec<String> = warnings
            .iter()
            .filter(|w| w.severity == WarningSeverity::Error)
            .map(|w| format!("{}: {}", w.field, w.message))
            .collect();

        if !errors.is_empty() {
            return Err(format!("Configuration errors:\n  • {}", errors.join("\n  • ")));
        }

        Ok(warnings)
    }
}
