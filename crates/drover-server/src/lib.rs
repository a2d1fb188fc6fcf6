//! # drover-server
//!
//! The node's operator surface: a small HTTP API exposing health,
//! per-dependency circuit state, the device snapshot, and held locks —
//! enough to tell "device is genuinely offline" from "a dependency is
//! circuit-open" without shelling into the node.

use axum::{Router, extract::State, response::Json, routing::get};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tower_http::cors::CorsLayer;
use tracing::info;

use drover_core::DeviceStatus;
use drover_fault::CircuitSnapshot;
use drover_guard::GuardStatus;
use drover_runtime::{FleetContext, HeartbeatStats};
use drover_state::DeviceRecord;

/// Shared server state.
pub struct AppState {
    pub ctx: Arc<FleetContext>,
    pub stats: Arc<HeartbeatStats>,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
}

#[derive(Serialize)]
pub struct DeviceCounts {
    pub total: usize,
    pub online: usize,
    pub busy: usize,
    pub error: usize,
    pub offline: usize,
}

#[derive(Serialize)]
pub struct HeartbeatSummary {
    pub ticks: u64,
    pub last_reap_count: u64,
    pub last_reported: u64,
    pub last_tick_ms: u64,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_secs: u64,
    pub activity_tier: String,
    pub heartbeat: HeartbeatSummary,
    pub devices: DeviceCounts,
    pub circuits: Vec<CircuitSnapshot>,
    pub locks: Vec<GuardStatus>,
}

/// Assemble the full status view from the live components.
pub fn build_status(state: &AppState) -> StatusResponse {
    let snapshot = state.ctx.store.snapshot();
    let count = |status: DeviceStatus| snapshot.iter().filter(|r| r.status == status).count();

    StatusResponse {
        node_id: state.ctx.node_id().to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        activity_tier: state.ctx.schedule.current_tier().to_string(),
        heartbeat: HeartbeatSummary {
            ticks: state.stats.ticks.load(Ordering::Relaxed),
            last_reap_count: state.stats.last_reap_count.load(Ordering::Relaxed),
            last_reported: state.stats.last_reported.load(Ordering::Relaxed),
            last_tick_ms: state.stats.last_tick_ms.load(Ordering::Relaxed),
        },
        devices: DeviceCounts {
            total: snapshot.len(),
            online: count(DeviceStatus::Online),
            busy: count(DeviceStatus::Busy),
            error: count(DeviceStatus::Error),
            offline: count(DeviceStatus::Offline),
        },
        circuits: state.ctx.breaker.snapshot(),
        locks: state.ctx.guards.held(),
    }
}

/// Build the Axum router.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let mut router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/devices", get(devices_handler))
        .with_state(state);

    if cors {
        router = router.layer(CorsLayer::permissive());
    }
    router.layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<AppState>, listen: &str, cors: bool) -> drover_core::Result<()> {
    let router = build_router(state, cors);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!(listen = %listen, "status server listening");
    axum::serve(listener, router)
        .await
        .map_err(|e| drover_core::DroverError::Other(e.into()))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(build_status(&state))
}

async fn devices_handler(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceRecord>> {
    Json(state.ctx.store.snapshot())
}
