//! HTTP status endpoint: scheduler stats, the entity dump, and limit changes.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use sluice_core::config::GroupLimit;
use sluice_core::{Direction, RateGroupRegistry};
use sluice_sched::{Scheduler, SchedulerStats};

#[derive(Clone)]
pub struct StatusState {
    pub scheduler: Arc<Scheduler>,
    pub groups:    RateGroupRegistry,
}

// ── /status ──────────────────────────────────────────────────────────────────

async fn handle_status(State(state): State<StatusState>) -> Json<SchedulerStats> {
    Json(state.scheduler.stats())
}

// ── /dump ────────────────────────────────────────────────────────────────────

async fn handle_dump(State(state): State<StatusState>) -> String {
    state.scheduler.dump()
}

// ── /limits ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct LimitsRequest {
    pub upload_bytes_per_sec:   Option<i64>,
    pub download_bytes_per_sec: Option<i64>,
    #[serde(default)]
    pub groups:                 Vec<GroupLimit>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LimitsResponse {
    pub upload_bytes_per_sec:   i64,
    pub download_bytes_per_sec: i64,
    pub groups_updated:         usize,
}

async fn handle_limits(
    State(state): State<StatusState>,
    Json(req): Json<LimitsRequest>,
) -> Result<Json<LimitsResponse>, (StatusCode, String)> {
    if req.groups.iter().any(|g| g.name.trim().is_empty()) {
        return Err((StatusCode::BAD_REQUEST, "group name must not be empty".into()));
    }

    let settings = state.scheduler.settings();
    if let Some(limit) = req.upload_bytes_per_sec {
        settings.set_global_limit(Direction::Upload, limit);
    }
    if let Some(limit) = req.download_bytes_per_sec {
        settings.set_global_limit(Direction::Download, limit);
    }
    for g in &req.groups {
        state.groups.set_limit(&g.name, Direction::Upload, g.upload_bytes_per_sec);
        state.groups.set_limit(&g.name, Direction::Download, g.download_bytes_per_sec);
    }

    Ok(Json(LimitsResponse {
        upload_bytes_per_sec:   settings.global_limit(Direction::Upload).limit(),
        download_bytes_per_sec: settings.global_limit(Direction::Download).limit(),
        groups_updated:         req.groups.len(),
    }))
}

// ── /groups ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct GroupInfo {
    pub name:       String,
    pub limit:      i64,
    pub bytes_used: u64,
}

async fn handle_groups(State(state): State<StatusState>) -> Json<Vec<GroupInfo>> {
    let groups = state
        .groups
        .list()
        .into_iter()
        .map(|g| GroupInfo {
            name:       g.name().to_string(),
            limit:      g.limit(),
            bytes_used: g.bytes_used(),
        })
        .collect();
    Json(groups)
}

// ── Router ───────────────────────────────────────────────────────────────────

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .route("/dump",   get(handle_dump))
        .route("/limits", post(handle_limits))
        .route("/groups", get(handle_groups))
        .with_state(state)
}

pub async fn serve(state: StatusState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
