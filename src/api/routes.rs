use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::control::{Control, StartResponse, SystemStatus};
use crate::error::AppError;
use crate::pipeline::CaptureDepth;
use crate::types::{CaptureDocument, Manifest};

#[derive(Clone)]
pub struct ApiState {
    pub control: Arc<Control>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/capture/start", post(start_capture))
        .route("/api/status", get(get_status))
        .route("/api/config/reload", post(reload_config))
        .route("/api/backup", post(create_backup))
        .route("/api/manifest", get(get_manifest))
        .route("/api/latest-data", get(get_latest_data))
        .route("/api/data/:file", get(get_data_file))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Query param structs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct StartQuery {
    /// Override the configured depth; `false` captures the listing only.
    pub details: Option<bool>,
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
    pub automation_enabled: bool,
    pub capture_times: Vec<String>,
}

#[derive(Serialize)]
pub struct BackupResponse {
    pub path: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn start_capture(
    State(state): State<ApiState>,
    Query(params): Query<StartQuery>,
) -> Json<StartResponse> {
    let depth = params.details.map(CaptureDepth::from_flag);
    Json(state.control.start_capture(depth))
}

async fn get_status(State(state): State<ApiState>) -> Json<SystemStatus> {
    Json(state.control.status())
}

async fn reload_config(State(state): State<ApiState>) -> Result<Json<ReloadResponse>, AppError> {
    let cfg = state.control.reload_config()?;
    Ok(Json(ReloadResponse {
        reloaded: true,
        automation_enabled: cfg.automation.enabled,
        capture_times: cfg.automation.capture_times,
    }))
}

async fn create_backup(State(state): State<ApiState>) -> Result<Json<BackupResponse>, AppError> {
    let path = state.control.backup_now().await?;
    Ok(Json(BackupResponse {
        path: path.display().to_string(),
    }))
}

async fn get_manifest(State(state): State<ApiState>) -> Result<Json<Manifest>, AppError> {
    Ok(Json(state.control.manifest()?))
}

async fn get_latest_data(State(state): State<ApiState>) -> Result<Json<CaptureDocument>, AppError> {
    Ok(Json(state.control.latest_data()?))
}

async fn get_data_file(
    State(state): State<ApiState>,
    Path(file): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    Ok(Json(state.control.data_file(&file)?))
}
