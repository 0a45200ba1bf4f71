use std::collections::BTreeMap;

use axum::response::IntoResponse;
use axum::{extract::State, Json};
use serde::Serialize;
use serde_json::json;
use utoipa::{OpenApi, ToSchema};

use crate::AppState;

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ClientConfig {
    pub api_base_path: String,
    pub version: String,
}

#[derive(Serialize, ToSchema)]
pub(crate) struct AiHealth {
    pub enabled: bool,
    /// What the most recent session step is doing, if anything.
    pub activity: Option<String>,
    pub model: String,
}

/// Health probe.
#[utoipa::path(
    get,
    path = "/healthz",
    tag = "Meta",
    responses(
        (status = 200, description = "Service healthy", body = crate::openapi::HealthOk)
    )
)]
pub async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true}))
}

/// Where the dashboard finds the API. Served at the root, outside the base path.
#[utoipa::path(
    get,
    path = "/config",
    tag = "Meta",
    responses((status = 200, description = "Client bootstrap config", body = ClientConfig))
)]
pub async fn client_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(ClientConfig {
        api_base_path: state.settings().api_base_path.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Assistant availability and the current activity line.
#[utoipa::path(
    get,
    path = "/ai/health",
    tag = "Assistant",
    responses((status = 200, description = "Assistant status", body = AiHealth))
)]
pub async fn ai_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(AiHealth {
        enabled: state.settings().ai_enabled,
        activity: state.hub().activity.message(),
        model: state.settings().ai_model.clone(),
    })
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AiStats {
    pub live_sessions: usize,
    pub recent_sessions: usize,
    /// Session count per status, live and recent together.
    pub by_status: BTreeMap<String, usize>,
    pub events: usize,
    pub latest_event_id: u64,
    pub patterns: usize,
    pub routes: usize,
}

/// Counters for the dashboard header.
#[utoipa::path(
    get,
    path = "/ai/stats",
    tag = "Assistant",
    responses((status = 200, description = "Session and event counters", body = AiStats))
)]
pub async fn ai_stats(State(state): State<AppState>) -> impl IntoResponse {
    let (live_sessions, recent_sessions) = state.sessions().counts();
    let mut by_status = BTreeMap::new();
    for session in state.sessions().list() {
        *by_status
            .entry(session.status.as_str().to_string())
            .or_insert(0) += 1;
    }
    let thoughts = &state.hub().thoughts;
    Json(AiStats {
        live_sessions,
        recent_sessions,
        by_status,
        events: thoughts.len(),
        latest_event_id: thoughts.latest_id(),
        patterns: state.knowledge().len(),
        routes: state.topology().declarations().len(),
    })
}

/// Generated OpenAPI document.
pub async fn openapi_json() -> impl IntoResponse {
    Json(crate::openapi::ApiDoc::openapi())
}
