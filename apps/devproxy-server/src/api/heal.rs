use std::time::Duration;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use utoipa::ToSchema;

use crate::api::{problem, require_admin};
use crate::session::{ConvergenceRule, HealSession, SessionKind, SessionRequest};
use crate::AppState;

/// Upper bound accepted for `maxPasses`.
const MAX_PASSES_LIMIT: u32 = 10;

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealRequest {
    pub url: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default)]
    pub max_passes: Option<u32>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub wait_ms: Option<u64>,
    #[serde(default)]
    pub convergence: Option<ConvergenceRule>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuditRequest {
    pub url: String,
    #[serde(default)]
    pub route: Option<String>,
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Accepted {
    pub accepted: bool,
    pub session_id: String,
    pub session: HealSession,
}

#[derive(Debug, Serialize, ToSchema)]
pub(crate) struct AlreadyHealthy {
    pub ok: bool,
    pub message: String,
}

fn validate_url(raw: &str) -> Result<String, Response> {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => Ok(trimmed.to_string()),
        _ => Err(problem(
            StatusCode::BAD_REQUEST,
            "Bad Request",
            format!("`{trimmed}` is not an http(s) URL"),
        )),
    }
}

fn accepted(session: HealSession) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            session_id: session.id.clone(),
            session,
        }),
    )
        .into_response()
}

/// Start an audit-and-heal session, or answer synchronously when the route is already healthy.
#[utoipa::path(
    post,
    path = "/ai/audit-and-heal",
    tag = "Assistant",
    request_body = HealRequest,
    responses(
        (status = 202, description = "Session accepted", body = Accepted),
        (status = 200, description = "Already healthy", body = AlreadyHealthy),
        (status = 400, description = "Invalid request", body = devproxy_protocol::ProblemDetails),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown route", body = devproxy_protocol::ProblemDetails)
    )
)]
pub async fn audit_and_heal(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<HealRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let url = match validate_url(&req.url) {
        Ok(url) => url,
        Err(resp) => return resp,
    };
    let Some(route) = req.route.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()) else {
        return problem(StatusCode::BAD_REQUEST, "Bad Request", "route is required");
    };
    if state.topology().effective_declaration(&route).is_none() {
        return problem(
            StatusCode::NOT_FOUND,
            "Unknown Route",
            format!("no route source declares `{route}`"),
        );
    }

    let defaults = &state.settings().heal;
    let request = SessionRequest {
        kind: SessionKind::Heal,
        url,
        route: Some(route),
        max_passes: req.max_passes.unwrap_or(defaults.max_passes).min(MAX_PASSES_LIMIT),
        timeout: req
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout),
        wait: req.wait_ms.map(Duration::from_millis).unwrap_or(defaults.wait),
        convergence: req.convergence.unwrap_or(defaults.convergence),
    };

    // Diagnostic-first: a healthy upstream that audited clean moments ago needs no session.
    if state.recently_clean(&request.url).await && state.probe().probe(&request.url).await.is_healthy() {
        info!(url = %request.url, "heal skipped; recently audited clean");
        return Json(AlreadyHealthy {
            ok: true,
            message: format!("{} is already healthy; nothing to fix.", request.url),
        })
        .into_response();
    }

    accepted(state.sessions().start(&state, request))
}

/// Start a background audit and diagnosis without remediation.
#[utoipa::path(
    post,
    path = "/ai/audit",
    tag = "Assistant",
    request_body = AuditRequest,
    responses(
        (status = 202, description = "Audit accepted", body = Accepted),
        (status = 400, description = "Invalid request", body = devproxy_protocol::ProblemDetails),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AuditRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let url = match validate_url(&req.url) {
        Ok(url) => url,
        Err(resp) => return resp,
    };
    let defaults = &state.settings().heal;
    let request = SessionRequest {
        kind: SessionKind::Audit,
        url,
        route: req.route.map(|r| r.trim().to_string()).filter(|r| !r.is_empty()),
        max_passes: 0,
        timeout: req
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.timeout),
        wait: req.wait_ms.map(Duration::from_millis).unwrap_or(defaults.wait),
        convergence: defaults.convergence,
    };
    accepted(state.sessions().start(&state, request))
}

/// Live sessions followed by recently finished ones.
#[utoipa::path(
    get,
    path = "/ai/sessions",
    tag = "Assistant",
    responses(
        (status = 200, description = "Session snapshots", body = [HealSession]),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn sessions_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(state.sessions().list()).into_response()
}

#[utoipa::path(
    get,
    path = "/ai/sessions/{id}",
    tag = "Assistant",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 200, description = "Session snapshot", body = HealSession),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown session", body = devproxy_protocol::ProblemDetails)
    )
)]
pub async fn session_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.sessions().get(&id) {
        Some(session) => Json(session).into_response(),
        None => problem(StatusCode::NOT_FOUND, "Not Found", format!("no session `{id}`")),
    }
}

/// Request cooperative cancellation of one session.
#[utoipa::path(
    post,
    path = "/ai/sessions/{id}/cancel",
    tag = "Assistant",
    params(("id" = String, Path, description = "Session id")),
    responses(
        (status = 202, description = "Cancellation requested", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Unknown session", body = devproxy_protocol::ProblemDetails),
        (status = 409, description = "Already finished", body = devproxy_protocol::ProblemDetails)
    )
)]
pub async fn session_cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    match state.sessions().cancel(&id) {
        Some(true) => (
            StatusCode::ACCEPTED,
            Json(json!({"cancelled": true, "sessionId": id})),
        )
            .into_response(),
        Some(false) => problem(
            StatusCode::CONFLICT,
            "Conflict",
            format!("session `{id}` already finished"),
        ),
        None => problem(StatusCode::NOT_FOUND, "Not Found", format!("no session `{id}`")),
    }
}

/// Cancel every in-flight session.
#[utoipa::path(
    post,
    path = "/ai/cancel",
    tag = "Assistant",
    responses(
        (status = 200, description = "Number of sessions signalled", body = serde_json::Value),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn cancel_all(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let cancelled = state.sessions().cancel_all();
    info!(cancelled, "cancel-all requested");
    Json(json!({ "cancelled": cancelled })).into_response()
}
