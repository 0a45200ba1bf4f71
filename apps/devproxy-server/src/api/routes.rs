use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use utoipa::ToSchema;

use devproxy_core::topology::{resolve_parent, GroupMember, PromotionMode};
use devproxy_core::TopologyError;
use devproxy_topics as topics;

use crate::api::{problem, require_admin};
use crate::remediation::RemediationError;
use crate::AppState;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GroupView {
    pub key: String,
    pub parent: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub promotion: Option<devproxy_core::topology::Promotion>,
    #[schema(value_type = Vec<Object>)]
    pub members: Vec<GroupMember>,
    /// Routes left visible after the promotion hides siblings.
    pub visible: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PromoteRequest {
    pub base_key: String,
    pub route: String,
    /// `children` (default) or `config`.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub mode: Option<PromotionMode>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResolveRequest {
    pub route: String,
    pub winner_file: String,
}

fn unknown_route(err: &TopologyError) -> Response {
    problem(StatusCode::NOT_FOUND, "Unknown Route", err.to_string())
}

fn overrides_failed(err: impl std::fmt::Display) -> Response {
    problem(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Overrides Not Saved",
        err.to_string(),
    )
}

/// Topology groups with their parent and visible members.
#[utoipa::path(
    get,
    path = "/routes",
    tag = "Routes",
    responses(
        (status = 200, description = "Route groups", body = [GroupView]),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn routes(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let topology = state.topology();
    let groups: Vec<GroupView> = topology
        .groups()
        .iter()
        .map(|g| GroupView {
            key: g.key.clone(),
            parent: resolve_parent(g).map(str::to_string),
            promotion: g.promotion.clone(),
            visible: g.visible_members().iter().map(|m| m.route.clone()).collect(),
            members: g.members.clone(),
        })
        .collect();
    Json(groups).into_response()
}

/// Every route declared by several files with disagreeing upstreams.
#[utoipa::path(
    get,
    path = "/overrides/conflicts",
    tag = "Routes",
    responses((status = 200, description = "Conflicts, resolved or not", body = serde_json::Value))
)]
pub async fn conflicts(State(state): State<AppState>) -> impl IntoResponse {
    let topology = state.topology();
    Json(json!({ "conflicts": topology.conflicts() }))
}

/// Promote a route as the representative of its upstream group.
#[utoipa::path(
    post,
    path = "/overrides/promote",
    tag = "Routes",
    request_body = PromoteRequest,
    responses(
        (status = 200, description = "Promotion recorded", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Route is not in the group", body = devproxy_protocol::ProblemDetails)
    )
)]
pub async fn promote(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PromoteRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let mut next = (*state.topology()).clone();
    let mode = req.mode.unwrap_or(PromotionMode::Children);
    let promotion = match next.promote(mode, &req.base_key, &req.route) {
        Ok(p) => p,
        Err(err) => return unknown_route(&err),
    };
    if let Err(err) = state.overrides().set_promotion(promotion.clone()).await {
        return overrides_failed(err);
    }
    let parent = next.parent(&req.base_key).map(str::to_string);
    state.set_topology(next);
    state.hub().thoughts.emit(
        topics::TOPIC_ROUTES_PROMOTED,
        format!("Promoted {} for {}", promotion.route, promotion.base_key),
        json!({ "promotion": promotion, "parent": parent }),
    );
    info!(key = %promotion.base_key, route = %promotion.route, "route promoted");
    Json(json!({ "promotion": promotion, "parent": parent })).into_response()
}

/// Choose which file wins a conflicted route and regenerate the bundle.
#[utoipa::path(
    post,
    path = "/resolve-conflict",
    tag = "Routes",
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Resolution recorded and bundle regenerated", body = serde_json::Value),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "No such conflict or file", body = devproxy_protocol::ProblemDetails),
        (status = 422, description = "Regenerated bundle failed validation", body = devproxy_protocol::ProblemDetails)
    )
)]
pub async fn resolve_conflict(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResolveRequest>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let mut next = (*state.topology()).clone();
    if let Err(err) = next.resolve_conflict(&req.route, &req.winner_file) {
        return unknown_route(&err);
    }
    if let Err(err) = state
        .overrides()
        .set_resolution(&req.route, &req.winner_file)
        .await
    {
        return overrides_failed(err);
    }
    let resolutions = next.resolutions().clone();
    let conflict = next.conflict(&req.route).cloned();
    state.set_topology(next);
    state.hub().thoughts.emit(
        topics::TOPIC_ROUTES_CONFLICT_RESOLVED,
        format!("{} now served from {}", req.route, req.winner_file),
        json!({ "route": req.route, "winner": req.winner_file }),
    );

    match state.executor().rebuild(&resolutions).await {
        Ok(bundle) => Json(json!({ "conflict": conflict, "bundle": bundle })).into_response(),
        Err(err @ RemediationError::ValidationFailed(_)) => {
            warn!(route = %req.route, %err, "bundle rejected after conflict resolution");
            problem(StatusCode::UNPROCESSABLE_ENTITY, "Validation Failed", err.to_string())
        }
        Err(err) => problem(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Bundle Not Regenerated",
            err.to_string(),
        ),
    }
}
