use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{extract::State, Json};
use serde_json::json;
use tracing::info;

use devproxy_core::knowledge::PatternSpec;
use devproxy_topics as topics;

use crate::api::{problem, require_admin};
use crate::AppState;

/// Registered issue patterns, built-ins first.
#[utoipa::path(
    get,
    path = "/knowledge",
    tag = "Knowledge",
    responses(
        (status = 200, description = "Pattern specs in registration order", body = serde_json::Value),
        (status = 401, description = "Unauthorized")
    )
)]
pub async fn knowledge_list(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let kb = state.knowledge();
    let patterns: Vec<&PatternSpec> = kb.patterns().map(|p| &p.spec).collect();
    Json(json!({ "count": patterns.len(), "patterns": patterns })).into_response()
}

/// Register a pattern at runtime. Ids are unique; a known id is rejected.
#[utoipa::path(
    post,
    path = "/knowledge",
    tag = "Knowledge",
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Registered", body = serde_json::Value),
        (status = 400, description = "Invalid pattern", body = devproxy_protocol::ProblemDetails),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "Id already registered", body = devproxy_protocol::ProblemDetails)
    )
)]
pub async fn knowledge_register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(spec): Json<PatternSpec>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let id = spec.id.clone();
    match state.register_pattern(spec) {
        Ok(true) => {
            state.hub().thoughts.emit(
                topics::TOPIC_KNOWLEDGE_REGISTERED,
                format!("Learned pattern {id}"),
                json!({ "patternId": id }),
            );
            info!(pattern = %id, "pattern registered");
            (
                StatusCode::CREATED,
                Json(json!({ "registered": true, "id": id })),
            )
                .into_response()
        }
        Ok(false) => problem(
            StatusCode::CONFLICT,
            "Conflict",
            format!("pattern `{id}` is already registered"),
        ),
        Err(err) => problem(StatusCode::BAD_REQUEST, "Invalid Pattern", err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use crate::api::test_http::{app, call};
    use crate::test_support::{report_with_console, Harness};
    use axum::http::StatusCode;
    use devproxy_protocol::AuditReport;
    use serde_json::json;

    #[tokio::test]
    async fn registered_patterns_take_part_in_diagnosis() {
        let h = Harness::new(vec![Ok(AuditReport::empty("u"))]).await;
        let app = app(h.state.clone());
        let pattern = json!({
            "id": "hmr_socket",
            "title": "Dev server HMR socket blocked",
            "signals": [{"scope": "console", "regex": "\\[vite\\] failed to connect"}],
            "solutions": [{
                "id": "enable_hmr_upgrade",
                "description": "Forward upgrade headers",
                "kind": "recommendation",
                "steps": ["Point server.hmr.clientPort at the proxy"]
            }]
        });
        let (status, _) = call(&app, "POST", "/devproxy/api/knowledge", Some(pattern.clone()), None).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = call(&app, "POST", "/devproxy/api/knowledge", Some(pattern), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let matches = h
            .state
            .knowledge()
            .diagnose(&report_with_console(&["[vite] failed to connect to websocket"]));
        assert!(matches.iter().any(|m| m.pattern_id == "hmr_socket"));

        let (_, listed) = call(&app, "GET", "/devproxy/api/knowledge", None, None).await;
        assert_eq!(listed["patterns"].as_array().unwrap().last().unwrap()["id"], "hmr_socket");
    }

    #[tokio::test]
    async fn invalid_regex_is_rejected() {
        let h = Harness::new(vec![Ok(AuditReport::empty("u"))]).await;
        let app = app(h.state.clone());
        let before = h.state.knowledge().len();
        let pattern = json!({
            "id": "broken",
            "title": "Broken",
            "signals": [{"scope": "console", "regex": "(unclosed"}]
        });
        let (status, resp) = call(&app, "POST", "/devproxy/api/knowledge", Some(pattern), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(resp["title"], "Invalid Pattern");
        assert_eq!(h.state.knowledge().len(), before);
    }
}
