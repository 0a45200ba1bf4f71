use utoipa::{OpenApi, ToSchema};

#[allow(dead_code)]
#[derive(ToSchema)]
pub struct HealthOk {
    pub ok: bool,
}

/// Paths are relative to the configured API base path, except `/config`.
#[derive(OpenApi)]
#[openapi(
    info(title = "devproxy", description = "Route diagnosis and self-healing for the local dev proxy"),
    paths(
        crate::api::meta::healthz,
        crate::api::meta::client_config,
        crate::api::meta::ai_health,
        crate::api::meta::ai_stats,
        crate::api::events::thoughts,
        crate::api::events::thoughts_stream,
        crate::api::heal::audit_and_heal,
        crate::api::heal::audit,
        crate::api::heal::sessions_list,
        crate::api::heal::session_get,
        crate::api::heal::session_cancel,
        crate::api::heal::cancel_all,
        crate::api::routes::routes,
        crate::api::routes::conflicts,
        crate::api::routes::promote,
        crate::api::routes::resolve_conflict,
        crate::api::knowledge::knowledge_list,
        crate::api::knowledge::knowledge_register,
    ),
    components(
        schemas(
            HealthOk,
            crate::api::meta::ClientConfig,
            crate::api::meta::AiHealth,
            crate::api::meta::AiStats,
            crate::api::heal::HealRequest,
            crate::api::heal::AuditRequest,
            crate::api::heal::Accepted,
            crate::api::heal::AlreadyHealthy,
            crate::api::routes::GroupView,
            crate::api::routes::PromoteRequest,
            crate::api::routes::ResolveRequest,
            crate::session::HealSession,
            crate::session::SessionKind,
            crate::session::ConvergenceRule,
            devproxy_protocol::ProblemDetails,
            devproxy_protocol::AuditReport,
            devproxy_protocol::SessionStatus,
            devproxy_protocol::Outcome,
        )
    ),
    tags(
        (name = "Meta", description = "Service metadata and health"),
        (name = "Assistant", description = "Audit and heal sessions"),
        (name = "Events", description = "Thought log polling and SSE"),
        (name = "Routes", description = "Route topology, promotions and conflicts"),
        (name = "Knowledge", description = "Issue patterns used for diagnosis")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_lists_every_tag_and_the_heal_schemas() {
        let doc = serde_json::to_value(ApiDoc::openapi()).unwrap();
        let tags: Vec<&str> = doc["tags"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["name"].as_str())
            .collect();
        assert_eq!(tags, ["Meta", "Assistant", "Events", "Routes", "Knowledge"]);
        let schemas = &doc["components"]["schemas"];
        assert!(schemas["HealRequest"].is_object());
        assert!(schemas["HealSession"].is_object());
        assert!(doc["paths"]["/ai/sessions/{id}/cancel"]["post"].is_object());
    }
}
