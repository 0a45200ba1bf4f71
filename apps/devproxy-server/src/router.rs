use std::mem;

use axum::{
    handler::Handler,
    routing::{get, post},
    Router,
};

use crate::config::Settings;
use crate::{api, AppState};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Access {
    Public,
    Admin,
}

impl Access {
    fn as_str(self) -> &'static str {
        match self {
            Access::Public => "public",
            Access::Admin => "admin",
        }
    }
}

pub(crate) struct RouterBuilder {
    router: Router<AppState>,
    endpoints: Vec<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            endpoints: Vec::new(),
        }
    }

    fn record(&mut self, method: &str, path: &'static str, access: Access) {
        self.endpoints
            .push(format!("{method} {path} ({})", access.as_str()));
    }

    pub fn route_get<H, T>(&mut self, path: &'static str, handler: H, access: Access) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.record("GET", path, access);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, get(handler));
        self
    }

    pub fn route_post<H, T>(&mut self, path: &'static str, handler: H, access: Access) -> &mut Self
    where
        H: Handler<T, AppState> + Clone + 'static,
        T: Send + 'static,
    {
        self.record("POST", path, access);
        let router = mem::take(&mut self.router);
        self.router = router.route(path, post(handler));
        self
    }

    pub fn build(self) -> (Router<AppState>, Vec<String>) {
        (self.router, self.endpoints)
    }
}

pub(crate) mod paths {
    pub const CONFIG: &str = "/config";
    pub const HEALTHZ: &str = "/healthz";
    pub const OPENAPI: &str = "/openapi.json";
    pub const AI_HEALTH: &str = "/ai/health";
    pub const AI_STATS: &str = "/ai/stats";
    pub const AI_THOUGHTS: &str = "/ai/thoughts";
    pub const AI_THOUGHTS_STREAM: &str = "/ai/thoughts/stream";
    pub const AI_AUDIT_AND_HEAL: &str = "/ai/audit-and-heal";
    pub const AI_AUDIT: &str = "/ai/audit";
    pub const AI_SESSIONS: &str = "/ai/sessions";
    pub const AI_SESSION: &str = "/ai/sessions/{id}";
    pub const AI_SESSION_CANCEL: &str = "/ai/sessions/{id}/cancel";
    pub const AI_CANCEL: &str = "/ai/cancel";
    pub const ROUTES: &str = "/routes";
    pub const OVERRIDES_CONFLICTS: &str = "/overrides/conflicts";
    pub const OVERRIDES_PROMOTE: &str = "/overrides/promote";
    pub const RESOLVE_CONFLICT: &str = "/resolve-conflict";
    pub const KNOWLEDGE: &str = "/knowledge";
}

/// The full HTTP surface: `/config` at the root, everything else under the API base path.
/// Returns the router and a human-readable endpoint index for start-up logging.
pub(crate) fn build_router(settings: &Settings) -> (Router<AppState>, Vec<String>) {
    let mut api = RouterBuilder::new();
    api.route_get(paths::HEALTHZ, api::meta::healthz, Access::Public)
        .route_get(paths::OPENAPI, api::meta::openapi_json, Access::Public)
        .route_get(paths::AI_HEALTH, api::meta::ai_health, Access::Public)
        .route_get(paths::AI_STATS, api::meta::ai_stats, Access::Public)
        .route_get(paths::AI_THOUGHTS, api::events::thoughts, Access::Public)
        .route_get(
            paths::AI_THOUGHTS_STREAM,
            api::events::thoughts_stream,
            Access::Public,
        )
        .route_post(
            paths::AI_AUDIT_AND_HEAL,
            api::heal::audit_and_heal,
            Access::Admin,
        )
        .route_post(paths::AI_AUDIT, api::heal::audit, Access::Admin)
        .route_get(paths::AI_SESSIONS, api::heal::sessions_list, Access::Admin)
        .route_get(paths::AI_SESSION, api::heal::session_get, Access::Admin)
        .route_post(
            paths::AI_SESSION_CANCEL,
            api::heal::session_cancel,
            Access::Admin,
        )
        .route_post(paths::AI_CANCEL, api::heal::cancel_all, Access::Admin)
        .route_get(paths::ROUTES, api::routes::routes, Access::Admin)
        .route_get(
            paths::OVERRIDES_CONFLICTS,
            api::routes::conflicts,
            Access::Public,
        )
        .route_post(paths::OVERRIDES_PROMOTE, api::routes::promote, Access::Admin)
        .route_post(
            paths::RESOLVE_CONFLICT,
            api::routes::resolve_conflict,
            Access::Admin,
        )
        .route_get(paths::KNOWLEDGE, api::knowledge::knowledge_list, Access::Admin)
        .route_post(
            paths::KNOWLEDGE,
            api::knowledge::knowledge_register,
            Access::Admin,
        );
    let (api_router, api_endpoints) = api.build();

    let base = settings.api_base_path.as_str();
    let mut endpoints = vec![format!("GET {} (public)", paths::CONFIG)];
    endpoints.extend(api_endpoints.iter().map(|e| format!("{base}{e}")));

    let root = Router::new().route(paths::CONFIG, get(api::meta::client_config));
    let router = if base.is_empty() {
        root.merge(api_router)
    } else {
        root.nest(base, api_router)
    };
    (router, endpoints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_settings;

    #[test]
    fn endpoints_are_prefixed_with_the_base_path() {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        let (_, endpoints) = build_router(&settings);
        assert_eq!(endpoints[0], "GET /config (public)");
        assert!(endpoints.contains(&"POST /devproxy/api/ai/audit-and-heal (admin)".to_string()));
        assert!(endpoints.contains(&"GET /devproxy/api/overrides/conflicts (public)".to_string()));
        assert!(endpoints.contains(&"GET /devproxy/api/ai/stats (public)".to_string()));
    }

    #[test]
    fn root_base_path_merges_instead_of_nesting() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path());
        settings.api_base_path = String::new();
        let (_, endpoints) = build_router(&settings);
        assert!(endpoints.contains(&"GET /healthz (public)".to_string()));
    }
}
