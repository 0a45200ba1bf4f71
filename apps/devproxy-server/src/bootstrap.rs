use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::{debug, info, warn};

use devproxy_events::Hub;
use devproxy_topics as topics;

use crate::{
    access_log,
    app_state::AppState,
    config::Settings,
    router::build_router,
    tasks::{spawn_supervised, TaskManager},
};

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

pub(crate) struct BootstrapOutput {
    pub router: axum::Router<AppState>,
    pub state: AppState,
    pub background_tasks: TaskManager,
}

pub(crate) async fn build(settings: Settings) -> anyhow::Result<BootstrapOutput> {
    let hub = Hub::new(settings.events_retention, settings.events_max);
    let (router, endpoints) = build_router(&settings);
    debug!(count = endpoints.len(), "routes registered");
    for endpoint in &endpoints {
        debug!(%endpoint, "endpoint");
    }

    let state = AppState::builder(settings, hub)
        .build()
        .await
        .context("initialise application state")?;

    // Make the served bundle match the sources and saved resolutions before taking traffic.
    let resolutions = state.topology().resolutions().clone();
    match state.executor().rebuild(&resolutions).await {
        Ok(bundle) => info!(
            path = %state.settings().bundle_path.display(),
            changed = bundle.changed,
            "proxy bundle ready"
        ),
        Err(err) => warn!(%err, "initial bundle rebuild failed; serving the previous bundle"),
    }

    let mut background_tasks = TaskManager::new();
    let prune_state = state.clone();
    background_tasks.push(spawn_supervised("thoughts.prune", move || {
        let state = prune_state.clone();
        async move {
            let mut tick = tokio::time::interval(PRUNE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let pruned = state.hub().thoughts.prune_expired();
                if pruned > 0 {
                    debug!(pruned, "expired thought events dropped");
                }
            }
        }
    }));

    state.hub().thoughts.emit(
        topics::TOPIC_SERVICE_START,
        "Dev proxy assistant started",
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "routes": state.topology().declarations().len(),
            "patterns": state.knowledge().len(),
        }),
    );

    Ok(BootstrapOutput {
        router,
        state,
        background_tasks,
    })
}

pub(crate) fn attach_http_layers(
    router: axum::Router<AppState>,
    state: AppState,
    concurrency_limit: usize,
) -> axum::Router<()> {
    use tower::limit::ConcurrencyLimitLayer;
    use tower_http::trace::TraceLayer;

    router
        .with_state::<()>(state)
        .layer(TraceLayer::new_for_http())
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(axum::middleware::from_fn(access_log::access_log_mw))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum HttpConfigError {
    #[error("invalid DEVPROXY_HTTP_MAX_CONC: {0}")]
    InvalidConcurrency(String),
    #[error("invalid DEVPROXY_BIND: {0}")]
    InvalidBind(String),
    #[error("DEVPROXY_BIND={bind} is public and DEVPROXY_ADMIN_TOKEN is not set; refusing to start")]
    MissingAdminToken { bind: String },
}

pub(crate) struct HttpConfig {
    pub addr: std::net::SocketAddr,
    pub concurrency_limit: usize,
}

pub(crate) fn http_config(settings: &Settings) -> Result<HttpConfig, HttpConfigError> {
    let concurrency_limit = std::env::var("DEVPROXY_HTTP_MAX_CONC")
        .ok()
        .map(|raw| {
            raw.parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(HttpConfigError::InvalidConcurrency(raw))
        })
        .transpose()?
        .unwrap_or(256);

    enforce_admin_token_guard(&settings.bind, settings.admin_token.as_deref())?;

    let host = settings.bind.trim();
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    let addr = format!("{host}:{}", settings.port)
        .parse()
        .map_err(|_| HttpConfigError::InvalidBind(settings.bind.clone()))?;

    Ok(HttpConfig {
        addr,
        concurrency_limit,
    })
}

fn enforce_admin_token_guard(bind: &str, token: Option<&str>) -> Result<(), HttpConfigError> {
    let token_set = token.is_some_and(|t| !t.is_empty());
    let bind_lower = bind.trim().to_ascii_lowercase();
    let is_loopback = matches!(
        bind_lower.as_str(),
        "127.0.0.1" | "::1" | "[::1]" | "localhost"
    );
    if !is_loopback && !token_set {
        return Err(HttpConfigError::MissingAdminToken {
            bind: bind.to_string(),
        });
    }
    Ok(())
}
