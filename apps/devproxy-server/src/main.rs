use axum::http::HeaderMap;
use serde_json::json;
use std::{net::SocketAddr, time::Duration};
use tracing::{error, info};

mod access_log;
mod api;
mod app_state;
mod audit;
mod bootstrap;
mod config;
mod openapi;
mod overrides;
mod probe;
mod remediation;
mod router;
mod session;
mod sessions;
mod tasks;
#[cfg(test)]
mod test_support;

pub(crate) use app_state::AppState;

#[tokio::main]
async fn main() {
    devproxy_otel::init();

    let settings = match config::Settings::load() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let http_cfg = match bootstrap::http_config(&settings) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(2);
        }
    };
    let bootstrap::BootstrapOutput {
        router,
        state,
        background_tasks,
    } = match bootstrap::build(settings).await {
        Ok(out) => out,
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(2);
        }
    };

    let app = bootstrap::attach_http_layers(router, state.clone(), http_cfg.concurrency_limit);
    let listener = match tokio::net::TcpListener::bind(http_cfg.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: bind {}: {err}", http_cfg.addr);
            std::process::exit(2);
        }
    };
    info!(addr = %http_cfg.addr, base = %state.settings().api_base_path, "listening");

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(err) = server.await {
        error!("http server exited with error: {err}");
    }

    info!("stopping heal sessions");
    state.sessions().shutdown(Duration::from_secs(5)).await;
    state.hub().thoughts.emit(
        devproxy_topics::TOPIC_SERVICE_STOP,
        "Dev proxy assistant stopped",
        json!({}),
    );
    info!("shutting down background tasks");
    background_tasks
        .shutdown_with_grace(Duration::from_secs(5))
        .await;
}

async fn shutdown_signal() {
    info!("shutdown signal listener active");
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = term.recv() => {},
                }
            }
            Err(err) => {
                error!(%err, "failed to install SIGTERM handler; waiting for ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}

/// Admin surfaces are open when no token is configured; otherwise the token must
/// arrive as `Authorization: Bearer` or `X-Devproxy-Admin`.
pub(crate) fn admin_ok(headers: &HeaderMap, token: Option<&str>) -> bool {
    let Some(expected) = token.filter(|t| !t.is_empty()) else {
        return true;
    };
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            headers
                .get("X-Devproxy-Admin")
                .and_then(|h| h.to_str().ok())
        });
    let Some(presented) = presented else {
        return false;
    };
    fn ct_eq(a: &[u8], b: &[u8]) -> bool {
        if a.len() != b.len() {
            return false;
        }
        let mut diff: u8 = 0;
        for i in 0..a.len() {
            diff |= a[i] ^ b[i];
        }
        diff == 0
    }
    ct_eq(expected.as_bytes(), presented.trim().as_bytes())
}
