use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use once_cell::sync::Lazy;
use sha2::Digest as _;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Clone, Debug, Default)]
struct Cfg {
    enabled: bool,
    sample_n: u64,
    ua_hash: bool,
    trust_forward: bool,
}

impl Cfg {
    fn from_env() -> Self {
        let flag = |key: &str| std::env::var(key).ok().as_deref() == Some("1");
        Self {
            enabled: flag("DEVPROXY_ACCESS_LOG"),
            sample_n: std::env::var("DEVPROXY_ACCESS_SAMPLE_N")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1)
                .max(1),
            ua_hash: flag("DEVPROXY_ACCESS_UA_HASH"),
            trust_forward: flag("DEVPROXY_TRUST_FORWARD_HEADERS"),
        }
    }

    fn sampled(&self, n: u64) -> bool {
        self.sample_n <= 1 || n % self.sample_n == 0
    }
}

static CFG: Lazy<Cfg> = Lazy::new(Cfg::from_env);
static COUNTER: AtomicU64 = AtomicU64::new(0);

fn first_forwarded_ip(headers: &axum::http::HeaderMap) -> Option<String> {
    let v = headers.get("x-forwarded-for")?.to_str().ok()?;
    let ip = v.split(',').next().unwrap_or("").trim();
    if ip.is_empty() {
        return None;
    }
    // strip port
    if let Some((host, port)) = ip.rsplit_once(':') {
        if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) {
            return Some(host.to_string());
        }
    }
    Some(ip.to_string())
}

fn ua_digest(ua: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(ua.as_bytes());
    hex::encode(hasher.finalize())
}

/// One structured line per request on the `http.access` target, when enabled.
pub async fn access_log_mw(req: Request<axum::body::Body>, next: Next) -> Response {
    if !CFG.enabled {
        return next.run(req).await;
    }
    let started = Instant::now();
    let method = req.method().clone();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let peer = req
        .extensions()
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|c| c.0.ip().to_string());
    let remote = if CFG.trust_forward {
        first_forwarded_ip(req.headers()).or(peer)
    } else {
        peer
    };
    let ua_hash = if CFG.ua_hash {
        req.headers()
            .get(axum::http::header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .map(ua_digest)
    } else {
        None
    };

    let res = next.run(req).await;
    let n = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    if !CFG.sampled(n) {
        return res;
    }
    tracing::info!(
        target: devproxy_otel::ACCESS_TARGET,
        method = %method,
        path = %path,
        status = res.status().as_u16(),
        dur_ms = started.elapsed().as_millis() as u64,
        remote = remote.as_deref().unwrap_or("-"),
        ua_hash = ua_hash.as_deref().unwrap_or("-"),
        "request"
    );
    res
}
