use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// Result of the diagnostic-first reachability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub(crate) enum ProbeOutcome {
    Reachable { status: u16 },
    Unreachable { reason: String },
}

impl ProbeOutcome {
    pub fn is_reachable(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { .. })
    }

    pub fn is_server_error(&self) -> bool {
        matches!(self, ProbeOutcome::Reachable { status } if *status >= 500)
    }

    /// Reachable and not answering with a 5xx.
    pub fn is_healthy(&self) -> bool {
        self.is_reachable() && !self.is_server_error()
    }
}

#[async_trait]
pub(crate) trait UpstreamProbe: Send + Sync {
    async fn probe(&self, url: &str) -> ProbeOutcome;
}

/// Plain GET with a short timeout. Self-signed dev certificates are accepted.
pub(crate) struct HttpProbe {
    client: reqwest::Client,
    rewrite: Box<dyn Fn(&str) -> String + Send + Sync>,
}

impl HttpProbe {
    pub fn new(
        timeout: Duration,
        rewrite: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            rewrite: Box::new(rewrite),
        })
    }
}

#[async_trait]
impl UpstreamProbe for HttpProbe {
    async fn probe(&self, url: &str) -> ProbeOutcome {
        let target = (self.rewrite)(url);
        match self.client.get(&target).send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                debug!(url = %target, status, "probe answered");
                ProbeOutcome::Reachable { status }
            }
            Err(err) => {
                let reason = if err.is_timeout() {
                    "timed out".to_string()
                } else if err.is_connect() {
                    format!("connection failed: {err}")
                } else {
                    err.to_string()
                };
                debug!(url = %target, %reason, "probe failed");
                ProbeOutcome::Unreachable { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_classification() {
        assert!(ProbeOutcome::Reachable { status: 200 }.is_healthy());
        assert!(ProbeOutcome::Reachable { status: 404 }.is_healthy());
        let five = ProbeOutcome::Reachable { status: 502 };
        assert!(five.is_reachable() && five.is_server_error() && !five.is_healthy());
        let down = ProbeOutcome::Unreachable {
            reason: "refused".into(),
        };
        assert!(!down.is_reachable() && !down.is_healthy());
    }

    #[tokio::test]
    async fn http_probe_reports_status_and_refusals() {
        use axum::{http::StatusCode, routing::get, Router};

        let app = Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/boom", get(|| async { StatusCode::BAD_GATEWAY }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let probe = HttpProbe::new(Duration::from_secs(2), |u| u.to_string()).unwrap();
        assert_eq!(
            probe.probe(&format!("http://{addr}/ok")).await,
            ProbeOutcome::Reachable { status: 200 }
        );
        assert!(probe
            .probe(&format!("http://{addr}/boom"))
            .await
            .is_server_error());
        server.abort();

        // Nothing listens on port 1.
        let down = probe.probe("http://127.0.0.1:1/").await;
        assert!(!down.is_reachable());
    }
}
