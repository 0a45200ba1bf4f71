//! Audit client: runs the external headless-browser auditor and normalizes
//! its report. Local execution first, containerized fallback second.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use devproxy_events::Hub;
use devproxy_protocol::AuditReport;
use devproxy_topics as topics;

use crate::config::AuditorSettings;

mod report;
pub(crate) mod strategy;

use report::{parse_output, NavigationError};
use strategy::{Invocation, RunError, StrategyKind};

/// Extra wall-clock allowance on top of `timeout + wait`.
pub(crate) const DEFAULT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AuditOptions {
    pub timeout: Duration,
    pub wait: Duration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum AuditError {
    #[error("{url} is unreachable: {detail}")]
    Unreachable { url: String, detail: String },
    #[error("audit timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("auditor failed: {detail}")]
    ExecutionFailed { detail: String, retryable: bool },
    #[error("audit cancelled")]
    Cancelled,
}

impl AuditError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditError::Unreachable { .. } => "unreachable",
            AuditError::Timeout(_) => "timeout",
            AuditError::ExecutionFailed { .. } => "executionFailed",
            AuditError::Cancelled => "cancelled",
        }
    }
}

/// Per-call observer context.
pub(crate) struct AuditContext<'a> {
    pub hub: &'a Hub,
    pub cancel: &'a CancellationToken,
    /// Session or job id the progress belongs to.
    pub owner: Option<&'a str>,
}

#[async_trait]
pub(crate) trait Auditor: Send + Sync {
    async fn audit(
        &self,
        url: &str,
        opts: &AuditOptions,
        ctx: &AuditContext<'_>,
    ) -> Result<AuditReport, AuditError>;
}

/// Outcome of one strategy attempt.
enum Attempt {
    Done(AuditReport),
    /// Could not start at all; fallback allowed.
    Unavailable(String),
    /// Ran but failed or produced garbage; fallback allowed.
    Failed(String),
    /// Final; never retried with another strategy.
    Fatal(AuditError),
}

pub(crate) struct AuditClient {
    settings: AuditorSettings,
    grace: Duration,
}

impl AuditClient {
    pub fn new(settings: AuditorSettings) -> Self {
        Self {
            settings,
            grace: DEFAULT_GRACE,
        }
    }

    #[cfg(test)]
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    async fn attempt(&self, inv: &Invocation, cancel: &CancellationToken) -> Attempt {
        let bound = inv.hard_bound(self.grace);
        debug!(strategy = inv.kind.as_str(), argv = ?inv.argv, ?bound, "running auditor");
        let output = match strategy::run(inv, bound, cancel).await {
            Ok(output) => output,
            Err(RunError::Spawn(err)) => {
                return match inv.kind {
                    StrategyKind::Local => Attempt::Unavailable(format!("{}: {err}", inv.argv[0])),
                    StrategyKind::Container => Attempt::Fatal(AuditError::ExecutionFailed {
                        detail: format!("container runtime `{}` unavailable: {err}", inv.argv[0]),
                        retryable: true,
                    }),
                };
            }
            Err(RunError::Wait(err)) => return Attempt::Failed(err.to_string()),
            Err(RunError::TimedOut(bound)) => return Attempt::Fatal(AuditError::Timeout(bound)),
            Err(RunError::Cancelled) => return Attempt::Fatal(AuditError::Cancelled),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if inv.kind == StrategyKind::Container && strategy::is_platform_mismatch(&stderr) {
            return Attempt::Fatal(AuditError::ExecutionFailed {
                detail: format!("platform mismatch: {}", tail(&stderr)),
                retryable: false,
            });
        }
        // Auditors commonly exit non-zero when they found problems; a parsable
        // report wins over the exit status.
        match parse_output(&stdout, &inv.url) {
            Ok(parsed) => match parsed.navigation_error {
                Some(NavigationError::Unreachable(detail)) => {
                    Attempt::Fatal(AuditError::Unreachable {
                        url: inv.url.clone(),
                        detail,
                    })
                }
                Some(NavigationError::Timeout(_)) => Attempt::Fatal(AuditError::Timeout(inv.timeout)),
                _ => Attempt::Done(parsed.report),
            },
            Err(parse_err) if output.status.success() => Attempt::Failed(parse_err),
            Err(_) => Attempt::Failed(format!("exit {}: {}", output.status, tail(&stderr))),
        }
    }
}

#[async_trait]
impl Auditor for AuditClient {
    async fn audit(
        &self,
        url: &str,
        opts: &AuditOptions,
        ctx: &AuditContext<'_>,
    ) -> Result<AuditReport, AuditError> {
        let local_failure = match strategy::local_invocation(&self.settings, url, opts) {
            Some(inv) => match self.attempt(&inv, ctx.cancel).await {
                Attempt::Done(report) => return Ok(report),
                Attempt::Fatal(err) => return Err(err),
                Attempt::Unavailable(reason) | Attempt::Failed(reason) => reason,
            },
            None => "local auditor disabled".to_string(),
        };

        let Some(container) = &self.settings.container else {
            return Err(AuditError::ExecutionFailed {
                detail: local_failure,
                retryable: true,
            });
        };
        if ctx.cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }
        let inv = strategy::container_invocation(&self.settings, container, url, opts);
        warn!(reason = %local_failure, platform = %container.platform, "local auditor failed, falling back to container");
        ctx.hub.thoughts.emit(
            topics::TOPIC_AUDIT_FALLBACK,
            format!("Local auditor unavailable, retrying in a {} container", container.platform),
            json!({
                "owner": ctx.owner,
                "reason": local_failure,
                "platform": container.platform,
                "timeoutMs": inv.timeout.as_millis() as u64,
            }),
        );
        match self.attempt(&inv, ctx.cancel).await {
            Attempt::Done(report) => {
                info!(url = %inv.url, "container audit completed");
                Ok(report)
            }
            Attempt::Fatal(err) => Err(err),
            Attempt::Unavailable(reason) | Attempt::Failed(reason) => {
                Err(AuditError::ExecutionFailed {
                    detail: format!("local: {local_failure}; container: {reason}"),
                    retryable: true,
                })
            }
        }
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    let start = trimmed
        .char_indices()
        .rev()
        .nth(399)
        .map(|(i, _)| i)
        .unwrap_or(0);
    trimmed[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::ContainerSettings;
    use std::path::Path;

    fn script(dir: &Path, name: &str, body: &str) -> Vec<String> {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        vec!["sh".into(), path.display().to_string()]
    }

    fn settings(command: Vec<String>) -> AuditorSettings {
        AuditorSettings {
            command,
            internal_hosts: vec!["dev-proxy".into()],
            local_alias: "localhost".into(),
            container: None,
            emulation_multiplier: 2.5,
            emulation_floor: Duration::from_secs(60),
        }
    }

    /// Executable stand-in for a container runtime; it ignores the `run ...` args.
    fn fake_runtime(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("runtime.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn with_container(mut s: AuditorSettings, runtime: String) -> AuditorSettings {
        s.container = Some(ContainerSettings {
            runtime,
            image: "auditor:test".into(),
            platform: "linux/amd64".into(),
            network: Some("devproxy".into()),
        });
        s
    }

    fn opts() -> AuditOptions {
        AuditOptions {
            timeout: Duration::from_millis(200),
            wait: Duration::ZERO,
        }
    }

    async fn run_audit(client: &AuditClient, hub: &Hub, cancel: &CancellationToken) -> Result<AuditReport, AuditError> {
        let ctx = AuditContext {
            hub,
            cancel,
            owner: Some("t"),
        };
        client.audit("http://dev-proxy/app/", &opts(), &ctx).await
    }

    #[tokio::test]
    async fn local_report_is_parsed_after_log_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(
            dir.path(),
            "auditor.sh",
            r#"echo "starting chromium"
echo "url=$1"
echo '{"consoleErrors":["Mixed Content: blocked"]}'
exit 1"#,
        );
        let client = AuditClient::new(settings(cmd));
        let hub = Hub::default();
        let report = run_audit(&client, &hub, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.url, "http://localhost/app/");
        assert_eq!(report.console_errors, vec!["Mixed Content: blocked"]);
        assert!(hub.thoughts.is_empty());
    }

    #[tokio::test]
    async fn falls_back_to_container_when_local_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = fake_runtime(dir.path(), r#"echo '{"consoleErrors":[]}'"#);
        let s = with_container(
            settings(vec![dir.path().join("missing-auditor").display().to_string()]),
            runtime,
        );
        let client = AuditClient::new(s);
        let hub = Hub::default();
        let report = run_audit(&client, &hub, &CancellationToken::new()).await.unwrap();
        assert!(report.is_clean());
        let events = hub.thoughts.drain(None).events;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), Some(topics::TOPIC_AUDIT_FALLBACK));
    }

    #[tokio::test]
    async fn platform_mismatch_is_fatal_and_not_retryable() {
        let dir = tempfile::tempdir().unwrap();
        let local = script(dir.path(), "auditor.sh", "echo 'garbage'\nexit 3");
        let runtime = fake_runtime(
            dir.path(),
            "echo 'exec /usr/bin/node: exec format error' >&2\nexit 1",
        );
        let client = AuditClient::new(with_container(settings(local), runtime));
        let err = run_audit(&client, &Hub::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(
            matches!(err, AuditError::ExecutionFailed { retryable: false, .. }),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn unreachable_navigation_is_not_a_clean_report() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(
            dir.path(),
            "auditor.sh",
            r#"echo '{"navigationError":"net::ERR_CONNECTION_REFUSED at http://localhost/app/"}'"#,
        );
        let client = AuditClient::new(settings(cmd));
        let err = run_audit(&client, &Hub::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unreachable");
    }

    #[tokio::test]
    async fn hard_timeout_kills_the_auditor() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "auditor.sh", "sleep 30");
        let client = AuditClient::new(settings(cmd)).with_grace(Duration::from_millis(50));
        let started = std::time::Instant::now();
        let err = run_audit(&client, &Hub::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_running_audit() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "auditor.sh", "sleep 30");
        let client = AuditClient::new(settings(cmd)).with_grace(Duration::from_secs(30));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            run_audit(&client, &Hub::default(), &cancel),
        )
        .await
        .expect("cancel should be prompt")
        .unwrap_err();
        assert!(matches!(err, AuditError::Cancelled));
    }

    #[test]
    fn tail_keeps_the_end() {
        let long = "x".repeat(1000) + "END";
        let t = tail(&long);
        assert!(t.ends_with("END"));
        assert_eq!(t.chars().count(), 400);
    }
}
