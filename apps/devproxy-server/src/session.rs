//! Audit-heal session: one bounded audit → diagnose → remediate → re-audit
//! cycle for one route, run as a detached task.

use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use utoipa::ToSchema;

use devproxy_core::{MatchedIssue, Solution};
use devproxy_protocol::{Outcome, SessionStatus};
use devproxy_topics as topics;

use crate::app_state::AppState;
use crate::audit::{AuditContext, AuditError, AuditOptions};
use crate::probe::ProbeOutcome;
use crate::remediation::{RemediationContext, RemediationError};

/// When a pass with nothing left to apply ends the session early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub(crate) enum ConvergenceRule {
    /// This pass's matched ids are a subset of (or equal to) the prior pass's.
    #[default]
    SubsetOrEqual,
    /// This pass matched exactly the prior pass's ids.
    Equal,
    /// Never stop early; re-audit until the remediation budget is spent.
    Disabled,
}

impl ConvergenceRule {
    pub fn as_str(self) -> &'static str {
        match self {
            ConvergenceRule::SubsetOrEqual => "subset_or_equal",
            ConvergenceRule::Equal => "equal",
            ConvergenceRule::Disabled => "disabled",
        }
    }

    fn holds(self, prior: &BTreeSet<String>, current: &BTreeSet<String>) -> bool {
        match self {
            ConvergenceRule::SubsetOrEqual => current.is_subset(prior),
            ConvergenceRule::Equal => current == prior,
            ConvergenceRule::Disabled => false,
        }
    }
}

impl FromStr for ConvergenceRule {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "subset_or_equal" | "subset" => Ok(ConvergenceRule::SubsetOrEqual),
            "equal" => Ok(ConvergenceRule::Equal),
            "disabled" | "off" | "none" => Ok(ConvergenceRule::Disabled),
            other => Err(format!("unknown convergence rule `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) enum SessionKind {
    /// Audit, diagnose and remediate.
    Heal,
    /// Audit and diagnose only.
    Audit,
}

/// What a session was asked to do.
#[derive(Debug, Clone)]
pub(crate) struct SessionRequest {
    pub kind: SessionKind,
    pub url: String,
    pub route: Option<String>,
    /// Remediation rounds allowed; zero for audit-only sessions.
    pub max_passes: u32,
    pub timeout: Duration,
    pub wait: Duration,
    pub convergence: ConvergenceRule,
}

/// Observable state of one session.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HealSession {
    pub id: String,
    pub kind: SessionKind,
    pub url: String,
    pub route: Option<String>,
    pub source_file: Option<String>,
    pub pass_index: u32,
    pub max_passes: u32,
    pub status: SessionStatus,
    pub outcome: Option<Outcome>,
    pub applied_solution_ids: Vec<String>,
    /// Matches of the most recent pass.
    #[schema(value_type = Vec<Object>)]
    pub matches: Vec<MatchedIssue>,
    pub summary: Option<String>,
    #[schema(value_type = String, format = DateTime)]
    pub started_at: DateTime<Utc>,
    #[schema(value_type = Option<String>, format = DateTime)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl HealSession {
    pub fn new(id: String, request: &SessionRequest) -> Self {
        Self {
            id,
            kind: request.kind,
            url: request.url.clone(),
            route: request.route.clone(),
            source_file: None,
            pass_index: 0,
            max_passes: request.max_passes,
            status: SessionStatus::Running,
            outcome: None,
            applied_solution_ids: Vec::new(),
            matches: Vec::new(),
            summary: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

pub(crate) type SharedSession = Arc<RwLock<HealSession>>;

struct Verdict {
    status: SessionStatus,
    summary: String,
}

impl Verdict {
    fn new(status: SessionStatus, summary: impl Into<String>) -> Self {
        Self {
            status,
            summary: summary.into(),
        }
    }
}

struct Target {
    route: String,
    source_file: String,
}

struct Driver {
    state: AppState,
    shared: SharedSession,
    request: SessionRequest,
    id: String,
    cancel: CancellationToken,
}

/// Drive a session to a terminal status. Never fails past this boundary: every
/// error becomes a terminal status recorded in the final thought event.
pub(crate) async fn run(
    state: AppState,
    shared: SharedSession,
    request: SessionRequest,
    cancel: CancellationToken,
) -> SessionStatus {
    let id = shared.read().id.clone();
    let driver = Driver {
        state,
        shared,
        request,
        id,
        cancel,
    };
    let verdict = match std::panic::AssertUnwindSafe(driver.drive())
        .catch_unwind()
        .await
    {
        Ok(verdict) => verdict,
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            tracing::error!(session = %driver.id, %detail, "session task panicked");
            Verdict::new(
                SessionStatus::Failed,
                format!("The session stopped unexpectedly: {detail}"),
            )
        }
    };
    driver.finish(verdict)
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string())
}

impl Driver {
    fn emit(&self, kind: &str, message: impl Into<String>, mut details: Value) {
        if let Value::Object(map) = &mut details {
            map.insert("sessionId".into(), Value::String(self.id.clone()));
            if let Some(route) = &self.request.route {
                map.insert("route".into(), Value::String(route.clone()));
            }
        }
        self.state.hub().thoughts.emit(kind, message, details);
    }

    fn activity(&self, message: impl Into<String>) {
        self.state.hub().activity.set(Some(&self.id), message);
    }

    fn cancelled(&self) -> Option<Verdict> {
        self.cancel
            .is_cancelled()
            .then(|| Verdict::new(SessionStatus::Cancelled, "Cancelled before the session finished"))
    }

    fn resolve_target(&self) -> Result<Option<Target>, Verdict> {
        let Some(route) = &self.request.route else {
            if self.request.max_passes > 0 {
                return Err(Verdict::new(
                    SessionStatus::Failed,
                    "A route is required to remediate",
                ));
            }
            return Ok(None);
        };
        let topology = self.state.topology();
        let Some(decl) = topology.effective_declaration(route) else {
            if self.request.max_passes == 0 {
                return Ok(None);
            }
            return Err(Verdict::new(
                SessionStatus::Failed,
                format!("Route {route} is not declared in any route source"),
            ));
        };
        if let Some(conflict) = topology.conflict(route) {
            if !conflict.resolved {
                self.emit(
                    topics::TOPIC_HEAL_WARNING,
                    format!(
                        "{route} is declared by {}; editing the first-seen declaration in {}",
                        conflict.files().join(", "),
                        decl.source_file
                    ),
                    json!({ "files": conflict.files(), "winner": conflict.winner }),
                );
            }
        }
        self.shared.write().source_file = Some(decl.source_file.clone());
        Ok(Some(Target {
            route: route.clone(),
            source_file: decl.source_file.clone(),
        }))
    }

    async fn drive(&self) -> Verdict {
        let target = match self.resolve_target() {
            Ok(target) => target,
            Err(verdict) => return verdict,
        };
        if let Some(v) = self.cancelled() {
            return v;
        }

        let url = self.request.url.as_str();
        self.activity(format!("Checking {url}"));
        let probe = self.state.probe().probe(url).await;
        self.emit(
            topics::TOPIC_HEAL_PROBE,
            match &probe {
                ProbeOutcome::Reachable { status } => format!("{url} answered {status}"),
                ProbeOutcome::Unreachable { reason } => format!("{url} is unreachable: {reason}"),
            },
            json!({ "probe": probe }),
        );
        if !probe.is_reachable() {
            return Verdict::new(
                SessionStatus::Failed,
                format!("The upstream for {url} is not reachable, nothing could be verified"),
            );
        }
        let server_error = probe.is_server_error();

        let opts = AuditOptions {
            timeout: self.request.timeout,
            wait: self.request.wait,
        };
        let mut rounds: u32 = 0;
        let mut prior: Option<(BTreeSet<String>, BTreeSet<String>)> = None;
        loop {
            if let Some(v) = self.cancelled() {
                return v;
            }
            let pass = {
                let mut s = self.shared.write();
                s.pass_index += 1;
                s.pass_index
            };
            self.activity(format!("Auditing {url} (pass {pass})"));
            self.emit(
                topics::TOPIC_HEAL_AUDIT_STARTED,
                format!("Pass {pass}: auditing {url}"),
                json!({ "pass": pass, "timeoutMs": opts.timeout.as_millis() as u64 }),
            );
            let ctx = AuditContext {
                hub: self.state.hub(),
                cancel: &self.cancel,
                owner: Some(&self.id),
            };
            let report = match self.state.auditor().audit(url, &opts, &ctx).await {
                Ok(report) => report,
                Err(AuditError::Cancelled) => {
                    return Verdict::new(SessionStatus::Cancelled, "Cancelled during an audit")
                }
                Err(err) => {
                    return Verdict::new(
                        SessionStatus::Failed,
                        format!("The audit could not complete ({}): {err}", err.kind()),
                    )
                }
            };
            if report.is_clean() {
                self.state.remember_clean_audit(url).await;
            }
            self.emit(
                topics::TOPIC_HEAL_AUDIT_COMPLETED,
                format!("Pass {pass}: {} problem(s) observed", report.problem_count()),
                json!({
                    "pass": pass,
                    "problems": report.problem_count(),
                    "consoleErrors": report.console_errors.len(),
                    "networkFailures": report.network_failures.len(),
                    "httpIssues": report.http_issues.len(),
                }),
            );
            if let Some(v) = self.cancelled() {
                return v;
            }

            self.activity(format!("Diagnosing {url} (pass {pass})"));
            let matches = self.state.knowledge().diagnose(&report);
            let matched: BTreeSet<String> = matches.iter().map(|m| m.pattern_id.clone()).collect();
            let fixable: BTreeSet<String> = matches
                .iter()
                .filter(|m| m.is_proxy_fixable())
                .map(|m| m.pattern_id.clone())
                .collect();
            self.emit(
                topics::TOPIC_HEAL_DIAGNOSED,
                diagnosis_message(pass, &matches),
                json!({
                    "pass": pass,
                    "matched": matched,
                    "proxyFixable": fixable,
                }),
            );
            let applied = {
                let mut s = self.shared.write();
                s.matches = matches.clone();
                s.applied_solution_ids.clone()
            };

            if matches.is_empty() {
                if server_error && applied.is_empty() {
                    return Verdict::new(
                        SessionStatus::AppLevelOnly,
                        format!("{url} renders without known issues but the upstream answered with a server error"),
                    );
                }
                if applied.is_empty() {
                    return Verdict::new(SessionStatus::Healthy, format!("{url} looks healthy"));
                }
                return Verdict::new(
                    SessionStatus::Healed,
                    format!("Applied {} and {url} now audits clean", applied.join(", ")),
                );
            }
            if fixable.is_empty() {
                return Verdict::new(
                    SessionStatus::AppLevelOnly,
                    format!("Application-level issues: {}", titles(&matches)),
                );
            }

            if let Some((_, prior_fixable)) = &prior {
                let new: Vec<&String> = fixable.difference(prior_fixable).collect();
                if !new.is_empty() {
                    warn!(session = %self.id, ?new, "new proxy-fixable issues after remediation");
                    self.emit(
                        topics::TOPIC_HEAL_REGRESSION,
                        format!("Pass {pass} surfaced new issues: {}", join(&new)),
                        json!({ "pass": pass, "new": new }),
                    );
                }
            }

            let unresolved = || {
                matches
                    .iter()
                    .filter(|m| m.is_proxy_fixable())
                    .map(|m| m.title.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let Some(target) = target.as_ref().filter(|_| rounds < self.request.max_passes) else {
                return Verdict::new(
                    SessionStatus::Exhausted,
                    format!("Unresolved proxy issues: {}", unresolved()),
                );
            };

            let pending = pending_solutions(&matches, &applied);
            if pending.is_empty() {
                let converged = match &prior {
                    _ if self.request.convergence == ConvergenceRule::Disabled => false,
                    Some((prior_matched, _)) => self.request.convergence.holds(prior_matched, &matched),
                    None => true,
                };
                if converged {
                    return Verdict::new(
                        SessionStatus::Exhausted,
                        format!("Fixes are in place but these persist: {}", unresolved()),
                    );
                }
                rounds += 1;
                prior = Some((matched, fixable));
                continue;
            }

            if let Some(v) = self.cancelled() {
                return v;
            }
            for solution in pending {
                if let Err(verdict) = self.remediate(target, solution).await {
                    return verdict;
                }
            }
            rounds += 1;
            prior = Some((matched, fixable));
        }
    }

    async fn remediate(&self, target: &Target, solution: &Solution) -> Result<(), Verdict> {
        self.activity(format!("Applying {} to {}", solution.id, target.route));
        self.emit(
            topics::TOPIC_HEAL_REMEDIATING,
            format!("Applying {}: {}", solution.id, solution.description),
            json!({ "solutionId": solution.id, "sourceFile": target.source_file }),
        );
        let topology = self.state.topology();
        let ctx = RemediationContext {
            route: &target.route,
            source_file: &target.source_file,
            resolutions: topology.resolutions(),
        };
        match self.state.executor().apply(solution, ctx).await {
            Ok(result) => {
                self.record_applied(&solution.id);
                self.emit(
                    topics::TOPIC_HEAL_APPLIED,
                    format!("Applied {}", solution.id),
                    json!({ "result": result }),
                );
                Ok(())
            }
            Err(RemediationError::ReloadFailed { detail, applied }) => {
                self.record_applied(&solution.id);
                self.emit(
                    topics::TOPIC_HEAL_WARNING,
                    format!("{} is in place but the engine reload failed: {detail}", solution.id),
                    json!({ "result": applied, "detail": detail }),
                );
                Ok(())
            }
            Err(err) => Err(Verdict::new(
                SessionStatus::Failed,
                format!("Could not apply {}: {err}", solution.id),
            )),
        }
    }

    fn record_applied(&self, solution_id: &str) {
        let mut s = self.shared.write();
        if !s.applied_solution_ids.iter().any(|id| id == solution_id) {
            s.applied_solution_ids.push(solution_id.to_string());
        }
    }

    fn finish(&self, verdict: Verdict) -> SessionStatus {
        let outcome = verdict.status.outcome();
        let snapshot = {
            let mut s = self.shared.write();
            s.status = verdict.status;
            s.outcome = outcome;
            s.summary = Some(verdict.summary.clone());
            s.finished_at = Some(Utc::now());
            s.clone()
        };
        let headline = outcome.map(|o| o.headline()).unwrap_or_default();
        let kind = match (snapshot.kind, verdict.status) {
            (SessionKind::Heal, _) => topics::TOPIC_HEAL_FINISHED,
            (SessionKind::Audit, SessionStatus::Failed | SessionStatus::Cancelled) => {
                topics::TOPIC_AUDIT_FAILED
            }
            (SessionKind::Audit, _) => topics::TOPIC_AUDIT_COMPLETED,
        };
        self.emit(
            kind,
            format!("{headline}. {}", verdict.summary),
            json!({
                "status": verdict.status.as_str(),
                "outcome": outcome.map(|o| o.as_str()),
                "headline": headline,
                "appliedSolutionIds": snapshot.applied_solution_ids,
                "passIndex": snapshot.pass_index,
                "matched": snapshot.matches.iter().map(|m| m.pattern_id.as_str()).collect::<Vec<_>>(),
            }),
        );
        self.state.hub().activity.clear_if_owner(&self.id);
        info!(
            session = %self.id,
            status = verdict.status.as_str(),
            passes = snapshot.pass_index,
            applied = snapshot.applied_solution_ids.len(),
            "session finished"
        );
        verdict.status
    }
}

/// Config-edit solutions of the matches not applied yet, first occurrence wins.
fn pending_solutions<'m>(matches: &'m [MatchedIssue], applied: &[String]) -> Vec<&'m Solution> {
    let mut seen: BTreeSet<&str> = applied.iter().map(String::as_str).collect();
    let mut out = Vec::new();
    for solution in matches.iter().flat_map(MatchedIssue::config_edits) {
        if seen.insert(solution.id.as_str()) {
            out.push(solution);
        }
    }
    out
}

fn diagnosis_message(pass: u32, matches: &[MatchedIssue]) -> String {
    if matches.is_empty() {
        return format!("Pass {pass}: no known issues");
    }
    format!("Pass {pass}: matched {}", titles(matches))
}

fn titles(matches: &[MatchedIssue]) -> String {
    matches
        .iter()
        .map(|m| m.title.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn join(ids: &[&String]) -> String {
    ids.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(", ")
}
