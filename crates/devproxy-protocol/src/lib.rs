use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// RFC7807-style error payload used at service edges.
#[derive(Debug, Serialize, Deserialize, Clone, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub status: u16,
    pub detail: Option<String>,
    pub instance: Option<String>,
    pub code: Option<String>,
}

impl ProblemDetails {
    pub fn new(status: u16, title: impl Into<String>) -> Self {
        Self {
            kind: "about:blank".into(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
            code: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

// -------- Auditor report --------

/// A request that never completed (DNS failure, refused connection, blocked mixed content...).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkFailure {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub failure: String,
}

/// A response the page received with an error status.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HttpIssue {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub status_text: Option<String>,
}

/// Normalized result of one headless-browser audit of a URL.
///
/// Produced fresh by every audit call and never mutated afterwards.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    pub url: String,
    #[serde(default)]
    pub console_errors: Vec<String>,
    #[serde(default)]
    pub console_warnings: Vec<String>,
    #[serde(default)]
    pub page_errors: Vec<String>,
    #[serde(default)]
    pub network_failures: Vec<NetworkFailure>,
    #[serde(default)]
    pub http_issues: Vec<HttpIssue>,
    #[serde(default)]
    pub screenshots: Vec<String>,
    #[schema(value_type = String, format = DateTime)]
    pub captured_at: DateTime<Utc>,
}

impl AuditReport {
    pub fn empty(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            console_errors: Vec::new(),
            console_warnings: Vec::new(),
            page_errors: Vec::new(),
            network_failures: Vec::new(),
            http_issues: Vec::new(),
            screenshots: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    /// True when the page produced no errors, failed requests, or error responses.
    /// Warnings and screenshots do not count.
    pub fn is_clean(&self) -> bool {
        self.console_errors.is_empty()
            && self.page_errors.is_empty()
            && self.network_failures.is_empty()
            && self.http_issues.is_empty()
    }

    pub fn problem_count(&self) -> usize {
        self.console_errors.len()
            + self.page_errors.len()
            + self.network_failures.len()
            + self.http_issues.len()
    }
}

// -------- Heal sessions --------

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Running,
    Healthy,
    Healed,
    AppLevelOnly,
    Exhausted,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Healthy => "healthy",
            SessionStatus::Healed => "healed",
            SessionStatus::AppLevelOnly => "appLevelOnly",
            SessionStatus::Exhausted => "exhausted",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Running)
    }

    /// User-visible outcome for a terminal status; `None` while running.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            SessionStatus::Running => None,
            SessionStatus::Healthy => Some(Outcome::NothingWrong),
            SessionStatus::Healed => Some(Outcome::Fixed),
            SessionStatus::AppLevelOnly | SessionStatus::Exhausted => {
                Some(Outcome::NeedsAttention)
            }
            SessionStatus::Cancelled | SessionStatus::Failed => Some(Outcome::Unverified),
        }
    }
}

/// The four distinguishable answers a finished session can give.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    NothingWrong,
    Fixed,
    NeedsAttention,
    Unverified,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::NothingWrong => "nothing_wrong",
            Outcome::Fixed => "fixed",
            Outcome::NeedsAttention => "needs_attention",
            Outcome::Unverified => "unverified",
        }
    }

    pub fn headline(&self) -> &'static str {
        match self {
            Outcome::NothingWrong => "Nothing was wrong",
            Outcome::Fixed => "I fixed it",
            Outcome::NeedsAttention => "This needs attention in your application",
            Outcome::Unverified => "I could not verify",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_terminal_status_maps_to_one_outcome() {
        let all = [
            SessionStatus::Healthy,
            SessionStatus::Healed,
            SessionStatus::AppLevelOnly,
            SessionStatus::Exhausted,
            SessionStatus::Cancelled,
            SessionStatus::Failed,
        ];
        for status in all {
            assert!(status.is_terminal());
            assert!(status.outcome().is_some(), "{status:?}");
        }
        assert_eq!(SessionStatus::Running.outcome(), None);
        assert_ne!(
            SessionStatus::Healthy.outcome(),
            SessionStatus::Healed.outcome()
        );
        assert_ne!(
            SessionStatus::AppLevelOnly.outcome(),
            SessionStatus::Failed.outcome()
        );
    }

    #[test]
    fn report_accepts_auditor_camel_case() {
        let raw = serde_json::json!({
            "url": "https://localhost/app/",
            "consoleErrors": ["Mixed Content: blocked"],
            "networkFailures": [{"url": "http://svc:3000/app.js", "failure": "net::ERR_BLOCKED"}],
            "httpIssues": [{"url": "https://localhost/static/x.css", "status": 404}],
            "capturedAt": "2026-01-01T00:00:00Z"
        });
        let report: AuditReport = serde_json::from_value(raw).expect("report");
        assert_eq!(report.console_errors.len(), 1);
        assert!(report.page_errors.is_empty());
        assert_eq!(report.http_issues[0].status, 404);
        assert_eq!(report.problem_count(), 3);
        assert!(!report.is_clean());
    }

    #[test]
    fn status_serializes_camel_case() {
        let v = serde_json::to_value(SessionStatus::AppLevelOnly).unwrap();
        assert_eq!(v, serde_json::json!("appLevelOnly"));
        assert_eq!(SessionStatus::AppLevelOnly.as_str(), "appLevelOnly");
    }
}
