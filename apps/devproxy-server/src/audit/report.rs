//! Normalization of the auditor's raw JSON output.

use chrono::Utc;
use serde::Deserialize;

use devproxy_protocol::{AuditReport, HttpIssue, NetworkFailure};

/// Navigation failures that mean the page could not be reached at all.
const UNREACHABLE_MARKERS: &[&str] = &[
    "ERR_CONNECTION_REFUSED",
    "ERR_NAME_NOT_RESOLVED",
    "ECONNREFUSED",
    "ENOTFOUND",
];

const TIMEOUT_MARKERS: &[&str] = &["Navigation timeout", "TimeoutError", "ERR_TIMED_OUT"];

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TextEntry {
    Text(String),
    Detailed {
        #[serde(alias = "message")]
        text: String,
    },
}

impl TextEntry {
    fn into_text(self) -> String {
        match self {
            TextEntry::Text(t) | TextEntry::Detailed { text: t } => t,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFailure {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default, alias = "errorText", alias = "error")]
    failure: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHttpIssue {
    url: String,
    status: u16,
    #[serde(default)]
    status_text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Screenshot {
    Path(String),
    Detailed { path: String },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReport {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    console_errors: Vec<TextEntry>,
    #[serde(default)]
    console_warnings: Vec<TextEntry>,
    #[serde(default)]
    page_errors: Vec<TextEntry>,
    #[serde(default)]
    network_failures: Vec<RawFailure>,
    #[serde(default)]
    http_issues: Vec<RawHttpIssue>,
    #[serde(default)]
    screenshots: Vec<Screenshot>,
    #[serde(default, alias = "error")]
    navigation_error: Option<String>,
}

/// How a navigation error should be treated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NavigationError {
    Unreachable(String),
    Timeout(String),
    /// Anything else is kept in the report as a page error.
    Other(String),
}

#[derive(Debug)]
pub(crate) struct ParsedOutput {
    pub report: AuditReport,
    pub navigation_error: Option<NavigationError>,
}

/// Parse auditor stdout. The last line starting with `{` carries the report;
/// when no such line exists the whole output is tried.
pub(crate) fn parse_output(stdout: &str, requested_url: &str) -> Result<ParsedOutput, String> {
    let candidate = stdout
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| l.starts_with('{'))
        .unwrap_or_else(|| stdout.trim());
    if candidate.is_empty() {
        return Err("auditor produced no output".into());
    }
    let raw: RawReport =
        serde_json::from_str(candidate).map_err(|e| format!("unparsable auditor output: {e}"))?;

    let navigation_error = raw.navigation_error.filter(|e| !e.trim().is_empty()).map(|e| {
        if UNREACHABLE_MARKERS.iter().any(|m| e.contains(m)) {
            NavigationError::Unreachable(e)
        } else if TIMEOUT_MARKERS.iter().any(|m| e.contains(m)) {
            NavigationError::Timeout(e)
        } else {
            NavigationError::Other(e)
        }
    });

    let mut page_errors: Vec<String> = raw.page_errors.into_iter().map(TextEntry::into_text).collect();
    if let Some(NavigationError::Other(e)) = &navigation_error {
        page_errors.push(e.clone());
    }

    let report = AuditReport {
        url: raw.url.unwrap_or_else(|| requested_url.to_string()),
        console_errors: raw
            .console_errors
            .into_iter()
            .map(TextEntry::into_text)
            .collect(),
        console_warnings: raw
            .console_warnings
            .into_iter()
            .map(TextEntry::into_text)
            .collect(),
        page_errors,
        network_failures: raw
            .network_failures
            .into_iter()
            .map(|f| NetworkFailure {
                url: f.url,
                method: f.method,
                failure: f.failure.unwrap_or_default(),
            })
            .collect(),
        http_issues: raw
            .http_issues
            .into_iter()
            .map(|h| HttpIssue {
                url: h.url,
                status: h.status,
                status_text: h.status_text,
            })
            .collect(),
        screenshots: raw
            .screenshots
            .into_iter()
            .map(|s| match s {
                Screenshot::Path(p) | Screenshot::Detailed { path: p } => p,
            })
            .collect(),
        captured_at: Utc::now(),
    };
    Ok(ParsedOutput {
        report,
        navigation_error,
    })
}
