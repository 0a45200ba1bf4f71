use regex::Regex;
use serde::{Deserialize, Serialize};

use devproxy_protocol::AuditReport;

/// Which parts of an audit report a signal inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalScope {
    /// Console error text and uncaught page errors.
    Console,
    /// URLs of failed requests and error responses.
    Network,
    /// Console warning text. Never implied by `Any`.
    Warnings,
    /// `Console` and `Network` together.
    #[default]
    Any,
}

/// Where a piece of evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EvidenceSource {
    ConsoleError,
    PageError,
    ConsoleWarning,
    NetworkFailure,
    HttpIssue,
}

/// Declarative form of a signal as written in knowledge files and API payloads.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalSpec {
    #[serde(default)]
    pub scope: SignalScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,
}

impl SignalSpec {
    pub fn literal(scope: SignalScope, needle: &str) -> Self {
        Self {
            scope,
            literal: Some(needle.to_string()),
            regex: None,
        }
    }

    pub fn regex(scope: SignalScope, pattern: &str) -> Self {
        Self {
            scope,
            literal: None,
            regex: Some(pattern.to_string()),
        }
    }

    /// Compile into a matcher. Exactly one of `literal`/`regex` must be set.
    pub fn compile(&self) -> Result<Signal, String> {
        let matcher = match (&self.literal, &self.regex) {
            (Some(needle), None) => {
                if needle.is_empty() {
                    return Err("literal signal is empty".into());
                }
                Matcher::Literal {
                    needle: needle.clone(),
                    lowered: needle.to_lowercase(),
                }
            }
            (None, Some(pattern)) => {
                Matcher::Regex(Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?)
            }
            (Some(_), Some(_)) => return Err("signal sets both literal and regex".into()),
            (None, None) => return Err("signal needs a literal or a regex".into()),
        };
        Ok(Signal {
            scope: self.scope,
            matcher,
        })
    }
}

#[derive(Debug, Clone)]
pub enum Matcher {
    /// Case-insensitive substring.
    Literal { needle: String, lowered: String },
    Regex(Regex),
}

impl Matcher {
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Literal { lowered, .. } => text.to_lowercase().contains(lowered.as_str()),
            Matcher::Regex(re) => re.is_match(text),
        }
    }
}

/// A compiled detection rule.
#[derive(Debug, Clone)]
pub struct Signal {
    pub scope: SignalScope,
    pub matcher: Matcher,
}

impl Signal {
    /// Human-readable form used in evidence, e.g. `console~"Mixed Content"`.
    pub fn describe(&self) -> String {
        let scope = match self.scope {
            SignalScope::Console => "console",
            SignalScope::Network => "network",
            SignalScope::Warnings => "warnings",
            SignalScope::Any => "any",
        };
        match &self.matcher {
            Matcher::Literal { needle, .. } => format!("{scope}~{needle:?}"),
            Matcher::Regex(re) => format!("{scope}/{}/", re.as_str()),
        }
    }

    /// First report entry in scope that this signal matches.
    pub fn first_match<'r>(&self, report: &'r AuditReport) -> Option<(EvidenceSource, &'r str)> {
        entries(report, self.scope).find(|(_, text)| self.matcher.is_match(text))
    }
}

/// Report entries visible to a scope, in a fixed order.
fn entries(
    report: &AuditReport,
    scope: SignalScope,
) -> impl Iterator<Item = (EvidenceSource, &str)> + '_ {
    let console = matches!(scope, SignalScope::Console | SignalScope::Any);
    let network = matches!(scope, SignalScope::Network | SignalScope::Any);
    let warnings = scope == SignalScope::Warnings;

    let console_errors = report
        .console_errors
        .iter()
        .filter(move |_| console)
        .map(|t| (EvidenceSource::ConsoleError, t.as_str()));
    let page_errors = report
        .page_errors
        .iter()
        .filter(move |_| console)
        .map(|t| (EvidenceSource::PageError, t.as_str()));
    let failures = report
        .network_failures
        .iter()
        .filter(move |_| network)
        .map(|f| (EvidenceSource::NetworkFailure, f.url.as_str()));
    let http = report
        .http_issues
        .iter()
        .filter(move |_| network)
        .map(|h| (EvidenceSource::HttpIssue, h.url.as_str()));
    let warns = report
        .console_warnings
        .iter()
        .filter(move |_| warnings)
        .map(|t| (EvidenceSource::ConsoleWarning, t.as_str()));

    console_errors
        .chain(page_errors)
        .chain(failures)
        .chain(http)
        .chain(warns)
}
