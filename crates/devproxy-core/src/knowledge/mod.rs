//! Issue knowledge base and the diagnosis matcher that scores audit reports
//! against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use devproxy_protocol::AuditReport;

mod builtin;
mod signal;

pub use builtin::builtin_patterns;
pub use signal::{EvidenceSource, Matcher, Signal, SignalScope, SignalSpec};

#[derive(Debug, thiserror::Error)]
pub enum KnowledgeError {
    #[error("pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("failed to parse {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SolutionKind {
    /// Mutates proxy configuration through the remediation executor.
    ConfigEdit,
    /// Advice for the operator; never mutates state.
    Recommendation,
}

/// A declarative change to the directives of one `location` block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DirectiveEdit {
    /// Make sure `directive args...;` is present with exactly these args.
    Ensure {
        directive: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Drop the directive (only the one with this first argument, when given).
    Remove {
        directive: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_arg: Option<String>,
    },
}

impl DirectiveEdit {
    pub fn directive(&self) -> &str {
        match self {
            DirectiveEdit::Ensure { directive, .. } | DirectiveEdit::Remove { directive, .. } => {
                directive
            }
        }
    }

    /// Substitute `{route}` and `{route_trimmed}` placeholders.
    pub fn render(&self, route: &str) -> DirectiveEdit {
        let trimmed = if route.len() > 1 {
            route.trim_end_matches('/')
        } else {
            route
        };
        let fill = |s: &str| s.replace("{route_trimmed}", trimmed).replace("{route}", route);
        match self {
            DirectiveEdit::Ensure { directive, args } => DirectiveEdit::Ensure {
                directive: directive.clone(),
                args: args.iter().map(|a| fill(a)).collect(),
            },
            DirectiveEdit::Remove {
                directive,
                first_arg,
            } => DirectiveEdit::Remove {
                directive: directive.clone(),
                first_arg: first_arg.as_deref().map(fill),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Solution {
    pub id: String,
    pub description: String,
    pub kind: SolutionKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub edits: Vec<DirectiveEdit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
}

impl Solution {
    pub fn is_config_edit(&self) -> bool {
        self.kind == SolutionKind::ConfigEdit
    }
}

/// Declarative issue pattern as stored in knowledge files and accepted over the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub signals: Vec<SignalSpec>,
    #[serde(default)]
    pub effects: Vec<String>,
    #[serde(default)]
    pub solutions: Vec<Solution>,
}

/// A registered pattern with its signals compiled once.
#[derive(Debug, Clone)]
pub struct IssuePattern {
    pub spec: PatternSpec,
    signals: Vec<Signal>,
}

impl IssuePattern {
    pub fn compile(spec: PatternSpec) -> Result<Self, KnowledgeError> {
        let invalid = |reason: String| KnowledgeError::InvalidPattern {
            pattern: spec.id.clone(),
            reason,
        };
        if spec.id.trim().is_empty() {
            return Err(invalid("id is empty".into()));
        }
        if spec.signals.is_empty() {
            return Err(invalid("no detection signals".into()));
        }
        let signals = spec
            .signals
            .iter()
            .enumerate()
            .map(|(i, s)| s.compile().map_err(|e| invalid(format!("signal {i}: {e}"))))
            .collect::<Result<Vec<_>, _>>()?;
        for solution in &spec.solutions {
            if solution.is_config_edit() && solution.edits.is_empty() {
                return Err(invalid(format!(
                    "solution `{}` is a config edit without edits",
                    solution.id
                )));
            }
            if !solution.is_config_edit() && !solution.edits.is_empty() {
                return Err(invalid(format!(
                    "recommendation `{}` must not carry edits",
                    solution.id
                )));
            }
        }
        Ok(Self { spec, signals })
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    fn evaluate(&self, report: &AuditReport) -> Option<MatchedIssue> {
        let evidence: Vec<Evidence> = self
            .signals
            .iter()
            .filter_map(|signal| {
                signal.first_match(report).map(|(source, text)| Evidence {
                    source,
                    text: text.to_string(),
                    signal: signal.describe(),
                })
            })
            .collect();
        if evidence.is_empty() {
            return None;
        }
        Some(MatchedIssue {
            pattern_id: self.spec.id.clone(),
            title: self.spec.title.clone(),
            effects: self.spec.effects.clone(),
            solutions: self.spec.solutions.clone(),
            evidence,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evidence {
    pub source: EvidenceSource,
    pub text: String,
    pub signal: String,
}

/// One pattern that matched an audit report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedIssue {
    pub pattern_id: String,
    pub title: String,
    pub effects: Vec<String>,
    pub solutions: Vec<Solution>,
    pub evidence: Vec<Evidence>,
}

impl MatchedIssue {
    /// Has at least one config-edit solution.
    pub fn is_proxy_fixable(&self) -> bool {
        self.solutions.iter().any(Solution::is_config_edit)
    }

    /// Only recommendations: the problem lives in the application.
    pub fn is_app_level(&self) -> bool {
        !self.is_proxy_fixable()
    }

    pub fn config_edits(&self) -> impl Iterator<Item = &Solution> {
        self.solutions.iter().filter(|s| s.is_config_edit())
    }

    pub fn recommendations(&self) -> impl Iterator<Item = &Solution> {
        self.solutions.iter().filter(|s| !s.is_config_edit())
    }
}

#[derive(Debug, Deserialize)]
struct KnowledgeFile {
    #[serde(default)]
    pattern: Vec<PatternSpec>,
}

/// Append-only registry of issue patterns.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeBase {
    patterns: Vec<Arc<IssuePattern>>,
}

impl KnowledgeBase {
    pub fn new() -> Self {
        Self::default()
    }

    /// A base holding the built-in patterns.
    pub fn with_builtin() -> Self {
        let mut kb = Self::new();
        for pattern in builtin_patterns() {
            kb.register(pattern.clone());
        }
        kb
    }

    /// Add a pattern. Returns false (and changes nothing) when the id is known.
    pub fn register(&mut self, pattern: IssuePattern) -> bool {
        if self.get(pattern.id()).is_some() {
            debug!(pattern = %pattern.id(), "pattern already registered");
            return false;
        }
        self.patterns.push(Arc::new(pattern));
        true
    }

    pub fn register_spec(&mut self, spec: PatternSpec) -> Result<bool, KnowledgeError> {
        Ok(self.register(IssuePattern::compile(spec)?))
    }

    pub fn get(&self, id: &str) -> Option<&IssuePattern> {
        self.patterns.iter().find(|p| p.id() == id).map(Arc::as_ref)
    }

    pub fn patterns(&self) -> impl Iterator<Item = &IssuePattern> {
        self.patterns.iter().map(Arc::as_ref)
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Every pattern with at least one matching signal, in registration order.
    pub fn diagnose(&self, report: &AuditReport) -> Vec<MatchedIssue> {
        self.patterns
            .iter()
            .filter_map(|p| p.evaluate(report))
            .collect()
    }

    /// Register every pattern from the `*.toml` files in `dir`, in file-name order.
    /// A file with any invalid pattern is rejected as a whole.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, KnowledgeError> {
        let entries = std::fs::read_dir(dir).map_err(|source| KnowledgeError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
            .collect();
        files.sort();
        let mut added = 0;
        for path in files {
            let text = std::fs::read_to_string(&path).map_err(|source| KnowledgeError::Io {
                path: path.clone(),
                source,
            })?;
            let patterns = parse_patterns(&text, &path.display().to_string())?;
            for pattern in patterns {
                if self.register(pattern) {
                    added += 1;
                }
            }
        }
        info!(dir = %dir.display(), added, total = self.len(), "knowledge patterns loaded");
        Ok(added)
    }
}

/// Parse and compile every `[[pattern]]` table of a knowledge file.
pub fn parse_patterns(text: &str, origin: &str) -> Result<Vec<IssuePattern>, KnowledgeError> {
    let file: KnowledgeFile = toml::from_str(text).map_err(|source| KnowledgeError::Parse {
        origin: origin.to_string(),
        source,
    })?;
    file.pattern.into_iter().map(IssuePattern::compile).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use devproxy_protocol::NetworkFailure;

    fn report_with(console: &[&str]) -> AuditReport {
        let mut r = AuditReport::empty("http://localhost/app/");
        r.console_errors = console.iter().map(|s| s.to_string()).collect();
        r
    }

    fn recommendation_only(id: &str, needle: &str) -> PatternSpec {
        PatternSpec {
            id: id.into(),
            title: id.into(),
            description: String::new(),
            signals: vec![SignalSpec::literal(SignalScope::Console, needle)],
            effects: vec![],
            solutions: vec![Solution {
                id: format!("{id}_advice"),
                description: "look at the app".into(),
                kind: SolutionKind::Recommendation,
                edits: vec![],
                steps: vec!["check logs".into()],
            }],
        }
    }

    #[test]
    fn builtins_register_in_order() {
        let kb = KnowledgeBase::with_builtin();
        let ids: Vec<&str> = kb.patterns().map(IssuePattern::id).collect();
        assert_eq!(
            ids,
            vec![
                "mixed_content",
                "redirect_loop",
                "broken_asset_paths",
                "websocket_upgrade",
                "cors_blocked",
                "app_runtime_error"
            ]
        );
        for p in kb.patterns() {
            for s in &p.spec.solutions {
                assert!(s.is_config_edit() != s.edits.is_empty(), "{}", s.id);
            }
        }
    }

    #[test]
    fn register_is_idempotent_by_id() {
        let mut kb = KnowledgeBase::with_builtin();
        let before = kb.len();
        let mut dup = recommendation_only("mixed_content", "anything");
        dup.title = "replacement".into();
        assert!(!kb.register_spec(dup).unwrap());
        assert_eq!(kb.len(), before);
        assert_eq!(kb.get("mixed_content").unwrap().spec.title, "Mixed content");
        assert!(kb.register_spec(recommendation_only("custom", "boom")).unwrap());
        assert_eq!(kb.len(), before + 1);
    }

    #[test]
    fn diagnose_matches_mixed_content_as_proxy_fixable() {
        let kb = KnowledgeBase::with_builtin();
        let report = report_with(&[
            "Mixed Content: The page at 'https://localhost/app/' was loaded over HTTPS, but requested an insecure resource 'http://localhost/app/login'.",
        ]);
        let matches = kb.diagnose(&report);
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.pattern_id, "mixed_content");
        assert!(m.is_proxy_fixable());
        assert_eq!(
            m.config_edits().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            vec!["fix_absolute_redirect"]
        );
        assert!(!m.evidence.is_empty());
    }

    #[test]
    fn app_level_issues_are_recommendation_only() {
        let kb = KnowledgeBase::with_builtin();
        let report = report_with(&[
            "Access to fetch at 'http://api/' from origin 'http://localhost' has been blocked by CORS policy",
        ]);
        let matches = kb.diagnose(&report);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pattern_id, "cors_blocked");
        assert!(matches[0].is_app_level());
    }

    #[test]
    fn diagnose_is_ordered_and_deterministic() {
        let mut report = report_with(&[
            "Uncaught TypeError: cannot read properties of undefined",
            "Mixed Content: blocked",
        ]);
        report.network_failures.push(NetworkFailure {
            url: "http://localhost/_next/static/chunks/main.js".into(),
            method: None,
            failure: "404".into(),
        });
        let kb = KnowledgeBase::with_builtin();
        let first = kb.diagnose(&report);
        let ids: Vec<&str> = first.iter().map(|m| m.pattern_id.as_str()).collect();
        assert_eq!(ids, vec!["mixed_content", "broken_asset_paths", "app_runtime_error"]);
        // a clone registered at a different time yields the same answer
        let again = kb.clone().diagnose(&report);
        assert_eq!(first, again);
        assert!(kb.diagnose(&AuditReport::empty("http://x/")).is_empty());
    }

    #[test]
    fn render_fills_route_placeholders() {
        let edit = DirectiveEdit::Ensure {
            directive: "proxy_set_header".into(),
            args: vec!["X-Forwarded-Prefix".into(), "{route_trimmed}".into()],
        };
        assert_eq!(
            edit.render("/app/"),
            DirectiveEdit::Ensure {
                directive: "proxy_set_header".into(),
                args: vec!["X-Forwarded-Prefix".into(), "/app".into()],
            }
        );
        let sub = DirectiveEdit::Ensure {
            directive: "sub_filter".into(),
            args: vec!["href=\"/".into(), "href=\"{route}".into()],
        };
        match sub.render("/app/") {
            DirectiveEdit::Ensure { args, .. } => assert_eq!(args[1], "href=\"/app/"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn knowledge_files_load_in_order_and_reject_bad_regex() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("10-extra.toml"),
            r#"
[[pattern]]
id = "chunk_load_failed"
title = "Chunk load failed"
effects = ["Lazy routes fail to render"]
signals = [
  { scope = "console", literal = "ChunkLoadError" },
  { scope = "network", regex = "\\.chunk\\.js$" },
]

[[pattern.solutions]]
id = "strip_prefix"
description = "Forward without the route prefix"
kind = "configEdit"
edits = [{ op = "ensure", directive = "rewrite", args = ["^{route_trimmed}/(.*)$", "/$1", "break"] }]
"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("README.md"), "not knowledge").unwrap();
        let mut kb = KnowledgeBase::new();
        assert_eq!(kb.load_dir(dir.path()).unwrap(), 1);
        let p = kb.get("chunk_load_failed").unwrap();
        assert_eq!(p.signals().len(), 2);
        assert_eq!(p.spec.solutions[0].kind, SolutionKind::ConfigEdit);

        std::fs::write(
            dir.path().join("20-bad.toml"),
            "[[pattern]]\nid = \"bad\"\ntitle = \"Bad\"\nsignals = [{ regex = \"(\" }]\n",
        )
        .unwrap();
        let err = kb.load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, KnowledgeError::InvalidPattern { ref pattern, .. } if pattern == "bad"));
    }
}
