//! Remediation Executor: applies config-edit solutions to route sources,
//! regenerates the derived bundle, validates it and reloads the engine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::fs as afs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use devproxy_core::Solution;

mod bundle;
mod edit;
mod engine;

pub(crate) use bundle::save_bytes_atomic;
pub(crate) use engine::{CommandEngine, EngineError, ProxyEngine};

#[derive(Debug, Clone, thiserror::Error)]
pub(crate) enum RemediationError {
    #[error("solution `{0}` is a recommendation and cannot be applied")]
    NotApplicable(String),
    #[error("applying failed: {0}")]
    ApplyFailed(String),
    #[error("bundle validation failed, changes rolled back: {0}")]
    ValidationFailed(String),
    /// The change is on disk and validated; only the reload failed.
    #[error("engine reload failed: {detail}")]
    ReloadFailed {
        detail: String,
        applied: Box<AppliedResult>,
    },
}

impl RemediationError {
    pub fn kind(&self) -> &'static str {
        match self {
            RemediationError::NotApplicable(_) => "notApplicable",
            RemediationError::ApplyFailed(_) => "applyFailed",
            RemediationError::ValidationFailed(_) => "validationFailed",
            RemediationError::ReloadFailed { .. } => "reloadFailed",
        }
    }
}

/// Where a solution lands.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemediationContext<'a> {
    pub route: &'a str,
    pub source_file: &'a str,
    pub resolutions: &'a BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BundleOutcome {
    pub digest: String,
    pub changed: bool,
    pub reloaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AppliedResult {
    pub solution_id: String,
    pub source_file: String,
    pub source_changed: bool,
    pub bundle: BundleOutcome,
}

pub(crate) struct Executor {
    routes_dir: PathBuf,
    bundle_path: PathBuf,
    engine: Arc<dyn ProxyEngine>,
    // Read-modify-write of sources and bundle is serialized process-wide.
    lock: Mutex<()>,
}

impl Executor {
    pub fn new(routes_dir: PathBuf, bundle_path: PathBuf, engine: Arc<dyn ProxyEngine>) -> Self {
        Self {
            routes_dir,
            bundle_path,
            engine,
            lock: Mutex::new(()),
        }
    }

    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    /// Apply one config-edit solution. Repeated application is a no-op.
    pub async fn apply(
        &self,
        solution: &Solution,
        ctx: RemediationContext<'_>,
    ) -> Result<AppliedResult, RemediationError> {
        if !solution.is_config_edit() {
            return Err(RemediationError::NotApplicable(solution.id.clone()));
        }
        let _guard = self.lock.lock().await;

        let source_path = self.routes_dir.join(ctx.source_file);
        let original = afs::read_to_string(&source_path)
            .await
            .map_err(|e| apply_failed(&source_path, e))?;
        let edits: Vec<_> = solution.edits.iter().map(|e| e.render(ctx.route)).collect();
        let updated = edit::apply_edits(ctx.source_file, &original, ctx.route, &edits)
            .map_err(|e| RemediationError::ApplyFailed(e.to_string()))?;
        let source_changed = updated != original;
        if source_changed {
            save_bytes_atomic(&source_path, updated.as_bytes())
                .await
                .map_err(|e| apply_failed(&source_path, e))?;
        }

        // Only a failed validation undoes the source edit.
        let bundle = match self.regenerate(ctx.resolutions).await {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(
                    solution = %solution.id,
                    file = ctx.source_file,
                    %err,
                    "bundle regeneration failed; source edit kept"
                );
                return Err(err);
            }
        };
        let mut applied = AppliedResult {
            solution_id: solution.id.clone(),
            source_file: ctx.source_file.to_string(),
            source_changed,
            bundle: BundleOutcome {
                digest: bundle.next.digest.clone(),
                changed: bundle.changed(),
                reloaded: false,
            },
        };
        if !source_changed && !bundle.changed() {
            info!(solution = %solution.id, route = ctx.route, "solution already in place");
            return Ok(applied);
        }

        if let Err(err) = self.write_and_validate(&bundle).await {
            restore_source(&source_path, &original, source_changed).await;
            return Err(err);
        }
        match self.engine.reload().await {
            Ok(()) => {
                applied.bundle.reloaded = true;
                info!(
                    solution = %solution.id,
                    route = ctx.route,
                    file = ctx.source_file,
                    digest = %applied.bundle.digest,
                    "solution applied"
                );
                Ok(applied)
            }
            Err(err) => {
                warn!(solution = %solution.id, %err, "reload failed; keeping validated change");
                Err(RemediationError::ReloadFailed {
                    detail: err.detail,
                    applied: Box::new(applied),
                })
            }
        }
    }

    /// Regenerate the bundle from the current sources, e.g. at start-up or after
    /// a conflict resolution. Validates and reloads only when it changed.
    pub async fn rebuild(
        &self,
        resolutions: &BTreeMap<String, String>,
    ) -> Result<BundleOutcome, RemediationError> {
        let _guard = self.lock.lock().await;
        let bundle = self.regenerate(resolutions).await?;
        let mut outcome = BundleOutcome {
            digest: bundle.next.digest.clone(),
            changed: bundle.changed(),
            reloaded: false,
        };
        if !outcome.changed {
            return Ok(outcome);
        }
        self.write_and_validate(&bundle).await?;
        match self.engine.reload().await {
            Ok(()) => outcome.reloaded = true,
            Err(err) => warn!(%err, "reload after bundle rebuild failed"),
        }
        info!(digest = %outcome.digest, "bundle rebuilt");
        Ok(outcome)
    }

    async fn regenerate(
        &self,
        resolutions: &BTreeMap<String, String>,
    ) -> Result<Regenerated, RemediationError> {
        let previous = match afs::read_to_string(&self.bundle_path).await {
            Ok(text) => Some(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(apply_failed(&self.bundle_path, err)),
        };
        let next = bundle::render_dir(&self.routes_dir, resolutions)
            .await
            .map_err(|e| RemediationError::ApplyFailed(e.to_string()))?;
        Ok(Regenerated { previous, next })
    }

    /// Write the new bundle and validate it; restore the previous bundle on failure.
    async fn write_and_validate(&self, bundle: &Regenerated) -> Result<(), RemediationError> {
        save_bytes_atomic(&self.bundle_path, bundle.next.text.as_bytes())
            .await
            .map_err(|e| apply_failed(&self.bundle_path, e))?;
        let Err(err) = self.engine.validate(&self.bundle_path).await else {
            return Ok(());
        };
        let restored = match &bundle.previous {
            Some(text) => save_bytes_atomic(&self.bundle_path, text.as_bytes()).await,
            None => afs::remove_file(&self.bundle_path).await,
        };
        if let Err(restore_err) = restored {
            warn!(path = %self.bundle_path.display(), %restore_err, "bundle rollback failed");
        }
        Err(RemediationError::ValidationFailed(err.detail))
    }
}

struct Regenerated {
    previous: Option<String>,
    next: bundle::Bundle,
}

impl Regenerated {
    fn changed(&self) -> bool {
        self.previous.as_deref() != Some(self.next.text.as_str())
    }
}

async fn restore_source(path: &Path, original: &str, changed: bool) {
    if !changed {
        return;
    }
    if let Err(err) = save_bytes_atomic(path, original.as_bytes()).await {
        warn!(path = %path.display(), %err, "source rollback failed");
    }
}

fn apply_failed(path: &Path, err: std::io::Error) -> RemediationError {
    RemediationError::ApplyFailed(format!("{}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingEngine;
    use devproxy_core::KnowledgeBase;

    const APP: &str = "location /app/ {\n    proxy_pass http://svc:3000;\n}\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        routes: PathBuf,
        bundle: PathBuf,
        engine: Arc<RecordingEngine>,
        executor: Executor,
    }

    fn fixture(engine: RecordingEngine) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let routes = dir.path().join("routes");
        std::fs::create_dir_all(&routes).unwrap();
        std::fs::write(routes.join("app.conf"), APP).unwrap();
        let bundle = dir.path().join("generated/bundle.conf");
        let engine = Arc::new(engine);
        let executor = Executor::new(routes.clone(), bundle.clone(), engine.clone());
        Fixture {
            _dir: dir,
            routes,
            bundle,
            engine,
            executor,
        }
    }

    fn solution(pattern: &str, index: usize) -> Solution {
        KnowledgeBase::with_builtin()
            .get(pattern)
            .unwrap()
            .spec
            .solutions[index]
            .clone()
    }

    fn ctx<'a>(res: &'a BTreeMap<String, String>) -> RemediationContext<'a> {
        RemediationContext {
            route: "/app/",
            source_file: "app.conf",
            resolutions: res,
        }
    }

    #[tokio::test]
    async fn applies_then_converges_to_a_byte_identical_bundle() {
        let f = fixture(RecordingEngine::default());
        let res = BTreeMap::new();
        let fix = solution("mixed_content", 0);

        let first = f.executor.apply(&fix, ctx(&res)).await.unwrap();
        assert!(first.source_changed && first.bundle.changed && first.bundle.reloaded);
        let source = std::fs::read_to_string(f.routes.join("app.conf")).unwrap();
        assert!(source.contains("absolute_redirect off;"));
        let bundle_once = std::fs::read_to_string(&f.bundle).unwrap();

        let second = f.executor.apply(&fix, ctx(&res)).await.unwrap();
        assert!(!second.source_changed && !second.bundle.changed && !second.bundle.reloaded);
        assert_eq!(second.bundle.digest, first.bundle.digest);
        assert_eq!(std::fs::read_to_string(&f.bundle).unwrap(), bundle_once);
        assert_eq!(f.engine.reloads(), 1);
        assert_eq!(f.engine.validations(), 1);
    }

    #[tokio::test]
    async fn recommendation_is_not_applicable() {
        let f = fixture(RecordingEngine::default());
        let res = BTreeMap::new();
        let err = f
            .executor
            .apply(&solution("cors_blocked", 0), ctx(&res))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "notApplicable");
        assert_eq!(std::fs::read_to_string(f.routes.join("app.conf")).unwrap(), APP);
        assert!(!f.bundle.exists());
        assert_eq!(f.engine.validations(), 0);
    }

    #[tokio::test]
    async fn validation_failure_rolls_back_source_and_bundle() {
        let f = fixture(RecordingEngine::default());
        let res = BTreeMap::new();
        f.executor.rebuild(&res).await.unwrap();
        let bundle_before = std::fs::read_to_string(&f.bundle).unwrap();

        f.engine.fail_validate(true);
        let err = f
            .executor
            .apply(&solution("mixed_content", 0), ctx(&res))
            .await
            .unwrap_err();
        assert!(matches!(err, RemediationError::ValidationFailed(_)));
        assert_eq!(std::fs::read_to_string(f.routes.join("app.conf")).unwrap(), APP);
        assert_eq!(std::fs::read_to_string(&f.bundle).unwrap(), bundle_before);
    }

    #[tokio::test]
    async fn reload_failure_keeps_the_change() {
        let f = fixture(RecordingEngine::default());
        f.engine.fail_reload(true);
        let res = BTreeMap::new();
        let err = f
            .executor
            .apply(&solution("redirect_loop", 0), ctx(&res))
            .await
            .unwrap_err();
        let RemediationError::ReloadFailed { applied, .. } = err else {
            panic!("expected reload failure, got {err:?}");
        };
        assert!(applied.source_changed && !applied.bundle.reloaded);
        let source = std::fs::read_to_string(f.routes.join("app.conf")).unwrap();
        assert!(source.contains("proxy_set_header X-Forwarded-Prefix /app;"));
        assert!(std::fs::read_to_string(&f.bundle)
            .unwrap()
            .contains("X-Forwarded-Prefix"));
    }

    #[tokio::test]
    async fn missing_location_is_apply_failed() {
        let f = fixture(RecordingEngine::default());
        let res = BTreeMap::new();
        let err = f
            .executor
            .apply(
                &solution("mixed_content", 0),
                RemediationContext {
                    route: "/nope/",
                    ..ctx(&res)
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "applyFailed");
    }

    #[tokio::test]
    async fn regeneration_failure_keeps_the_source_edit() {
        let f = fixture(RecordingEngine::default());
        std::fs::create_dir_all(&f.bundle).unwrap();
        let res = BTreeMap::new();
        let err = f
            .executor
            .apply(&solution("mixed_content", 0), ctx(&res))
            .await
            .unwrap_err();
        assert!(matches!(err, RemediationError::ApplyFailed(_)), "{err:?}");
        let source = std::fs::read_to_string(f.routes.join("app.conf")).unwrap();
        assert!(source.contains("absolute_redirect off;"));
        assert_eq!(f.engine.validations(), 0);
        assert_eq!(f.engine.reloads(), 0);
    }

    #[tokio::test]
    async fn rebuild_only_reloads_on_change() {
        let f = fixture(RecordingEngine::default());
        let res = BTreeMap::new();
        assert!(f.executor.rebuild(&res).await.unwrap().reloaded);
        let again = f.executor.rebuild(&res).await.unwrap();
        assert!(!again.changed && !again.reloaded);
        assert_eq!(f.engine.reloads(), 1);
    }
}
