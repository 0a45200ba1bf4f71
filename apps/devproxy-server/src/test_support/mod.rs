use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex as PlMutex;
use std::sync::{Mutex, MutexGuard};

use devproxy_events::Hub;
use devproxy_protocol::AuditReport;

use crate::app_state::{AppState, CLEAN_AUDIT_TTL};
use crate::audit::{AuditContext, AuditError, AuditOptions, Auditor};
use crate::config::{AuditorSettings, EngineSettings, HealSettings, Settings};
use crate::probe::{ProbeOutcome, UpstreamProbe};
use crate::remediation::{EngineError, ProxyEngine};
use crate::session::ConvergenceRule;

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

pub(crate) mod env {
    use super::*;
    use std::collections::HashMap;

    pub(crate) struct EnvGuard {
        _lock: MutexGuard<'static, ()>,
        saved: HashMap<String, Option<String>>,
    }

    pub(crate) fn guard() -> EnvGuard {
        EnvGuard {
            _lock: ENV_LOCK.lock().unwrap_or_else(|p| p.into_inner()),
            saved: HashMap::new(),
        }
    }

    impl EnvGuard {
        fn remember(&mut self, key: &str) {
            self.saved
                .entry(key.to_string())
                .or_insert_with(|| std::env::var(key).ok());
        }

        pub(crate) fn set(&mut self, key: &str, value: impl AsRef<str>) {
            self.remember(key);
            std::env::set_var(key, value.as_ref());
        }

        pub(crate) fn remove(&mut self, key: &str) {
            self.remember(key);
            std::env::remove_var(key);
        }

        pub(crate) fn clear_keys(&mut self, keys: &[&str]) {
            for key in keys {
                self.remove(key);
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain() {
                match value {
                    Some(val) => std::env::set_var(&key, val),
                    None => std::env::remove_var(&key),
                }
            }
        }
    }
}

pub(crate) const APP_ROUTE: &str = "/app/";
pub(crate) const APP_SOURCE: &str = "location /app/ {\n    proxy_pass http://svc:3000;\n}\n";

pub(crate) fn report_with_console(errors: &[&str]) -> AuditReport {
    let mut report = AuditReport::empty("http://localhost/app/");
    report.console_errors = errors.iter().map(|e| e.to_string()).collect();
    report
}

/// Replays scripted results; the last one repeats once the script runs out.
pub(crate) struct ScriptedAuditor {
    script: PlMutex<Vec<Result<AuditReport, AuditError>>>,
    calls: AtomicUsize,
    hold: AtomicBool,
    explode: AtomicBool,
}

impl ScriptedAuditor {
    pub(crate) fn new(script: Vec<Result<AuditReport, AuditError>>) -> Self {
        Self {
            script: PlMutex::new(script),
            calls: AtomicUsize::new(0),
            hold: AtomicBool::new(false),
            explode: AtomicBool::new(false),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Block every audit until its session is cancelled.
    pub(crate) fn hold(&self, on: bool) {
        self.hold.store(on, Ordering::SeqCst);
    }

    /// Panic inside the next audit, as a broken auditor backend would.
    pub(crate) fn explode(&self, on: bool) {
        self.explode.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl Auditor for ScriptedAuditor {
    async fn audit(
        &self,
        _url: &str,
        _opts: &AuditOptions,
        ctx: &AuditContext<'_>,
    ) -> Result<AuditReport, AuditError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.explode.load(Ordering::SeqCst) {
            panic!("auditor backend crashed");
        }
        if self.hold.load(Ordering::SeqCst) {
            ctx.cancel.cancelled().await;
            return Err(AuditError::Cancelled);
        }
        let mut script = self.script.lock();
        match script.len() {
            0 => Ok(AuditReport::empty("http://localhost/app/")),
            1 => script[0].clone(),
            _ => script.remove(0),
        }
    }
}

pub(crate) struct ScriptedProbe {
    outcome: PlMutex<ProbeOutcome>,
}

impl ScriptedProbe {
    pub(crate) fn new(outcome: ProbeOutcome) -> Self {
        Self {
            outcome: PlMutex::new(outcome),
        }
    }

    pub(crate) fn set(&self, outcome: ProbeOutcome) {
        *self.outcome.lock() = outcome;
    }
}

#[async_trait]
impl UpstreamProbe for ScriptedProbe {
    async fn probe(&self, _url: &str) -> ProbeOutcome {
        self.outcome.lock().clone()
    }
}

#[derive(Default)]
pub(crate) struct RecordingEngine {
    validations: AtomicUsize,
    reloads: AtomicUsize,
    fail_validate: AtomicBool,
    fail_reload: AtomicBool,
}

impl RecordingEngine {
    pub(crate) fn fail_validate(&self, on: bool) {
        self.fail_validate.store(on, Ordering::SeqCst);
    }

    pub(crate) fn fail_reload(&self, on: bool) {
        self.fail_reload.store(on, Ordering::SeqCst);
    }

    pub(crate) fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    pub(crate) fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProxyEngine for RecordingEngine {
    async fn validate(&self, _bundle: &std::path::Path) -> Result<(), EngineError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if self.fail_validate.load(Ordering::SeqCst) {
            return Err(EngineError {
                step: "validate",
                detail: "unknown directive \"absolute_redirectt\"".into(),
            });
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), EngineError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(EngineError {
                step: "reload",
                detail: "proxy container is not running".into(),
            });
        }
        Ok(())
    }
}

pub(crate) fn test_settings(root: &std::path::Path) -> Settings {
    Settings {
        bind: "127.0.0.1".into(),
        port: 0,
        api_base_path: "/devproxy/api".into(),
        admin_token: None,
        routes_dir: root.join("routes"),
        bundle_path: root.join("generated/bundle.conf"),
        state_dir: root.join("state"),
        knowledge_dir: None,
        ai_enabled: true,
        ai_model: "test-model".into(),
        auditor: AuditorSettings {
            command: Vec::new(),
            internal_hosts: vec!["dev-proxy".into()],
            local_alias: "localhost".into(),
            container: None,
            emulation_multiplier: 1.0,
            emulation_floor: Duration::ZERO,
        },
        engine: EngineSettings {
            validate_command: Vec::new(),
            reload_command: Vec::new(),
            probe_timeout: Duration::from_secs(1),
        },
        heal: HealSettings {
            max_passes: 3,
            timeout: Duration::from_secs(1),
            wait: Duration::ZERO,
            convergence: ConvergenceRule::default(),
        },
        events_retention: Duration::from_secs(3600),
        events_max: 1000,
    }
}

/// A fully wired state over a temporary routes directory holding `app.conf`.
pub(crate) struct Harness {
    _dir: tempfile::TempDir,
    pub root: PathBuf,
    pub state: AppState,
    pub engine: Arc<RecordingEngine>,
    pub auditor: Arc<ScriptedAuditor>,
    pub probe: Arc<ScriptedProbe>,
}

impl Harness {
    pub(crate) async fn new(script: Vec<Result<AuditReport, AuditError>>) -> Self {
        Self::build(script, CLEAN_AUDIT_TTL, |_| {}).await
    }

    pub(crate) async fn with_clean_ttl(
        script: Vec<Result<AuditReport, AuditError>>,
        ttl: Duration,
    ) -> Self {
        Self::build(script, ttl, |_| {}).await
    }

    pub(crate) async fn with_settings(
        script: Vec<Result<AuditReport, AuditError>>,
        tweak: impl FnOnce(&mut Settings),
    ) -> Self {
        Self::build(script, CLEAN_AUDIT_TTL, tweak).await
    }

    async fn build(
        script: Vec<Result<AuditReport, AuditError>>,
        ttl: Duration,
        tweak: impl FnOnce(&mut Settings),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        std::fs::create_dir_all(root.join("routes")).unwrap();
        std::fs::write(root.join("routes/app.conf"), APP_SOURCE).unwrap();
        let mut settings = test_settings(&root);
        tweak(&mut settings);

        let engine = Arc::new(RecordingEngine::default());
        let auditor = Arc::new(ScriptedAuditor::new(script));
        let probe = Arc::new(ScriptedProbe::new(ProbeOutcome::Reachable { status: 200 }));
        let state = AppState::builder(settings, Hub::default())
            .with_auditor(auditor.clone())
            .with_probe(probe.clone())
            .with_engine(engine.clone())
            .with_clean_audit_ttl(ttl)
            .build()
            .await
            .unwrap();
        Self {
            _dir: dir,
            root,
            state,
            engine,
            auditor,
            probe,
        }
    }

    pub(crate) fn with_probe(self, outcome: ProbeOutcome) -> Self {
        self.probe.set(outcome);
        self
    }

    pub(crate) fn source(&self) -> String {
        std::fs::read_to_string(self.root.join("routes/app.conf")).unwrap()
    }

    pub(crate) fn write_route(&self, name: &str, text: &str) {
        std::fs::write(self.root.join("routes").join(name), text).unwrap();
    }
}
