use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use parking_lot::RwLock;
use tracing::info;

use devproxy_core::knowledge::PatternSpec;
use devproxy_core::{KnowledgeBase, KnowledgeError, RouteTopology, TopologyError};
use devproxy_events::Hub;

use crate::audit::{AuditClient, Auditor};
use crate::config::Settings;
use crate::overrides::{Overrides, OverridesStore};
use crate::probe::{HttpProbe, UpstreamProbe};
use crate::remediation::{CommandEngine, Executor, ProxyEngine};
use crate::sessions::SessionRegistry;

/// How long a clean audit lets a heal request short-circuit to "already healthy".
pub(crate) const CLEAN_AUDIT_TTL: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub(crate) struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    settings: Settings,
    hub: Hub,
    topology: RwLock<Arc<RouteTopology>>,
    knowledge: RwLock<Arc<KnowledgeBase>>,
    overrides: OverridesStore,
    sessions: SessionRegistry,
    auditor: Arc<dyn Auditor>,
    probe: Arc<dyn UpstreamProbe>,
    executor: Executor,
    clean_audits: moka::future::Cache<String, ()>,
}

impl AppState {
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn hub(&self) -> &Hub {
        &self.inner.hub
    }

    pub fn topology(&self) -> Arc<RouteTopology> {
        self.inner.topology.read().clone()
    }

    pub fn set_topology(&self, topology: RouteTopology) {
        *self.inner.topology.write() = Arc::new(topology);
    }

    /// Re-parse the route sources and re-apply persisted overrides.
    pub async fn refresh_topology(&self) -> Result<Arc<RouteTopology>, TopologyError> {
        let overrides = self.inner.overrides.snapshot().await;
        let topology = Arc::new(load_topology(&self.inner.settings, &overrides)?);
        *self.inner.topology.write() = topology.clone();
        Ok(topology)
    }

    pub fn knowledge(&self) -> Arc<KnowledgeBase> {
        self.inner.knowledge.read().clone()
    }

    /// Register a pattern; `Ok(false)` when the id was already known.
    pub fn register_pattern(&self, spec: PatternSpec) -> Result<bool, KnowledgeError> {
        let mut guard = self.inner.knowledge.write();
        let mut next = (**guard).clone();
        let added = next.register_spec(spec)?;
        if added {
            *guard = Arc::new(next);
        }
        Ok(added)
    }

    pub fn overrides(&self) -> &OverridesStore {
        &self.inner.overrides
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.inner.sessions
    }

    pub fn auditor(&self) -> &dyn Auditor {
        self.inner.auditor.as_ref()
    }

    pub fn probe(&self) -> &dyn UpstreamProbe {
        self.inner.probe.as_ref()
    }

    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    pub async fn remember_clean_audit(&self, url: &str) {
        self.inner.clean_audits.insert(url.to_string(), ()).await;
    }

    pub async fn recently_clean(&self, url: &str) -> bool {
        self.inner.clean_audits.get(url).await.is_some()
    }
}

fn load_topology(settings: &Settings, overrides: &Overrides) -> Result<RouteTopology, TopologyError> {
    Ok(RouteTopology::build(&settings.routes_dir)?
        .with_promotions(&overrides.promotions)
        .with_resolutions(&overrides.resolutions))
}

pub(crate) struct AppStateBuilder {
    settings: Settings,
    hub: Hub,
    auditor: Option<Arc<dyn Auditor>>,
    probe: Option<Arc<dyn UpstreamProbe>>,
    engine: Option<Arc<dyn ProxyEngine>>,
    clean_audit_ttl: Duration,
}

impl AppState {
    pub(crate) fn builder(settings: Settings, hub: Hub) -> AppStateBuilder {
        AppStateBuilder {
            settings,
            hub,
            auditor: None,
            probe: None,
            engine: None,
            clean_audit_ttl: CLEAN_AUDIT_TTL,
        }
    }
}

#[allow(dead_code)]
impl AppStateBuilder {
    pub(crate) fn with_auditor(mut self, auditor: Arc<dyn Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub(crate) fn with_probe(mut self, probe: Arc<dyn UpstreamProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub(crate) fn with_engine(mut self, engine: Arc<dyn ProxyEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub(crate) fn with_clean_audit_ttl(mut self, ttl: Duration) -> Self {
        self.clean_audit_ttl = ttl;
        self
    }

    /// Load overrides, topology and knowledge; any failure aborts start-up.
    pub(crate) async fn build(self) -> anyhow::Result<AppState> {
        let settings = self.settings;
        let overrides = OverridesStore::load(&settings.state_dir)
            .context("loading persisted overrides")?;
        let topology = load_topology(&settings, &overrides.snapshot().await)
            .with_context(|| format!("building route topology from {}", settings.routes_dir.display()))?;

        let mut knowledge = KnowledgeBase::with_builtin();
        if let Some(dir) = &settings.knowledge_dir {
            knowledge
                .load_dir(dir)
                .with_context(|| format!("loading knowledge from {}", dir.display()))?;
        }

        let auditor = match self.auditor {
            Some(auditor) => auditor,
            None => Arc::new(AuditClient::new(settings.auditor.clone())),
        };
        let probe = match self.probe {
            Some(probe) => probe,
            None => {
                let auditor_settings = settings.auditor.clone();
                Arc::new(
                    HttpProbe::new(settings.engine.probe_timeout, move |url| {
                        crate::audit::strategy::translate_host(
                            url,
                            &auditor_settings.internal_hosts,
                            &auditor_settings.local_alias,
                        )
                    })
                    .context("building probe client")?,
                )
            }
        };
        let engine = match self.engine {
            Some(engine) => engine,
            None => Arc::new(CommandEngine::new(&settings.engine)),
        };
        let executor = Executor::new(
            settings.routes_dir.clone(),
            settings.bundle_path.clone(),
            engine,
        );
        let clean_audits = moka::future::Cache::builder()
            .max_capacity(1024)
            .time_to_live(self.clean_audit_ttl)
            .build();

        info!(
            routes = topology.declarations().len(),
            conflicts = topology.conflicts().len(),
            patterns = knowledge.len(),
            "state loaded"
        );
        Ok(AppState {
            inner: Arc::new(Inner {
                settings,
                hub: self.hub,
                topology: RwLock::new(Arc::new(topology)),
                knowledge: RwLock::new(Arc::new(knowledge)),
                overrides,
                sessions: SessionRegistry::new(),
                auditor,
                probe,
                executor,
                clean_audits,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use devproxy_core::knowledge::{SignalScope, SignalSpec};
    use devproxy_protocol::AuditReport;

    #[tokio::test]
    async fn registers_patterns_once() {
        let h = Harness::new(vec![Ok(AuditReport::empty("u"))]).await;
        let before = h.state.knowledge().len();
        let spec = PatternSpec {
            id: "hmr_blocked".into(),
            title: "HMR blocked".into(),
            description: String::new(),
            signals: vec![SignalSpec::literal(SignalScope::Console, "[vite] failed to connect to websocket")],
            effects: vec![],
            solutions: vec![],
        };
        assert!(h.state.register_pattern(spec.clone()).unwrap());
        assert!(!h.state.register_pattern(spec).unwrap());
        assert_eq!(h.state.knowledge().len(), before + 1);
    }

    #[tokio::test]
    async fn refresh_picks_up_new_sources() {
        let h = Harness::new(vec![Ok(AuditReport::empty("u"))]).await;
        assert!(h.state.topology().effective_declaration("/docs/").is_none());
        h.write_route("docs.conf", "location /docs/ {\n    proxy_pass http://docs:4000;\n}\n");
        let topology = h.state.refresh_topology().await.unwrap();
        assert!(topology.effective_declaration("/docs/").is_some());
    }

    #[tokio::test]
    async fn clean_audits_expire() {
        let h = Harness::with_clean_ttl(vec![Ok(AuditReport::empty("u"))], Duration::from_millis(50)).await;
        h.state.remember_clean_audit("http://x/").await;
        assert!(h.state.recently_clean("http://x/").await);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!h.state.recently_clean("http://x/").await);
    }
}
