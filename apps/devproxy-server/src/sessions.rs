//! Registry of in-flight and recently finished sessions, keyed by id.
//!
//! Request handlers only start, read and cancel through it; they never await a
//! session.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use devproxy_topics as topics;

use crate::app_state::AppState;
use crate::session::{self, HealSession, SessionKind, SessionRequest, SharedSession};

/// Finished sessions kept for `GET ai/sessions`.
pub(crate) const RECENT_CAPACITY: usize = 64;

struct LiveSession {
    shared: SharedSession,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Inner {
    live: HashMap<String, LiveSession>,
    recent: VecDeque<SharedSession>,
}

#[derive(Default)]
pub(crate) struct SessionRegistry {
    inner: Mutex<Inner>,
    root: CancellationToken,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a request and run it as a detached task. Returns immediately.
    pub fn start(&self, state: &AppState, request: SessionRequest) -> HealSession {
        let id = uuid::Uuid::new_v4().to_string();
        let session = HealSession::new(id.clone(), &request);
        let shared: SharedSession = Arc::new(RwLock::new(session.clone()));
        let cancel = self.root.child_token();
        self.inner.lock().live.insert(
            id.clone(),
            LiveSession {
                shared: shared.clone(),
                cancel: cancel.clone(),
                handle: None,
            },
        );

        let (kind, message) = match request.kind {
            SessionKind::Heal => (
                topics::TOPIC_HEAL_ACCEPTED,
                format!("Heal accepted for {}", request.url),
            ),
            SessionKind::Audit => (
                topics::TOPIC_AUDIT_STARTED,
                format!("Audit accepted for {}", request.url),
            ),
        };
        state.hub().thoughts.emit(
            kind,
            message,
            json!({
                "sessionId": id,
                "url": request.url,
                "route": request.route,
                "maxPasses": request.max_passes,
                "convergence": request.convergence.as_str(),
            }),
        );
        info!(session = %id, url = %request.url, kind = ?request.kind, "session accepted");

        let task_state = state.clone();
        let task_id = id.clone();
        let handle = tokio::spawn(async move {
            session::run(task_state.clone(), shared, request, cancel).await;
            task_state.sessions().finish(&task_id);
        });
        if let Some(entry) = self.inner.lock().live.get_mut(&id) {
            entry.handle = Some(handle);
        }
        session
    }

    /// Move a session from the live map to the recent list.
    fn finish(&self, id: &str) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.live.remove(id) {
            inner.recent.push_front(entry.shared);
            inner.recent.truncate(RECENT_CAPACITY);
        }
        debug!(session = %id, live = inner.live.len(), "session retired");
    }

    pub fn get(&self, id: &str) -> Option<HealSession> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.live.get(id) {
            return Some(entry.shared.read().clone());
        }
        inner
            .recent
            .iter()
            .find(|s| s.read().id == id)
            .map(|s| s.read().clone())
    }

    /// Live sessions (oldest first) followed by finished ones (newest first).
    pub fn list(&self) -> Vec<HealSession> {
        let inner = self.inner.lock();
        let mut live: Vec<HealSession> = inner.live.values().map(|e| e.shared.read().clone()).collect();
        live.sort_by_key(|s| s.started_at);
        live.extend(inner.recent.iter().map(|s| s.read().clone()));
        live
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Number of sessions still running and of finished ones kept for inspection.
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        (inner.live.len(), inner.recent.len())
    }

    /// `None` when the id is unknown, `Some(false)` when it already finished.
    pub fn cancel(&self, id: &str) -> Option<bool> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.live.get(id) {
            entry.cancel.cancel();
            info!(session = %id, "session cancel requested");
            return Some(true);
        }
        inner
            .recent
            .iter()
            .any(|s| s.read().id == id)
            .then_some(false)
    }

    pub fn cancel_all(&self) -> usize {
        let inner = self.inner.lock();
        for entry in inner.live.values() {
            entry.cancel.cancel();
        }
        inner.live.len()
    }

    /// Cancel everything and wait up to `grace` for the tasks to wind down.
    pub async fn shutdown(&self, grace: Duration) {
        self.root.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .inner
            .lock()
            .live
            .values_mut()
            .filter_map(|e| e.handle.take())
            .collect();
        if handles.is_empty() {
            return;
        }
        let waiting = handles.len();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, futures_util::future::join_all(handles)).await;
        if joined.is_err() {
            for abort in aborts {
                abort.abort();
            }
        }
        info!(sessions = waiting, clean = joined.is_ok(), "sessions shut down");
    }
}
