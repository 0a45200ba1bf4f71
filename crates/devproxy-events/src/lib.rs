use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

mod activity;

pub use activity::{Activity, ActivityTracker};

/// Default retention window for thought events.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(15 * 60);
/// Upper bound on retained events regardless of age.
pub const DEFAULT_MAX_EVENTS: usize = 10_000;

/// One unit of progress published by a session or audit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThoughtEvent {
    pub id: u64,
    pub added_at: DateTime<Utc>,
    pub message: String,
    pub details: Value,
}

impl ThoughtEvent {
    /// The `details.kind` tag, when the publisher set one.
    pub fn kind(&self) -> Option<&str> {
        self.details.get("kind").and_then(Value::as_str)
    }
}

/// Result of a cursor drain: everything newer than the cursor plus the newest id.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Drained {
    pub events: Vec<ThoughtEvent>,
    pub latest_id: u64,
}

struct ThoughtLog {
    events: VecDeque<ThoughtEvent>,
    last_id: u64,
}

struct BusInner {
    log: Mutex<ThoughtLog>,
    tx: broadcast::Sender<ThoughtEvent>,
    retention: RwLock<Duration>,
    max_events: usize,
}

/// In-process, time-ordered event queue drained incrementally through a cursor.
///
/// Reads never delete: every poller keeps its own `since` cursor and sees every
/// event published inside the retention window. Ids are assigned under the log
/// lock, so ids and queue order always agree.
#[derive(Clone)]
pub struct ThoughtBus {
    inner: Arc<BusInner>,
}

impl Default for ThoughtBus {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}

impl ThoughtBus {
    pub fn new(retention: Duration) -> Self {
        Self::with_limits(retention, DEFAULT_MAX_EVENTS)
    }

    pub fn with_limits(retention: Duration, max_events: usize) -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            inner: Arc::new(BusInner {
                log: Mutex::new(ThoughtLog {
                    events: VecDeque::new(),
                    last_id: 0,
                }),
                tx,
                retention: RwLock::new(retention),
                max_events: max_events.max(1),
            }),
        }
    }

    pub fn retention(&self) -> Duration {
        *self.inner.retention.read()
    }

    pub fn set_retention(&self, retention: Duration) {
        *self.inner.retention.write() = retention;
    }

    /// Append an event and return its id.
    pub fn publish<T: Serialize>(&self, message: impl Into<String>, details: &T) -> u64 {
        let details =
            serde_json::to_value(details).unwrap_or_else(|_| serde_json::json!({"_ser": "error"}));
        let now = Utc::now();
        let mut log = self.inner.log.lock();
        log.last_id += 1;
        let event = ThoughtEvent {
            id: log.last_id,
            added_at: now,
            message: message.into(),
            details,
        };
        log.events.push_back(event.clone());
        let cutoff = self.cutoff(now);
        prune_locked(&mut log, cutoff, self.inner.max_events);
        // No live subscribers is fine; pollers read the log.
        let _ = self.inner.tx.send(event);
        log.last_id
    }

    /// Publish with a `kind` tag merged into the details object.
    pub fn emit(&self, kind: &str, message: impl Into<String>, details: Value) -> u64 {
        let details = match details {
            Value::Object(mut map) => {
                map.insert("kind".into(), Value::String(kind.to_string()));
                Value::Object(map)
            }
            Value::Null => serde_json::json!({ "kind": kind }),
            other => serde_json::json!({ "kind": kind, "data": other }),
        };
        self.publish(message, &details)
    }

    /// Return every retained event with `id > since` (all retained events when
    /// `since` is `None`) together with the newest id ever published.
    pub fn drain(&self, since: Option<u64>) -> Drained {
        let mut log = self.inner.log.lock();
        let cutoff = self.cutoff(Utc::now());
        prune_locked(&mut log, cutoff, self.inner.max_events);
        let since = since.unwrap_or(0);
        let start = log.events.partition_point(|ev| ev.id <= since);
        Drained {
            events: log.events.range(start..).cloned().collect(),
            latest_id: log.last_id,
        }
    }

    pub fn latest_id(&self) -> u64 {
        self.inner.log.lock().last_id
    }

    pub fn len(&self) -> usize {
        self.inner.log.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ThoughtEvent> {
        self.inner.tx.subscribe()
    }

    /// Drop events older than the retention window. Returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        let cutoff = self.cutoff(Utc::now());
        self.prune_before(cutoff)
    }

    /// Drop events added strictly before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut log = self.inner.log.lock();
        let removed = prune_locked(&mut log, cutoff, self.inner.max_events);
        if removed > 0 {
            tracing::debug!(removed, remaining = log.events.len(), "pruned thought events");
        }
        removed
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let retention = chrono::Duration::from_std(self.retention())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        now - retention
    }
}

fn prune_locked(log: &mut ThoughtLog, cutoff: DateTime<Utc>, max_events: usize) -> usize {
    let mut removed = 0;
    while let Some(front) = log.events.front() {
        if front.added_at < cutoff || log.events.len() > max_events {
            log.events.pop_front();
            removed += 1;
        } else {
            break;
        }
    }
    removed
}

/// Process-scoped observer context handed to every session and audit.
///
/// Constructed once at start-up (or per test) instead of living in globals.
#[derive(Clone, Default)]
pub struct Hub {
    pub thoughts: ThoughtBus,
    pub activity: ActivityTracker,
}

impl Hub {
    pub fn new(retention: Duration, max_events: usize) -> Self {
        Self {
            thoughts: ThoughtBus::with_limits(retention, max_events),
            activity: ActivityTracker::default(),
        }
    }
}
