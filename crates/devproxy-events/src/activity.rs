use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What the service is doing right now, as shown to health pollers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub message: String,
    /// Session or audit id that set the value, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub since: DateTime<Utc>,
}

/// Single process-wide "current activity" value.
///
/// Informational only: overlapping sessions overwrite each other and there is no
/// history. It is not a lock.
#[derive(Clone, Default)]
pub struct ActivityTracker {
    current: Arc<RwLock<Option<Activity>>>,
}

impl ActivityTracker {
    pub fn set(&self, owner: Option<&str>, message: impl Into<String>) {
        *self.current.write() = Some(Activity {
            message: message.into(),
            owner: owner.map(str::to_string),
            since: Utc::now(),
        });
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }

    /// Clear only when the value was last set by `owner`; returns whether it cleared.
    pub fn clear_if_owner(&self, owner: &str) -> bool {
        let mut guard = self.current.write();
        match guard.as_ref() {
            Some(activity) if activity.owner.as_deref() == Some(owner) => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    pub fn current(&self) -> Option<Activity> {
        self.current.read().clone()
    }

    pub fn message(&self) -> Option<String> {
        self.current.read().as_ref().map(|a| a.message.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_writer_wins_and_owner_guarded_clear() {
        let tracker = ActivityTracker::default();
        assert_eq!(tracker.current(), None);
        tracker.set(Some("s1"), "auditing /app/");
        tracker.set(Some("s2"), "auditing /api/");
        assert_eq!(tracker.message().as_deref(), Some("auditing /api/"));
        assert!(!tracker.clear_if_owner("s1"));
        assert!(tracker.current().is_some());
        assert!(tracker.clear_if_owner("s2"));
        assert_eq!(tracker.current(), None);
    }

    #[test]
    fn clones_share_the_value() {
        let tracker = ActivityTracker::default();
        let other = tracker.clone();
        tracker.set(None, "rebuilding bundle");
        assert_eq!(other.message().as_deref(), Some("rebuilding bundle"));
        other.clear();
        assert_eq!(tracker.current(), None);
    }
}
