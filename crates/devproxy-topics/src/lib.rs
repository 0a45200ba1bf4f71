//! Canonical kind strings attached to thought events (`details.kind`) and used
//! as SSE event names.
//!
//! Keep this list grouped by subsystem and favor dot.case names.

// Heal sessions
pub const TOPIC_HEAL_ACCEPTED: &str = "heal.accepted";
pub const TOPIC_HEAL_PROBE: &str = "heal.probe";
pub const TOPIC_HEAL_AUDIT_STARTED: &str = "heal.audit.started";
pub const TOPIC_HEAL_AUDIT_COMPLETED: &str = "heal.audit.completed";
pub const TOPIC_HEAL_DIAGNOSED: &str = "heal.diagnosed";
pub const TOPIC_HEAL_REGRESSION: &str = "heal.regression";
pub const TOPIC_HEAL_REMEDIATING: &str = "heal.remediating";
pub const TOPIC_HEAL_APPLIED: &str = "heal.applied";
pub const TOPIC_HEAL_WARNING: &str = "heal.warning";
pub const TOPIC_HEAL_FINISHED: &str = "heal.finished";

// Standalone audits
pub const TOPIC_AUDIT_STARTED: &str = "audit.started";
pub const TOPIC_AUDIT_FALLBACK: &str = "audit.fallback";
pub const TOPIC_AUDIT_COMPLETED: &str = "audit.completed";
pub const TOPIC_AUDIT_FAILED: &str = "audit.failed";

// Topology / overrides
pub const TOPIC_ROUTES_PROMOTED: &str = "routes.promoted";
pub const TOPIC_ROUTES_CONFLICT_RESOLVED: &str = "routes.conflict.resolved";

// Knowledge base
pub const TOPIC_KNOWLEDGE_REGISTERED: &str = "knowledge.registered";

// Service lifecycle
pub const TOPIC_SERVICE_START: &str = "service.start";
pub const TOPIC_SERVICE_STOP: &str = "service.stop";
