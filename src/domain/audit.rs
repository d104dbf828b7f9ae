//! Audit entries for the append-only privileged-action log.
//!
//! Entries are never edited or deleted by the orchestrator; retention and
//! rotation belong to the sink's operator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single record in the append-only audit log.
///
/// Ordering within a session follows the happens-before order of the events
/// recorded; entries from different sessions may interleave.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Unique identifier for this entry
    pub id: Uuid,

    /// When the recorded event occurred
    pub ts: DateTime<Utc>,

    /// Session the event belongs to
    pub session_id: String,

    /// Kind of event recorded
    pub event_kind: AuditKind,

    /// Redacted, structured detail payload (NO secrets)
    pub detail: serde_json::Value,

    /// Time taken in milliseconds, for timed events
    pub duration_ms: Option<u64>,
}

impl AuditEntry {
    /// Create an entry with the current timestamp.
    pub fn new(session_id: impl Into<String>, event_kind: AuditKind, detail: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts: Utc::now(),
            session_id: session_id.into(),
            event_kind,
            detail,
            duration_ms: None,
        }
    }

    /// Attach duration information.
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// Kinds of privileged or state-changing events the core records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// A turn completed and returned a response
    TurnCompleted,

    /// A turn ended in a terminal failure
    TurnFailed,

    /// A turn was cancelled by an external signal
    TurnCancelled,

    /// An intent exceeded the session's privilege tier
    PrivilegeDenied,

    /// The guardrail rejected the intent before any other stage
    GuardrailBlock,

    /// A model route was selected for the turn
    RouteSelected,

    /// A tool invocation finished (any status)
    ToolInvoked,

    /// A consent-requiring tool was invoked without a valid grant
    ConsentRequired,

    /// Generation finished and produced a response
    GenerationCompleted,

    /// Generation failed after exhausting all routes
    GenerationFailed,

    /// A structured action passed re-validation and was forwarded
    ActionForwarded,

    /// A structured action failed re-validation
    ActionRejected,

    /// A consent grant was issued or refreshed
    ConsentGranted,

    /// A consent grant was revoked
    ConsentRevoked,

    /// The session's privilege tier changed
    PrivilegeChanged,

    /// The session was paused
    SessionPaused,

    /// The session was resumed
    SessionResumed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_serialization() {
        let entry = AuditEntry::new(
            "session-1",
            AuditKind::ToolInvoked,
            json!({"tool": "search_docs", "status": "ok"}),
        )
        .with_duration(42);

        let json = serde_json::to_string(&entry).unwrap();
        let parsed: AuditEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_kind, AuditKind::ToolInvoked);
        assert_eq!(parsed.duration_ms, Some(42));
        assert_eq!(parsed.detail["tool"], "search_docs");
    }

    #[test]
    fn test_kind_snake_case_encoding() {
        let encoded = serde_json::to_string(&AuditKind::ConsentRequired).unwrap();
        assert_eq!(encoded, "\"consent_required\"");

        let encoded = serde_json::to_string(&AuditKind::GuardrailBlock).unwrap();
        assert_eq!(encoded, "\"guardrail_block\"");
    }
}
