//! Consent and privilege ledger.
//!
//! Owns the live per-session safety state: privilege tier, pause flag, and
//! consent grants. All mutations are synchronous state transitions followed
//! by exactly one audit entry before the call returns. Readers get cloned
//! snapshots, never references into the map, so a revoke issued mid-turn
//! can't tear a reader's view.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use crate::domain::{AuditEntry, AuditKind, PrivilegeTier, ConsentGrant, Session};

use super::audit_log::{AuditSink, AuditSinkError};

/// Per-session consent and privilege state, shared across concurrent turns.
pub struct ConsentLedger {
    sessions: RwLock<HashMap<String, Session>>,
    audit: Arc<dyn AuditSink>,
    default_tier: PrivilegeTier,
    pause_on_start: bool,
}

impl ConsentLedger {
    pub fn new(audit: Arc<dyn AuditSink>, default_tier: PrivilegeTier) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            audit,
            default_tier,
            pause_on_start: false,
        }
    }

    /// Start unseen sessions paused.
    pub fn with_pause_on_start(mut self, pause_on_start: bool) -> Self {
        self.pause_on_start = pause_on_start;
        self
    }

    fn with_session<T>(&self, session_id: &str, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut sessions = self.sessions.write().expect("ledger lock poisoned");
        let session = sessions.entry(session_id.to_string()).or_insert_with(|| {
            let mut s = Session::new(session_id, self.default_tier);
            s.paused = self.pause_on_start;
            s
        });
        f(session)
    }

    /// Consistent snapshot of the session (created at the default tier if
    /// the ledger has not seen it before).
    pub fn snapshot(&self, session_id: &str) -> Session {
        self.with_session(session_id, |s| s.clone())
    }

    /// Whether the session is currently paused. Checked at every stage
    /// boundary of an in-flight turn, not only at turn start.
    pub fn is_paused(&self, session_id: &str) -> bool {
        self.with_session(session_id, |s| s.paused)
    }

    /// Current privilege tier of the session.
    pub fn privilege(&self, session_id: &str) -> PrivilegeTier {
        self.with_session(session_id, |s| s.privilege_tier)
    }

    /// Idempotent upsert: a second grant for the same tool overwrites the
    /// first, leaving exactly one active grant per (session, tool) pair.
    pub async fn grant(
        &self,
        session_id: &str,
        tool_name: &str,
        scope: &str,
        ttl: Option<Duration>,
    ) -> Result<(), AuditSinkError> {
        self.with_session(session_id, |s| {
            s.consent_grants
                .insert(tool_name.to_string(), ConsentGrant::new(scope, ttl));
        });

        info!(session = session_id, tool = tool_name, "Consent granted");
        self.audit
            .append(&AuditEntry::new(
                session_id,
                AuditKind::ConsentGranted,
                json!({
                    "tool": tool_name,
                    "scope": scope,
                    "ttl_ms": ttl.map(|d| d.num_milliseconds()),
                }),
            ))
            .await
    }

    /// Remove the grant. Subsequent executor calls for the tool see the
    /// denial immediately.
    pub async fn revoke(&self, session_id: &str, tool_name: &str) -> Result<(), AuditSinkError> {
        self.with_session(session_id, |s| {
            s.consent_grants.remove(tool_name);
        });

        info!(session = session_id, tool = tool_name, "Consent revoked");
        self.audit
            .append(&AuditEntry::new(
                session_id,
                AuditKind::ConsentRevoked,
                json!({"tool": tool_name}),
            ))
            .await
    }

    /// Change the session's privilege tier.
    pub async fn set_privilege(
        &self,
        session_id: &str,
        tier: PrivilegeTier,
    ) -> Result<(), AuditSinkError> {
        self.with_session(session_id, |s| {
            s.privilege_tier = tier;
        });

        info!(session = session_id, %tier, "Privilege changed");
        self.audit
            .append(&AuditEntry::new(
                session_id,
                AuditKind::PrivilegeChanged,
                json!({"tier": tier.to_string()}),
            ))
            .await
    }

    /// Pause the session. Takes effect before the next tool or generation
    /// call is dispatched, even for an in-flight turn.
    pub async fn pause(&self, session_id: &str) -> Result<(), AuditSinkError> {
        self.with_session(session_id, |s| {
            s.paused = true;
        });

        info!(session = session_id, "Session paused");
        self.audit
            .append(&AuditEntry::new(session_id, AuditKind::SessionPaused, json!({})))
            .await
    }

    /// Resume a paused session.
    pub async fn resume(&self, session_id: &str) -> Result<(), AuditSinkError> {
        self.with_session(session_id, |s| {
            s.paused = false;
        });

        info!(session = session_id, "Session resumed");
        self.audit
            .append(&AuditEntry::new(session_id, AuditKind::SessionResumed, json!({})))
            .await
    }

    /// Drop expired grants for a session. Optional housekeeping; the
    /// executor validates expiry on every call regardless.
    pub fn prune_expired(&self, session_id: &str) {
        let now = Utc::now();
        self.with_session(session_id, |s| {
            s.consent_grants.retain(|_, grant| grant.is_valid_at(now));
        });
    }
}
