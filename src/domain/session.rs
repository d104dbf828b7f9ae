//! Session state: privilege tier, pause flag, and consent grants.
//!
//! Sessions are explicit values passed through call boundaries; nothing in
//! the core reads ambient global state. The consent ledger owns the live
//! copies and hands out cloned snapshots.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::intent::PrivilegeTier;

/// A session-scoped, possibly time-limited authorization for one tool.
///
/// A grant with no `expires_at` stays valid until explicitly revoked;
/// session end does not implicitly revoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentGrant {
    /// When the grant was issued
    pub granted_at: DateTime<Utc>,

    /// Free-form scope description (e.g. "this conversation")
    pub scope: String,

    /// Expiry instant, if the grant is time-limited
    pub expires_at: Option<DateTime<Utc>>,
}

impl ConsentGrant {
    /// Create a grant, optionally time-limited.
    pub fn new(scope: impl Into<String>, ttl: Option<Duration>) -> Self {
        let granted_at = Utc::now();
        Self {
            granted_at,
            scope: scope.into(),
            expires_at: ttl.map(|d| granted_at + d),
        }
    }

    /// Whether the grant is still valid at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

/// Per-conversation safety state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub id: String,

    /// Current privilege tier
    pub privilege_tier: PrivilegeTier,

    /// When paused, no tool or generation call may be dispatched
    pub paused: bool,

    /// Active consent grants keyed by tool name
    pub consent_grants: HashMap<String, ConsentGrant>,
}

impl Session {
    /// Create a session at the given tier, unpaused, with no grants.
    pub fn new(id: impl Into<String>, tier: PrivilegeTier) -> Self {
        Self {
            id: id.into(),
            privilege_tier: tier,
            paused: false,
            consent_grants: HashMap::new(),
        }
    }

    /// Return the grant for `tool` if one exists and is unexpired at `now`.
    pub fn valid_grant(&self, tool: &str, now: DateTime<Utc>) -> Option<&ConsentGrant> {
        self.consent_grants
            .get(tool)
            .filter(|grant| grant.is_valid_at(now))
    }
}
