//! User intents and privilege tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse permission level gating which actions a session may request.
///
/// Ordering matters: `Informational < Command`, so tier checks can use
/// plain comparisons.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTier {
    /// Read-only: questions, retrieval, status queries.
    #[default]
    Informational,

    /// May request side-effecting actions (actuation, system commands).
    Command,
}

impl std::fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrivilegeTier::Informational => write!(f, "informational"),
            PrivilegeTier::Command => write!(f, "command"),
        }
    }
}

impl std::str::FromStr for PrivilegeTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "informational" => Ok(PrivilegeTier::Informational),
            "command" => Ok(PrivilegeTier::Command),
            other => Err(format!("unsupported privilege tier '{}'", other)),
        }
    }
}

/// A single user request entering the orchestrator. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// Unique identifier for this intent
    pub id: Uuid,

    /// Session this intent belongs to
    pub session_id: String,

    /// Raw request text
    pub text: String,

    /// Privilege tier the caller claims to need
    pub declared_privilege: PrivilegeTier,

    /// When the intent was created
    pub timestamp: DateTime<Utc>,

    /// Optional classifier tag attached upstream (e.g. by the interface)
    pub safety_tag: Option<String>,
}

impl Intent {
    /// Create a new informational intent with the current timestamp.
    pub fn new(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            text: text.into(),
            declared_privilege: PrivilegeTier::Informational,
            timestamp: Utc::now(),
            safety_tag: None,
        }
    }

    /// Set the declared privilege tier.
    pub fn with_privilege(mut self, tier: PrivilegeTier) -> Self {
        self.declared_privilege = tier;
        self
    }

    /// Attach an upstream safety tag.
    pub fn with_safety_tag(mut self, tag: impl Into<String>) -> Self {
        self.safety_tag = Some(tag.into());
        self
    }
}
