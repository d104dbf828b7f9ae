//! Tool catalogue with typed metadata.
//!
//! The registry is populated at process start from a fixed configuration
//! source and is immutable afterwards; no runtime code injection. Name
//! uniqueness is enforced at registration.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::PrivilegeTier;
use crate::limits::RateLimit;

/// How a tool's side effects are contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxPolicy {
    /// No side effects: computes over its inputs only
    Pure,

    /// Reads runtime state, never writes
    StateRead,

    /// Queues structured commands for the control collaborator
    ControlQueue,

    /// Runs an allowlisted subprocess. Implementations must spawn children
    /// with kill-on-drop so a timed-out call terminates the process.
    Subprocess { allowlist: Vec<String> },
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self::Pure
    }
}

/// Immutable metadata for a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique tool name
    pub name: String,

    /// Human-readable description (also shown to the model)
    pub description: String,

    /// Minimum session tier required to invoke the tool
    #[serde(default)]
    pub permission_tier: PrivilegeTier,

    /// Per-(session, tool) rate limit
    #[serde(default)]
    pub rate_limit: RateLimit,

    /// Hard timeout for one invocation
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Whether an unexpired consent grant is required
    #[serde(default)]
    pub requires_consent: bool,

    /// Side-effect containment policy
    #[serde(default)]
    pub sandbox_policy: SandboxPolicy,
}

fn default_timeout_ms() -> u64 {
    500
}

impl ToolSpec {
    /// Create a spec with informational tier, no consent, and defaults.
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            permission_tier: PrivilegeTier::Informational,
            rate_limit: RateLimit::default(),
            timeout_ms: default_timeout_ms(),
            requires_consent: false,
            sandbox_policy: SandboxPolicy::Pure,
        }
    }

    pub fn with_tier(mut self, tier: PrivilegeTier) -> Self {
        self.permission_tier = tier;
        self
    }

    pub fn with_consent_required(mut self) -> Self {
        self.requires_consent = true;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_sandbox(mut self, policy: SandboxPolicy) -> Self {
        self.sandbox_policy = policy;
        self
    }
}

/// Inputs handed to a tool handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Call parameters
    pub params: serde_json::Value,

    /// Snapshot of runtime state at dispatch time
    pub state: serde_json::Value,
}

/// A callable tool implementation.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn run(&self, ctx: ToolContext) -> anyhow::Result<serde_json::Value>;
}

/// A spec paired with its handler.
pub struct RegisteredTool {
    pub spec: ToolSpec,
    pub handler: Arc<dyn ToolHandler>,
}

/// Registration failures.
#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("tool '{0}' is already registered")]
    Duplicate(String),
}

/// Name-keyed tool catalogue.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Fails on duplicate names.
    pub fn register(
        &mut self,
        spec: ToolSpec,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), RegistryError> {
        if self.tools.contains_key(&spec.name) {
            return Err(RegistryError::Duplicate(spec.name.clone()));
        }
        self.tools
            .insert(spec.name.clone(), RegisteredTool { spec, handler });
        Ok(())
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// All registered specs.
    pub fn specs(&self) -> impl Iterator<Item = &ToolSpec> {
        self.tools.values().map(|t| &t.spec)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopHandler;

    #[async_trait]
    impl ToolHandler for NoopHandler {
        async fn run(&self, _ctx: ToolContext) -> anyhow::Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolSpec::new("echo", "echoes input"), Arc::new(NoopHandler))
            .unwrap();

        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolSpec::new("echo", "echoes input"), Arc::new(NoopHandler))
            .unwrap();

        let result = registry.register(ToolSpec::new("echo", "other"), Arc::new(NoopHandler));
        assert!(matches!(result, Err(RegistryError::Duplicate(name)) if name == "echo"));
    }

    #[test]
    fn test_spec_builder_defaults() {
        let spec = ToolSpec::new("issue_command", "queues a command")
            .with_tier(PrivilegeTier::Command)
            .with_consent_required()
            .with_timeout_ms(250);

        assert_eq!(spec.permission_tier, PrivilegeTier::Command);
        assert!(spec.requires_consent);
        assert_eq!(spec.timeout_ms, 250);
        assert_eq!(spec.sandbox_policy, SandboxPolicy::Pure);
    }
}
