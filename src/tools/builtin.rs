//! Built-in tools installed at process start.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ToolingConfig;
use crate::domain::PrivilegeTier;
use crate::retrieval::Retriever;

use super::registry::{
    RegistryError, SandboxPolicy, ToolContext, ToolHandler, ToolRegistry, ToolSpec,
};

/// Retrieve knowledge base passages relevant to a textual query.
pub struct SearchDocs {
    retriever: Arc<Retriever>,
}

#[async_trait]
impl ToolHandler for SearchDocs {
    async fn run(&self, ctx: ToolContext) -> anyhow::Result<Value> {
        let query = ctx.params.get("query").and_then(Value::as_str);
        let limit = ctx
            .params
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        let Some(query) = query.filter(|q| !q.trim().is_empty()) else {
            return Ok(json!({"matches": [], "degraded": false, "reason": "empty query"}));
        };

        let result = self.retriever.retrieve(query, limit);
        Ok(serde_json::to_value(result)?)
    }
}

/// Return a snapshot of the latest runtime state estimation.
pub struct RuntimeState;

#[async_trait]
impl ToolHandler for RuntimeState {
    async fn run(&self, ctx: ToolContext) -> anyhow::Result<Value> {
        Ok(json!({"state": ctx.state}))
    }
}

/// Queue a structured command for the control collaborator.
pub struct IssueCommand {
    allow_control_commands: bool,
}

#[async_trait]
impl ToolHandler for IssueCommand {
    async fn run(&self, ctx: ToolContext) -> anyhow::Result<Value> {
        if !self.allow_control_commands {
            return Ok(json!({"status": "rejected", "reason": "control commands disabled"}));
        }
        let command = ctx.params.get("command").cloned().unwrap_or(Value::Null);
        Ok(json!({"status": "accepted", "command": command}))
    }
}

/// Build the default registry with the built-in tools.
pub fn builtin_registry(
    config: &ToolingConfig,
    retriever: Arc<Retriever>,
) -> Result<ToolRegistry, RegistryError> {
    let mut registry = ToolRegistry::new();

    registry.register(
        ToolSpec::new(
            "search_docs",
            "Retrieve knowledge base passages relevant to a textual query.",
        )
        .with_timeout_ms(500),
        Arc::new(SearchDocs { retriever }),
    )?;

    registry.register(
        ToolSpec::new(
            "get_runtime_state",
            "Return a snapshot of the latest state estimation.",
        )
        .with_timeout_ms(250)
        .with_sandbox(SandboxPolicy::StateRead),
        Arc::new(RuntimeState),
    )?;

    registry.register(
        ToolSpec::new(
            "issue_command",
            "Queue a structured actuator command via the control stack.",
        )
        .with_tier(PrivilegeTier::Command)
        .with_consent_required()
        .with_timeout_ms(500)
        .with_sandbox(SandboxPolicy::ControlQueue),
        Arc::new(IssueCommand {
            allow_control_commands: config.allow_control_commands,
        }),
    )?;

    Ok(registry)
}
