//! Turn-level data: tool invocation results, stages, and the final result
//! returned to the interface collaborator.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::intent::PrivilegeTier;

/// Outcome status of a single tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    /// Tool ran and produced sanitized output
    Ok,

    /// Policy denied the call (consent, privilege, pause, or rate limit)
    Denied,

    /// The tool exceeded its hard timeout
    Timeout,

    /// The tool ran and failed
    Error,
}

/// Result of one tool invocation. Created per call, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationResult {
    /// Tool that was invoked
    pub tool_name: String,

    /// Outcome status
    pub status: ToolStatus,

    /// Sanitized output (`null` unless status is `ok`)
    pub output: serde_json::Value,

    /// Error or denial reason, if any
    pub error: Option<String>,

    /// Wall-clock duration of the call
    pub duration_ms: u64,

    /// When the call started
    pub started_at: DateTime<Utc>,
}

impl ToolInvocationResult {
    /// Whether the tool ran to completion.
    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }
}

/// Stages of the turn state machine.
///
/// `Failed` and `Cancelled` are terminal and reachable from any
/// non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Received,
    GuardrailCheck,
    Routed,
    Tooling,
    Generating,
    PostProcessing,
    Done,
    Failed,
    Cancelled,
}

impl TurnStage {
    /// Whether the stage is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStage::Done | TurnStage::Failed | TurnStage::Cancelled)
    }
}

/// A command the model emitted, validated and forwarded to the control
/// collaborator. Control performs its own final safety check and owns
/// actuation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredAction {
    /// Action kind (e.g. "navigate", "set_volume")
    pub action_kind: String,

    /// Action parameters as emitted by the model
    pub parameters: serde_json::Value,

    /// Privilege tier the action was accepted under
    pub privilege_tier: PrivilegeTier,
}

/// Token accounting for one generation call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Rough whitespace-based estimate, matching the scripted provider.
    pub fn estimate(prompt: &str, completion: &str) -> Self {
        let prompt_tokens = estimate_tokens(prompt);
        let completion_tokens = estimate_tokens(completion);
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

fn estimate_tokens(text: &str) -> u64 {
    text.split_whitespace().count().max(1) as u64
}

/// Response metadata returned alongside the text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnMetadata {
    /// Model that produced the final text, if generation ran
    pub model: Option<String>,

    /// Per-stage latency breakdown
    pub latency_ms_by_stage: HashMap<String, f64>,

    /// Token usage for the generation call, if generation ran
    pub token_usage: Option<TokenUsage>,

    /// True when tool/retrieval inputs were skipped due to budget or timeout
    pub partial_context: bool,

    /// True when retrieval fell back to lexical-only scoring
    pub retrieval_degraded: bool,

    /// True when the guardrail produced the canned refusal
    pub guardrail_blocked: bool,
}

/// Final result of one turn, returned to the interface collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnResult {
    /// Response text for the user
    pub text: String,

    /// Actions accepted in post-processing and forwarded to control
    pub structured_actions: Vec<StructuredAction>,

    /// Timing, usage, and degradation metadata
    pub metadata: TurnMetadata,
}
