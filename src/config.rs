//! Runtime configuration for the orchestration core.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variable (AIDE_HOME) for the state directory
//! 2. Config file (YAML, passed explicitly or at $AIDE_HOME/config.yaml)
//! 3. Defaults
//!
//! Every section carries per-field serde defaults so partial config files
//! stay valid as new fields are added.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::PrivilegeTier;
use crate::limits::{BreakerConfig, RetryPolicy};

/// Aggregate runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Model routing policy
    #[serde(default)]
    pub models: ModelRoutingConfig,

    /// Retrieval scoring policy
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Tool orchestration policy
    #[serde(default)]
    pub tooling: ToolingConfig,

    /// Conversation memory store
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Privilege, guardrail, and audit settings
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Shared retry and circuit-breaker settings
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl RuntimeConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse config YAML")
    }
}

/// Resolve the aide state directory ($AIDE_HOME or ~/.aide).
pub fn default_home() -> PathBuf {
    if let Ok(home) = std::env::var("AIDE_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".aide")
}

/// Model routing policy: which model serves which path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoutingConfig {
    /// Default model for normal turns
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Model for latency-sensitive fast-path turns
    #[serde(default = "default_fast_model")]
    pub fast_model: String,

    /// Model for offline-only turns
    #[serde(default = "default_offline_model")]
    pub offline_model: String,

    /// Sampling temperature for the default model
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Output token cap for the default model
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}
fn default_fast_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_offline_model() -> String {
    "mixtral-8x7b".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_output_tokens() -> u32 {
    1024
}

impl Default for ModelRoutingConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            fast_model: default_fast_model(),
            offline_model: default_offline_model(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

/// Retrieval scoring policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Results returned per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Weight of the lexical score in the convex combination
    #[serde(default = "default_lexical_weight")]
    pub lexical_weight: f64,

    /// Weight of the dense similarity score
    #[serde(default = "default_vector_weight")]
    pub vector_weight: f64,

    /// Minimum combined score for a document to be returned
    #[serde(default = "default_min_score")]
    pub min_score: f64,

    /// Lexical prune keeps `top_k * candidate_multiplier` candidates
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,

    /// TTL for ephemeral tool-derived documents, in milliseconds
    #[serde(default = "default_ephemeral_ttl_ms")]
    pub ephemeral_ttl_ms: u64,
}

fn default_top_k() -> usize {
    4
}
fn default_lexical_weight() -> f64 {
    0.35
}
fn default_vector_weight() -> f64 {
    0.65
}
fn default_min_score() -> f64 {
    0.12
}
fn default_candidate_multiplier() -> usize {
    3
}
fn default_ephemeral_ttl_ms() -> u64 {
    60_000
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            lexical_weight: default_lexical_weight(),
            vector_weight: default_vector_weight(),
            min_score: default_min_score(),
            candidate_multiplier: default_candidate_multiplier(),
            ephemeral_ttl_ms: default_ephemeral_ttl_ms(),
        }
    }
}

impl RetrievalConfig {
    /// Convex combination of the two score components.
    pub fn combined_score(&self, lexical: f64, vector: f64) -> f64 {
        self.lexical_weight * lexical + self.vector_weight * vector
    }
}

/// Tool orchestration policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolingConfig {
    /// Run a retrieval search for every turn with a query
    #[serde(default = "default_auto_search")]
    pub auto_search: bool,

    /// Per-turn tool-time budget in milliseconds
    #[serde(default = "default_max_tool_time_ms")]
    pub max_tool_time_ms: u64,

    /// Maximum tool calls running concurrently within one turn
    #[serde(default = "default_fan_out")]
    pub fan_out: usize,

    /// Allow forwarding model-emitted actions to the control collaborator
    #[serde(default)]
    pub allow_control_commands: bool,

    /// Maximum sanitized tool output length in bytes
    #[serde(default = "default_max_tool_output_bytes")]
    pub max_tool_output_bytes: usize,

    /// Regex patterns redacted from tool output before it reaches the
    /// prompt assembler or the audit log
    #[serde(default = "default_redact_patterns")]
    pub redact_patterns: Vec<String>,
}

fn default_auto_search() -> bool {
    true
}
fn default_max_tool_time_ms() -> u64 {
    600
}
fn default_fan_out() -> usize {
    2
}
fn default_max_tool_output_bytes() -> usize {
    16 * 1024
}
fn default_redact_patterns() -> Vec<String> {
    vec![
        r"(?i)\b(?:sk|pk|key|token|secret|bearer)[-_][A-Za-z0-9]{8,}".to_string(),
        r"(?:/home/|/Users/)[^\s'\x22]+".to_string(),
        r"\bAKIA[0-9A-Z]{16}\b".to_string(),
    ]
}

impl Default for ToolingConfig {
    fn default() -> Self {
        Self {
            auto_search: default_auto_search(),
            max_tool_time_ms: default_max_tool_time_ms(),
            fan_out: default_fan_out(),
            allow_control_commands: false,
            max_tool_output_bytes: default_max_tool_output_bytes(),
            redact_patterns: default_redact_patterns(),
        }
    }
}

/// Conversation memory configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// SQLite database path (relative paths resolve under AIDE_HOME)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Recent turns loaded into the prompt
    #[serde(default = "default_history_window")]
    pub history_window: usize,
}

fn default_db_path() -> String {
    "var/memory.db".to_string()
}
fn default_history_window() -> usize {
    8
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            history_window: default_history_window(),
        }
    }
}

/// Privilege, guardrail, and audit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Tier assigned to sessions the ledger has not seen before
    #[serde(default)]
    pub default_privilege: PrivilegeTier,

    /// Audit log path (relative paths resolve under AIDE_HOME)
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: String,

    /// Start sessions paused
    #[serde(default)]
    pub pause_on_start: bool,

    /// Lowercase phrases the guardrail rejects outright
    #[serde(default = "default_guardrail_blocklist")]
    pub guardrail_blocklist: Vec<String>,
}

fn default_audit_log_path() -> String {
    "var/audit.jsonl".to_string()
}
fn default_guardrail_blocklist() -> Vec<String> {
    vec![
        "ignore previous instructions".to_string(),
        "disable the safety".to_string(),
        "bypass consent".to_string(),
        "sudo rm -rf".to_string(),
        "self-destruct".to_string(),
    ]
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            default_privilege: PrivilegeTier::Informational,
            audit_log_path: default_audit_log_path(),
            pause_on_start: false,
            guardrail_blocklist: default_guardrail_blocklist(),
        }
    }
}

/// Shared retry and circuit-breaker settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Retry policy for transient provider failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Per-provider circuit breaker settings
    #[serde(default)]
    pub breaker: BreakerConfig,
}
