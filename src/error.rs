//! Error taxonomy for turn processing.
//!
//! Every failure a caller can observe maps to one of these kinds; raw
//! provider or I/O errors never cross the orchestrator boundary.

use thiserror::Error;

/// Failure kinds surfaced by the orchestration core.
#[derive(Debug, Clone, Error)]
pub enum TurnError {
    #[error("Privilege denied: {detail}")]
    PrivilegeDenied { detail: String },

    #[error("Guardrail blocked the request: {reason}")]
    GuardrailBlocked { reason: String },

    #[error("Unknown tool: {name}")]
    UnknownTool { name: String },

    #[error("Tool '{tool}' requires consent")]
    ConsentRequired { tool: String },

    #[error("Rate limit exceeded for '{key}'")]
    RateLimited { key: String },

    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    #[error("Tool '{tool}' failed: {message}")]
    ToolError { tool: String, message: String },

    #[error("Provider '{provider}' failed: {message}")]
    ProviderError { provider: String, message: String },

    #[error("Generation unavailable after exhausting all routes")]
    GenerationUnavailable,

    #[error("Turn cancelled")]
    TurnCancelled,

    #[error("Audit sink unavailable: {detail}")]
    AuditSinkUnavailable { detail: String },
}

impl TurnError {
    /// Non-technical message suitable for direct display to the user.
    pub fn user_message(&self) -> String {
        match self {
            TurnError::PrivilegeDenied { .. } => {
                "I can't do that with the current permission level.".to_string()
            }
            TurnError::GuardrailBlocked { .. } => {
                "I can't help with that request.".to_string()
            }
            TurnError::UnknownTool { .. } | TurnError::ToolError { .. } => {
                "One of the steps I needed didn't work. Please try again.".to_string()
            }
            TurnError::ConsentRequired { tool } => {
                format!("I need your permission before using '{}'.", tool)
            }
            TurnError::RateLimited { .. } => {
                "That's being asked a little too often. Please wait a moment.".to_string()
            }
            TurnError::ToolTimeout { .. } | TurnError::ProviderError { .. } => {
                "That took too long. Please try again.".to_string()
            }
            TurnError::GenerationUnavailable | TurnError::AuditSinkUnavailable { .. } => {
                "I'm unable to respond right now. Please try again later.".to_string()
            }
            TurnError::TurnCancelled => "Okay, stopping.".to_string(),
        }
    }

    /// Whether the failure aborts the whole turn rather than being contained.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TurnError::PrivilegeDenied { .. }
                | TurnError::GenerationUnavailable
                | TurnError::TurnCancelled
                | TurnError::AuditSinkUnavailable { .. }
        )
    }
}
