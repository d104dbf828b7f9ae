//! Domain types for the aide orchestration core.
//!
//! This module contains the core data structures:
//! - Intent: Immutable user requests and privilege tiers
//! - Session: Per-conversation privilege, pause, and consent state
//! - Turn: Tool invocation results, stages, and the final turn result
//! - Audit: Append-only privileged-action records

pub mod audit;
pub mod intent;
pub mod session;
pub mod turn;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditKind};
pub use intent::{Intent, PrivilegeTier};
pub use session::{ConsentGrant, Session};
pub use turn::{
    StructuredAction, TokenUsage, ToolInvocationResult, ToolStatus, TurnMetadata, TurnResult,
    TurnStage,
};
