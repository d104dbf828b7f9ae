//! Core orchestration logic.
//!
//! This module contains:
//! - AuditLog: Append-only privileged-action logging
//! - ConsentLedger: Per-session privilege, pause, and consent state
//! - Guardrail: Cheap synchronous intent filtering
//! - Orchestrator: The turn state machine

pub mod audit_log;
pub mod cancel;
pub mod consent;
pub mod guardrail;
pub mod orchestrator;

// Re-export commonly used types
pub use audit_log::{AuditSink, AuditSinkError, JsonlAuditLog, MemoryAuditLog};
pub use cancel::CancelToken;
pub use consent::ConsentLedger;
pub use guardrail::{Guardrail, GuardrailBlock};
pub use orchestrator::{
    ControlSink, Orchestrator, QueueControlSink, ToolRequest, TurnOptions,
};
