//! aide - Safety-checked assistant turn orchestration core
//!
//! Turns a single user intent into a tool-augmented, model-routed
//! response while enforcing a consent/privilege policy and logging every
//! privileged action to an append-only audit sink.
//!
//! # Architecture
//!
//! One turn flows through a state machine: privilege gate → guardrail →
//! route selection → bounded tooling → generation → post-processing.
//! Tool and retrieval failures degrade the turn (partial context) rather
//! than aborting it; an unavailable audit sink is the one fatal
//! dependency, because unaudited privileged action is unacceptable.
//!
//! # Modules
//!
//! - `core`: Orchestrator, consent ledger, guardrail, audit log
//! - `gateway`: Model routing, providers, retries, circuit breaking
//! - `tools`: Tool registry, policy-checked executor, sanitization
//! - `retrieval`: Hybrid lexical + dense retrieval with TTL'd documents
//! - `domain`: Data structures (Intent, Session, AuditEntry, TurnResult)
//! - `memory`: SQLite-backed conversation continuity
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run one turn against the scripted provider
//! aide turn "what's the battery level?"
//!
//! # Inspect the audit trail
//! aide audit --limit 20
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod limits;
pub mod memory;
pub mod retrieval;
pub mod telemetry;
pub mod tools;

// Re-export main types at crate root for convenience
pub use crate::core::{CancelToken, ConsentLedger, JsonlAuditLog, Orchestrator, TurnOptions};
pub use domain::{AuditEntry, AuditKind, Intent, PrivilegeTier, TurnResult};
pub use error::TurnError;
pub use gateway::{ModelGateway, RouteHints};
