//! Tool execution under policy, timing, and sandbox constraints.
//!
//! Every invocation (success, denial, timeout, or error) produces
//! exactly one audit entry before the result is returned. A tool whose
//! spec requires consent never runs without a matching unexpired grant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Value};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::core::audit_log::AuditSink;
use crate::domain::{AuditEntry, AuditKind, Session, ToolInvocationResult, ToolStatus};
use crate::error::TurnError;
use crate::limits::SlidingWindowLimiter;

use super::registry::{ToolContext, ToolRegistry};
use super::sanitize::Sanitizer;

/// Runs single tool invocations for the orchestrator.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    limiter: Arc<SlidingWindowLimiter>,
    sanitizer: Sanitizer,
    audit: Arc<dyn AuditSink>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        limiter: Arc<SlidingWindowLimiter>,
        sanitizer: Sanitizer,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            registry,
            limiter,
            sanitizer,
            audit,
        }
    }

    /// Invoke a tool by name on behalf of a session.
    ///
    /// Only `UnknownTool` and `AuditSinkUnavailable` surface as errors;
    /// every other outcome is reported through the result status.
    pub async fn invoke(
        &self,
        tool_name: &str,
        params: Value,
        session: &Session,
        state: &Value,
    ) -> Result<ToolInvocationResult, TurnError> {
        let started_at = Utc::now();

        let tool = match self.registry.get(tool_name) {
            Some(tool) => tool,
            None => {
                self.append_audit(
                    &session.id,
                    AuditKind::ToolInvoked,
                    json!({"tool": tool_name, "status": "error", "reason": "unknown_tool"}),
                    None,
                )
                .await?;
                return Err(TurnError::UnknownTool {
                    name: tool_name.to_string(),
                });
            }
        };
        let spec = &tool.spec;

        // Policy checks before the handler ever runs.
        if session.paused {
            return self
                .deny(tool_name, &session.id, "session_paused", started_at)
                .await;
        }

        if spec.permission_tier > session.privilege_tier {
            return self
                .deny(tool_name, &session.id, "insufficient_privilege", started_at)
                .await;
        }

        let limiter_key = format!("{}:{}", session.id, spec.name);
        if !self.limiter.try_acquire(&limiter_key, spec.rate_limit) {
            return self
                .deny(tool_name, &session.id, "rate_limited", started_at)
                .await;
        }

        if spec.requires_consent && session.valid_grant(&spec.name, started_at).is_none() {
            let result = denial_result(tool_name, "consent_required", started_at);
            self.append_audit(
                &session.id,
                AuditKind::ConsentRequired,
                json!({"tool": tool_name, "status": "denied"}),
                Some(0),
            )
            .await?;
            return Ok(result);
        }

        // Dispatch under the hard timeout. Dropping the handler future on
        // timeout abandons in-process work; subprocess-backed tools spawn
        // children with kill-on-drop (see SandboxPolicy::Subprocess).
        let ctx = ToolContext {
            params,
            state: state.clone(),
        };
        let handler = tool.handler.clone();
        let start = Instant::now();

        let outcome = timeout(Duration::from_millis(spec.timeout_ms), handler.run(ctx)).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match outcome {
            Ok(Ok(output)) => {
                let sanitized = self.sanitizer.sanitize_value(&output);
                debug!(tool = tool_name, duration_ms, "Tool completed");
                ToolInvocationResult {
                    tool_name: tool_name.to_string(),
                    status: ToolStatus::Ok,
                    output: sanitized,
                    error: None,
                    duration_ms,
                    started_at,
                }
            }
            Ok(Err(e)) => {
                let message = self.sanitizer.sanitize_text(&e.to_string());
                warn!(tool = tool_name, error = %message, "Tool failed");
                ToolInvocationResult {
                    tool_name: tool_name.to_string(),
                    status: ToolStatus::Error,
                    output: Value::Null,
                    error: Some(message),
                    duration_ms,
                    started_at,
                }
            }
            Err(_) => {
                // Partial output is discarded with the dropped future.
                warn!(tool = tool_name, timeout_ms = spec.timeout_ms, "Tool timed out");
                ToolInvocationResult {
                    tool_name: tool_name.to_string(),
                    status: ToolStatus::Timeout,
                    output: Value::Null,
                    error: Some(format!("timed out after {}ms", spec.timeout_ms)),
                    duration_ms,
                    started_at,
                }
            }
        };

        self.append_audit(
            &session.id,
            AuditKind::ToolInvoked,
            json!({
                "tool": tool_name,
                "status": result.status,
                "error": result.error,
            }),
            Some(duration_ms),
        )
        .await?;

        Ok(result)
    }

    async fn deny(
        &self,
        tool_name: &str,
        session_id: &str,
        reason: &str,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<ToolInvocationResult, TurnError> {
        let result = denial_result(tool_name, reason, started_at);
        self.append_audit(
            session_id,
            AuditKind::ToolInvoked,
            json!({"tool": tool_name, "status": "denied", "reason": reason}),
            Some(0),
        )
        .await?;
        Ok(result)
    }

    async fn append_audit(
        &self,
        session_id: &str,
        kind: AuditKind,
        detail: Value,
        duration_ms: Option<u64>,
    ) -> Result<(), TurnError> {
        let mut entry = AuditEntry::new(session_id, kind, detail);
        if let Some(ms) = duration_ms {
            entry = entry.with_duration(ms);
        }
        self.audit
            .append(&entry)
            .await
            .map_err(|e| TurnError::AuditSinkUnavailable { detail: e.detail })
    }
}

fn denial_result(
    tool_name: &str,
    reason: &str,
    started_at: chrono::DateTime<Utc>,
) -> ToolInvocationResult {
    ToolInvocationResult {
        tool_name: tool_name.to_string(),
        status: ToolStatus::Denied,
        output: Value::Null,
        error: Some(reason.to_string()),
        duration_ms: 0,
        started_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolingConfig;
    use crate::core::audit_log::MemoryAuditLog;
    use crate::domain::PrivilegeTier;
    use crate::limits::RateLimit;
    use crate::tools::registry::{ToolHandler, ToolSpec};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct EchoHandler;

    #[async_trait]
    impl ToolHandler for EchoHandler {
        async fn run(&self, ctx: ToolContext) -> anyhow::Result<Value> {
            Ok(json!({"echo": ctx.params}))
        }
    }

    struct SlowHandler;

    #[async_trait]
    impl ToolHandler for SlowHandler {
        async fn run(&self, _ctx: ToolContext) -> anyhow::Result<Value> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(json!({"late": true}))
        }
    }

    struct TrackedHandler {
        executed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ToolHandler for TrackedHandler {
        async fn run(&self, _ctx: ToolContext) -> anyhow::Result<Value> {
            self.executed.store(true, Ordering::SeqCst);
            Ok(json!({}))
        }
    }

    fn executor(registry: ToolRegistry) -> (ToolExecutor, Arc<MemoryAuditLog>) {
        let audit = Arc::new(MemoryAuditLog::new());
        let executor = ToolExecutor::new(
            Arc::new(registry),
            Arc::new(SlidingWindowLimiter::new()),
            Sanitizer::new(&ToolingConfig::default()).unwrap(),
            audit.clone(),
        );
        (executor, audit)
    }

    fn session(tier: PrivilegeTier) -> Session {
        Session::new("s1", tier)
    }

    #[tokio::test]
    async fn test_invoke_ok_writes_one_audit_entry() {
        let mut registry = ToolRegistry::new();
        registry
            .register(ToolSpec::new("echo", "echoes"), Arc::new(EchoHandler))
            .unwrap();
        let (executor, audit) = executor(registry);

        let result = executor
            .invoke(
                "echo",
                json!({"q": 1}),
                &session(PrivilegeTier::Informational),
                &Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Ok);
        assert_eq!(result.output["echo"]["q"], 1);

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_kind, AuditKind::ToolInvoked);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_and_audited() {
        let (executor, audit) = executor(ToolRegistry::new());

        let result = executor
            .invoke(
                "missing",
                json!({}),
                &session(PrivilegeTier::Informational),
                &Value::Null,
            )
            .await;

        assert!(matches!(result, Err(TurnError::UnknownTool { name }) if name == "missing"));
        assert_eq!(audit.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_consent_required_denies_without_running() {
        let executed = Arc::new(AtomicBool::new(false));
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("issue_command", "queues a command")
                    .with_consent_required(),
                Arc::new(TrackedHandler {
                    executed: executed.clone(),
                }),
            )
            .unwrap();
        let (executor, audit) = executor(registry);

        let result = executor
            .invoke(
                "issue_command",
                json!({}),
                &session(PrivilegeTier::Informational),
                &Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Denied);
        assert!(!executed.load(Ordering::SeqCst));

        let entries = audit.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_kind, AuditKind::ConsentRequired);
    }

    #[tokio::test]
    async fn test_timeout_discards_output() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("slow", "sleeps").with_timeout_ms(50),
                Arc::new(SlowHandler),
            )
            .unwrap();
        let (executor, _audit) = executor(registry);

        let result = executor
            .invoke(
                "slow",
                json!({}),
                &session(PrivilegeTier::Informational),
                &Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Timeout);
        assert_eq!(result.output, Value::Null);
    }

    #[tokio::test]
    async fn test_rate_limit_denies_second_call() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("echo", "echoes").with_rate_limit(RateLimit {
                    max_calls: 1,
                    window_ms: 60_000,
                }),
                Arc::new(EchoHandler),
            )
            .unwrap();
        let (executor, _audit) = executor(registry);
        let session = session(PrivilegeTier::Informational);

        let first = executor
            .invoke("echo", json!({}), &session, &Value::Null)
            .await
            .unwrap();
        assert_eq!(first.status, ToolStatus::Ok);

        let second = executor
            .invoke("echo", json!({}), &session, &Value::Null)
            .await
            .unwrap();
        assert_eq!(second.status, ToolStatus::Denied);
        assert_eq!(second.error.as_deref(), Some("rate_limited"));
    }

    #[tokio::test]
    async fn test_paused_session_never_dispatches() {
        let executed = Arc::new(AtomicBool::new(false));
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("echo", "echoes"),
                Arc::new(TrackedHandler {
                    executed: executed.clone(),
                }),
            )
            .unwrap();
        let (executor, _audit) = executor(registry);

        let mut paused = session(PrivilegeTier::Command);
        paused.paused = true;

        let result = executor
            .invoke("echo", json!({}), &paused, &Value::Null)
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Denied);
        assert!(!executed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_command_tier_tool_denied_for_informational_session() {
        let mut registry = ToolRegistry::new();
        registry
            .register(
                ToolSpec::new("actuate", "moves things").with_tier(PrivilegeTier::Command),
                Arc::new(EchoHandler),
            )
            .unwrap();
        let (executor, _audit) = executor(registry);

        let result = executor
            .invoke(
                "actuate",
                json!({}),
                &session(PrivilegeTier::Informational),
                &Value::Null,
            )
            .await
            .unwrap();

        assert_eq!(result.status, ToolStatus::Denied);
        assert_eq!(result.error.as_deref(), Some("insufficient_privilege"));
    }
}
