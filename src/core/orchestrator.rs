//! Turn controller: drives one conversational turn end-to-end.
//!
//! State machine: received → guardrail_check → routed → (tooling)* →
//! generating → post_processing → done, with terminal failed/cancelled
//! reachable from any non-terminal stage. Pause is re-checked at every
//! stage boundary; audit entries preserve the causal order of the events
//! they record; an unavailable audit sink fails the turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::domain::{
    AuditEntry, AuditKind, Intent, PrivilegeTier, Session, StructuredAction,
    ToolInvocationResult, TurnMetadata, TurnResult, TurnStage,
};
use crate::error::TurnError;
use crate::gateway::{GenerationResult, ModelGateway, ModelRoute, RouteHints};
use crate::memory::{ConversationMemory, MemoryTurn};
use crate::retrieval::{Document, RetrievalSet, RetrievedDocument, Retriever};
use crate::telemetry::LatencyProbe;
use crate::tools::ToolExecutor;

use super::audit_log::AuditSink;
use super::cancel::CancelToken;
use super::consent::ConsentLedger;
use super::guardrail::Guardrail;

/// Boundary to the control collaborator. Accepted structured actions are
/// forwarded here; control performs its own final safety check and is the
/// sole owner of actuation.
#[async_trait]
pub trait ControlSink: Send + Sync {
    async fn submit(&self, action: &StructuredAction) -> anyhow::Result<()>;
}

/// Control sink backed by an in-process channel.
pub struct QueueControlSink {
    tx: mpsc::UnboundedSender<StructuredAction>,
}

impl QueueControlSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StructuredAction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ControlSink for QueueControlSink {
    async fn submit(&self, action: &StructuredAction) -> anyhow::Result<()> {
        self.tx
            .send(action.clone())
            .map_err(|_| anyhow::anyhow!("control queue closed"))
    }
}

/// One requested tool call for the tooling stage.
#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub name: String,
    pub params: Value,
}

/// Per-turn options supplied by the interface collaborator.
#[derive(Debug, Clone, Default)]
pub struct TurnOptions {
    /// Routing hints (explicit model, fast path, offline)
    pub route: RouteHints,

    /// System instructions override
    pub instructions: Option<String>,

    /// Extra tool calls to run during the tooling stage
    pub tool_requests: Vec<ToolRequest>,

    /// Runtime state snapshot passed to tools and the prompt
    pub state: Value,
}

/// Working state of one turn. Owned exclusively by the turn's execution
/// and destroyed when the turn completes or is cancelled.
struct TurnState {
    intent: Intent,
    privilege_snapshot: Session,
    selected_route: Option<ModelRoute>,
    tool_calls: Vec<ToolInvocationResult>,
    retrieved_docs: Vec<RetrievedDocument>,
    stage: TurnStage,
}

/// Top-level entry point composing retrieval, tooling, and generation.
pub struct Orchestrator {
    config: RuntimeConfig,
    gateway: Arc<ModelGateway>,
    retriever: Arc<Retriever>,
    tools: Arc<ToolExecutor>,
    ledger: Arc<ConsentLedger>,
    guardrail: Guardrail,
    audit: Arc<dyn AuditSink>,
    memory: Option<Arc<ConversationMemory>>,
    control: Option<Arc<dyn ControlSink>>,
}

impl Orchestrator {
    pub fn new(
        config: RuntimeConfig,
        gateway: Arc<ModelGateway>,
        retriever: Arc<Retriever>,
        tools: Arc<ToolExecutor>,
        ledger: Arc<ConsentLedger>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let guardrail = Guardrail::new(&config.safety);
        Self {
            config,
            gateway,
            retriever,
            tools,
            ledger,
            guardrail,
            audit,
            memory: None,
            control: None,
        }
    }

    /// Attach the conversation memory store.
    pub fn with_memory(mut self, memory: Arc<ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Attach the control collaborator boundary.
    pub fn with_control(mut self, control: Arc<dyn ControlSink>) -> Self {
        self.control = Some(control);
        self
    }

    /// Process an intent with default options and no external cancel
    /// handle. The interface-facing entry point.
    pub async fn submit_intent(&self, intent: Intent) -> Result<TurnResult, TurnError> {
        self.process_turn(intent, TurnOptions::default(), CancelToken::new())
            .await
    }

    /// Drive one turn through the state machine.
    #[instrument(skip(self, intent, options, cancel), fields(session = %intent.session_id, intent_id = %intent.id))]
    pub async fn process_turn(
        &self,
        intent: Intent,
        options: TurnOptions,
        cancel: CancelToken,
    ) -> Result<TurnResult, TurnError> {
        let turn_start = Instant::now();
        let session_id = intent.session_id.clone();
        let mut probe = LatencyProbe::new();

        let mut state = TurnState {
            privilege_snapshot: self.ledger.snapshot(&session_id),
            intent,
            selected_route: None,
            tool_calls: Vec::new(),
            retrieved_docs: Vec::new(),
            stage: TurnStage::Received,
        };

        match self.drive(&mut state, &options, &cancel, &mut probe).await {
            Ok(mut result) => {
                state.stage = TurnStage::Done;
                result.metadata.latency_ms_by_stage = probe.summary();

                // Guardrail refusals already wrote their entry; no further
                // stages executed, so no completion entry either.
                if !result.metadata.guardrail_blocked {
                    self.append_audit(
                        AuditEntry::new(
                            &session_id,
                            AuditKind::TurnCompleted,
                            json!({
                                "tool_calls": state.tool_calls.len(),
                                "actions": result.structured_actions.len(),
                                "partial_context": result.metadata.partial_context,
                            }),
                        )
                        .with_duration(turn_start.elapsed().as_millis() as u64),
                    )
                    .await?;
                }

                info!(
                    stage = ?state.stage,
                    latency_ms = turn_start.elapsed().as_millis() as u64,
                    "Turn complete"
                );
                Ok(result)
            }
            Err(TurnError::TurnCancelled) => {
                state.stage = TurnStage::Cancelled;
                // The audit trail completes synchronously before the
                // cancellation surfaces to the caller.
                self.append_audit(AuditEntry::new(
                    &session_id,
                    AuditKind::TurnCancelled,
                    json!({"intent_id": state.intent.id}),
                ))
                .await?;
                info!("Turn cancelled");
                Err(TurnError::TurnCancelled)
            }
            Err(err) => {
                state.stage = TurnStage::Failed;
                // Stage-level entries (privilege_denied, generation_failed)
                // were written where the failure occurred.
                warn!(error = %err, "Turn failed");
                Err(err)
            }
        }
    }

    async fn drive(
        &self,
        state: &mut TurnState,
        options: &TurnOptions,
        cancel: &CancelToken,
        probe: &mut LatencyProbe,
    ) -> Result<TurnResult, TurnError> {
        let session_id = state.intent.session_id.clone();

        // Privilege gate: no tool or model call may run past this point
        // if the declared action exceeds the session's tier.
        if state.intent.declared_privilege > state.privilege_snapshot.privilege_tier {
            let detail = format!(
                "declared {} exceeds session tier {}",
                state.intent.declared_privilege, state.privilege_snapshot.privilege_tier
            );
            self.append_audit(AuditEntry::new(
                &session_id,
                AuditKind::PrivilegeDenied,
                json!({
                    "declared": state.intent.declared_privilege.to_string(),
                    "tier": state.privilege_snapshot.privilege_tier.to_string(),
                }),
            ))
            .await?;
            return Err(TurnError::PrivilegeDenied { detail });
        }

        self.ensure_active(&session_id, cancel).await?;

        // Guardrail: cheap synchronous heuristics, before any other stage.
        state.stage = TurnStage::GuardrailCheck;
        if let Err(block) = self.guardrail.check(&state.intent.text) {
            self.append_audit(AuditEntry::new(
                &session_id,
                AuditKind::GuardrailBlock,
                json!({"matched": block.matched}),
            ))
            .await?;
            info!(matched = %block.matched, "Guardrail blocked intent");

            return Ok(TurnResult {
                text: Guardrail::refusal_text().to_string(),
                structured_actions: Vec::new(),
                metadata: TurnMetadata {
                    guardrail_blocked: true,
                    ..Default::default()
                },
            });
        }

        // Routing: pure selection over the route table.
        self.ensure_active(&session_id, cancel).await?;
        state.stage = TurnStage::Routed;
        let route = match self.gateway.select_route(&options.route) {
            Some(route) => route,
            None => {
                self.append_audit(AuditEntry::new(
                    &session_id,
                    AuditKind::GenerationFailed,
                    json!({"error": "no routes configured"}),
                ))
                .await?;
                return Err(TurnError::GenerationUnavailable);
            }
        };
        self.append_audit(AuditEntry::new(
            &session_id,
            AuditKind::RouteSelected,
            json!({
                "model": route.model_id,
                "provider": route.provider,
                "fallbacks": route.fallback_chain.len(),
            }),
        ))
        .await?;
        state.selected_route = Some(route.clone());

        // Tooling: zero or more bounded, possibly concurrent tool calls.
        state.stage = TurnStage::Tooling;
        self.ensure_active(&session_id, cancel).await?;

        let mut partial_context = false;
        let mut retrieval_degraded = false;

        let mut requests: Vec<ToolRequest> = Vec::new();
        if self.config.tooling.auto_search && !state.intent.text.trim().is_empty() {
            requests.push(ToolRequest {
                name: "search_docs".to_string(),
                params: json!({
                    "query": state.intent.text,
                    "limit": self.config.retrieval.top_k,
                }),
            });
        }
        requests.extend(options.tool_requests.iter().cloned());

        if !requests.is_empty() {
            let (results, skipped) = probe
                .track(
                    "tooling",
                    self.run_tooling(&state.privilege_snapshot, &options.state, requests, cancel),
                )
                .await?;
            partial_context |= skipped;

            for result in &results {
                if result.tool_name == "search_docs" && result.is_ok() {
                    match serde_json::from_value::<RetrievalSet>(result.output.clone()) {
                        Ok(set) => {
                            retrieval_degraded |= set.degraded;
                            state.retrieved_docs.extend(set.matches);
                        }
                        Err(e) => {
                            debug!(error = %e, "Unparseable search output");
                            partial_context = true;
                        }
                    }
                } else if result.is_ok() {
                    // Attach other tool outputs as ephemeral context so a
                    // follow-up retrieval can see them until they expire.
                    self.retriever.ingest_ephemeral(
                        Document::new(
                            format!("tool:{}:{}", result.tool_name, state.intent.id),
                            result.output.to_string(),
                            format!("tool:{}", result.tool_name),
                        ),
                        chrono::Duration::milliseconds(
                            self.config.retrieval.ephemeral_ttl_ms as i64,
                        ),
                    );
                } else {
                    partial_context = true;
                }
            }
            state.tool_calls = results;
        }

        // Generation: always the final, single, sequential step.
        self.ensure_active(&session_id, cancel).await?;
        state.stage = TurnStage::Generating;

        let history = self.load_history(&session_id);
        let prompt = build_prompt(state, options, &history);

        let generation = probe
            .track("generation", self.gateway.generate(&prompt, &route, cancel))
            .await;

        let generation = match generation {
            Ok(result) => {
                self.append_audit(
                    AuditEntry::new(
                        &session_id,
                        AuditKind::GenerationCompleted,
                        json!({
                            "model": result.model,
                            "provider": result.provider,
                            "total_tokens": result.usage.total_tokens,
                        }),
                    )
                    .with_duration(result.latency_ms),
                )
                .await?;
                result
            }
            Err(TurnError::TurnCancelled) => return Err(TurnError::TurnCancelled),
            Err(err) => {
                self.append_audit(AuditEntry::new(
                    &session_id,
                    AuditKind::GenerationFailed,
                    json!({"error": err.to_string()}),
                ))
                .await?;
                return Err(TurnError::GenerationUnavailable);
            }
        };

        // Post-processing: extract structured actions and re-validate
        // against the *current* ledger state: the session may have been
        // paused or downgraded while the model was generating.
        state.stage = TurnStage::PostProcessing;
        let accepted = self.post_process(&session_id, &generation, cancel).await?;

        self.persist_memory(&session_id, state, &generation);

        Ok(TurnResult {
            text: generation.text,
            structured_actions: accepted,
            metadata: TurnMetadata {
                model: Some(generation.model),
                latency_ms_by_stage: HashMap::new(),
                token_usage: Some(generation.usage),
                partial_context,
                retrieval_degraded,
                guardrail_blocked: false,
            },
        })
    }

    /// Run the planned tool calls in fan-out batches under the per-turn
    /// tool-time budget. Returns the ordered results and whether anything
    /// was skipped or failed (partial context).
    async fn run_tooling(
        &self,
        session: &Session,
        state_snapshot: &Value,
        requests: Vec<ToolRequest>,
        cancel: &CancelToken,
    ) -> Result<(Vec<ToolInvocationResult>, bool), TurnError> {
        let budget = Duration::from_millis(self.config.tooling.max_tool_time_ms);
        let fan_out = self.config.tooling.fan_out.max(1);
        let started = Instant::now();

        let mut ordered: Vec<(usize, ToolInvocationResult)> = Vec::new();
        let mut skipped_any = false;
        let mut next = 0usize;

        while next < requests.len() {
            if cancel.is_cancelled() {
                return Err(TurnError::TurnCancelled);
            }

            // Pause takes effect mid-turn, before the next dispatch.
            if self.ledger.is_paused(&session.id) {
                warn!(
                    skipped = requests.len() - next,
                    "Session paused, skipping remaining tools"
                );
                skipped_any = true;
                break;
            }

            if started.elapsed() >= budget {
                warn!(
                    skipped = requests.len() - next,
                    "Tool budget exhausted, proceeding with partial context"
                );
                skipped_any = true;
                break;
            }

            let batch_end = (next + fan_out).min(requests.len());
            let mut join_set = JoinSet::new();

            for (offset, request) in requests[next..batch_end].iter().enumerate() {
                let index = next + offset;
                let request = request.clone();
                let tools = self.tools.clone();
                let session = session.clone();
                let state_snapshot = state_snapshot.clone();

                join_set.spawn(async move {
                    let result = tools
                        .invoke(&request.name, request.params, &session, &state_snapshot)
                        .await;
                    (index, result)
                });
            }

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        join_set.abort_all();
                        return Err(TurnError::TurnCancelled);
                    }
                    joined = join_set.join_next() => match joined {
                        Some(Ok((index, Ok(result)))) => ordered.push((index, result)),
                        Some(Ok((_, Err(TurnError::AuditSinkUnavailable { detail })))) => {
                            join_set.abort_all();
                            return Err(TurnError::AuditSinkUnavailable { detail });
                        }
                        Some(Ok((_, Err(contained)))) => {
                            // Tool-level failures never abort the turn.
                            warn!(error = %contained, "Tool call contained");
                            skipped_any = true;
                        }
                        Some(Err(join_error)) => {
                            warn!(error = %join_error, "Tool task panicked");
                            skipped_any = true;
                        }
                        None => break,
                    }
                }
            }

            next = batch_end;
        }

        ordered.sort_by_key(|(index, _)| *index);
        Ok((ordered.into_iter().map(|(_, r)| r).collect(), skipped_any))
    }

    async fn post_process(
        &self,
        session_id: &str,
        generation: &GenerationResult,
        cancel: &CancelToken,
    ) -> Result<Vec<StructuredAction>, TurnError> {
        let candidates = extract_actions(&generation.text);
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        if cancel.is_cancelled() {
            return Err(TurnError::TurnCancelled);
        }

        let tier_now = self.ledger.privilege(session_id);
        let paused_now = self.ledger.is_paused(session_id);
        let mut accepted = Vec::new();

        for (action_kind, parameters) in candidates {
            let rejection = if paused_now {
                Some("session_paused")
            } else if tier_now < PrivilegeTier::Command {
                Some("insufficient_privilege")
            } else if !self.config.tooling.allow_control_commands {
                Some("control_commands_disabled")
            } else {
                None
            };

            if let Some(reason) = rejection {
                self.append_audit(AuditEntry::new(
                    session_id,
                    AuditKind::ActionRejected,
                    json!({"action_kind": action_kind, "reason": reason}),
                ))
                .await?;
                continue;
            }

            let action = StructuredAction {
                action_kind: action_kind.clone(),
                parameters,
                privilege_tier: tier_now,
            };

            if let Some(control) = &self.control {
                if let Err(e) = control.submit(&action).await {
                    warn!(action = %action_kind, error = %e, "Control sink rejected action");
                    self.append_audit(AuditEntry::new(
                        session_id,
                        AuditKind::ActionRejected,
                        json!({"action_kind": action_kind, "reason": "control_unavailable"}),
                    ))
                    .await?;
                    continue;
                }
            }

            self.append_audit(AuditEntry::new(
                session_id,
                AuditKind::ActionForwarded,
                json!({"action_kind": action_kind}),
            ))
            .await?;
            accepted.push(action);
        }

        Ok(accepted)
    }

    fn load_history(&self, session_id: &str) -> Vec<MemoryTurn> {
        let Some(memory) = &self.memory else {
            return Vec::new();
        };
        match memory.load_recent_turns(session_id, self.config.memory.history_window) {
            Ok(turns) => turns,
            Err(e) => {
                warn!(error = %e, "Failed to load conversation history");
                Vec::new()
            }
        }
    }

    fn persist_memory(&self, session_id: &str, state: &TurnState, generation: &GenerationResult) {
        let Some(memory) = &self.memory else {
            return;
        };

        let mut user_meta = HashMap::new();
        if let Some(tag) = &state.intent.safety_tag {
            user_meta.insert("safety_tag".to_string(), tag.clone());
        }
        if let Err(e) = memory.append_turn(session_id, "user", &state.intent.text, &user_meta) {
            warn!(error = %e, "Failed to persist user turn");
        }

        let mut assistant_meta = HashMap::new();
        assistant_meta.insert("model".to_string(), generation.model.clone());
        if let Err(e) =
            memory.append_turn(session_id, "assistant", &generation.text, &assistant_meta)
        {
            warn!(error = %e, "Failed to persist assistant turn");
        }
    }

    /// Stage-boundary check: cancellation first, then pause.
    async fn ensure_active(
        &self,
        session_id: &str,
        cancel: &CancelToken,
    ) -> Result<(), TurnError> {
        if cancel.is_cancelled() {
            return Err(TurnError::TurnCancelled);
        }
        if self.ledger.is_paused(session_id) {
            self.append_audit(AuditEntry::new(
                session_id,
                AuditKind::PrivilegeDenied,
                json!({"reason": "session_paused"}),
            ))
            .await?;
            return Err(TurnError::PrivilegeDenied {
                detail: "session is paused".to_string(),
            });
        }
        Ok(())
    }

    async fn append_audit(&self, entry: AuditEntry) -> Result<(), TurnError> {
        self.audit
            .append(&entry)
            .await
            .map_err(|e| TurnError::AuditSinkUnavailable { detail: e.detail })
    }
}

/// Assemble the generation prompt from instructions, history, retrieved
/// context, tool outputs, and runtime state.
fn build_prompt(state: &TurnState, options: &TurnOptions, history: &[MemoryTurn]) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(
        options
            .instructions
            .clone()
            .unwrap_or_else(|| "You are a helpful AI assistant.".to_string()),
    );

    if !history.is_empty() {
        let mut lines = vec!["Conversation history:".to_string()];
        for turn in history {
            lines.push(format!("{}: {}", turn.role, turn.content));
        }
        sections.push(lines.join("\n"));
    }

    if !state.retrieved_docs.is_empty() {
        let mut lines = vec!["Context documents:".to_string()];
        for doc in &state.retrieved_docs {
            lines.push(format!(
                "- [{}] ({}) {}",
                doc.source_id, doc.provenance_tag, doc.text
            ));
        }
        sections.push(lines.join("\n"));
    }

    let tool_outputs: Vec<&ToolInvocationResult> = state
        .tool_calls
        .iter()
        .filter(|call| call.is_ok() && call.tool_name != "search_docs")
        .collect();
    if !tool_outputs.is_empty() {
        let mut lines = vec!["Tool outputs:".to_string()];
        for call in tool_outputs {
            lines.push(format!("- {}: {}", call.tool_name, call.output));
        }
        sections.push(lines.join("\n"));
    }

    if !options.state.is_null() {
        sections.push(format!("State summary: {}", options.state));
    }

    sections.push(format!("User request: {}", state.intent.text));
    sections.join("\n\n")
}

/// Extract structured actions from model output.
///
/// Accepts a bare JSON object (`{"action": ..., "parameters": ...}`), an
/// `{"actions": [...]}` envelope, or the first JSON object embedded in
/// surrounding prose.
fn extract_actions(text: &str) -> Vec<(String, Value)> {
    let parsed: Option<Value> = serde_json::from_str(text.trim()).ok().or_else(|| {
        let start = text.find('{')?;
        let end = text.rfind('}')?;
        if end <= start {
            return None;
        }
        serde_json::from_str(&text[start..=end]).ok()
    });

    let Some(value) = parsed else {
        return Vec::new();
    };

    let mut actions = Vec::new();
    let candidates: Vec<&Value> = match value.get("actions").and_then(Value::as_array) {
        Some(list) => list.iter().collect(),
        None => vec![&value],
    };

    for candidate in candidates {
        if let Some(kind) = candidate.get("action").and_then(Value::as_str) {
            let parameters = candidate.get("parameters").cloned().unwrap_or(Value::Null);
            actions.push((kind.to_string(), parameters));
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bare_action() {
        let actions =
            extract_actions(r#"{"action": "navigate", "parameters": {"room": "kitchen"}}"#);
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].0, "navigate");
        assert_eq!(actions[0].1["room"], "kitchen");
    }

    #[test]
    fn test_extract_action_envelope() {
        let actions = extract_actions(
            r#"{"actions": [{"action": "a", "parameters": {}}, {"action": "b"}]}"#,
        );
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1].0, "b");
        assert_eq!(actions[1].1, Value::Null);
    }

    #[test]
    fn test_extract_action_from_prose() {
        let actions = extract_actions(
            r#"Sure, doing that now. {"action": "set_volume", "parameters": {"level": 3}}"#,
        );
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].0, "set_volume");
    }

    #[test]
    fn test_extract_ignores_plain_text() {
        assert!(extract_actions("the battery is at 82 percent").is_empty());
        assert!(extract_actions(r#"{"note": "no action key"}"#).is_empty());
    }
}
