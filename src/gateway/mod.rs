//! Model gateway: route selection, retries, circuit breaking, generation.
//!
//! Routing is a pure function of the route table and the caller's hints;
//! no side effects, deterministic for identical inputs. The gateway emits
//! per-call timing and token telemetry but writes no audit entries: it is
//! privilege-agnostic by design; auditing belongs to the orchestrator.

pub mod provider;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{LimitsConfig, ModelRoutingConfig};
use crate::core::cancel::CancelToken;
use crate::domain::TokenUsage;
use crate::error::TurnError;
use crate::limits::{BreakerDecision, CircuitBreaker, RetryPolicy};

pub use provider::{
    ChunkStream, GenerationRequest, HttpProvider, ModelProvider, ProviderError,
    ProviderErrorKind, ScriptedProvider, TokenChunk,
};

/// Routing tier of a model entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteTier {
    Primary,
    Fast,
    Offline,
}

/// One entry in the model catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier
    pub name: String,

    /// Provider adapter serving this model
    pub provider: String,

    /// Per-call latency budget in milliseconds
    pub latency_budget_ms: u64,

    /// Output token cap
    pub max_output_tokens: u32,

    /// Sampling temperature
    pub temperature: f32,

    /// Routing tier
    pub tier: RouteTier,

    /// Next model to try when this one is unavailable
    pub fallback: Option<String>,
}

/// A resolved route for one turn: the selected model plus its flattened
/// fallback chain. Chosen per turn by policy; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoute {
    pub model_id: String,
    pub provider: String,
    pub max_latency_ms: u64,
    pub fallback_chain: Vec<ModelRoute>,
}

/// Per-turn routing hints from the interface collaborator.
#[derive(Debug, Clone, Default)]
pub struct RouteHints {
    /// Explicit model request
    pub model: Option<String>,

    /// Prefer the low-latency model
    pub fast_path: bool,

    /// Only models that run without network egress
    pub offline_only: bool,
}

/// Normalized result of a completed generation call.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub text: String,
    pub model: String,
    pub provider: String,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub finish_reason: String,
}

/// Default model catalog, parameterized by the routing config.
pub fn default_catalog(models: &ModelRoutingConfig) -> Vec<ModelSpec> {
    vec![
        ModelSpec {
            name: "gpt-4.1-mini".to_string(),
            provider: "openai".to_string(),
            latency_budget_ms: 1400,
            max_output_tokens: models.max_output_tokens,
            temperature: models.temperature,
            tier: RouteTier::Primary,
            fallback: Some("gpt-4o-mini".to_string()),
        },
        ModelSpec {
            name: "gpt-4o-mini".to_string(),
            provider: "openai".to_string(),
            latency_budget_ms: 650,
            max_output_tokens: 512,
            temperature: 0.3,
            tier: RouteTier::Fast,
            fallback: None,
        },
        ModelSpec {
            name: "mixtral-8x7b".to_string(),
            provider: "scripted".to_string(),
            latency_budget_ms: 2200,
            max_output_tokens: 768,
            temperature: 0.25,
            tier: RouteTier::Offline,
            fallback: Some("gpt-4o-mini".to_string()),
        },
    ]
}

enum AttemptOutcome {
    Text(String),
    Cancelled,
    Failed(ProviderError),
}

/// Routes generation requests to provider adapters.
pub struct ModelGateway {
    catalog: HashMap<String, ModelSpec>,
    routing: ModelRoutingConfig,
    providers: HashMap<String, Arc<dyn ModelProvider>>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ModelGateway {
    pub fn new(routing: ModelRoutingConfig, limits: &LimitsConfig) -> Self {
        let catalog = default_catalog(&routing)
            .into_iter()
            .map(|spec| (spec.name.clone(), spec))
            .collect();

        Self {
            catalog,
            routing,
            providers: HashMap::new(),
            breaker: CircuitBreaker::new(limits.breaker),
            retry: limits.retry.clone(),
        }
    }

    /// Attach a provider adapter, keyed by its name.
    pub fn with_provider(mut self, provider: Arc<dyn ModelProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    /// Register or override a model specification.
    pub fn register_model(&mut self, spec: ModelSpec) {
        self.catalog.insert(spec.name.clone(), spec);
    }

    /// Select a route for the given hints.
    ///
    /// Pure: no side effects, deterministic for identical catalog + hints.
    pub fn select_route(&self, hints: &RouteHints) -> Option<ModelRoute> {
        let preferred = [
            hints.model.as_deref(),
            hints.fast_path.then_some(self.routing.fast_model.as_str()),
            hints.offline_only.then_some(self.routing.offline_model.as_str()),
            Some(self.routing.default_model.as_str()),
        ];

        for candidate in preferred.into_iter().flatten() {
            if let Some(route) = self.resolve_route(candidate) {
                return Some(route);
            }
        }

        // Last resort: lowest model name, for a deterministic pick.
        let mut names: Vec<&String> = self.catalog.keys().collect();
        names.sort();
        names.first().and_then(|name| self.resolve_route(name))
    }

    fn resolve_route(&self, name: &str) -> Option<ModelRoute> {
        let spec = self.catalog.get(name)?;

        let mut fallback_chain = Vec::new();
        let mut seen = vec![spec.name.clone()];
        let mut next = spec.fallback.clone();

        while let Some(fallback_name) = next {
            if seen.contains(&fallback_name) {
                break;
            }
            let Some(fallback_spec) = self.catalog.get(&fallback_name) else {
                break;
            };
            seen.push(fallback_name);
            fallback_chain.push(leg_of(fallback_spec));
            next = fallback_spec.fallback.clone();
        }

        let mut route = leg_of(spec);
        route.fallback_chain = fallback_chain;
        Some(route)
    }

    /// Execute a generation call over the route, walking the fallback
    /// chain as providers fail or their breakers open.
    pub async fn generate(
        &self,
        prompt: &str,
        route: &ModelRoute,
        cancel: &CancelToken,
    ) -> Result<GenerationResult, TurnError> {
        let legs = std::iter::once(route).chain(route.fallback_chain.iter());
        let mut last_error: Option<ProviderError> = None;

        for leg in legs {
            let decision = self.breaker.check(&leg.provider);
            if decision == BreakerDecision::Skip {
                warn!(provider = %leg.provider, "Breaker open, skipping provider");
                continue;
            }

            let Some(provider) = self.providers.get(&leg.provider) else {
                warn!(provider = %leg.provider, "No adapter registered for provider");
                continue;
            };

            let request = self.request_for(leg, prompt);
            // A half-open probe gets exactly one attempt.
            let max_attempts = match decision {
                BreakerDecision::Probe => 1,
                _ => self.retry.max_attempts,
            };

            let mut attempt = 0u32;
            loop {
                attempt += 1;
                if cancel.is_cancelled() {
                    return Err(TurnError::TurnCancelled);
                }

                let started = Instant::now();
                let outcome = self
                    .attempt(provider.as_ref(), &request, leg.max_latency_ms, cancel)
                    .await;
                let latency_ms = started.elapsed().as_millis() as u64;

                match outcome {
                    AttemptOutcome::Text(text) => {
                        self.breaker.record_success(&leg.provider);
                        let usage = TokenUsage::estimate(prompt, &text);
                        debug!(
                            model = %leg.model_id,
                            provider = %leg.provider,
                            latency_ms,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            "Generation call complete"
                        );
                        return Ok(GenerationResult {
                            text,
                            model: leg.model_id.clone(),
                            provider: leg.provider.clone(),
                            usage,
                            latency_ms,
                            finish_reason: "stop".to_string(),
                        });
                    }
                    AttemptOutcome::Cancelled => return Err(TurnError::TurnCancelled),
                    AttemptOutcome::Failed(error) => {
                        self.breaker.record_failure(&leg.provider);
                        warn!(
                            model = %leg.model_id,
                            provider = %leg.provider,
                            attempt,
                            error = %error,
                            "Generation attempt failed"
                        );

                        if error.is_transient() && attempt < max_attempts {
                            tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                            continue;
                        }
                        last_error = Some(error);
                        break;
                    }
                }
            }
        }

        if let Some(error) = last_error {
            warn!(error = %error, "All routes exhausted");
        }
        Err(TurnError::GenerationUnavailable)
    }

    /// Open a raw chunk stream on the first usable leg of the route.
    ///
    /// No retries: a failed or cancelled stream is restartable from
    /// nothing by calling again.
    pub async fn open_stream(
        &self,
        prompt: &str,
        route: &ModelRoute,
    ) -> Result<ChunkStream, TurnError> {
        let legs = std::iter::once(route).chain(route.fallback_chain.iter());

        for leg in legs {
            if self.breaker.check(&leg.provider) == BreakerDecision::Skip {
                continue;
            }
            let Some(provider) = self.providers.get(&leg.provider) else {
                continue;
            };

            let request = self.request_for(leg, prompt);
            match provider.generate(&request).await {
                Ok(stream) => {
                    self.breaker.record_success(&leg.provider);
                    return Ok(stream);
                }
                Err(e) => {
                    self.breaker.record_failure(&leg.provider);
                    warn!(provider = %leg.provider, error = %e, "Stream open failed");
                }
            }
        }

        Err(TurnError::GenerationUnavailable)
    }

    fn request_for(&self, leg: &ModelRoute, prompt: &str) -> GenerationRequest {
        let (max_output_tokens, temperature) = self
            .catalog
            .get(&leg.model_id)
            .map(|spec| (spec.max_output_tokens, spec.temperature))
            .unwrap_or((self.routing.max_output_tokens, self.routing.temperature));

        GenerationRequest {
            model: leg.model_id.clone(),
            prompt: prompt.to_string(),
            max_output_tokens,
            temperature,
        }
    }

    async fn attempt(
        &self,
        provider: &dyn ModelProvider,
        request: &GenerationRequest,
        max_latency_ms: u64,
        cancel: &CancelToken,
    ) -> AttemptOutcome {
        let call = async {
            let mut stream = match provider.generate(request).await {
                Ok(stream) => stream,
                Err(e) => return AttemptOutcome::Failed(e),
            };

            let mut text = String::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        stream.cancel();
                        return AttemptOutcome::Cancelled;
                    }
                    chunk = stream.next_chunk() => match chunk {
                        Some(Ok(piece)) => text.push_str(&piece.text),
                        Some(Err(e)) => return AttemptOutcome::Failed(e),
                        None => break,
                    }
                }
            }
            AttemptOutcome::Text(text)
        };

        match timeout(Duration::from_millis(max_latency_ms), call).await {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Failed(ProviderError::new(
                ProviderErrorKind::Timeout,
                format!("no completion within {}ms", max_latency_ms),
            )),
        }
    }
}

fn leg_of(spec: &ModelSpec) -> ModelRoute {
    ModelRoute {
        model_id: spec.name.clone(),
        provider: spec.provider.clone(),
        max_latency_ms: spec.latency_budget_ms,
        fallback_chain: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway_with_scripted() -> ModelGateway {
        let mut gateway = ModelGateway::new(ModelRoutingConfig::default(), &LimitsConfig::default())
            .with_provider(Arc::new(ScriptedProvider::default()));
        // Point every catalog entry at the scripted provider for tests.
        for spec in default_catalog(&ModelRoutingConfig::default()) {
            gateway.register_model(ModelSpec {
                provider: "scripted".to_string(),
                ..spec
            });
        }
        gateway
    }

    #[test]
    fn test_select_route_default() {
        let gateway = gateway_with_scripted();
        let route = gateway.select_route(&RouteHints::default()).unwrap();

        assert_eq!(route.model_id, "gpt-4.1-mini");
        assert_eq!(route.fallback_chain.len(), 1);
        assert_eq!(route.fallback_chain[0].model_id, "gpt-4o-mini");
    }

    #[test]
    fn test_select_route_hints() {
        let gateway = gateway_with_scripted();

        let fast = gateway
            .select_route(&RouteHints {
                fast_path: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(fast.model_id, "gpt-4o-mini");
        assert!(fast.fallback_chain.is_empty());

        let offline = gateway
            .select_route(&RouteHints {
                offline_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(offline.model_id, "mixtral-8x7b");

        let explicit = gateway
            .select_route(&RouteHints {
                model: Some("gpt-4o-mini".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(explicit.model_id, "gpt-4o-mini");
    }

    #[test]
    fn test_select_route_is_deterministic() {
        let gateway = gateway_with_scripted();
        let hints = RouteHints::default();

        let a = gateway.select_route(&hints).unwrap();
        let b = gateway.select_route(&hints).unwrap();
        assert_eq!(a.model_id, b.model_id);
        assert_eq!(a.max_latency_ms, b.max_latency_ms);
    }

    #[test]
    fn test_unknown_explicit_model_falls_back_to_default() {
        let gateway = gateway_with_scripted();
        let route = gateway
            .select_route(&RouteHints {
                model: Some("nonexistent".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(route.model_id, "gpt-4.1-mini");
    }

    #[tokio::test]
    async fn test_generate_with_scripted_provider() {
        let gateway = gateway_with_scripted();
        let route = gateway.select_route(&RouteHints::default()).unwrap();

        let result = gateway
            .generate("tell me about the battery", &route, &CancelToken::new())
            .await
            .unwrap();

        assert!(!result.text.is_empty());
        assert_eq!(result.model, "gpt-4.1-mini");
        assert!(result.usage.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_generate_without_adapter_is_unavailable() {
        let gateway = ModelGateway::new(ModelRoutingConfig::default(), &LimitsConfig::default());
        let route = gateway.select_route(&RouteHints::default()).unwrap();

        let result = gateway
            .generate("hello", &route, &CancelToken::new())
            .await;
        assert!(matches!(result, Err(TurnError::GenerationUnavailable)));
    }

    #[tokio::test]
    async fn test_cancelled_generation_returns_cancelled() {
        let gateway = gateway_with_scripted();
        let route = gateway.select_route(&RouteHints::default()).unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();

        let result = gateway.generate("hello", &route, &cancel).await;
        assert!(matches!(result, Err(TurnError::TurnCancelled)));
    }

    #[tokio::test]
    async fn test_open_stream_yields_chunks() {
        let gateway = gateway_with_scripted();
        let route = gateway.select_route(&RouteHints::default()).unwrap();

        let mut stream = gateway
            .open_stream("stream me some tokens please", &route)
            .await
            .unwrap();

        let first = stream.next_chunk().await;
        assert!(matches!(first, Some(Ok(_))));
    }
}
