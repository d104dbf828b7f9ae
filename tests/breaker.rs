//! Circuit Breaker Integration Tests
//!
//! Tests that provider failures open the breaker, open breakers route to
//! the fallback without touching the broken provider, and half-open
//! probes close or reopen it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use aide::config::{LimitsConfig, ModelRoutingConfig};
use aide::core::CancelToken;
use aide::gateway::{
    ChunkStream, GenerationRequest, ModelGateway, ModelProvider, ModelSpec, ProviderError,
    ProviderErrorKind, RouteHints, RouteTier, TokenChunk,
};
use aide::limits::{BreakerConfig, RetryPolicy};

/// Provider that fails every call with a transient error, counting
/// attempts so tests can assert it was skipped.
struct FlakyProvider {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl ModelProvider for FlakyProvider {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<ChunkStream, ProviderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(ProviderError::new(
            ProviderErrorKind::Transient,
            "upstream unavailable",
        ))
    }
}

/// Provider that answers with a fixed completion.
struct SteadyProvider;

#[async_trait]
impl ModelProvider for SteadyProvider {
    fn name(&self) -> &str {
        "steady"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<ChunkStream, ProviderError> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(Ok(TokenChunk {
            text: "fallback answer".to_string(),
        }));
        Ok(ChunkStream::from_channel(rx))
    }
}

fn gateway(breaker: BreakerConfig, attempts: Arc<AtomicU32>) -> ModelGateway {
    let limits = LimitsConfig {
        retry: RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        },
        breaker,
    };

    let routing = ModelRoutingConfig {
        default_model: "primary-model".to_string(),
        ..Default::default()
    };

    let mut gateway = ModelGateway::new(routing, &limits)
        .with_provider(Arc::new(FlakyProvider { attempts }))
        .with_provider(Arc::new(SteadyProvider));

    gateway.register_model(ModelSpec {
        name: "primary-model".to_string(),
        provider: "flaky".to_string(),
        latency_budget_ms: 1_000,
        max_output_tokens: 64,
        temperature: 0.2,
        tier: RouteTier::Primary,
        fallback: Some("backup-model".to_string()),
    });
    gateway.register_model(ModelSpec {
        name: "backup-model".to_string(),
        provider: "steady".to_string(),
        latency_budget_ms: 1_000,
        max_output_tokens: 64,
        temperature: 0.2,
        tier: RouteTier::Fast,
        fallback: None,
    });

    gateway
}

#[tokio::test]
async fn test_failures_fall_through_to_fallback() {
    let attempts = Arc::new(AtomicU32::new(0));
    let gateway = gateway(
        BreakerConfig {
            failure_threshold: 5,
            window_ms: 60_000,
            cooldown_ms: 60_000,
        },
        attempts.clone(),
    );

    let route = gateway.select_route(&RouteHints::default()).unwrap();
    let result = gateway
        .generate("hello", &route, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(result.text, "fallback answer");
    assert_eq!(result.model, "backup-model");
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_open_breaker_skips_broken_provider() {
    let attempts = Arc::new(AtomicU32::new(0));
    let gateway = gateway(
        BreakerConfig {
            failure_threshold: 2,
            window_ms: 60_000,
            cooldown_ms: 60_000,
        },
        attempts.clone(),
    );

    let route = gateway.select_route(&RouteHints::default()).unwrap();
    let cancel = CancelToken::new();

    // Two failing calls reach the threshold.
    gateway.generate("one", &route, &cancel).await.unwrap();
    gateway.generate("two", &route, &cancel).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    // Breaker now open: the next call routes straight to the fallback
    // without attempting the broken provider.
    let result = gateway.generate("three", &route, &cancel).await.unwrap();
    assert_eq!(result.model, "backup-model");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_cooldown_allows_one_probe_then_reopens() {
    let attempts = Arc::new(AtomicU32::new(0));
    let gateway = gateway(
        BreakerConfig {
            failure_threshold: 1,
            window_ms: 60_000,
            cooldown_ms: 50,
        },
        attempts.clone(),
    );

    let route = gateway.select_route(&RouteHints::default()).unwrap();
    let cancel = CancelToken::new();

    // One failure opens the breaker.
    gateway.generate("one", &route, &cancel).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    // While open: skipped.
    gateway.generate("two", &route, &cancel).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    tokio::time::sleep(Duration::from_millis(80)).await;

    // After cool-down: exactly one probe attempt, which fails and
    // reopens the breaker.
    gateway.generate("three", &route, &cancel).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);

    gateway.generate("four", &route, &cancel).await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_auth_errors_are_not_retried() {
    struct AuthFailProvider {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl ModelProvider for AuthFailProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn generate(
            &self,
            _request: &GenerationRequest,
        ) -> Result<ChunkStream, ProviderError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ProviderError::new(ProviderErrorKind::Auth, "bad key"))
        }
    }

    let attempts = Arc::new(AtomicU32::new(0));
    let limits = LimitsConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 1,
            backoff_multiplier: 1.0,
        },
        breaker: BreakerConfig::default(),
    };
    let routing = ModelRoutingConfig {
        default_model: "primary-model".to_string(),
        ..Default::default()
    };

    let mut gateway = ModelGateway::new(routing, &limits)
        .with_provider(Arc::new(AuthFailProvider {
            attempts: attempts.clone(),
        }))
        .with_provider(Arc::new(SteadyProvider));

    gateway.register_model(ModelSpec {
        name: "primary-model".to_string(),
        provider: "flaky".to_string(),
        latency_budget_ms: 1_000,
        max_output_tokens: 64,
        temperature: 0.2,
        tier: RouteTier::Primary,
        fallback: Some("backup-model".to_string()),
    });
    gateway.register_model(ModelSpec {
        name: "backup-model".to_string(),
        provider: "steady".to_string(),
        latency_budget_ms: 1_000,
        max_output_tokens: 64,
        temperature: 0.2,
        tier: RouteTier::Fast,
        fallback: None,
    });

    let route = gateway.select_route(&RouteHints::default()).unwrap();
    let result = gateway
        .generate("hello", &route, &CancelToken::new())
        .await
        .unwrap();

    // Non-transient failure: exactly one attempt, then the fallback.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(result.model, "backup-model");
}
