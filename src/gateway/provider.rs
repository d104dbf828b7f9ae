//! Provider adapters for the model gateway.
//!
//! Adapters implement a single capability interface; the gateway never
//! inspects provider identity beyond route selection. Streaming output is
//! a lazy, cancellable sequence of token chunks; cancelling the stream
//! stops consuming upstream immediately.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// A normalized generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub prompt: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
}

/// One streamed piece of generated text.
#[derive(Debug, Clone)]
pub struct TokenChunk {
    pub text: String,
}

/// Classification of a provider failure, driving retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// The call exceeded its latency budget
    Timeout,

    /// The provider rejected the call for rate reasons
    RateLimited,

    /// 5xx-equivalent: worth retrying
    Transient,

    /// Authentication or authorization failure: never retried
    Auth,

    /// Malformed request: never retried
    Malformed,
}

/// A provider call failure.
#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Whether the retry policy applies to this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::Timeout
                | ProviderErrorKind::RateLimited
                | ProviderErrorKind::Transient
        )
    }
}

/// Lazy, finite, cancellable sequence of token chunks.
///
/// Dropping or cancelling the stream closes the channel; the producing
/// task observes the closed channel on its next send and stops consuming
/// upstream. The stream is restartable from nothing: a fresh `generate`
/// call starts a fresh sequence.
pub struct ChunkStream {
    rx: mpsc::Receiver<Result<TokenChunk, ProviderError>>,
}

impl ChunkStream {
    pub fn from_channel(rx: mpsc::Receiver<Result<TokenChunk, ProviderError>>) -> Self {
        Self { rx }
    }

    /// Next chunk, or `None` when the sequence completed.
    pub async fn next_chunk(&mut self) -> Option<Result<TokenChunk, ProviderError>> {
        self.rx.recv().await
    }

    /// Stop the stream. The producer stops at its next send.
    pub fn cancel(&mut self) {
        self.rx.close();
    }

    /// Drain the stream into a single string.
    pub async fn collect_text(mut self) -> Result<String, ProviderError> {
        let mut text = String::new();
        while let Some(chunk) = self.next_chunk().await {
            text.push_str(&chunk?.text);
        }
        Ok(text)
    }
}

/// Capability interface every provider adapter implements.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name, matched against `ModelRoute.provider`
    fn name(&self) -> &str;

    /// Start a generation call, returning its chunk stream.
    async fn generate(&self, request: &GenerationRequest) -> Result<ChunkStream, ProviderError>;
}

/// Deterministic in-process provider.
///
/// Fabricates a completion from the prompt with a seeded generator, so
/// identical requests produce identical output. Serves as the offline
/// backend and the test double.
pub struct ScriptedProvider {
    name: String,
    chunk_tokens: usize,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self {
            name: "scripted".to_string(),
            chunk_tokens: 8,
        }
    }
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunk_tokens: 8,
        }
    }

    fn synthesize(&self, request: &GenerationRequest) -> Vec<String> {
        let words: Vec<&str> = request.prompt.split_whitespace().collect();
        let target = (words.len() / 2 + 32).min(request.max_output_tokens as usize);

        let mut seed = request
            .prompt
            .bytes()
            .chain(request.model.bytes())
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));

        let mut tokens = Vec::with_capacity(target);
        for i in 0..target {
            seed = seed
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            if !words.is_empty() && seed % 10 > 5 {
                tokens.push(words[(seed as usize / 7) % words.len()].to_string());
            } else {
                tokens.push(format!("tok{}", (seed >> 33) % 1000 + i as u64));
            }
        }
        tokens
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ChunkStream, ProviderError> {
        let tokens = self.synthesize(request);
        let chunk_tokens = self.chunk_tokens;
        let (tx, rx) = mpsc::channel(4);

        tokio::spawn(async move {
            for group in tokens.chunks(chunk_tokens) {
                let chunk = TokenChunk {
                    text: format!("{} ", group.join(" ")),
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    // Receiver cancelled; stop producing.
                    return;
                }
            }
        });

        Ok(ChunkStream::from_channel(rx))
    }
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    text: String,
}

/// HTTP provider speaking a minimal completions protocol.
///
/// POSTs `{model, prompt, max_tokens, temperature}` to
/// `{base_url}/v1/completions` and expects `{"text": ...}` back.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            api_key: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<ChunkStream, ProviderError> {
        let url = format!("{}/v1/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": request.model,
            "prompt": request.prompt,
            "max_tokens": request.max_output_tokens,
            "temperature": request.temperature,
        });

        let mut http_request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            http_request = http_request.bearer_auth(key);
        }

        let response = http_request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::new(ProviderErrorKind::Timeout, e.to_string())
            } else {
                ProviderError::new(ProviderErrorKind::Transient, e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let kind = match status.as_u16() {
                429 => ProviderErrorKind::RateLimited,
                401 | 403 => ProviderErrorKind::Auth,
                400 | 404 | 422 => ProviderErrorKind::Malformed,
                _ => ProviderErrorKind::Transient,
            };
            return Err(ProviderError::new(
                kind,
                format!("provider returned HTTP {}", status.as_u16()),
            ));
        }

        let completion: CompletionBody = response.json().await.map_err(|e| {
            ProviderError::new(ProviderErrorKind::Malformed, format!("bad response body: {}", e))
        })?;

        debug!(provider = %self.name, bytes = completion.text.len(), "HTTP completion received");

        let (tx, rx) = mpsc::channel(1);
        let chunk = TokenChunk {
            text: completion.text,
        };
        // Single-chunk delivery; capacity 1 means this never blocks.
        let _ = tx.try_send(Ok(chunk));
        Ok(ChunkStream::from_channel(rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(prompt: &str) -> GenerationRequest {
        GenerationRequest {
            model: "gpt-4.1-mini".to_string(),
            prompt: prompt.to_string(),
            max_output_tokens: 128,
            temperature: 0.2,
        }
    }

    #[tokio::test]
    async fn test_scripted_provider_is_deterministic() {
        let provider = ScriptedProvider::default();

        let first = provider
            .generate(&request("tell me about the battery"))
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        let second = provider
            .generate(&request("tell me about the battery"))
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();

        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_provider_varies_by_prompt() {
        let provider = ScriptedProvider::default();

        let a = provider
            .generate(&request("first prompt"))
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        let b = provider
            .generate(&request("a different prompt entirely"))
            .await
            .unwrap()
            .collect_text()
            .await
            .unwrap();

        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_stream_cancel_stops_producer() {
        let provider = ScriptedProvider::default();
        let mut stream = provider
            .generate(&request("a long prompt with many words to chunk over"))
            .await
            .unwrap();

        // Take one chunk, then cancel; the producer task exits on its
        // next failed send rather than draining the whole sequence.
        let first = stream.next_chunk().await;
        assert!(first.is_some());
        stream.cancel();

        // Only already-buffered chunks (channel capacity 4) may still
        // arrive before the sequence terminates.
        let mut remaining = 0;
        while let Some(chunk) = stream.next_chunk().await {
            assert!(chunk.is_ok());
            remaining += 1;
            assert!(remaining <= 4, "producer kept sending after cancel");
        }
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::new(ProviderErrorKind::Timeout, "t").is_transient());
        assert!(ProviderError::new(ProviderErrorKind::RateLimited, "r").is_transient());
        assert!(ProviderError::new(ProviderErrorKind::Transient, "5xx").is_transient());
        assert!(!ProviderError::new(ProviderErrorKind::Auth, "401").is_transient());
        assert!(!ProviderError::new(ProviderErrorKind::Malformed, "400").is_transient());
    }
}
