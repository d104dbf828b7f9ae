//! Shared rate limiting, circuit breaking, and retry policies.
//!
//! Used by both the Tool Executor (per session+tool limits) and the Model
//! Gateway (per provider breaker). State is keyed by caller-chosen strings
//! and updated under a single mutex, so concurrent turns never race on a
//! read-modify-write.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Per-tool rate limit: at most `max_calls` within a sliding window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimit {
    /// Calls allowed within the window
    #[serde(default = "default_max_calls")]
    pub max_calls: u32,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_max_calls() -> u32 {
    30
}
fn default_window_ms() -> u64 {
    60_000
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            max_calls: default_max_calls(),
            window_ms: default_window_ms(),
        }
    }
}

/// Sliding-window call counter keyed by an arbitrary string.
///
/// The Tool Executor keys by `"{session_id}:{tool_name}"`.
#[derive(Debug, Default)]
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a call for `key` if the limit allows it.
    ///
    /// Returns `false` (and records nothing) when the window is full.
    pub fn try_acquire(&self, key: &str, limit: RateLimit) -> bool {
        let now = Instant::now();
        let window = Duration::from_millis(limit.window_ms);

        let mut windows = self.windows.lock().expect("limiter lock poisoned");
        let calls = windows.entry(key.to_string()).or_default();

        while let Some(front) = calls.front() {
            if now.duration_since(*front) > window {
                calls.pop_front();
            } else {
                break;
            }
        }

        if calls.len() as u32 >= limit.max_calls {
            return false;
        }

        calls.push_back(now);
        true
    }
}

/// Circuit breaker configuration shared by all keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures within the window that open the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Sliding window for counting failures, in milliseconds
    #[serde(default = "default_breaker_window_ms")]
    pub window_ms: u64,

    /// How long an open breaker skips its key before allowing a probe
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_breaker_window_ms() -> u64 {
    30_000
}
fn default_cooldown_ms() -> u64 {
    10_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_ms: default_breaker_window_ms(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

/// What a caller should do with the keyed dependency right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Breaker closed: call normally
    Allow,

    /// Cool-down elapsed: exactly one probe call is allowed
    Probe,

    /// Breaker open (or a probe is already in flight): skip this key
    Skip,
}

#[derive(Debug)]
enum BreakerState {
    Closed,
    Open { since: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct KeyState {
    state: BreakerState,
    failures: VecDeque<Instant>,
}

impl Default for KeyState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            failures: VecDeque::new(),
        }
    }
}

/// Per-key circuit breaker with half-open probing.
///
/// A success resets the consecutive-failure count; `failure_threshold`
/// consecutive failures inside the window open the breaker. After the
/// cool-down, one probe is allowed: its success closes the breaker, its
/// failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    keys: Mutex<HashMap<String, KeyState>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Decide whether `key` may be called right now.
    pub fn check(&self, key: &str) -> BreakerDecision {
        let mut keys = self.keys.lock().expect("breaker lock poisoned");
        let entry = keys.entry(key.to_string()).or_default();

        match entry.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::HalfOpen => BreakerDecision::Skip,
            BreakerState::Open { since } => {
                if since.elapsed() >= Duration::from_millis(self.config.cooldown_ms) {
                    entry.state = BreakerState::HalfOpen;
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Skip
                }
            }
        }
    }

    /// Record a successful call for `key`.
    pub fn record_success(&self, key: &str) {
        let mut keys = self.keys.lock().expect("breaker lock poisoned");
        let entry = keys.entry(key.to_string()).or_default();
        entry.state = BreakerState::Closed;
        entry.failures.clear();
    }

    /// Record a failed call for `key`.
    pub fn record_failure(&self, key: &str) {
        let now = Instant::now();
        let window = Duration::from_millis(self.config.window_ms);

        let mut keys = self.keys.lock().expect("breaker lock poisoned");
        let entry = keys.entry(key.to_string()).or_default();

        if matches!(entry.state, BreakerState::HalfOpen) {
            entry.state = BreakerState::Open { since: now };
            entry.failures.clear();
            return;
        }

        entry.failures.push_back(now);
        while let Some(front) = entry.failures.front() {
            if now.duration_since(*front) > window {
                entry.failures.pop_front();
            } else {
                break;
            }
        }

        if entry.failures.len() as u32 >= self.config.failure_threshold {
            entry.state = BreakerState::Open { since: now };
            entry.failures.clear();
        }
    }
}

/// Retry policy with exponential backoff for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    200
}
fn default_max_delay() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
