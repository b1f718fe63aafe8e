//! Execution configuration: the retry policy, per-call overrides, and the
//! construction-time validation errors.

use crate::backoff::{Backoff, BackoffError};
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError};
use crate::error::TypedError;
use crate::hooks::Hooks;
use crate::jitter::{Jitter, JitterError};
use crate::rules::{Normalizer, RuleSetError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Context handed to a `should_retry` predicate alongside the attempt number
/// and the normalized error.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext {
    /// Wall time since the call entered `run`.
    pub elapsed: Duration,
    /// The configured retry budget.
    pub max_retries: usize,
}

type RetryPredicate = dyn Fn(usize, &TypedError, &RetryContext) -> bool + Send + Sync;
pub(crate) type MapErrorFn = dyn Fn(TypedError) -> TypedError + Send + Sync;

/// Retry policy: budget, backoff, jitter, and an optional predicate that can
/// veto a retry the engine would otherwise make.
#[derive(Clone)]
pub struct RetryConfig {
    /// Retries allowed after the initial attempt; 0 disables retrying.
    pub max_retries: usize,
    pub backoff: Backoff,
    pub jitter: Jitter,
    pub should_retry: Option<Arc<RetryPredicate>>,
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("should_retry", &self.should_retry.is_some())
            .finish()
    }
}

impl Default for RetryConfig {
    /// Two retries with exponential backoff from one second and full jitter.
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::exponential(Duration::from_secs(1)),
            jitter: Jitter::Full { ratio: 100.0 },
            should_retry: None,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: usize) -> Self {
        Self { max_retries, ..Self::default() }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self { max_retries: 0, ..Self::default() }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Install a predicate consulted after the engine's own checks; returning
    /// `false` stops the loop.
    pub fn with_should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(usize, &TypedError, &RetryContext) -> bool + Send + Sync + 'static,
    {
        self.should_retry = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        self.backoff.validate()?;
        self.jitter.validate()?;
        Ok(())
    }
}

/// Errors surfaced when an executor (or derived config) is constructed.
#[derive(Debug)]
pub enum ConfigError {
    Backoff(BackoffError),
    Jitter(JitterError),
    CircuitBreaker(CircuitBreakerError),
    Rules(RuleSetError),
    ZeroTimeout,
    ZeroConcurrency,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Backoff(err) => write!(f, "invalid backoff configuration: {}", err),
            ConfigError::Jitter(err) => write!(f, "invalid jitter configuration: {}", err),
            ConfigError::CircuitBreaker(err) => {
                write!(f, "invalid circuit breaker configuration: {}", err)
            }
            ConfigError::Rules(err) => write!(f, "invalid rule configuration: {}", err),
            ConfigError::ZeroTimeout => write!(f, "timeout must be greater than zero"),
            ConfigError::ZeroConcurrency => write!(f, "concurrency must be greater than zero"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Backoff(err) => Some(err),
            ConfigError::Jitter(err) => Some(err),
            ConfigError::CircuitBreaker(err) => Some(err),
            ConfigError::Rules(err) => Some(err),
            _ => None,
        }
    }
}

impl From<BackoffError> for ConfigError {
    fn from(err: BackoffError) -> Self {
        ConfigError::Backoff(err)
    }
}

impl From<JitterError> for ConfigError {
    fn from(err: JitterError) -> Self {
        ConfigError::Jitter(err)
    }
}

impl From<CircuitBreakerError> for ConfigError {
    fn from(err: CircuitBreakerError) -> Self {
        ConfigError::CircuitBreaker(err)
    }
}

impl From<RuleSetError> for ConfigError {
    fn from(err: RuleSetError) -> Self {
        ConfigError::Rules(err)
    }
}

/// Per-call overrides, merged field-by-field over the executor's defaults.
/// Error normalization is inherited from the instance unless a replacement
/// [`Normalizer`] is supplied.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub(crate) signal: Option<CancellationToken>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) ignore_abort: Option<bool>,
    pub(crate) retry: Option<RetryConfig>,
    pub(crate) circuit_breaker: Option<CircuitBreakerConfig>,
    pub(crate) concurrency: Option<usize>,
    pub(crate) hooks: Hooks,
    pub(crate) normalizer: Option<Arc<Normalizer>>,
    pub(crate) map_error: Option<Arc<MapErrorFn>>,
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("signal", &self.signal.is_some())
            .field("timeout", &self.timeout)
            .field("ignore_abort", &self.ignore_abort)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("concurrency", &self.concurrency)
            .field("hooks", &self.hooks)
            .field("normalizer", &self.normalizer.is_some())
            .field("map_error", &self.map_error.is_some())
            .finish()
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Outer cancellation signal for this call.
    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Per-attempt timeout. Panics on a zero duration: that is a programmer
    /// error, not a runtime failure.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        assert!(!timeout.is_zero(), "timeout must be greater than zero");
        self.timeout = Some(timeout);
        self
    }

    pub fn ignore_abort(mut self, ignore_abort: bool) -> Self {
        self.ignore_abort = Some(ignore_abort);
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Breaker override. For a plain `run` call this builds a call-scoped
    /// breaker whose state does not outlive the call; use
    /// `Executor::with_config` for breaker state that persists across calls.
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Batch worker cap. Panics on zero.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        assert!(concurrency > 0, "concurrency must be greater than zero");
        self.concurrency = Some(concurrency);
        self
    }

    /// Hooks merged per-hook over the instance hooks.
    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replace the instance normalizer for this call.
    pub fn normalizer(mut self, normalizer: Normalizer) -> Self {
        self.normalizer = Some(Arc::new(normalizer));
        self
    }

    /// Final transformation applied to every normalized error.
    pub fn map_error<F>(mut self, map: F) -> Self
    where
        F: Fn(TypedError) -> TypedError + Send + Sync + 'static,
    {
        self.map_error = Some(Arc::new(map));
        self
    }
}
