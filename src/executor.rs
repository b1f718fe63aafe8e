//! The single-task engine and the executor factory.
//!
//! One `run` call is: breaker admission, then the attempt loop (invoke the
//! task, race it against its timeout and the caller's signal, classify the
//! failure, decide whether to retry, sleep with cancellation awareness),
//! then outcome packaging with metrics and a breaker update. `run` never
//! returns `Err` and never panics for validated configurations; `try_run`
//! collapses the result into `Result<T, TypedError>`.

use crate::batch;
use crate::cancel::CompositeSignal;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Rejection};
use crate::config::{ConfigError, MapErrorFn, RetryConfig, RetryContext, RunOptions};
use crate::delay::{RetryDelay, TimerDelay};
use crate::error::{AbortError, BoxError, ErrorCode, SharedError, TimeoutError, TypedError};
use crate::hooks::Hooks;
use crate::metrics::{Metrics, RetryRecord};
use crate::result::TaskResult;
use crate::rules::{Normalizer, Rule, RulesMode};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio_util::sync::CancellationToken;

/// Context handed to the task on every attempt.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Cancelled when the caller's signal fires or this attempt's timeout
    /// trips. Cooperative: the task decides what to do with it.
    pub signal: CancellationToken,
}

/// A configured task executor. Owns its circuit breaker state, its
/// normalizer, and its last observed circuit state; clones share all three.
#[derive(Clone)]
pub struct Executor {
    timeout: Option<Duration>,
    ignore_abort: bool,
    retry: RetryConfig,
    concurrency: Option<usize>,
    hooks: Hooks,
    map_error: Option<Arc<MapErrorFn>>,
    normalizer: Arc<Normalizer>,
    breaker: Option<CircuitBreaker>,
    breaker_config: Option<CircuitBreakerConfig>,
    last_circuit: Arc<Mutex<CircuitState>>,
    delay: Arc<dyn RetryDelay>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("timeout", &self.timeout)
            .field("ignore_abort", &self.ignore_abort)
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .field("hooks", &self.hooks)
            .field("map_error", &self.map_error.is_some())
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor {
    /// An executor with the default configuration: no timeout, no breaker,
    /// two retries with exponential backoff and full jitter.
    pub fn new() -> Self {
        Self::builder().build().expect("default configuration is valid")
    }

    pub fn builder() -> ExecutorBuilder {
        ExecutorBuilder::new()
    }

    /// Current breaker state, when a breaker is configured.
    pub fn circuit_state(&self) -> Option<CircuitState> {
        self.breaker.as_ref().map(|b| b.state())
    }

    pub(crate) fn default_concurrency(&self) -> Option<usize> {
        self.concurrency
    }

    /// Derive a new executor by merging `options` over this instance's
    /// defaults. The derived executor gets a fresh breaker built from the
    /// merged breaker config: breaker state is never shared across
    /// instances.
    pub fn with_config(&self, options: RunOptions) -> Result<Executor, ConfigError> {
        if let Some(timeout) = options.timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout);
            }
        }
        let retry = match options.retry {
            Some(retry) => {
                retry.validate()?;
                retry
            }
            None => self.retry.clone(),
        };
        let breaker_config = options.circuit_breaker.or_else(|| self.breaker_config.clone());
        let breaker = match &breaker_config {
            Some(config) => Some(CircuitBreaker::new(config.clone())?),
            None => None,
        };
        Ok(Executor {
            timeout: options.timeout.or(self.timeout),
            ignore_abort: options.ignore_abort.unwrap_or(self.ignore_abort),
            retry,
            concurrency: options.concurrency.or(self.concurrency),
            hooks: self.hooks.merged(&options.hooks),
            map_error: options.map_error.or_else(|| self.map_error.clone()),
            normalizer: options.normalizer.unwrap_or_else(|| self.normalizer.clone()),
            breaker,
            breaker_config,
            last_circuit: Arc::new(Mutex::new(CircuitState::Closed)),
            delay: self.delay.clone(),
        })
    }

    /// Run a task with the instance defaults.
    pub async fn run<T, Op, Fut>(&self, task: Op) -> TaskResult<T>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.run_with(task, RunOptions::default()).await
    }

    /// Run a task with per-call overrides merged over the instance defaults.
    pub async fn run_with<T, Op, Fut>(&self, mut task: Op, options: RunOptions) -> TaskResult<T>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let started = Instant::now();

        let timeout = options.timeout.or(self.timeout);
        let ignore_abort = options.ignore_abort.unwrap_or(self.ignore_abort);
        let retry = options.retry.as_ref().unwrap_or(&self.retry);
        let hooks = self.hooks.merged(&options.hooks);
        let map_error = options.map_error.as_ref().or(self.map_error.as_ref());
        let normalizer = options.normalizer.as_ref().unwrap_or(&self.normalizer);

        let call_breaker: Option<CircuitBreaker> = options.circuit_breaker.as_ref().map(|config| {
            CircuitBreaker::new(config.clone()).expect("per-call circuit breaker config must be valid")
        });
        let breaker = call_breaker.as_ref().or(self.breaker.as_ref());

        // Breaker admission.
        if let Some(b) = breaker {
            if let Err(rejection) = b.try_acquire() {
                self.observe_circuit(b, &hooks);
                let error = circuit_open_error(&rejection);
                tracing::warn!(
                    failures = rejection.failure_count,
                    retry_after_ms = rejection.retry_after.as_millis() as u64,
                    "call rejected: circuit open"
                );
                let metrics = Metrics::empty(started.elapsed(), Some(error.clone()));
                hooks.fire_finally(&metrics);
                return TaskResult::Failure { error, metrics };
            }
            self.observe_circuit(b, &hooks);
        }

        // Caller-signal short-circuit: the task is never invoked.
        let mut outer = CompositeSignal::new(options.signal.iter().cloned());
        if outer.is_cancelled() {
            let error = normalizer.normalize(Box::new(AbortError::new()));
            hooks.fire_abort(&error);
            if let Some(b) = breaker {
                b.release_probe();
            }
            let metrics = Metrics::empty(started.elapsed(), Some(error.clone()));
            hooks.fire_finally(&metrics);
            outer.cleanup();
            return TaskResult::Aborted { error, metrics };
        }

        let mut attempt = 0usize;
        let mut history: Vec<RetryRecord> = Vec::new();
        let mut last_error: Option<TypedError> = None;
        let mut abort_reported = false;

        let outcome: Result<T, TypedError> = loop {
            attempt += 1;
            let attempt_started = Instant::now();
            let mut attempt_signal = CompositeSignal::new([outer.token()]);
            let attempt_cancel = attempt_signal.token();
            let fut = task(TaskContext { signal: attempt_signal.token() });

            let raw_result: Result<T, BoxError> = match timeout {
                Some(limit) => {
                    tokio::select! {
                        biased;
                        _ = outer.cancelled() => Err(Box::new(AbortError::new()) as BoxError),
                        res = fut => res,
                        _ = tokio::time::sleep(limit) => {
                            // Trip the attempt signal first so cooperating
                            // work the task spawned can stop.
                            attempt_cancel.cancel();
                            Err(Box::new(TimeoutError::new(attempt_started.elapsed(), limit)) as BoxError)
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = outer.cancelled() => Err(Box::new(AbortError::new()) as BoxError),
                        res = fut => res,
                    }
                }
            };
            attempt_signal.cleanup();

            let raw = match raw_result {
                Ok(data) => break Ok(data),
                Err(raw) => raw,
            };

            let mut error = normalizer.normalize(raw);
            if let Some(map) = map_error {
                error = apply_map(map, error);
            }
            last_error = Some(error.clone());

            if error.is_aborted() {
                if !abort_reported {
                    hooks.fire_abort(&error);
                    #[allow(unused_assignments)]
                    {
                        abort_reported = true;
                    }
                }
                if !ignore_abort {
                    hooks.fire_error(&error, attempt);
                    tracing::error!(attempt, "attempt aborted");
                }
                // Cancellation is terminal regardless of retry budget.
                break Err(error);
            }

            hooks.fire_error(&error, attempt);
            tracing::error!(attempt, code = error.code.as_str(), error = %error, "attempt failed");

            if !error.retryable {
                break Err(error);
            }
            if attempt > retry.max_retries {
                break Err(error);
            }
            if let Some(predicate) = &retry.should_retry {
                let ctx =
                    RetryContext { elapsed: started.elapsed(), max_retries: retry.max_retries };
                if !predicate(attempt, &error, &ctx) {
                    break Err(error);
                }
            }

            let base = retry.backoff.delay(attempt, &error);
            let delay = retry.jitter.apply(base);
            hooks.fire_retry(attempt, &error, delay);
            tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "retrying after failure");

            let slept = self.delay.wait(delay, outer.token()).await;
            if !slept {
                // The retry never happened, so it leaves no history entry;
                // retry_history stays in step with total_retries.
                let error = normalizer.normalize(Box::new(AbortError::new()));
                if !abort_reported {
                    hooks.fire_abort(&error);
                }
                last_error = Some(error.clone());
                break Err(error);
            }
            history.push(RetryRecord {
                attempt,
                error: error.clone(),
                delay,
                at: SystemTime::now(),
            });
        };

        let metrics = Metrics {
            total_attempts: attempt,
            total_retries: attempt.saturating_sub(1),
            total_duration: started.elapsed(),
            last_error,
            retry_history: history,
        };

        let result = match outcome {
            Ok(data) => {
                hooks.fire_success(&metrics);
                tracing::info!(attempts = metrics.total_attempts, "task succeeded");
                TaskResult::Success { data, metrics }
            }
            Err(error) => TaskResult::from_error(error, metrics),
        };

        hooks.fire_finally(result.metrics());

        if let Some(b) = breaker {
            match result.error() {
                None => b.record_success(),
                Some(error) => b.record_failure(error),
            }
            self.observe_circuit(b, &hooks);
        }

        outer.cleanup();
        result
    }

    /// Run a task, collapsing the outcome into `Result<T, TypedError>`.
    pub async fn try_run<T, Op, Fut>(&self, task: Op) -> Result<T, TypedError>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.run(task).await.into_result()
    }

    /// `try_run` with per-call overrides.
    pub async fn try_run_with<T, Op, Fut>(
        &self,
        task: Op,
        options: RunOptions,
    ) -> Result<T, TypedError>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.run_with(task, options).await.into_result()
    }

    /// Run a batch of tasks through a bounded worker pool. The result vector
    /// is index-aligned with the input regardless of completion order.
    pub async fn run_all<T, Op, Fut>(&self, tasks: Vec<Op>) -> Vec<TaskResult<T>>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        batch::run_batch(self, tasks, RunOptions::default()).await
    }

    /// `run_all` with per-call overrides (including `concurrency`).
    pub async fn run_all_with<T, Op, Fut>(
        &self,
        tasks: Vec<Op>,
        options: RunOptions,
    ) -> Vec<TaskResult<T>>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        batch::run_batch(self, tasks, options).await
    }

    /// Run a batch and return the success values, or the first non-success
    /// error in input order.
    pub async fn try_run_all<T, Op, Fut>(&self, tasks: Vec<Op>) -> Result<Vec<T>, TypedError>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        self.try_run_all_with(tasks, RunOptions::default()).await
    }

    /// `try_run_all` with per-call overrides.
    pub async fn try_run_all_with<T, Op, Fut>(
        &self,
        tasks: Vec<Op>,
        options: RunOptions,
    ) -> Result<Vec<T>, TypedError>
    where
        T: Send,
        Op: FnMut(TaskContext) -> Fut + Send,
        Fut: Future<Output = Result<T, BoxError>> + Send,
    {
        let results = self.run_all_with(tasks, options).await;
        let mut data = Vec::with_capacity(results.len());
        for result in results {
            data.push(result.into_result()?);
        }
        Ok(data)
    }

    /// Report a circuit transition if the observed state differs from the
    /// last observation.
    fn observe_circuit(&self, breaker: &CircuitBreaker, hooks: &Hooks) {
        let now = breaker.state();
        let prev = {
            let mut snapshot = self.last_circuit.lock().unwrap();
            let prev = *snapshot;
            if prev != now {
                *snapshot = now;
            }
            prev
        };
        if prev != now {
            hooks.fire_circuit_state_change(prev, now);
        }
    }
}

fn circuit_open_error(rejection: &Rejection) -> TypedError {
    TypedError::new(
        ErrorCode::CircuitOpen,
        format!(
            "circuit breaker open ({} failures, retry in {:?})",
            rejection.failure_count, rejection.retry_after
        ),
    )
    .with_meta(serde_json::json!({
        "failure_count": rejection.failure_count,
        "retry_after_ms": rejection.retry_after.as_millis() as u64,
    }))
}

/// Apply `map_error`, keeping the original error if the mapper panics.
fn apply_map(map: &Arc<MapErrorFn>, error: TypedError) -> TypedError {
    let fallback = error.clone();
    match catch_unwind(AssertUnwindSafe(move || map(error))) {
        Ok(mapped) => mapped,
        Err(_) => {
            tracing::debug!("map_error panicked; keeping the original error");
            fallback
        }
    }
}

/// Builder for [`Executor`]. Validates the whole configuration in `build`.
#[derive(Clone)]
pub struct ExecutorBuilder {
    timeout: Option<Duration>,
    ignore_abort: bool,
    retry: RetryConfig,
    concurrency: Option<usize>,
    hooks: Hooks,
    map_error: Option<Arc<MapErrorFn>>,
    rules: Vec<Rule>,
    rules_mode: RulesMode,
    fallback: Option<Arc<dyn Fn(&SharedError) -> TypedError + Send + Sync>>,
    breaker: Option<CircuitBreakerConfig>,
    delay: Arc<dyn RetryDelay>,
}

impl std::fmt::Debug for ExecutorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorBuilder")
            .field("timeout", &self.timeout)
            .field("ignore_abort", &self.ignore_abort)
            .field("retry", &self.retry)
            .field("concurrency", &self.concurrency)
            .field("rules", &self.rules.len())
            .field("rules_mode", &self.rules_mode)
            .field("breaker", &self.breaker)
            .finish()
    }
}

impl Default for ExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutorBuilder {
    pub fn new() -> Self {
        Self {
            timeout: None,
            ignore_abort: true,
            retry: RetryConfig::default(),
            concurrency: None,
            hooks: Hooks::default(),
            map_error: None,
            rules: Vec::new(),
            rules_mode: RulesMode::default(),
            fallback: None,
            breaker: None,
            delay: Arc::new(TimerDelay),
        }
    }

    /// Per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// When false, `ABORTED` failures also fire `on_error`.
    pub fn ignore_abort(mut self, ignore_abort: bool) -> Self {
        self.ignore_abort = ignore_abort;
        self
    }

    /// Replace the whole retry policy.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Retry budget after the initial attempt.
    pub fn max_retries(mut self, max_retries: usize) -> Self {
        self.retry.max_retries = max_retries;
        self
    }

    pub fn backoff(mut self, backoff: crate::backoff::Backoff) -> Self {
        self.retry.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: crate::jitter::Jitter) -> Self {
        self.retry.jitter = jitter;
        self
    }

    pub fn should_retry<F>(mut self, predicate: F) -> Self
    where
        F: Fn(usize, &TypedError, &RetryContext) -> bool + Send + Sync + 'static,
    {
        self.retry = self.retry.with_should_retry(predicate);
        self
    }

    /// Default batch worker cap.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
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

    /// User classification rules, merged per [`RulesMode`].
    pub fn rules(mut self, rules: Vec<Rule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn rules_mode(mut self, mode: RulesMode) -> Self {
        self.rules_mode = mode;
        self
    }

    /// Replace the built-in `UNKNOWN` fallback for values no rule matched.
    pub fn fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(&SharedError) -> TypedError + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker = Some(config);
        self
    }

    /// Override how backoff delays are waited out (deterministic tests).
    pub fn with_retry_delay<D>(mut self, delay: D) -> Self
    where
        D: RetryDelay + 'static,
    {
        self.delay = Arc::new(delay);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<Executor, ConfigError> {
        if let Some(timeout) = self.timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout);
            }
        }
        if self.concurrency == Some(0) {
            return Err(ConfigError::ZeroConcurrency);
        }
        self.retry.validate()?;
        let mut normalizer = Normalizer::new(self.rules, self.rules_mode)?;
        if let Some(fallback) = self.fallback {
            normalizer = normalizer.with_fallback(move |raw| fallback(raw));
        }
        let normalizer = Arc::new(normalizer);
        let breaker = match &self.breaker {
            Some(config) => Some(CircuitBreaker::new(config.clone())?),
            None => None,
        };
        Ok(Executor {
            timeout: self.timeout,
            ignore_abort: self.ignore_abort,
            retry: self.retry,
            concurrency: self.concurrency,
            hooks: self.hooks,
            map_error: self.map_error,
            normalizer,
            breaker,
            breaker_config: self.breaker,
            last_circuit: Arc::new(Mutex::new(CircuitState::Closed)),
            delay: self.delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use crate::delay::{InstantDelay, RecordingDelay};
    use crate::error::HttpError;
    use crate::jitter::Jitter;
    use crate::result::ResultKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn flaky(fail_times: usize) -> (Arc<AtomicUsize>, impl FnMut(TaskContext) -> std::pin::Pin<Box<dyn Future<Output = Result<u32, BoxError>> + Send>>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let task = move |_ctx: TaskContext| {
            let counter = counter.clone();
            Box::pin(async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < fail_times {
                    Err(Box::new(HttpError::new(503, "unavailable")) as BoxError)
                } else {
                    Ok(42u32)
                }
            }) as std::pin::Pin<Box<dyn Future<Output = Result<u32, BoxError>> + Send>>
        };
        (calls, task)
    }

    fn quick() -> Executor {
        Executor::builder()
            .max_retries(3)
            .backoff(Backoff::fixed(Duration::ZERO))
            .with_jitter(Jitter::None)
            .with_retry_delay(InstantDelay)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn succeeds_first_attempt() {
        let executor = quick();
        let (calls, task) = flaky(0);
        let result = executor.run(task).await;
        assert!(result.ok());
        assert_eq!(*result.data().unwrap(), 42);
        assert_eq!(result.metrics().total_attempts, 1);
        assert_eq!(result.metrics().total_retries, 0);
        assert!(result.metrics().retry_history.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let executor = quick();
        let (calls, task) = flaky(2);
        let result = executor.run(task).await;
        assert!(result.ok());
        assert_eq!(result.metrics().total_attempts, 3);
        assert_eq!(result.metrics().total_retries, 2);
        assert_eq!(result.metrics().retry_history.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The last error before success is preserved for diagnostics.
        assert_eq!(result.metrics().last_error.as_ref().unwrap().code, ErrorCode::Http);
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_failure() {
        let executor = quick();
        let (calls, task) = flaky(usize::MAX);
        let result = executor.run(task).await;
        assert_eq!(result.kind(), ResultKind::Failure);
        assert_eq!(result.metrics().total_attempts, 4, "1 initial + 3 retries");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(result.error().unwrap().status, Some(503));
    }

    #[tokio::test]
    async fn non_retryable_failure_stops_immediately() {
        let executor = quick();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: TaskResult<u32> = executor
            .run(move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Box::new(HttpError::new(404, "not found")) as BoxError)
                }
            })
            .await;
        assert_eq!(result.kind(), ResultKind::Failure);
        assert_eq!(result.metrics().total_attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let error = result.error().unwrap();
        assert_eq!(error.code, ErrorCode::Http);
        assert_eq!(error.status, Some(404));
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn should_retry_predicate_can_veto() {
        let executor = Executor::builder()
            .max_retries(5)
            .backoff(Backoff::fixed(Duration::ZERO))
            .with_jitter(Jitter::None)
            .with_retry_delay(InstantDelay)
            .should_retry(|attempt, _error, _ctx| attempt < 2)
            .build()
            .unwrap();
        let (calls, task) = flaky(usize::MAX);
        let result = executor.run(task).await;
        assert!(!result.ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2, "attempt 2 is vetoed from retrying");
    }

    #[tokio::test]
    async fn timeout_produces_a_timeout_result() {
        let executor = Executor::builder()
            .timeout(Duration::from_millis(10))
            .retry(RetryConfig::none())
            .build()
            .unwrap();
        let result: TaskResult<u32> = executor
            .run(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(1u32)
            })
            .await;
        assert_eq!(result.kind(), ResultKind::Timeout);
        assert_eq!(result.error().unwrap().code, ErrorCode::Timeout);
        assert_eq!(result.metrics().total_attempts, 1);
    }

    #[tokio::test]
    async fn timeout_trips_the_attempt_signal() {
        let executor = Executor::builder()
            .timeout(Duration::from_millis(20))
            .retry(RetryConfig::none())
            .build()
            .unwrap();
        let observed = Arc::new(AtomicUsize::new(0));
        let observed_clone = observed.clone();
        let result: TaskResult<u32> = executor
            .run(move |ctx| {
                let observed = observed_clone.clone();
                async move {
                    // Spawned work holding the attempt signal sees the trip.
                    let watcher = tokio::spawn({
                        let signal = ctx.signal.clone();
                        let observed = observed.clone();
                        async move {
                            signal.cancelled().await;
                            observed.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    drop(watcher);
                    Ok(1u32)
                }
            })
            .await;
        assert_eq!(result.kind(), ResultKind::Timeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_signal_skips_the_task() {
        let executor = quick();
        let token = CancellationToken::new();
        token.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: TaskResult<u32> = executor
            .run_with(
                move |_ctx| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(1u32)
                    }
                },
                RunOptions::new().signal(token),
            )
            .await;
        assert_eq!(result.kind(), ResultKind::Aborted);
        assert_eq!(result.error().unwrap().code, ErrorCode::Aborted);
        assert_eq!(result.metrics().total_attempts, 0);
        assert!(result.metrics().retry_history.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_during_a_retry_sleep_aborts() {
        let token = CancellationToken::new();
        let executor = Executor::builder()
            .max_retries(5)
            .backoff(Backoff::fixed(Duration::from_secs(60)))
            .with_jitter(Jitter::None)
            .build()
            .unwrap();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });
        let result: TaskResult<u32> = executor
            .run_with(
                |_ctx| async { Err(Box::new(HttpError::new(503, "down")) as BoxError) },
                RunOptions::new().signal(token),
            )
            .await;
        assert_eq!(result.kind(), ResultKind::Aborted);
        let metrics = result.metrics();
        assert_eq!(metrics.total_attempts, 1);
        // The cancelled sleep means no retry happened: history and the
        // retry counter agree.
        assert_eq!(metrics.total_retries, 0);
        assert!(metrics.retry_history.is_empty());
    }

    #[tokio::test]
    async fn task_failing_with_abort_is_not_retried() {
        let executor = quick();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: TaskResult<u32> = executor
            .run(move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Box::new(AbortError::new()) as BoxError)
                }
            })
            .await;
        assert_eq!(result.kind(), ResultKind::Aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn backoff_delays_flow_through_the_retry_delay() {
        let recorder = RecordingDelay::new();
        let executor = Executor::builder()
            .max_retries(3)
            .backoff(Backoff::fixed(Duration::from_millis(25)))
            .with_jitter(Jitter::None)
            .with_retry_delay(recorder.clone())
            .build()
            .unwrap();
        let (_, task) = flaky(usize::MAX);
        let _ = executor.run(task).await;
        assert_eq!(
            recorder.requested(),
            vec![
                Duration::from_millis(25),
                Duration::from_millis(25),
                Duration::from_millis(25)
            ]
        );
    }

    #[tokio::test]
    async fn map_error_transforms_the_normalized_error() {
        let executor = quick();
        let result: TaskResult<u32> = executor
            .run_with(
                |_ctx| async { Err(Box::new(HttpError::new(500, "boom")) as BoxError) },
                RunOptions::new().map_error(|e| e.with_title("upstream failed").with_retryable(false)),
            )
            .await;
        let error = result.error().unwrap();
        assert_eq!(error.title.as_deref(), Some("upstream failed"));
        assert_eq!(result.metrics().total_attempts, 1, "mapped retryable=false stops the loop");
    }

    #[tokio::test]
    async fn panicking_map_error_keeps_the_original() {
        let executor = quick();
        let result: TaskResult<u32> = executor
            .run_with(
                |_ctx| async { Err(Box::new(HttpError::new(404, "gone")) as BoxError) },
                RunOptions::new().map_error(|_| panic!("mapper bug")),
            )
            .await;
        assert_eq!(result.error().unwrap().status, Some(404));
    }

    #[tokio::test]
    async fn hook_ordering_and_counts() {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let hooks = {
            let (a, b, c, d) = (log.clone(), log.clone(), log.clone(), log.clone());
            Hooks::new()
                .on_retry(move |attempt, _e, _d| a.lock().unwrap().push(format!("retry:{attempt}")))
                .on_error(move |_e, attempt| b.lock().unwrap().push(format!("error:{attempt}")))
                .on_success(move |_m| c.lock().unwrap().push("success".into()))
                .on_finally(move |m| d.lock().unwrap().push(format!("finally:{}", m.total_attempts)))
        };
        let executor = Executor::builder()
            .max_retries(3)
            .backoff(Backoff::fixed(Duration::ZERO))
            .with_jitter(Jitter::None)
            .with_retry_delay(InstantDelay)
            .hooks(hooks)
            .build()
            .unwrap();
        let (_, task) = flaky(2);
        let result = executor.run(task).await;
        assert!(result.ok());
        assert_eq!(
            *log.lock().unwrap(),
            vec!["error:1", "retry:1", "error:2", "retry:2", "success", "finally:3"]
        );
    }

    #[tokio::test]
    async fn panicking_hooks_do_not_change_the_result() {
        let hooks = Hooks::new()
            .on_error(|_, _| panic!("observer bug"))
            .on_finally(|_| panic!("observer bug"));
        let executor = Executor::builder()
            .max_retries(1)
            .backoff(Backoff::fixed(Duration::ZERO))
            .with_jitter(Jitter::None)
            .with_retry_delay(InstantDelay)
            .hooks(hooks)
            .build()
            .unwrap();
        let (_, task) = flaky(1);
        let result = executor.run(task).await;
        assert!(result.ok());
        assert_eq!(result.metrics().total_attempts, 2);
    }

    #[tokio::test]
    async fn custom_fallback_applies_to_unclassified_errors() {
        #[derive(Debug)]
        struct Opaque;
        impl std::fmt::Display for Opaque {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "opaque failure")
            }
        }
        impl std::error::Error for Opaque {}

        let executor = Executor::builder()
            .retry(RetryConfig::none())
            .fallback(|raw| {
                TypedError::new(ErrorCode::custom("OPAQUE"), raw.to_string()).with_retryable(false)
            })
            .build()
            .unwrap();
        let result: TaskResult<u32> =
            executor.run(|_ctx| async { Err(Box::new(Opaque) as BoxError) }).await;
        assert_eq!(result.error().unwrap().code, ErrorCode::custom("OPAQUE"));
    }

    #[tokio::test]
    async fn circuit_breaker_rejects_without_invoking_the_task() {
        let executor = Executor::builder()
            .retry(RetryConfig::none())
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 2,
                reset_timeout: Duration::from_secs(60),
                ..CircuitBreakerConfig::default()
            })
            .build()
            .unwrap();

        for _ in 0..2 {
            let result: TaskResult<u32> = executor
                .run(|_ctx| async { Err(Box::new(HttpError::new(500, "down")) as BoxError) })
                .await;
            assert!(!result.ok());
        }
        assert_eq!(executor.circuit_state(), Some(CircuitState::Open));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result: TaskResult<u32> = executor
            .run(move |_ctx| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(7u32)
                }
            })
            .await;
        assert_eq!(result.error().unwrap().code, ErrorCode::CircuitOpen);
        assert_eq!(result.metrics().total_attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn circuit_transitions_are_reported() {
        let transitions = Arc::new(Mutex::new(Vec::new()));
        let seen = transitions.clone();
        let executor = Executor::builder()
            .retry(RetryConfig::none())
            .circuit_breaker(CircuitBreakerConfig {
                failure_threshold: 1,
                reset_timeout: Duration::from_millis(40),
                ..CircuitBreakerConfig::default()
            })
            .hooks(Hooks::new().on_circuit_state_change(move |from, to| {
                seen.lock().unwrap().push((from, to));
            }))
            .build()
            .unwrap();

        let _: TaskResult<u32> = executor
            .run(|_ctx| async { Err(Box::new(HttpError::new(500, "down")) as BoxError) })
            .await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        let result: TaskResult<u32> = executor.run(|_ctx| async { Ok(1u32) }).await;
        assert!(result.ok());

        let seen = transitions.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
    }

    #[tokio::test]
    async fn with_config_derives_an_independent_executor() {
        let base = quick();
        let derived = base
            .with_config(RunOptions::new().timeout(Duration::from_millis(10)).retry(RetryConfig::none()))
            .unwrap();
        let result: TaskResult<u32> = derived
            .run(|_ctx| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(1u32)
            })
            .await;
        assert_eq!(result.kind(), ResultKind::Timeout);

        // The base executor is untouched.
        let (_, task) = flaky(0);
        assert!(base.run(task).await.ok());
    }

    #[tokio::test]
    async fn builder_rejects_invalid_config() {
        assert!(matches!(
            Executor::builder().timeout(Duration::ZERO).build(),
            Err(ConfigError::ZeroTimeout)
        ));
        assert!(matches!(
            Executor::builder().concurrency(0).build(),
            Err(ConfigError::ZeroConcurrency)
        ));
        let duplicate = vec![
            crate::rules::when(|_| false).to_code(ErrorCode::custom("X")).done(),
            crate::rules::when(|_| false).to_code(ErrorCode::custom("X")).done(),
        ];
        assert!(matches!(
            Executor::builder().rules(duplicate).build(),
            Err(ConfigError::Rules(_))
        ));
    }
}
