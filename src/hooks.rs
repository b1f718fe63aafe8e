//! Observability hooks.
//!
//! Hooks are optional callbacks fired at well-defined points of a call.
//! Every invocation goes through a panic guard: a hook that panics is logged
//! and discarded, and can never alter control flow, metrics, or the result.

use crate::circuit_breaker::CircuitState;
use crate::error::TypedError;
use crate::metrics::Metrics;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

type MetricsHook = dyn Fn(&Metrics) + Send + Sync;
type ErrorHook = dyn Fn(&TypedError, usize) + Send + Sync;
type RetryHook = dyn Fn(usize, &TypedError, Duration) + Send + Sync;
type AbortHook = dyn Fn(&TypedError) + Send + Sync;
type CircuitHook = dyn Fn(CircuitState, CircuitState) + Send + Sync;

/// Optional callbacks observing a call's lifecycle.
///
/// Per call, hooks fire in this order: at most one `on_abort` (first
/// observed abort), `on_retry` before each sleep, `on_error` once per
/// attempt ending in a non-abort error, `on_success` xor a final `on_error`,
/// then exactly one `on_finally`. Circuit transitions are reported as they
/// are observed.
#[derive(Clone, Default)]
pub struct Hooks {
    pub(crate) on_success: Option<Arc<MetricsHook>>,
    pub(crate) on_error: Option<Arc<ErrorHook>>,
    pub(crate) on_retry: Option<Arc<RetryHook>>,
    pub(crate) on_finally: Option<Arc<MetricsHook>>,
    pub(crate) on_abort: Option<Arc<AbortHook>>,
    pub(crate) on_circuit_state_change: Option<Arc<CircuitHook>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_retry", &self.on_retry.is_some())
            .field("on_finally", &self.on_finally.is_some())
            .field("on_abort", &self.on_abort.is_some())
            .field("on_circuit_state_change", &self.on_circuit_state_change.is_some())
            .finish()
    }
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fired once after the final attempt succeeds. Receives the call's
    /// metrics; the success value flows through the returned result.
    pub fn on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Metrics) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Fired once per attempt that ended in a non-abort error (and for
    /// aborts too when `ignore_abort` is off). Receives the normalized error
    /// and the attempt number.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TypedError, usize) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Fired before each retry sleep with the attempt that failed, the
    /// error, and the delay about to be applied.
    pub fn on_retry<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, &TypedError, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }

    /// Fired exactly once per call, after outcome packaging.
    pub fn on_finally<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Metrics) + Send + Sync + 'static,
    {
        self.on_finally = Some(Arc::new(hook));
        self
    }

    /// Fired at most once per call, on the first observed abort.
    pub fn on_abort<F>(mut self, hook: F) -> Self
    where
        F: Fn(&TypedError) + Send + Sync + 'static,
    {
        self.on_abort = Some(Arc::new(hook));
        self
    }

    /// Fired whenever the observed circuit state differs from the previous
    /// observation, with (from, to).
    pub fn on_circuit_state_change<F>(mut self, hook: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_circuit_state_change = Some(Arc::new(hook));
        self
    }

    /// Per-hook merge: every hook set in `overrides` replaces the base hook.
    pub(crate) fn merged(&self, overrides: &Hooks) -> Hooks {
        Hooks {
            on_success: overrides.on_success.clone().or_else(|| self.on_success.clone()),
            on_error: overrides.on_error.clone().or_else(|| self.on_error.clone()),
            on_retry: overrides.on_retry.clone().or_else(|| self.on_retry.clone()),
            on_finally: overrides.on_finally.clone().or_else(|| self.on_finally.clone()),
            on_abort: overrides.on_abort.clone().or_else(|| self.on_abort.clone()),
            on_circuit_state_change: overrides
                .on_circuit_state_change
                .clone()
                .or_else(|| self.on_circuit_state_change.clone()),
        }
    }

    pub(crate) fn fire_success(&self, metrics: &Metrics) {
        if let Some(hook) = &self.on_success {
            guard("on_success", || hook(metrics));
        }
    }

    pub(crate) fn fire_error(&self, error: &TypedError, attempt: usize) {
        if let Some(hook) = &self.on_error {
            guard("on_error", || hook(error, attempt));
        }
    }

    pub(crate) fn fire_retry(&self, attempt: usize, error: &TypedError, delay: Duration) {
        if let Some(hook) = &self.on_retry {
            guard("on_retry", || hook(attempt, error, delay));
        }
    }

    pub(crate) fn fire_finally(&self, metrics: &Metrics) {
        if let Some(hook) = &self.on_finally {
            guard("on_finally", || hook(metrics));
        }
    }

    pub(crate) fn fire_abort(&self, error: &TypedError) {
        if let Some(hook) = &self.on_abort {
            guard("on_abort", || hook(error));
        }
    }

    pub(crate) fn fire_circuit_state_change(&self, from: CircuitState, to: CircuitState) {
        if let Some(hook) = &self.on_circuit_state_change {
            guard("on_circuit_state_change", || hook(from, to));
        }
    }
}

/// Run a hook, swallowing any panic so observability can never affect the
/// call.
fn guard<F: FnOnce()>(name: &'static str, hook: F) {
    if catch_unwind(AssertUnwindSafe(hook)).is_err() {
        tracing::debug!(hook = name, "hook panicked; discarded");
    }
}
