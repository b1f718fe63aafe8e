#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]
// TypedError is intentionally a rich diagnostic record; callers get it by
// value in `Result` positions.
#![allow(clippy::result_large_err)]

//! # grit
//!
//! Resilient async task execution: wrap a unit of work and get back a typed,
//! non-panicking result describing what happened — success, failure,
//! timeout, or aborted — along with attempt-level metrics.
//!
//! ## Features
//!
//! - **Retries** with fixed, exponential, fibonacci, or custom backoff and
//!   configurable jitter
//! - **Per-attempt timeouts** that trip the task's cancellation signal
//!   before surfacing the error
//! - **Circuit breaker** with closed/open/half-open recovery and probe
//!   budgets
//! - **Rule-driven error normalization** into an open set of stable codes
//! - **Bounded batch execution** with index-aligned results and
//!   deterministic cancellation
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use grit::{Backoff, BoxError, Executor, Jitter, RetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = Executor::builder()
//!         .timeout(Duration::from_secs(2))
//!         .retry(
//!             RetryConfig::new(3)
//!                 .with_backoff(Backoff::exponential(Duration::from_millis(200)))
//!                 .with_jitter(Jitter::Full { ratio: 100.0 }),
//!         )
//!         .build()
//!         .expect("valid configuration");
//!
//!     let result = executor
//!         .run(|_ctx| async move { Ok::<_, BoxError>("hello") })
//!         .await;
//!
//!     assert!(result.ok());
//!     assert_eq!(result.metrics().total_attempts, 1);
//! }
//! ```

pub mod backoff;
mod batch;
pub mod cancel;
pub mod circuit_breaker;
pub mod config;
pub mod delay;
pub mod error;
mod executor;
mod global;
pub mod hooks;
pub mod jitter;
pub mod metrics;
pub mod prelude;
pub mod presets;
pub mod result;
pub mod rules;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use cancel::CompositeSignal;
pub use circuit_breaker::{
    BreakerClock, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    Rejection, UptimeClock,
};
pub use config::{ConfigError, RetryConfig, RetryContext, RunOptions};
/// Retry-delay abstractions: `TimerDelay` for production,
/// `InstantDelay`/`RecordingDelay` for tests.
pub use delay::{InstantDelay, RecordingDelay, RetryDelay, TimerDelay};
pub use error::{AbortError, BoxError, ErrorCode, HttpError, SharedError, TimeoutError, TypedError};
pub use executor::{Executor, ExecutorBuilder, TaskContext};
pub use global::{default_executor, run, run_all, run_all_with, run_with, try_run, try_run_all};
pub use hooks::Hooks;
pub use jitter::{Jitter, JitterError};
pub use metrics::{Metrics, RetryRecord};
pub use result::{partition, Partitioned, ResultKind, TaskResult};
pub use rules::{
    builtin_rules, instance, instance_as, when, ErrorBody, Normalizer, Rule, RuleSetError, RulesMode,
};
