//! Convenience re-exports for the common surface.
//!
//! ```rust
//! use grit::prelude::*;
//! ```

pub use crate::backoff::Backoff;
pub use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use crate::config::{RetryConfig, RunOptions};
pub use crate::error::{BoxError, ErrorCode, TypedError};
pub use crate::executor::{Executor, TaskContext};
pub use crate::hooks::Hooks;
pub use crate::jitter::Jitter;
pub use crate::result::{partition, ResultKind, TaskResult};
pub use crate::rules::{instance, instance_as, when, RulesMode};
