//! Backoff strategies for the retry loop.
//!
//! Each strategy computes a base delay for a 1-indexed attempt number; the
//! jitter transformer perturbs it afterwards. Delays saturate at a
//! documented maximum to avoid overflow.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use grit::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! ```

use crate::error::TypedError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffError {
    MaxNotSupported,
    MaxMustBePositive,
    MaxLessThanBase { base: Duration, max: Duration },
    FactorNotSupported,
    FactorTooSmall { factor: f64 },
}

impl fmt::Display for BackoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffError::MaxNotSupported => {
                write!(f, "with_max is only valid for Exponential or Fibonacci backoff")
            }
            BackoffError::MaxMustBePositive => write!(f, "max must be greater than zero"),
            BackoffError::MaxLessThanBase { base, max } => {
                write!(f, "max ({:?}) must be >= base ({:?})", max, base)
            }
            BackoffError::FactorNotSupported => {
                write!(f, "with_factor is only valid for Exponential backoff")
            }
            BackoffError::FactorTooSmall { factor } => {
                write!(f, "exponential factor must be > 1 (got {})", factor)
            }
        }
    }
}

impl std::error::Error for BackoffError {}

type DelayFn = dyn Fn(usize, &TypedError) -> Duration + Send + Sync;

/// Base-delay strategy for retries.
#[derive(Clone)]
pub enum Backoff {
    /// Fixed delay between retries.
    Fixed { delay: Duration },
    /// Geometrically increasing delay with optional cap.
    Exponential { base: Duration, factor: f64, max: Option<Duration> },
    /// Fibonacci-weighted delay with optional cap.
    Fibonacci { base: Duration, max: Option<Duration> },
    /// Caller-supplied delay function of (attempt, error).
    Custom(Arc<DelayFn>),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Fixed { delay } => f.debug_struct("Fixed").field("delay", delay).finish(),
            Backoff::Exponential { base, factor, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("factor", factor)
                .field("max", max)
                .finish(),
            Backoff::Fibonacci { base, max } => {
                f.debug_struct("Fibonacci").field("base", base).field("max", max).finish()
            }
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl Backoff {
    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Backoff::Fixed { delay }
    }

    /// Create an exponential backoff strategy with the default factor of 2.
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, factor: 2.0, max: None }
    }

    /// Create a fibonacci backoff strategy.
    pub fn fibonacci(base: Duration) -> Self {
        Backoff::Fibonacci { base, max: None }
    }

    /// Create a backoff strategy from a caller-supplied function.
    pub fn custom<F>(delay: F) -> Self
    where
        F: Fn(usize, &TypedError) -> Duration + Send + Sync + 'static,
    {
        Backoff::Custom(Arc::new(delay))
    }

    /// Set the growth factor for exponential backoff. Must be > 1.
    pub fn with_factor(mut self, factor: f64) -> Result<Self, BackoffError> {
        match &mut self {
            Backoff::Exponential { factor: existing, .. } => {
                if factor <= 1.0 {
                    return Err(BackoffError::FactorTooSmall { factor });
                }
                *existing = factor;
                Ok(self)
            }
            _ => Err(BackoffError::FactorNotSupported),
        }
    }

    /// Set a maximum delay (exponential or fibonacci).
    /// Returns an error for other variants, if `max` is zero, or if
    /// `max < base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self {
            Backoff::Exponential { max: existing, base, .. }
            | Backoff::Fibonacci { max: existing, base } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            _ => Err(BackoffError::MaxNotSupported),
        }
    }

    /// Re-check invariants for strategies assembled without the constructors.
    pub(crate) fn validate(&self) -> Result<(), BackoffError> {
        match self {
            Backoff::Exponential { base, factor, max } => {
                if *factor <= 1.0 {
                    return Err(BackoffError::FactorTooSmall { factor: *factor });
                }
                if let Some(max) = max {
                    if max < base {
                        return Err(BackoffError::MaxLessThanBase { base: *base, max: *max });
                    }
                }
                Ok(())
            }
            Backoff::Fibonacci { base, max } => {
                if let Some(max) = max {
                    if max < base {
                        return Err(BackoffError::MaxLessThanBase { base: *base, max: *max });
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Base delay for the given failed attempt (1-indexed). Attempt 0 is the
    /// initial call and yields no delay.
    pub fn delay(&self, attempt: usize, error: &TypedError) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential { base, factor, max } => {
                // factor^(attempt-1) in f64; saturate non-finite or huge results.
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let scaled = base.as_secs_f64() * factor.powi(exponent);
                let delay = if scaled.is_finite() && scaled < MAX_BACKOFF.as_secs_f64() {
                    Duration::from_secs_f64(scaled)
                } else {
                    MAX_BACKOFF
                };
                max.map(|m| delay.min(m)).unwrap_or(delay)
            }
            Backoff::Fibonacci { base, max } => {
                let multiplier = fibonacci(attempt);
                let nanos = base.as_nanos().saturating_mul(multiplier);
                let delay = Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64);
                max.map(|m| delay.min(m)).unwrap_or(delay)
            }
            Backoff::Custom(delay) => delay(attempt, error),
        }
    }
}

/// F(1) = F(2) = 1, saturating in u128.
fn fibonacci(n: usize) -> u128 {
    let mut prev: u128 = 0;
    let mut current: u128 = 1;
    for _ in 1..n {
        let next = prev.saturating_add(current);
        prev = current;
        current = next;
        if current == u128::MAX {
            break;
        }
    }
    current
}
