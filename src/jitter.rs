//! Jitter strategies to prevent synchronized retry storms.
//!
//! Which strategy to use:
//! - `None`: deterministic retries for tests or tightly controlled workflows.
//! - `Full { ratio }`: uniform in `[delay * (1 - ratio/100), delay]`; at
//!   ratio 100 this spreads over the whole `[0, delay]` window.
//! - `Equal { ratio }`: uniform in `[delay * (1 - ratio/200), delay]`; the
//!   randomized window is half as wide, keeping a floor under the delay.
//! - `Custom`: caller-supplied transformer.
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be
//! injected via `apply_with_rng`. Millisecond conversions saturate to
//! `u64::MAX` to avoid panics on very large durations.

use rand::{rng, Rng};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Errors returned by jitter configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum JitterError {
    RatioOutOfRange { ratio: f64 },
}

impl fmt::Display for JitterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JitterError::RatioOutOfRange { ratio } => {
                write!(f, "jitter ratio must be within [0, 100] (got {})", ratio)
            }
        }
    }
}

impl std::error::Error for JitterError {}

type JitterFn = dyn Fn(Duration) -> Duration + Send + Sync;

/// Strategy for randomizing retry delays.
#[derive(Clone, Default)]
pub enum Jitter {
    /// No jitter, use the exact backoff delay.
    #[default]
    None,
    /// Uniform in `[delay * (1 - ratio/100), delay]`.
    Full { ratio: f64 },
    /// Uniform in `[delay * (1 - ratio/200), delay]`.
    Equal { ratio: f64 },
    /// Caller-supplied transformer.
    Custom(Arc<JitterFn>),
}

impl fmt::Debug for Jitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Jitter::None => f.write_str("None"),
            Jitter::Full { ratio } => f.debug_struct("Full").field("ratio", ratio).finish(),
            Jitter::Equal { ratio } => f.debug_struct("Equal").field("ratio", ratio).finish(),
            Jitter::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn validate_ratio(ratio: f64) -> Result<f64, JitterError> {
    if (0.0..=100.0).contains(&ratio) {
        Ok(ratio)
    } else {
        Err(JitterError::RatioOutOfRange { ratio })
    }
}

impl Jitter {
    /// Create a full jitter strategy. `ratio` is a percentage in `[0, 100]`.
    pub fn full(ratio: f64) -> Result<Self, JitterError> {
        Ok(Jitter::Full { ratio: validate_ratio(ratio)? })
    }

    /// Create an equal jitter strategy. `ratio` is a percentage in `[0, 100]`.
    pub fn equal(ratio: f64) -> Result<Self, JitterError> {
        Ok(Jitter::Equal { ratio: validate_ratio(ratio)? })
    }

    /// Create a jitter strategy from a caller-supplied transformer.
    pub fn custom<F>(transform: F) -> Self
    where
        F: Fn(Duration) -> Duration + Send + Sync + 'static,
    {
        Jitter::Custom(Arc::new(transform))
    }

    /// Re-check the ratio for values assembled without the constructors.
    pub(crate) fn validate(&self) -> Result<(), JitterError> {
        match self {
            Jitter::Full { ratio } | Jitter::Equal { ratio } => {
                validate_ratio(*ratio).map(|_| ())
            }
            _ => Ok(()),
        }
    }

    /// Apply jitter to a delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        let mut rng = rng();
        self.apply_internal(delay, &mut rng)
    }

    /// Apply jitter with a caller-supplied RNG (for deterministic tests).
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        self.apply_internal(delay, rng)
    }

    fn as_millis_saturated(duration: Duration) -> u64 {
        duration.as_millis().try_into().unwrap_or(u64::MAX)
    }

    fn apply_internal<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        match self {
            Jitter::None => delay,
            Jitter::Full { ratio } => Self::window(delay, ratio / 100.0, rng),
            Jitter::Equal { ratio } => Self::window(delay, ratio / 200.0, rng),
            // A caller transform runs even on a zero delay; it may impose a
            // floor of its own.
            Jitter::Custom(transform) => transform(delay),
        }
    }

    /// Uniform in `[delay * (1 - fraction), delay]`, computed in milliseconds.
    fn window<R: Rng>(delay: Duration, fraction: f64, rng: &mut R) -> Duration {
        let millis = Self::as_millis_saturated(delay);
        if millis == 0 {
            return delay;
        }
        let span = (millis as f64 * fraction) as u64;
        let lower = millis.saturating_sub(span);
        Duration::from_millis(rng.random_range(lower..=millis))
    }
}
