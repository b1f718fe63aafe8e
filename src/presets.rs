//! Pre-configured executors for common call shapes.
//!
//! Presets encode sensible production defaults so callers don't have to
//! compose timeout, retry, and breaker settings by hand. Each function
//! returns a fresh executor with its own breaker state.

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::config::RetryConfig;
use crate::executor::Executor;
use crate::jitter::Jitter;
use std::time::Duration;

const EXTERNAL_API_TIMEOUT_SECS: u64 = 15;
const EXTERNAL_API_MAX_RETRIES: usize = 4;
const EXTERNAL_API_BACKOFF_MILLIS: u64 = 500;
const EXTERNAL_API_BACKOFF_CAP_SECS: u64 = 10;
const EXTERNAL_API_BREAKER_FAILURES: usize = 10;
const EXTERNAL_API_BREAKER_RESET_SECS: u64 = 60;

const DATABASE_TIMEOUT_SECS: u64 = 10;
const DATABASE_BREAKER_FAILURES: usize = 5;
const DATABASE_BREAKER_RESET_SECS: u64 = 30;

const FAST_LOOKUP_TIMEOUT_MILLIS: u64 = 100;

/// Third-party API calls: generous per-attempt timeout, patient exponential
/// retries with full jitter, and a forgiving breaker.
pub fn external_api() -> Executor {
    Executor::builder()
        .timeout(Duration::from_secs(EXTERNAL_API_TIMEOUT_SECS))
        .retry(
            RetryConfig::new(EXTERNAL_API_MAX_RETRIES)
                .with_backoff(
                    Backoff::exponential(Duration::from_millis(EXTERNAL_API_BACKOFF_MILLIS))
                        .with_max(Duration::from_secs(EXTERNAL_API_BACKOFF_CAP_SECS))
                        .expect("preset backoff cap exceeds its base"),
                )
                .with_jitter(Jitter::Full { ratio: 100.0 }),
        )
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: EXTERNAL_API_BREAKER_FAILURES,
            reset_timeout: Duration::from_secs(EXTERNAL_API_BREAKER_RESET_SECS),
            ..CircuitBreakerConfig::default()
        })
        .build()
        .expect("external_api preset is valid")
}

/// Database calls: no retries (the pool or driver owns those), a breaker to
/// shed load from a struggling primary.
pub fn database() -> Executor {
    Executor::builder()
        .timeout(Duration::from_secs(DATABASE_TIMEOUT_SECS))
        .retry(RetryConfig::none())
        .circuit_breaker(CircuitBreakerConfig {
            failure_threshold: DATABASE_BREAKER_FAILURES,
            reset_timeout: Duration::from_secs(DATABASE_BREAKER_RESET_SECS),
            ..CircuitBreakerConfig::default()
        })
        .build()
        .expect("database preset is valid")
}

/// Cache or in-memory lookups: a tight timeout and nothing else.
pub fn fast_lookup() -> Executor {
    Executor::builder()
        .timeout(Duration::from_millis(FAST_LOOKUP_TIMEOUT_MILLIS))
        .retry(RetryConfig::none())
        .build()
        .expect("fast_lookup preset is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::error::BoxError;

    #[tokio::test]
    async fn presets_build_and_run() {
        for executor in [external_api(), database(), fast_lookup()] {
            let result = executor.run(|_ctx| async { Ok::<_, BoxError>(1u32) }).await;
            assert!(result.ok());
        }
    }

    #[test]
    fn breaker_presence_matches_the_preset() {
        assert_eq!(external_api().circuit_state(), Some(CircuitState::Closed));
        assert_eq!(database().circuit_state(), Some(CircuitState::Closed));
        assert_eq!(fast_lookup().circuit_state(), None);
    }
}
