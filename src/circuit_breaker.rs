//! Circuit breaker with lock-free atomics.
//!
//! The breaker is passive: the engine asks for admission before each call
//! (`try_acquire`), reports the outcome afterwards (`record_success` /
//! `record_failure`), and reads `state()` for observability. The breaker
//! never calls back into the engine.

use crate::error::TypedError;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

/// Time source for the breaker's reset window. The breaker only ever asks
/// how much time has passed since it was built, so implementations deal in
/// elapsed durations, not timestamps; readings must be non-decreasing and
/// safe to take concurrently.
pub trait BreakerClock: Send + Sync + fmt::Debug {
    /// Time elapsed since this breaker's origin.
    fn elapsed(&self) -> Duration;
}

/// Default time source: process-monotonic, anchored when the breaker is
/// built. A reopened circuit measures its fresh reset window from the same
/// origin, so restarts of the process reset all windows together.
#[derive(Debug, Clone)]
pub struct UptimeClock {
    origin: Instant,
}

impl Default for UptimeClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl BreakerClock for UptimeClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Externally observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

type FailureFilter = dyn Fn(&TypedError) -> bool + Send + Sync;

/// Breaker policy knobs.
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive counted failures that open the circuit.
    pub failure_threshold: usize,
    /// How long the circuit stays open before probing.
    pub reset_timeout: Duration,
    /// Admissions allowed while half-open.
    pub half_open_max_probes: usize,
    /// When set, failures for which this returns `false` are not counted
    /// (e.g. validation errors that say nothing about downstream health).
    pub should_count_as_failure: Option<Arc<FailureFilter>>,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_threshold", &self.failure_threshold)
            .field("reset_timeout", &self.reset_timeout)
            .field("half_open_max_probes", &self.half_open_max_probes)
            .field("should_count_as_failure", &self.should_count_as_failure.is_some())
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_probes: 1,
            should_count_as_failure: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that is structurally present but never opens.
    pub fn disabled() -> Self {
        Self { failure_threshold: usize::MAX, ..Self::default() }
    }

    /// Install a failure filter.
    pub fn with_failure_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&TypedError) -> bool + Send + Sync + 'static,
    {
        self.should_count_as_failure = Some(Arc::new(filter));
        self
    }
}

/// Errors returned by breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitBreakerError {
    InvalidFailureThreshold(usize),
    InvalidProbeBudget(usize),
}

impl fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::InvalidFailureThreshold(n) => {
                write!(f, "failure_threshold must be > 0 (got {})", n)
            }
            CircuitBreakerError::InvalidProbeBudget(n) => {
                write!(f, "half_open_max_probes must be > 0 (got {})", n)
            }
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Why an admission was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejection {
    /// Counted failures at rejection time.
    pub failure_count: usize,
    /// Time until the next half-open probe becomes possible. Zero when the
    /// rejection came from an exhausted probe budget.
    pub retry_after: Duration,
}

struct Shared {
    state: AtomicU8,
    failure_count: AtomicUsize,
    opened_at_millis: AtomicU64,
    last_failure_at_millis: AtomicU64,
    half_open_probes: AtomicUsize,
}

/// Per-instance closed/open/half-open state machine.
#[derive(Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn BreakerClock>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Result<Self, CircuitBreakerError> {
        if config.failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold(0));
        }
        if config.half_open_max_probes == 0 {
            return Err(CircuitBreakerError::InvalidProbeBudget(0));
        }
        Ok(Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(STATE_CLOSED),
                failure_count: AtomicUsize::new(0),
                opened_at_millis: AtomicU64::new(0),
                last_failure_at_millis: AtomicU64::new(0),
                half_open_probes: AtomicUsize::new(0),
            }),
            config,
            clock: Arc::new(UptimeClock::default()),
        })
    }

    /// Override the clock (deterministic recovery tests).
    pub fn with_clock<C: BreakerClock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Clock reading in the millisecond grain the atomics store.
    fn now_millis(&self) -> u64 {
        self.clock.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    pub fn state(&self) -> CircuitState {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Ask to run one call. `Ok` admissions in the half-open state consume
    /// one probe from the budget.
    pub fn try_acquire(&self) -> Result<(), Rejection> {
        loop {
            match self.shared.state.load(Ordering::Acquire) {
                STATE_OPEN => {
                    let opened_at = self.shared.opened_at_millis.load(Ordering::Acquire);
                    let now = self.now_millis();
                    let elapsed = now.saturating_sub(opened_at);
                    let reset = self.config.reset_timeout.as_millis() as u64;
                    if elapsed < reset {
                        return Err(Rejection {
                            failure_count: self.shared.failure_count.load(Ordering::Acquire),
                            retry_after: Duration::from_millis(reset - elapsed),
                        });
                    }
                    match self.shared.state.compare_exchange(
                        STATE_OPEN,
                        STATE_HALF_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            // This admission is the first probe.
                            self.shared.half_open_probes.store(1, Ordering::Release);
                            tracing::info!("circuit breaker: open -> half-open");
                            return Ok(());
                        }
                        // Lost the race; re-evaluate whatever state won.
                        Err(_) => continue,
                    }
                }
                STATE_HALF_OPEN => {
                    let prev = self.shared.half_open_probes.fetch_add(1, Ordering::AcqRel);
                    if prev >= self.config.half_open_max_probes {
                        self.shared.half_open_probes.fetch_sub(1, Ordering::Release);
                        return Err(Rejection {
                            failure_count: self.shared.failure_count.load(Ordering::Acquire),
                            retry_after: Duration::ZERO,
                        });
                    }
                    tracing::debug!(
                        probes = prev + 1,
                        budget = self.config.half_open_max_probes,
                        "circuit breaker: half-open probe admitted"
                    );
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    /// Return a probe reserved by `try_acquire` without resolving it. Used
    /// when a call is cancelled between admission and the first attempt.
    pub(crate) fn release_probe(&self) {
        if self.shared.state.load(Ordering::Acquire) == STATE_HALF_OPEN {
            let _ = self.shared.half_open_probes.fetch_update(
                Ordering::AcqRel,
                Ordering::Acquire,
                |probes| probes.checked_sub(1),
            );
        }
    }

    pub fn record_success(&self) {
        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_CLOSED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.failure_count.store(0, Ordering::Release);
                    self.shared.opened_at_millis.store(0, Ordering::Release);
                    self.shared.half_open_probes.store(0, Ordering::Release);
                    tracing::info!("circuit breaker: half-open -> closed");
                }
            }
            STATE_CLOSED => {
                self.shared.failure_count.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    pub fn record_failure(&self, error: &TypedError) {
        if let Some(filter) = &self.config.should_count_as_failure {
            if !filter(error) {
                return;
            }
        }

        let failures = self.shared.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.last_failure_at_millis.store(self.now_millis(), Ordering::Release);

        match self.shared.state.load(Ordering::Acquire) {
            STATE_HALF_OPEN => {
                if self
                    .shared
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.shared.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::warn!(failures, "circuit breaker: probe failed, half-open -> open");
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .shared
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.shared.opened_at_millis.store(self.now_millis(), Ordering::Release);
                    tracing::error!(
                        failures,
                        threshold = self.config.failure_threshold,
                        "circuit breaker: closed -> open"
                    );
                }
            }
            _ => {}
        }
    }
}
