//! The wait between attempts.
//!
//! The engine hands each jittered backoff delay to a [`RetryDelay`], which
//! owns the race between the timer and the caller's cancellation signal.
//! Resolving `false` means cancellation won and the retry must not happen.
//! Test implementations skip real time while preserving that contract.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Waits out the delay that precedes a retry.
pub trait RetryDelay: Send + Sync + std::fmt::Debug {
    /// Wait for `delay`, racing it against `cancel`. Resolves `true` when
    /// the full delay elapsed and `false` when cancellation fired first.
    fn wait(
        &self,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = bool> + Send>>;
}

/// Production wait backed by the tokio timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimerDelay;

impl RetryDelay for TimerDelay {
    fn wait(
        &self,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        Box::pin(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            }
        })
    }
}

/// Test wait that skips the timer but still yields to a cancellation that
/// has already fired.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantDelay;

impl RetryDelay for InstantDelay {
    fn wait(
        &self,
        _delay: Duration,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        Box::pin(async move { !cancel.is_cancelled() })
    }
}

/// Test wait that records every requested delay and completes immediately.
#[derive(Debug, Clone, Default)]
pub struct RecordingDelay {
    requested: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order.
    pub fn requested(&self) -> Vec<Duration> {
        self.requested.lock().unwrap().clone()
    }
}

impl RetryDelay for RecordingDelay {
    fn wait(
        &self,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        self.requested.lock().unwrap().push(delay);
        Box::pin(async move { !cancel.is_cancelled() })
    }
}
