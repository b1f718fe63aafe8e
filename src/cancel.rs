//! Composite cancellation: derive one signal from many.
//!
//! [`CompositeSignal`] yields a token that is cancelled the moment any input
//! token is (or already was) cancelled. Each still-live input gets a watcher
//! task that exits as soon as either side fires; `cleanup()` detaches every
//! watcher and is idempotent, and `Drop` runs it so no exit path leaks a
//! listener.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A cancellation signal derived from zero or more inputs.
#[derive(Debug)]
pub struct CompositeSignal {
    token: CancellationToken,
    watchers: Vec<JoinHandle<()>>,
}

impl CompositeSignal {
    /// Derive a signal from the given inputs. An input that is already
    /// cancelled trips the derived token immediately, without spawning a
    /// watcher for it.
    pub fn new<I>(inputs: I) -> Self
    where
        I: IntoIterator<Item = CancellationToken>,
    {
        let token = CancellationToken::new();
        let mut watchers = Vec::new();
        for input in inputs {
            if token.is_cancelled() {
                break;
            }
            if input.is_cancelled() {
                token.cancel();
                break;
            }
            let trigger = token.clone();
            let done = token.clone();
            watchers.push(tokio::spawn(async move {
                tokio::select! {
                    _ = input.cancelled() => trigger.cancel(),
                    _ = done.cancelled() => {}
                }
            }));
        }
        Self { token, watchers }
    }

    /// A clone of the derived token, suitable for handing to tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether the derived signal has fired.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the derived signal fires.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Detach all watchers from still-live inputs. Idempotent; also run by
    /// `Drop`.
    pub fn cleanup(&mut self) {
        for watcher in self.watchers.drain(..) {
            watcher.abort();
        }
    }
}

impl Drop for CompositeSignal {
    fn drop(&mut self) {
        self.cleanup();
    }
}
