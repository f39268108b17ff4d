//! Request-scoped context threaded through every layer of a call.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Ambient state of one logical operation.
///
/// A `CallContext` carries the cancellation signal shared by every task of
/// an operation and the number of the try currently in flight. The retry
/// loop of [`Client`](crate::Client) hands listeners and transports a copy
/// whose [`attempt`](Self::attempt) reflects the current try, so collaborators
/// deep in a call can tell a first try from a retry without an extra
/// parameter.
///
/// Every context also remembers the highest try number reached by the calls
/// sent under it or its clones. [`ApiRequest`](crate::ApiRequest) hands its
/// post-flight hooks a context reporting that number, so a hook can tell
/// that one of the requests it waited on had to be retried.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    attempt: u32,
    reached: Arc<AtomicU32>,
}

impl CallContext {
    /// Creates a fresh context with its own cancellation token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context observing an existing cancellation token.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Self::default()
        }
    }

    /// A child context: cancelling the parent cancels the child, not the
    /// other way around.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            attempt: self.attempt,
            reached: Arc::clone(&self.reached),
        }
    }

    /// The try number of the call in flight, starting at 1.
    ///
    /// Returns 0 outside of a call.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns `true` when the call in flight is not its first try.
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }

    pub(crate) fn with_attempt(&self, attempt: u32) -> Self {
        Self {
            cancel: self.cancel.clone(),
            attempt,
            reached: Arc::clone(&self.reached),
        }
    }

    /// Same cancellation and try number, with its own record of the tries
    /// reached.
    pub(crate) fn scope(&self) -> Self {
        Self {
            cancel: self.cancel.clone(),
            attempt: self.attempt,
            reached: Arc::default(),
        }
    }

    pub(crate) fn record_attempt(&self, attempt: u32) {
        self.reached.fetch_max(attempt, Ordering::AcqRel);
    }

    /// The highest try number reached by calls sent under this context.
    pub(crate) fn reached_attempt(&self) -> u32 {
        self.reached.load(Ordering::Acquire)
    }

    /// Trips the cancellation signal.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns `true` once the cancellation signal was tripped.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the cancellation signal is tripped.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// The underlying token, for integration with other cancellable work.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
