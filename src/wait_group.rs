//! Unbounded concurrent dispatch that collects every failure.

use crate::{CallContext, Error, Result, Sendable};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::Notify;

/// Dispatches every added [`Sendable`] as its own task, immediately.
///
/// Items may be added while the group is being waited on, typically from a
/// completion listener of a running item; [`wait`](Self::wait) only returns
/// once nothing is pending, including those late additions. A failure never
/// stops the other items: every error is collected and reported together.
///
/// Handles are cheap to clone and all refer to the same group. Adding
/// requires a running tokio runtime.
///
/// # Examples
///
/// ```no_run
/// use callweave::{CallContext, Client, WaitGroup};
///
/// # async fn example() -> Result<(), callweave::Error> {
/// let client = Client::builder().base_url("https://api.example.com")?.build()?;
/// let ctx = CallContext::new();
///
/// let group = WaitGroup::new(&ctx);
/// for id in ["a", "b", "c"] {
///     group.add(client.delete("/items/{id}").with_path_param("id", id));
/// }
/// group.wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: CallContext,
    state: Mutex<State>,
    drained: Notify,
}

#[derive(Default)]
struct State {
    pending: usize,
    errors: Vec<Error>,
}

impl WaitGroup {
    /// Creates an empty group whose items run with `ctx`.
    pub fn new(ctx: &CallContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: ctx.clone(),
                state: Mutex::new(State::default()),
                drained: Notify::new(),
            }),
        }
    }

    /// Spawns `item`.
    pub fn add<S>(&self, item: S)
    where
        S: Sendable + 'static,
    {
        self.inner.state.lock().pending += 1;
        let guard = PendingGuard {
            inner: Arc::clone(&self.inner),
        };
        let ctx = self.inner.ctx.clone();

        tokio::spawn(async move {
            if let Err(error) = item.send(&ctx).await {
                tracing::debug!(error = %error, "Wait group item failed");
                guard.inner.state.lock().errors.push(error);
            }
            drop(guard);
        });
    }

    /// Number of items added and not yet finished.
    pub fn pending(&self) -> usize {
        self.inner.state.lock().pending
    }

    /// Waits until no item is pending.
    ///
    /// Returns the single error if exactly one item failed, an
    /// [`Error::Multiple`] if several did, or [`Error::Cancelled`] as soon as
    /// the group's context is cancelled. Collected errors are drained.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.inner.state.lock().pending == 0 {
                break;
            }

            tokio::select! {
                _ = self.inner.ctx.cancelled() => return Err(Error::Cancelled),
                _ = &mut drained => {}
            }
        }

        let errors = std::mem::take(&mut self.inner.state.lock().errors);
        Error::from_many(errors)
    }
}

/// Marks one item finished when dropped, even if its task panicked.
struct PendingGuard {
    inner: Arc<Inner>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        if std::thread::panicking() {
            state.errors.push(Error::other("wait group item panicked"));
        }
        state.pending -= 1;
        let drained = state.pending == 0;
        drop(state);

        if drained {
            self.inner.drained.notify_waiters();
        }
    }
}
