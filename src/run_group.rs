//! Bounded concurrent dispatch that stops at the first failure.

use crate::{CallContext, Error, Result, Sendable};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Runs queued [`Sendable`]s in FIFO order, at most `concurrency` at a time.
///
/// The first failure stops admission: queued items are discarded, items
/// already running finish but their results are ignored, and
/// [`run_and_wait`](Self::run_and_wait) returns that error right away.
/// Items may be added while the group runs, including from inside a running
/// item.
///
/// # Examples
///
/// ```no_run
/// use callweave::{CallContext, Client, RunGroup};
///
/// # async fn example() -> Result<(), callweave::Error> {
/// let client = Client::builder().base_url("https://api.example.com")?.build()?;
/// let ctx = CallContext::new();
///
/// let group = RunGroup::new(&ctx, 4);
/// for page in 0..20 {
///     group.add(client.get("/pages/{n}").with_path_param("n", page.to_string()));
/// }
/// group.run_and_wait().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RunGroup {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: CallContext,
    permits: Arc<Semaphore>,
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    queue: VecDeque<Arc<dyn Sendable>>,
    running: usize,
    dispatched: usize,
    failed: bool,
    first_error: Option<Error>,
}

impl RunGroup {
    /// Creates a group admitting at most `concurrency` items at once (at
    /// least one).
    pub fn new(ctx: &CallContext, concurrency: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx: ctx.clone(),
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                state: Mutex::new(State::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Queues `item`. Ignored once the group has failed.
    pub fn add<S>(&self, item: S)
    where
        S: Sendable + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.failed {
                tracing::debug!("Run group already failed, discarding item");
                return;
            }
            state.queue.push_back(Arc::new(item));
        }
        self.inner.changed.notify_waiters();
    }

    /// Number of items that were admitted and started.
    pub fn dispatched(&self) -> usize {
        self.inner.state.lock().dispatched
    }

    /// Number of items waiting for admission.
    pub fn queued(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Dispatches queued items until none is queued or running, or until the
    /// first failure, which is returned immediately.
    ///
    /// Only one caller should drive a group at a time.
    pub async fn run_and_wait(&self) -> Result<()> {
        loop {
            let Some(item) = self.next_item().await? else {
                return Ok(());
            };

            let permit = tokio::select! {
                biased;
                _ = self.inner.ctx.cancelled() => return Err(Error::Cancelled),
                permit = Arc::clone(&self.inner.permits).acquire_owned() => permit
                    .map_err(|_| Error::Configuration("run group semaphore closed".to_string()))?,
            };

            {
                let mut state = self.inner.state.lock();
                if let Some(error) = state.first_error.take() {
                    return Err(error);
                }
                state.running += 1;
                state.dispatched += 1;
            }

            let guard = RunningGuard {
                inner: Arc::clone(&self.inner),
                _permit: permit,
            };
            let ctx = self.inner.ctx.clone();
            tokio::spawn(async move {
                let result = item.send(&ctx).await;
                if let Err(error) = result {
                    guard.fail(error);
                }
                drop(guard);
            });
        }
    }

    /// Waits for the next queued item. `None` once nothing is queued or
    /// running.
    async fn next_item(&self) -> Result<Option<Arc<dyn Sendable>>> {
        loop {
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if let Some(error) = state.first_error.take() {
                    return Err(error);
                }
                if let Some(item) = state.queue.pop_front() {
                    return Ok(Some(item));
                }
                if state.running == 0 {
                    return Ok(None);
                }
            }

            tokio::select! {
                _ = self.inner.ctx.cancelled() => return Err(Error::Cancelled),
                _ = &mut changed => {}
            }
        }
    }
}

/// Tracks one running item. The permit is released only after the item's
/// result was recorded.
struct RunningGuard {
    inner: Arc<Inner>,
    _permit: OwnedSemaphorePermit,
}

impl RunningGuard {
    fn fail(&self, error: Error) {
        let mut state = self.inner.state.lock();
        if state.failed {
            tracing::debug!(error = %error, "Run group already failed, ignoring error");
            return;
        }
        tracing::debug!(error = %error, "Run group item failed, stopping admission");
        state.failed = true;
        state.queue.clear();
        state.first_error = Some(error);
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.fail(Error::other("run group item panicked"));
        }
        self.inner.state.lock().running -= 1;
        self.inner.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Tracked {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        order: Arc<Mutex<Vec<usize>>>,
        id: usize,
    }

    #[async_trait]
    impl Sendable for Tracked {
        async fn send(&self, _ctx: &CallContext) -> Result<()> {
            self.order.lock().push(self.id);
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_respects_budget_and_fifo_order() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let order = Arc::new(Mutex::new(Vec::new()));

        let group = RunGroup::new(&CallContext::new(), 1);
        for id in 0..5 {
            group.add(Tracked {
                active: active.clone(),
                peak: peak.clone(),
                order: order.clone(),
                id,
            });
        }

        group.run_and_wait().await.unwrap();
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(group.dispatched(), 5);
    }

    #[tokio::test]
    async fn test_empty_group() {
        let group = RunGroup::new(&CallContext::new(), 3);
        assert!(group.run_and_wait().await.is_ok());
        assert_eq!(group.dispatched(), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_clamped() {
        let group = RunGroup::new(&CallContext::new(), 0);
        group.add(Tracked {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            order: Arc::new(Mutex::new(Vec::new())),
            id: 0,
        });
        group.run_and_wait().await.unwrap();
        assert_eq!(group.dispatched(), 1);
    }
}
