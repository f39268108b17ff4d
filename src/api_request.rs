//! Composition of many calls into one logical operation with a typed result.

use crate::{CallContext, Error, Request, Result, Sendable, Slot, WaitGroup};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::fmt;
use std::sync::Arc;

type PreHook = Arc<dyn Fn(&CallContext) -> Result<()> + Send + Sync>;
type PostHook<R> = Arc<dyn Fn(&CallContext, &Slot<R>, Result<()>) -> Result<()> + Send + Sync>;
type Generator = Arc<dyn Fn(&CallContext, &WaitGroup) -> Result<()> + Send + Sync>;

/// One logical operation made of zero or more [`Sendable`]s, producing a
/// single result of type `R`.
///
/// Sending runs the pre-flight hooks in order, dispatches every sendable
/// concurrently (generators may add more while the dispatch is in flight),
/// waits for all of them, then runs the post-flight hooks in order. Each
/// post-flight hook receives the current result and may replace it, so a
/// later hook can recover from or reclassify an earlier failure. Cancellation
/// is checked before the pre-flight hooks, after them, and before every
/// post-flight hook. Post-flight hooks see a context whose
/// [`attempt`](CallContext::attempt) is the highest try number reached by the
/// dispatched requests, so [`is_retry`](CallContext::is_retry) tells whether
/// any of them was retried.
///
/// # Examples
///
/// ```no_run
/// use callweave::{ApiRequest, CallContext, Client, Slot};
///
/// # async fn example() -> Result<(), callweave::Error> {
/// let client = Client::builder().base_url("https://api.example.com")?.build()?;
///
/// let names = Slot::<Vec<String>>::default();
/// let total = ApiRequest::new(Slot::new(0usize))
///     .and(client.get("/names").with_result(&names))
///     .on_success(move |total| {
///         total.set(names.get().len());
///         Ok(())
///     });
///
/// let count = total.call(&CallContext::new()).await?;
/// # Ok(())
/// # }
/// ```
pub struct ApiRequest<R> {
    sendables: Vec<Arc<dyn Sendable>>,
    generators: Vec<Generator>,
    pre: Vec<PreHook>,
    post: Vec<PostHook<R>>,
    result: Slot<R>,
    noop: bool,
}

impl<R> ApiRequest<R> {
    /// Creates an operation whose result lives in `result`.
    pub fn new(result: Slot<R>) -> Self {
        Self {
            sendables: Vec::new(),
            generators: Vec::new(),
            pre: Vec::new(),
            post: Vec::new(),
            result,
            noop: false,
        }
    }

    /// An operation that is already complete: nothing is dispatched, hooks
    /// still run against the pre-populated result.
    pub fn ready(value: R) -> Self {
        Self {
            noop: true,
            ..Self::new(Slot::new(value))
        }
    }

    /// Adds a sendable dispatched concurrently with the others.
    pub fn and<S>(mut self, sendable: S) -> Self
    where
        S: Sendable + 'static,
    {
        self.sendables.push(Arc::new(sendable));
        self
    }

    /// Adds a generator, run once the bound sendables are in flight. It may
    /// add further items to the live group, typically derived from earlier
    /// responses through completion listeners.
    pub fn generate<F>(mut self, generator: F) -> Self
    where
        F: Fn(&CallContext, &WaitGroup) -> Result<()> + Send + Sync + 'static,
    {
        self.generators.push(Arc::new(generator));
        self
    }

    /// Adds a pre-flight hook. The first error aborts the send.
    pub fn before<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallContext) -> Result<()> + Send + Sync + 'static,
    {
        self.pre.push(Arc::new(hook));
        self
    }

    /// Adds a post-flight hook receiving the current result, whatever it is.
    /// Its return value becomes the new current result.
    pub fn after<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CallContext, &Slot<R>, Result<()>) -> Result<()> + Send + Sync + 'static,
    {
        self.post.push(Arc::new(hook));
        self
    }

    /// Adds a post-flight hook run only while the operation is successful.
    pub fn on_success<F>(self, hook: F) -> Self
    where
        F: Fn(&Slot<R>) -> Result<()> + Send + Sync + 'static,
    {
        self.after(move |_, slot, result| match result {
            Ok(()) => hook(slot),
            Err(e) => Err(e),
        })
    }

    /// Adds a post-flight hook run only while the operation is failing. It
    /// may return `Ok(())` to suppress the error.
    pub fn on_error<F>(self, hook: F) -> Self
    where
        F: Fn(Error) -> Result<()> + Send + Sync + 'static,
    {
        self.after(move |_, _, result| result.or_else(|e| hook(e)))
    }

    /// The result slot.
    pub fn result(&self) -> &Slot<R> {
        &self.result
    }

    /// Returns `true` for an operation created with [`ready`](Self::ready).
    pub fn is_noop(&self) -> bool {
        self.noop
    }

    async fn dispatch(&self, ctx: &CallContext) -> Result<()> {
        let group = WaitGroup::new(ctx);
        for sendable in &self.sendables {
            group.add(Arc::clone(sendable));
        }

        let mut errors = Vec::new();
        for generator in &self.generators {
            if let Err(e) = generator(ctx, &group) {
                errors.push(e);
            }
        }

        match group.wait().await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(Error::Multiple(many)) => errors.extend(many),
            Err(e) => errors.push(e),
        }

        Error::from_many(errors)
    }
}

impl<R> ApiRequest<R>
where
    R: Clone + Send + 'static,
{
    /// Sends the operation and returns a clone of its result.
    pub async fn call(&self, ctx: &CallContext) -> Result<R> {
        self.send(ctx).await?;
        Ok(self.result.get())
    }
}

impl ApiRequest<()> {
    /// Parallel composition with no result: fails if any member fails.
    pub fn all<I>(sendables: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Sendable>>,
    {
        Self {
            sendables: sendables.into_iter().collect(),
            ..Self::new(Slot::new(()))
        }
    }
}

impl Request {
    /// Wraps the request in an [`ApiRequest`] whose result is the decoded
    /// response body.
    pub fn into_api<T>(self) -> ApiRequest<T>
    where
        T: DeserializeOwned + Default + Send + 'static,
    {
        let result = Slot::default();
        let request = self.with_result(&result);
        ApiRequest::new(result).and(request)
    }
}

#[async_trait]
impl<R> Sendable for ApiRequest<R>
where
    R: Send + 'static,
{
    async fn send(&self, ctx: &CallContext) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        for hook in &self.pre {
            hook(ctx)?;
        }

        if ctx.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let scope = ctx.scope();
        let mut result = if self.noop {
            Ok(())
        } else {
            self.dispatch(&scope).await
        };

        let reached = scope.reached_attempt();
        ctx.record_attempt(reached);
        let ctx = ctx.with_attempt(reached.max(ctx.attempt()));

        for hook in &self.post {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled);
            }
            result = hook(&ctx, &self.result, result);
        }

        result
    }
}

impl<R> Clone for ApiRequest<R> {
    fn clone(&self) -> Self {
        Self {
            sendables: self.sendables.clone(),
            generators: self.generators.clone(),
            pre: self.pre.clone(),
            post: self.post.clone(),
            result: self.result.clone(),
            noop: self.noop,
        }
    }
}

impl<R> fmt::Debug for ApiRequest<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiRequest")
            .field("sendables", &self.sendables.len())
            .field("generators", &self.generators.len())
            .field("pre", &self.pre.len())
            .field("post", &self.post.len())
            .field("noop", &self.noop)
            .finish()
    }
}
