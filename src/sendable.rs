//! The two capabilities everything is dispatched through.

use crate::{CallContext, Outcome, Request, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Executes a [`Request`] and reports its [`Outcome`].
///
/// [`Client`](crate::Client) is the retry-capable implementation. The
/// outcome always carries the request that produced it; a failure is an
/// outcome with an error, never a panic.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Performs the logical call described by `request`.
    async fn send(&self, ctx: &CallContext, request: &Request) -> Outcome;
}

/// Anything that can be dispatched and report success or failure.
///
/// Implemented by [`Request`] and [`ApiRequest`](crate::ApiRequest), so both
/// can be mixed inside a [`WaitGroup`](crate::WaitGroup) or a
/// [`RunGroup`](crate::RunGroup).
#[async_trait]
pub trait Sendable: Send + Sync {
    /// Dispatches and waits for completion.
    async fn send(&self, ctx: &CallContext) -> Result<()>;
}

#[async_trait]
impl Sendable for Request {
    async fn send(&self, ctx: &CallContext) -> Result<()> {
        self.send_raw(ctx).await.map(|_| ())
    }
}

#[async_trait]
impl<T: Sendable + ?Sized> Sendable for Arc<T> {
    async fn send(&self, ctx: &CallContext) -> Result<()> {
        (**self).send(ctx).await
    }
}
