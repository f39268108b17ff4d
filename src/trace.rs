//! Lifecycle hooks fired during a logical call.
//!
//! A [`ClientTrace`] maps each [`TraceEventKind`] to an ordered list of
//! callbacks. Two traces compose by concatenating their lists per kind,
//! older first, so any number of independently registered observers fire in
//! registration order without knowing about each other.
//!
//! ```
//! use callweave::trace::{ClientTrace, TraceEvent, TraceEventKind};
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let (a, b) = (seen.clone(), seen.clone());
//!
//! let older = ClientTrace::new().on(TraceEventKind::FirstByte, move |_| a.lock().unwrap().push("older"));
//! let newer = ClientTrace::new().on(TraceEventKind::FirstByte, move |_| b.lock().unwrap().push("newer"));
//!
//! ClientTrace::compose(Some(&older), &newer).fire(&TraceEvent::FirstByte { attempt: 1 });
//! assert_eq!(*seen.lock().unwrap(), vec!["older", "newer"]);
//! ```

use crate::{CallContext, Error, Request};
use http::{HeaderMap, Method, StatusCode};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// The lifecycle points a [`ClientTrace`] can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TraceEventKind {
    /// A physical attempt is about to be sent.
    Start,
    /// Response status and headers were received.
    ResponseHeaders,
    /// The first byte of the response body arrived.
    FirstByte,
    /// A retry is about to wait for its backoff delay.
    Retry,
    /// Decoding of the response body into the result target started.
    ParseStart,
    /// Decoding of the response body finished.
    ParseDone,
    /// A physical attempt is fully processed.
    AttemptDone,
    /// The logical call is fully processed.
    Done,
}

/// Data handed to hooks. Hooks only observe; they cannot alter what later
/// hooks see.
#[derive(Debug)]
pub enum TraceEvent<'a> {
    /// See [`TraceEventKind::Start`].
    Start {
        /// The logical request being sent
        request: &'a Request,
        /// Method of this attempt (redirects may change it)
        method: &'a Method,
        /// URL of this attempt
        url: &'a Url,
        /// Try number, starting at 1
        attempt: u32,
    },
    /// See [`TraceEventKind::ResponseHeaders`].
    ResponseHeaders {
        /// Try number
        attempt: u32,
        /// Response status
        status: StatusCode,
        /// Response headers
        headers: &'a HeaderMap,
    },
    /// See [`TraceEventKind::FirstByte`].
    FirstByte {
        /// Try number
        attempt: u32,
    },
    /// See [`TraceEventKind::Retry`].
    Retry {
        /// Try number that failed
        attempt: u32,
        /// Delay before the next try
        delay: Duration,
        /// The error that triggered the retry
        error: &'a Error,
    },
    /// See [`TraceEventKind::ParseStart`].
    ParseStart {
        /// Try number
        attempt: u32,
    },
    /// See [`TraceEventKind::ParseDone`].
    ParseDone {
        /// Try number
        attempt: u32,
        /// Decoding error, if any
        error: Option<&'a Error>,
    },
    /// See [`TraceEventKind::AttemptDone`].
    AttemptDone {
        /// Try number
        attempt: u32,
        /// Response status, if a response was received
        status: Option<StatusCode>,
        /// Size of the response body in bytes
        body_size: usize,
        /// Error of this attempt, if any
        error: Option<&'a Error>,
    },
    /// See [`TraceEventKind::Done`].
    Done {
        /// Number of tries made
        attempts: u32,
        /// Final response status, if any
        status: Option<StatusCode>,
        /// Final error, if any
        error: Option<&'a Error>,
    },
}

impl TraceEvent<'_> {
    /// The kind of this event.
    pub fn kind(&self) -> TraceEventKind {
        match self {
            TraceEvent::Start { .. } => TraceEventKind::Start,
            TraceEvent::ResponseHeaders { .. } => TraceEventKind::ResponseHeaders,
            TraceEvent::FirstByte { .. } => TraceEventKind::FirstByte,
            TraceEvent::Retry { .. } => TraceEventKind::Retry,
            TraceEvent::ParseStart { .. } => TraceEventKind::ParseStart,
            TraceEvent::ParseDone { .. } => TraceEventKind::ParseDone,
            TraceEvent::AttemptDone { .. } => TraceEventKind::AttemptDone,
            TraceEvent::Done { .. } => TraceEventKind::Done,
        }
    }
}

type Hook = Arc<dyn Fn(&TraceEvent<'_>) + Send + Sync>;

/// A set of lifecycle callbacks for one logical call.
#[derive(Clone, Default)]
pub struct ClientTrace {
    hooks: BTreeMap<TraceEventKind, Vec<Hook>>,
}

impl ClientTrace {
    /// Creates a trace with no callbacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the callback for `kind`, replacing any callback this trace
    /// already had for it. Use [`compose`](Self::compose) to fire several.
    pub fn on<F>(mut self, kind: TraceEventKind, hook: F) -> Self
    where
        F: Fn(&TraceEvent<'_>) + Send + Sync + 'static,
    {
        self.hooks.insert(kind, vec![Arc::new(hook)]);
        self
    }

    /// Returns `true` if at least one callback observes `kind`.
    pub fn is_set(&self, kind: TraceEventKind) -> bool {
        self.hooks.get(&kind).is_some_and(|hooks| !hooks.is_empty())
    }

    /// Number of callbacks registered for `kind`.
    pub fn len(&self, kind: TraceEventKind) -> usize {
        self.hooks.get(&kind).map_or(0, Vec::len)
    }

    /// Merges two traces. Kinds set in both fire `older` first, then `newer`;
    /// kinds set in only one pass through. An absent `older` yields a copy of
    /// `newer`.
    pub fn compose(older: Option<&ClientTrace>, newer: &ClientTrace) -> ClientTrace {
        let Some(older) = older else {
            return newer.clone();
        };

        let mut hooks = older.hooks.clone();
        for (kind, newer_hooks) in &newer.hooks {
            hooks
                .entry(*kind)
                .or_default()
                .extend(newer_hooks.iter().cloned());
        }
        ClientTrace { hooks }
    }

    /// Invokes every callback registered for the event's kind, in order.
    pub fn fire(&self, event: &TraceEvent<'_>) {
        if let Some(hooks) = self.hooks.get(&event.kind()) {
            for hook in hooks {
                hook(event);
            }
        }
    }
}

impl fmt::Debug for ClientTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.hooks.iter().map(|(kind, hooks)| (kind, hooks.len())))
            .finish()
    }
}

/// Produces the hooks for one logical call.
///
/// Invoked once per call by [`Client`](crate::Client), in registration order.
/// The returned context is handed to the next factory and, finally, to the
/// call itself. Closures with the matching signature implement this trait.
pub trait TraceFactory: Send + Sync {
    /// Returns the (possibly updated) context and the hooks for this call.
    fn trace(&self, ctx: &CallContext, request: &Request) -> (CallContext, ClientTrace);
}

impl<F> TraceFactory for F
where
    F: Fn(&CallContext, &Request) -> (CallContext, ClientTrace) + Send + Sync,
{
    fn trace(&self, ctx: &CallContext, request: &Request) -> (CallContext, ClientTrace) {
        self(ctx, request)
    }
}
