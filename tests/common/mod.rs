//! Shared helpers for the integration suites.

#![allow(dead_code)]

use async_trait::async_trait;
use callweave::trace::{ClientTrace, TraceEvent, TraceEventKind};
use callweave::transport::{AttemptEvents, PreparedRequest, Transport};
use callweave::{CallContext, Error, RawResponse, Request, Result};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use url::Url;

/// Routes `tracing` output to the test harness; filter with `RUST_LOG`.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a scripted transport does for one round-trip.
#[derive(Debug, Clone)]
pub enum Step {
    Respond(RawResponse),
    Timeout,
    /// Never answers.
    Hang,
}

pub fn respond(status: u16, body: &str) -> Step {
    Step::Respond(RawResponse::new(
        StatusCode::from_u16(status).unwrap(),
        HeaderMap::new(),
        body.to_string(),
    ))
}

pub fn respond_with_header(status: u16, name: &'static str, value: &str, body: &str) -> Step {
    let mut headers = HeaderMap::new();
    headers.insert(name, HeaderValue::from_str(value).unwrap());
    Step::Respond(RawResponse::new(
        StatusCode::from_u16(status).unwrap(),
        headers,
        body.to_string(),
    ))
}

/// In-memory transport replaying a script, then a fallback step forever.
#[derive(Clone)]
pub struct ScriptedTransport {
    script: Arc<Mutex<VecDeque<Step>>>,
    fallback: Step,
    seen: Arc<Mutex<Vec<(Method, Url)>>>,
    tries: Arc<Mutex<Vec<u32>>>,
}

impl ScriptedTransport {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into_iter().collect())),
            fallback: respond(200, ""),
            seen: Arc::new(Mutex::new(Vec::new())),
            tries: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always(step: Step) -> Self {
        Self {
            fallback: step,
            ..Self::new([])
        }
    }

    /// Method and URL of every round-trip so far.
    pub fn seen(&self) -> Vec<(Method, Url)> {
        self.seen.lock().clone()
    }

    /// The try number carried by the context of every round-trip.
    pub fn tries(&self) -> Vec<u32> {
        self.tries.lock().clone()
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(
        &self,
        ctx: &CallContext,
        request: &PreparedRequest,
        events: &AttemptEvents<'_>,
    ) -> Result<RawResponse> {
        self.tries.lock().push(ctx.attempt());
        self.seen
            .lock()
            .push((request.method.clone(), request.url.clone()));
        tokio::task::yield_now().await;

        let step = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match step {
            Step::Timeout => Err(Error::Timeout {
                method: request.method.clone(),
                url: request.url.clone(),
            }),
            Step::Hang => std::future::pending().await,
            Step::Respond(response) => {
                events.response_headers(response.status, &response.headers);
                if !response.body.is_empty() {
                    events.first_byte();
                }
                Ok(response)
            }
        }
    }
}

pub const ALL_KINDS: [TraceEventKind; 8] = [
    TraceEventKind::Start,
    TraceEventKind::ResponseHeaders,
    TraceEventKind::FirstByte,
    TraceEventKind::Retry,
    TraceEventKind::ParseStart,
    TraceEventKind::ParseDone,
    TraceEventKind::AttemptDone,
    TraceEventKind::Done,
];

/// A trace factory recording `<label>:<kind>` for every event.
pub fn recording_factory(
    label: &'static str,
    log: Arc<Mutex<Vec<String>>>,
) -> impl Fn(&CallContext, &Request) -> (CallContext, ClientTrace) + Send + Sync + 'static {
    move |ctx: &CallContext, _: &Request| {
        let mut trace = ClientTrace::new();
        for kind in ALL_KINDS {
            let log = log.clone();
            trace = trace.on(kind, move |event: &TraceEvent<'_>| {
                log.lock().push(format!("{}:{:?}", label, event.kind()));
            });
        }
        (ctx.clone(), trace)
    }
}
