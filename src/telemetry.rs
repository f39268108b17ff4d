//! OpenTelemetry spans and metrics for every call.
//!
//! [`Telemetry`] is a [`TraceFactory`]: register it with
//! [`Client::and_trace`](crate::Client::and_trace) and every logical call
//! produces an `http.call` span with one `http.attempt` child per physical
//! attempt, an `http.parse` child of the attempt while the body is decoded,
//! and an `http.retry.wait` child of the call for every backoff delay.
//! Values of redacted headers, query parameters and path parameters are
//! replaced by [`REDACTED`] in every span attribute and metric dimension.

use crate::request::encode_component;
use crate::trace::{ClientTrace, TraceEvent, TraceEventKind, TraceFactory};
use crate::{CallContext, Error, Request};
use http::StatusCode;
use opentelemetry::global::BoxedTracer;
use opentelemetry::metrics::{Histogram, Meter, UpDownCounter};
use opentelemetry::trace::{SpanKind, Status, TraceContextExt, Tracer};
use opentelemetry::{Context, KeyValue};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Replacement text of redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Root span of a logical call.
pub const CALL_SPAN: &str = "http.call";
/// Span of one physical attempt.
pub const ATTEMPT_SPAN: &str = "http.attempt";
/// Span of the decoding of a response body.
pub const PARSE_SPAN: &str = "http.parse";
/// Span of a backoff delay between two tries.
pub const RETRY_WAIT_SPAN: &str = "http.retry.wait";

/// Attribute keys.
pub mod attributes {
    pub const METHOD: &str = "http.request.method";
    pub const URL_TEMPLATE: &str = "url.template";
    pub const URL_FULL: &str = "url.full";
    pub const HEADER_PREFIX: &str = "http.request.header.";
    pub const QUERY_PREFIX: &str = "url.query.";
    pub const PATH_PREFIX: &str = "url.path.";
    pub const STATUS_CODE: &str = "http.response.status_code";
    pub const RETRY_ATTEMPT: &str = "http.retry.attempt";
    pub const RETRY_DELAY_MS: &str = "http.retry.delay_ms";
    pub const BODY_SIZE: &str = "http.response.body.size";
    pub const ERROR_TYPE: &str = "error.type";
}

/// Which values never leave the process in clear text.
///
/// Header names are matched case-insensitively. The default redacts
/// `authorization`, `proxy-authorization` and `cookie`.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    headers: BTreeSet<String>,
    query: BTreeSet<String>,
    path: BTreeSet<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::empty()
            .redact_header("authorization")
            .redact_header("proxy-authorization")
            .redact_header("cookie")
    }
}

impl TelemetryConfig {
    /// A configuration redacting nothing.
    pub fn empty() -> Self {
        Self {
            headers: BTreeSet::new(),
            query: BTreeSet::new(),
            path: BTreeSet::new(),
        }
    }

    /// Redacts the value of a request header.
    pub fn redact_header(mut self, name: impl AsRef<str>) -> Self {
        self.headers.insert(name.as_ref().to_ascii_lowercase());
        self
    }

    /// Redacts the value of a query parameter.
    pub fn redact_query(mut self, key: impl Into<String>) -> Self {
        self.query.insert(key.into());
        self
    }

    /// Redacts the value of a path parameter.
    pub fn redact_path_param(mut self, name: impl Into<String>) -> Self {
        self.path.insert(name.into());
        self
    }

    fn header_value<'a>(&self, name: &str, value: &'a str) -> &'a str {
        if self.headers.contains(&name.to_ascii_lowercase()) {
            REDACTED
        } else {
            value
        }
    }

    fn query_value<'a>(&self, key: &str, value: &'a str) -> &'a str {
        if self.query.contains(key) {
            REDACTED
        } else {
            value
        }
    }

    fn path_value<'a>(&self, name: &str, value: &'a str) -> &'a str {
        if self.path.contains(name) {
            REDACTED
        } else {
            value
        }
    }

    /// The effective URL of `request` with redacted values replaced.
    fn masked_request_url(&self, request: &Request) -> Option<String> {
        request
            .render_url(
                &|name, value| match self.path_value(name, value) {
                    REDACTED => REDACTED.to_string(),
                    value => encode_component(value),
                },
                &|key, value| match self.query_value(key, value) {
                    REDACTED => REDACTED.to_string(),
                    value => encode_component(value),
                },
            )
            .ok()
            .map(String::from)
    }

    /// `url` with the values of redacted query parameters replaced.
    fn masked_url(&self, url: &Url) -> String {
        let Some(query) = url.query() else {
            return url.to_string();
        };
        if !url
            .query_pairs()
            .any(|(key, _)| self.query.contains(key.as_ref()))
        {
            return url.to_string();
        }

        let masked = url::form_urlencoded::parse(query.as_bytes())
            .map(|(key, value)| {
                let value = match self.query_value(&key, &value) {
                    REDACTED => REDACTED.to_string(),
                    value => encode_component(value),
                };
                format!("{}={}", encode_component(&key), value)
            })
            .collect::<Vec<_>>()
            .join("&");

        let mut url = url.clone();
        url.set_query(Some(&masked));
        url.to_string()
    }
}

struct Instruments {
    call_active: UpDownCounter<i64>,
    call_duration: Histogram<f64>,
    attempt_active: UpDownCounter<i64>,
    attempt_duration: Histogram<f64>,
    attempt_body_size: Histogram<u64>,
    parse_active: UpDownCounter<i64>,
    parse_duration: Histogram<f64>,
}

impl Instruments {
    fn new(meter: &Meter) -> Self {
        Self {
            call_active: meter
                .i64_up_down_counter("http.client.call.active")
                .with_description("Logical calls in flight")
                .build(),
            call_duration: meter
                .f64_histogram("http.client.call.duration")
                .with_description("Duration of logical calls, retries included")
                .with_unit("s")
                .build(),
            attempt_active: meter
                .i64_up_down_counter("http.client.attempt.active")
                .with_description("Physical attempts in flight")
                .build(),
            attempt_duration: meter
                .f64_histogram("http.client.attempt.duration")
                .with_description("Duration of physical attempts")
                .with_unit("s")
                .build(),
            attempt_body_size: meter
                .u64_histogram("http.client.attempt.body.size")
                .with_description("Size of response bodies")
                .with_unit("By")
                .build(),
            parse_active: meter
                .i64_up_down_counter("http.client.parse.active")
                .with_description("Response bodies being decoded")
                .build(),
            parse_duration: meter
                .f64_histogram("http.client.parse.duration")
                .with_description("Duration of response body decoding")
                .with_unit("s")
                .build(),
        }
    }
}

struct Shared<T> {
    tracer: T,
    instruments: Instruments,
    config: TelemetryConfig,
}

/// Emits OpenTelemetry spans and metrics for every call of a client.
///
/// # Examples
///
/// ```no_run
/// use callweave::telemetry::{Telemetry, TelemetryConfig};
/// use callweave::Client;
///
/// # fn example() -> Result<(), callweave::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com")?
///     .build()?
///     .and_trace(Telemetry::global(TelemetryConfig::default().redact_query("api_key")));
/// # Ok(())
/// # }
/// ```
pub struct Telemetry<T> {
    shared: Arc<Shared<T>>,
}

impl Telemetry<BoxedTracer> {
    /// Uses the globally installed tracer and meter providers.
    pub fn global(config: TelemetryConfig) -> Self {
        let tracer = opentelemetry::global::tracer("callweave");
        let meter = opentelemetry::global::meter("callweave");
        Self::new(tracer, &meter, config)
    }
}

impl<T> Telemetry<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    /// Creates the bridge from an explicit tracer and meter.
    pub fn new(tracer: T, meter: &Meter, config: TelemetryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                tracer,
                instruments: Instruments::new(meter),
                config,
            }),
        }
    }
}

impl<T> Clone for Telemetry<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> TraceFactory for Telemetry<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    fn trace(&self, ctx: &CallContext, request: &Request) -> (CallContext, ClientTrace) {
        let observer = Arc::new(CallObserver::start(Arc::clone(&self.shared), request));

        let mut trace = ClientTrace::new();
        for kind in [
            TraceEventKind::Start,
            TraceEventKind::ResponseHeaders,
            TraceEventKind::FirstByte,
            TraceEventKind::Retry,
            TraceEventKind::ParseStart,
            TraceEventKind::ParseDone,
            TraceEventKind::AttemptDone,
            TraceEventKind::Done,
        ] {
            let observer = Arc::clone(&observer);
            trace = trace.on(kind, move |event| observer.observe(event));
        }

        (ctx.clone(), trace)
    }
}

/// A span still open, with what its metrics need.
struct Phase {
    cx: Context,
    started: Instant,
    dimensions: Vec<KeyValue>,
}

#[derive(Default)]
struct CallState {
    attempt: Option<Phase>,
    parse: Option<Phase>,
    retry_wait: Option<Context>,
    status: Option<StatusCode>,
    done: bool,
}

/// Turns the events of one call into spans and measurements.
struct CallObserver<T> {
    shared: Arc<Shared<T>>,
    root: Context,
    started: Instant,
    /// Method and URL template, plus masked path parameters.
    definition: Vec<KeyValue>,
    unmasked_url: Option<Url>,
    masked_url: Option<String>,
    state: Mutex<CallState>,
}

impl<T> CallObserver<T>
where
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    fn start(shared: Arc<Shared<T>>, request: &Request) -> Self {
        let config = &shared.config;

        let mut definition = vec![
            KeyValue::new(attributes::METHOD, request.method().to_string()),
            KeyValue::new(attributes::URL_TEMPLATE, request.url_template().to_string()),
        ];
        for (name, value) in request.path_params() {
            definition.push(KeyValue::new(
                format!("{}{}", attributes::PATH_PREFIX, name),
                config.path_value(name, value).to_string(),
            ));
        }

        let masked_url = config.masked_request_url(request);

        let mut span_attributes = definition.clone();
        if let Some(url) = &masked_url {
            span_attributes.push(KeyValue::new(attributes::URL_FULL, url.clone()));
        }
        for (name, value) in request.headers() {
            let value = value.to_str().unwrap_or_default();
            span_attributes.push(KeyValue::new(
                format!("{}{}", attributes::HEADER_PREFIX, name.as_str()),
                config.header_value(name.as_str(), value).to_string(),
            ));
        }
        for (key, value) in request.query() {
            span_attributes.push(KeyValue::new(
                format!("{}{}", attributes::QUERY_PREFIX, key),
                config.query_value(key, value).to_string(),
            ));
        }

        let parent = Context::current();
        let span = shared
            .tracer
            .span_builder(CALL_SPAN)
            .with_kind(SpanKind::Client)
            .with_attributes(span_attributes)
            .start_with_context(&shared.tracer, &parent);
        let root = parent.with_span(span);

        shared.instruments.call_active.add(1, &definition);

        Self {
            root,
            started: Instant::now(),
            definition,
            unmasked_url: request.url().ok(),
            masked_url,
            state: Mutex::new(CallState::default()),
            shared,
        }
    }

    fn child(
        &self,
        parent: &Context,
        name: &'static str,
        kind: SpanKind,
        attrs: Vec<KeyValue>,
    ) -> Context {
        let span = self
            .shared
            .tracer
            .span_builder(name)
            .with_kind(kind)
            .with_attributes(attrs)
            .start_with_context(&self.shared.tracer, parent);
        parent.with_span(span)
    }

    fn attempt_url(&self, url: &Url) -> String {
        match (&self.unmasked_url, &self.masked_url) {
            (Some(unmasked), Some(masked)) if unmasked == url => masked.clone(),
            _ => self.shared.config.masked_url(url),
        }
    }

    fn observe(&self, event: &TraceEvent<'_>) {
        let instruments = &self.shared.instruments;
        let mut state = self.state.lock();

        match event {
            TraceEvent::Start {
                method,
                url,
                attempt,
                ..
            } => {
                if let Some(wait) = state.retry_wait.take() {
                    wait.span().end();
                }

                let dimensions = vec![
                    KeyValue::new(attributes::METHOD, method.to_string()),
                    KeyValue::new(attributes::URL_FULL, self.attempt_url(url)),
                ];
                let mut attrs = dimensions.clone();
                attrs.push(KeyValue::new(attributes::RETRY_ATTEMPT, i64::from(*attempt)));

                let cx = self.child(&self.root, ATTEMPT_SPAN, SpanKind::Client, attrs);
                instruments.attempt_active.add(1, &dimensions);
                state.attempt = Some(Phase {
                    cx,
                    started: Instant::now(),
                    dimensions,
                });
            }

            TraceEvent::ResponseHeaders { status, .. } => {
                state.status = Some(*status);
                if let Some(attempt) = &state.attempt {
                    attempt.cx.span().add_event("response_headers", vec![]);
                }
            }

            TraceEvent::FirstByte { .. } => {
                if let Some(attempt) = &state.attempt {
                    attempt.cx.span().add_event("first_byte", vec![]);
                }
            }

            TraceEvent::ParseStart { .. } => {
                let parent = state
                    .attempt
                    .as_ref()
                    .map_or_else(|| self.root.clone(), |attempt| attempt.cx.clone());
                let cx = self.child(&parent, PARSE_SPAN, SpanKind::Internal, self.definition.clone());
                instruments.parse_active.add(1, &self.definition);
                state.parse = Some(Phase {
                    cx,
                    started: Instant::now(),
                    dimensions: self.definition.clone(),
                });
            }

            TraceEvent::ParseDone { error, .. } => {
                if let Some(parse) = state.parse.take() {
                    if let Some(error) = error {
                        mark_failed(&parse.cx, error);
                    }
                    parse.cx.span().end();

                    instruments.parse_active.add(-1, &parse.dimensions);
                    let mut dimensions = parse.dimensions;
                    dimensions.push(status_dimension(state.status));
                    instruments
                        .parse_duration
                        .record(parse.started.elapsed().as_secs_f64(), &dimensions);
                }
            }

            TraceEvent::AttemptDone {
                status,
                body_size,
                error,
                ..
            } => {
                if let Some(attempt) = state.attempt.take() {
                    let span = attempt.cx.span();
                    if let Some(status) = status {
                        span.set_attribute(KeyValue::new(
                            attributes::STATUS_CODE,
                            i64::from(status.as_u16()),
                        ));
                    }
                    span.set_attribute(KeyValue::new(
                        attributes::BODY_SIZE,
                        i64::try_from(*body_size).unwrap_or(i64::MAX),
                    ));
                    if let Some(error) = error {
                        mark_failed(&attempt.cx, error);
                    }
                    span.end();

                    instruments.attempt_active.add(-1, &attempt.dimensions);
                    let mut dimensions = attempt.dimensions;
                    dimensions.push(status_dimension(*status));
                    instruments
                        .attempt_duration
                        .record(attempt.started.elapsed().as_secs_f64(), &dimensions);
                    instruments
                        .attempt_body_size
                        .record(u64::try_from(*body_size).unwrap_or(u64::MAX), &dimensions);
                }
                if status.is_some() {
                    state.status = *status;
                }
            }

            TraceEvent::Retry { attempt, delay, .. } => {
                let attrs = vec![
                    KeyValue::new(attributes::RETRY_ATTEMPT, i64::from(*attempt)),
                    KeyValue::new(
                        attributes::RETRY_DELAY_MS,
                        i64::try_from(delay.as_millis()).unwrap_or(i64::MAX),
                    ),
                ];
                self.root.span().add_event("retry", attrs.clone());
                let cx = self.child(&self.root, RETRY_WAIT_SPAN, SpanKind::Internal, attrs);
                state.retry_wait = Some(cx);
            }

            TraceEvent::Done {
                attempts,
                status,
                error,
            } => {
                if let Some(wait) = state.retry_wait.take() {
                    wait.span().end();
                }
                state.done = true;

                let span = self.root.span();
                span.set_attribute(KeyValue::new(attributes::RETRY_ATTEMPT, i64::from(*attempts)));
                if let Some(status) = status {
                    span.set_attribute(KeyValue::new(
                        attributes::STATUS_CODE,
                        i64::from(status.as_u16()),
                    ));
                }
                if let Some(error) = error {
                    mark_failed(&self.root, error);
                }
                span.end();

                instruments.call_active.add(-1, &self.definition);
                let mut dimensions = self.definition.clone();
                dimensions.push(status_dimension(*status));
                instruments
                    .call_duration
                    .record(self.started.elapsed().as_secs_f64(), &dimensions);
            }
        }
    }
}

// A call abandoned mid-flight never sees its closing events. Whatever is
// still open is closed here so the active counters return to zero.
impl<T> Drop for CallObserver<T> {
    fn drop(&mut self) {
        let instruments = &self.shared.instruments;
        let state = self.state.get_mut();

        if let Some(parse) = state.parse.take() {
            mark_failed(&parse.cx, &Error::Cancelled);
            parse.cx.span().end();
            instruments.parse_active.add(-1, &parse.dimensions);
        }
        if let Some(attempt) = state.attempt.take() {
            mark_failed(&attempt.cx, &Error::Cancelled);
            attempt.cx.span().end();
            instruments.attempt_active.add(-1, &attempt.dimensions);
        }
        if let Some(wait) = state.retry_wait.take() {
            wait.span().end();
        }
        if !state.done {
            mark_failed(&self.root, &Error::Cancelled);
            self.root.span().end();
            instruments.call_active.add(-1, &self.definition);
        }
    }
}

/// Status dimension of a measurement; `0` when no response was received.
fn status_dimension(status: Option<StatusCode>) -> KeyValue {
    KeyValue::new(
        attributes::STATUS_CODE,
        status.map_or(0, |s| i64::from(s.as_u16())),
    )
}

/// Marks the span of `cx` as failed. Only the error kind is recorded: error
/// messages may carry unredacted URLs.
fn mark_failed(cx: &Context, error: &Error) {
    let kind = error_type(error);
    let span = cx.span();
    span.set_attribute(KeyValue::new(attributes::ERROR_TYPE, kind));
    span.set_status(Status::error(kind));
}

fn error_type(error: &Error) -> &'static str {
    match error {
        Error::Configuration(_) => "configuration",
        Error::InvalidUrl(_) => "invalid_url",
        Error::SerializationFailed(_) => "serialization",
        Error::Transport { .. } => "transport",
        Error::Timeout { .. } => "timeout",
        Error::Http { .. } => "http",
        Error::DeserializationFailed { .. } => "deserialization",
        Error::Cancelled => "cancelled",
        Error::Multiple(_) => "multiple",
        Error::Other(_) => "other",
    }
}
