//! The retry-capable sender.
//!
//! [`Client`] runs every logical call through a retry loop around a plain
//! [`Transport`], follows redirects, decodes bodies into the request's
//! targets and fires the lifecycle hooks of every registered
//! [`TraceFactory`]. Use [`ClientBuilder`] to configure and create clients.

use crate::retry::{parse_retry_after, RetryConfig};
use crate::trace::{ClientTrace, TraceEvent, TraceFactory};
use crate::transport::{AttemptEvents, PreparedRequest, ReqwestTransport, Transport};
use crate::{CallContext, Error, Outcome, RawResponse, Request, Result, Sender};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use url::Url;

/// Default limit of redirects followed within one try.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// An HTTP client applying retry policy and lifecycle hooks to every call.
///
/// The client is cheap to clone and designed to be reused. Requests built
/// with [`get`](Self::get), [`post`](Self::post) and friends are bound to
/// it and resolve relative URLs against its base URL.
///
/// # Examples
///
/// ```no_run
/// use callweave::{CallContext, Client, RetryConfig, Slot};
/// use serde::Deserialize;
/// use std::time::Duration;
///
/// #[derive(Debug, Clone, Default, Deserialize)]
/// struct User {
///     id: u64,
///     name: String,
/// }
///
/// # async fn example() -> Result<(), callweave::Error> {
/// let client = Client::builder()
///     .base_url("https://api.example.com/v1")?
///     .timeout(Duration::from_secs(30))
///     .retry_config(RetryConfig::default().with_count(3))
///     .build()?;
///
/// let user = Slot::<User>::default();
/// client
///     .get("/users/{id}")
///     .with_path_param("id", "123")
///     .with_result(&user)
///     .send_raw(&CallContext::new())
///     .await?;
/// println!("User: {}", user.get().name);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

#[derive(Clone)]
struct ClientInner {
    transport: Arc<dyn Transport>,
    base_url: Option<Url>,
    default_headers: HeaderMap,
    retry: RetryConfig,
    timeout: Option<Duration>,
    max_redirects: usize,
    traces: Vec<Arc<dyn TraceFactory>>,
}

impl Client {
    /// Creates a new `ClientBuilder` for configuring a client.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// A request for `url` bound to this client.
    pub fn request(&self, method: Method, url: impl Into<String>) -> Request {
        let request = Request::new(method, url).with_sender(Arc::new(self.clone()));
        match &self.inner.base_url {
            Some(base) => request.with_base(base.clone()),
            None => request,
        }
    }

    /// A GET request bound to this client.
    pub fn get(&self, url: impl Into<String>) -> Request {
        self.request(Method::GET, url)
    }

    /// A POST request bound to this client.
    pub fn post(&self, url: impl Into<String>) -> Request {
        self.request(Method::POST, url)
    }

    /// A PUT request bound to this client.
    pub fn put(&self, url: impl Into<String>) -> Request {
        self.request(Method::PUT, url)
    }

    /// A PATCH request bound to this client.
    pub fn patch(&self, url: impl Into<String>) -> Request {
        self.request(Method::PATCH, url)
    }

    /// A DELETE request bound to this client.
    pub fn delete(&self, url: impl Into<String>) -> Request {
        self.request(Method::DELETE, url)
    }

    /// A HEAD request bound to this client.
    pub fn head(&self, url: impl Into<String>) -> Request {
        self.request(Method::HEAD, url)
    }

    /// Returns a new client whose calls also fire the hooks produced by
    /// `factory`, after those of the factories already registered. The
    /// receiver is left unchanged.
    pub fn and_trace(&self, factory: impl TraceFactory + 'static) -> Client {
        let mut inner = (*self.inner).clone();
        inner.traces.push(Arc::new(factory));
        Client {
            inner: Arc::new(inner),
        }
    }

    /// The retry configuration.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.inner.retry
    }

    /// Builds the hooks of one call, threading the context through every
    /// factory in registration order.
    fn call_trace(&self, ctx: &CallContext, request: &Request) -> (CallContext, ClientTrace) {
        let mut ctx = ctx.clone();
        let mut trace: Option<ClientTrace> = None;
        for factory in &self.inner.traces {
            let (next_ctx, next) = factory.trace(&ctx, request);
            ctx = next_ctx;
            trace = Some(ClientTrace::compose(trace.as_ref(), &next));
        }
        (ctx, trace.unwrap_or_default())
    }

    /// The retry loop. Returns the last response, the final error and the
    /// number of tries made.
    async fn run(
        &self,
        ctx: &CallContext,
        request: &Request,
        trace: &ClientTrace,
    ) -> (Option<RawResponse>, Option<Error>, u32) {
        let prepared = match request.prepare(&self.inner.default_headers, self.inner.timeout) {
            Ok(prepared) => prepared,
            Err(e) => return (None, Some(e), 0),
        };

        let retry = &self.inner.retry;
        let mut attempt = 1;

        loop {
            if ctx.is_cancelled() {
                return (None, Some(Error::Cancelled), attempt - 1);
            }

            let ctx = ctx.with_attempt(attempt);
            let (response, result) = self.try_once(&ctx, request, &prepared, trace).await;
            let error = match result {
                Ok(()) => return (response, None, attempt),
                Err(error) => error,
            };

            if !retry.should_retry(&error, attempt) {
                return (response, Some(error), attempt);
            }

            let delay = retry.next_delay(&error, attempt);
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt = attempt,
                "Retrying request after delay"
            );
            trace.fire(&TraceEvent::Retry {
                attempt,
                delay,
                error: &error,
            });

            tokio::select! {
                _ = ctx.cancelled() => return (response, Some(Error::Cancelled), attempt),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One try: a round-trip plus the redirects it leads to.
    async fn try_once(
        &self,
        ctx: &CallContext,
        request: &Request,
        prepared: &PreparedRequest,
        trace: &ClientTrace,
    ) -> (Option<RawResponse>, Result<()>) {
        let attempt = ctx.attempt();
        let mut current = prepared.clone();
        let mut redirects = 0;

        loop {
            trace.fire(&TraceEvent::Start {
                request,
                method: &current.method,
                url: &current.url,
                attempt,
            });

            tracing::debug!(
                method = %current.method,
                url = %current.url,
                attempt = attempt,
                "Executing HTTP request"
            );

            let events = AttemptEvents::new(trace, attempt);
            let executed = tokio::select! {
                _ = ctx.cancelled() => Err(Error::Cancelled),
                executed = self.inner.transport.execute(ctx, &current, &events) => executed,
            };

            let response = match executed {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        attempt = attempt,
                        method = %current.method,
                        url = %current.url,
                        "Request failed"
                    );
                    trace.fire(&TraceEvent::AttemptDone {
                        attempt,
                        status: None,
                        body_size: 0,
                        error: Some(&error),
                    });
                    return (None, Err(error));
                }
            };

            let result = match redirect_target(&current, &response) {
                Some(Ok(next)) if redirects < self.inner.max_redirects => {
                    tracing::debug!(
                        status = response.status.as_u16(),
                        location = %next.url,
                        "Following redirect"
                    );
                    trace.fire(&TraceEvent::AttemptDone {
                        attempt,
                        status: Some(response.status),
                        body_size: response.body.len(),
                        error: None,
                    });
                    redirects += 1;
                    current = next;
                    continue;
                }
                Some(Err(error)) => Err(error),
                _ => classify(request, &current, &response, trace, attempt),
            };

            tracing::info!(
                status = response.status.as_u16(),
                attempt = attempt,
                body_size = response.body.len(),
                "Received HTTP response"
            );

            if let Err(error) = &result {
                tracing::warn!(
                    error = %error,
                    attempt = attempt,
                    method = %current.method,
                    url = %current.url,
                    "Request failed"
                );
            }

            trace.fire(&TraceEvent::AttemptDone {
                attempt,
                status: Some(response.status),
                body_size: response.body.len(),
                error: result.as_ref().err(),
            });

            return (Some(response), result);
        }
    }
}

#[async_trait]
impl Sender for Client {
    async fn send(&self, ctx: &CallContext, request: &Request) -> Outcome {
        let started = Instant::now();
        let (ctx, trace) = self.call_trace(ctx, request);

        let (response, error, attempts) = self.run(&ctx, request, &trace).await;

        trace.fire(&TraceEvent::Done {
            attempts,
            status: response.as_ref().map(|r| r.status),
            error: error.as_ref(),
        });

        Outcome::new(request.clone(), response, error, attempts, started.elapsed())
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("base_url", &self.inner.base_url.as_ref().map(Url::as_str))
            .field("retry", &self.inner.retry)
            .field("timeout", &self.inner.timeout)
            .field("max_redirects", &self.inner.max_redirects)
            .field("traces", &self.inner.traces.len())
            .finish()
    }
}

/// Turns a received response into the try's result: decodes a 2xx body into
/// the result target, or a non-2xx body into the error target.
fn classify(
    request: &Request,
    current: &PreparedRequest,
    response: &RawResponse,
    trace: &ClientTrace,
    attempt: u32,
) -> Result<()> {
    let status = response.status;

    if !status.is_success() {
        request.decode_error(&response.body);
        let raw_response = response.text();

        if status.is_client_error() {
            tracing::error!(
                status = status.as_u16(),
                response = %raw_response,
                "Client error (4xx)"
            );
        } else if status.is_server_error() {
            tracing::warn!(
                status = status.as_u16(),
                response = %raw_response,
                "Server error (5xx)"
            );
        }

        return Err(Error::Http {
            method: current.method.clone(),
            url: current.url.clone(),
            status,
            raw_response,
            headers: response.headers.clone(),
            retry_after: parse_retry_after(&response.headers),
        });
    }

    if !request.has_result_target() {
        return Ok(());
    }

    trace.fire(&TraceEvent::ParseStart { attempt });

    let decoded = match request.decode_result(&response.body) {
        Some(Err(e)) => {
            let raw_response = response.text();
            tracing::error!(
                error = %e,
                raw_response = %raw_response,
                "Failed to deserialize response"
            );
            Err(Error::DeserializationFailed {
                method: current.method.clone(),
                url: current.url.clone(),
                status,
                raw_response,
                serde_error: e.to_string(),
            })
        }
        _ => Ok(()),
    };

    trace.fire(&TraceEvent::ParseDone {
        attempt,
        error: decoded.as_ref().err(),
    });

    decoded
}

/// The request to send next when `response` is a redirect, `None` if it is
/// not one. 303, and 301/302 after anything but GET or HEAD, continue as a
/// GET without body. Credentials are dropped when the origin changes.
fn redirect_target(
    current: &PreparedRequest,
    response: &RawResponse,
) -> Option<Result<PreparedRequest>> {
    let status = response.status;
    if !status.is_redirection() {
        return None;
    }
    let location = response.headers.get(LOCATION)?;

    let next_url = location
        .to_str()
        .map_err(|e| Error::Configuration(format!("Invalid Location header: {}", e)))
        .and_then(|location| current.url.join(location).map_err(Error::from));
    let next_url = match next_url {
        Ok(url) => url,
        Err(e) => return Some(Err(e)),
    };

    let mut next = current.clone();

    let becomes_get = status == StatusCode::SEE_OTHER
        || (matches!(status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
            && current.method != Method::GET
            && current.method != Method::HEAD);
    if becomes_get {
        if current.method != Method::HEAD {
            next.method = Method::GET;
        }
        next.body = Bytes::new();
        next.headers.remove(CONTENT_TYPE);
        next.headers.remove(CONTENT_LENGTH);
    }

    if next_url.origin() != current.url.origin() {
        next.headers.remove(AUTHORIZATION);
        next.headers.remove(COOKIE);
    }

    next.url = next_url;
    Some(Ok(next))
}

/// Builder for configuring and creating a [`Client`].
///
/// # Examples
///
/// ```no_run
/// use callweave::{ClientBuilder, RetryConfig};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), callweave::Error> {
/// let client = ClientBuilder::new()
///     .base_url("https://api.example.com")?
///     .timeout(Duration::from_secs(30))
///     .retry_config(
///         RetryConfig::default()
///             .with_count(4)
///             .with_initial_wait(Duration::from_millis(100))
///             .with_max_wait(Duration::from_secs(10)),
///     )
///     .default_header("User-Agent", "my-app/1.0")?
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    base_url: Option<Url>,
    default_headers: HeaderMap,
    retry: RetryConfig,
    timeout: Option<Duration>,
    transport: Option<Arc<dyn Transport>>,
    max_redirects: usize,
    traces: Vec<Arc<dyn TraceFactory>>,
}

impl ClientBuilder {
    /// Creates a builder with no base URL, no retries and no hooks.
    pub fn new() -> Self {
        Self {
            base_url: None,
            default_headers: HeaderMap::new(),
            retry: RetryConfig::default(),
            timeout: None,
            transport: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            traces: Vec::new(),
        }
    }

    /// Sets the base URL relative request URLs are resolved against.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid.
    pub fn base_url(mut self, url: impl AsRef<str>) -> Result<Self> {
        self.base_url = Some(Url::parse(url.as_ref())?);
        Ok(self)
    }

    /// Adds a header sent with every request unless the request sets it.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn default_header(mut self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let name = HeaderName::try_from(name.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header name: {}", e)))?;
        let value = HeaderValue::try_from(value.as_ref())
            .map_err(|e| Error::Configuration(format!("Invalid header value: {}", e)))?;
        self.default_headers.insert(name, value);
        Ok(self)
    }

    /// Sets the retry configuration.
    pub fn retry_config(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Sets the default per-attempt timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replaces the default `reqwest` transport.
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Sets the number of redirects followed within one try. `0` disables
    /// redirect handling.
    pub fn max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Registers a hook factory.
    pub fn and_trace(mut self, factory: impl TraceFactory + 'static) -> Self {
        self.traces.push(Arc::new(factory));
        self
    }

    /// Builds the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the default transport cannot be built.
    pub fn build(self) -> Result<Client> {
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new()?),
        };

        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                base_url: self.base_url,
                default_headers: self.default_headers,
                retry: self.retry,
                timeout: self.timeout,
                max_redirects: self.max_redirects,
                traces: self.traces,
            }),
        })
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
