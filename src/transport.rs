//! The plain, single-shot transport wrapped by [`Client`](crate::Client).
//!
//! A [`Transport`] performs exactly one round-trip for a [`PreparedRequest`]
//! and reports the arrival of headers and of the first body byte through
//! [`AttemptEvents`]. It never retries and never follows redirects; both are
//! decisions of the client.

use crate::trace::{ClientTrace, TraceEvent};
use crate::{CallContext, Error, RawResponse, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use std::time::Duration;
use url::Url;

/// A fully resolved request, ready for the wire.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    /// The HTTP method.
    pub method: Method,
    /// The absolute URL.
    pub url: Url,
    /// Request headers, defaults included.
    pub headers: HeaderMap,
    /// The encoded body. Empty when the request has none.
    pub body: Bytes,
    /// Per-attempt timeout.
    pub timeout: Option<Duration>,
}

/// Lets a transport report progress of the current attempt.
pub struct AttemptEvents<'a> {
    trace: &'a ClientTrace,
    attempt: u32,
}

impl<'a> AttemptEvents<'a> {
    pub(crate) fn new(trace: &'a ClientTrace, attempt: u32) -> Self {
        Self { trace, attempt }
    }

    /// The try number of this attempt.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reports that status and headers arrived.
    pub fn response_headers(&self, status: StatusCode, headers: &HeaderMap) {
        self.trace.fire(&TraceEvent::ResponseHeaders {
            attempt: self.attempt,
            status,
            headers,
        });
    }

    /// Reports that the first body byte arrived.
    pub fn first_byte(&self) {
        self.trace.fire(&TraceEvent::FirstByte {
            attempt: self.attempt,
        });
    }
}

/// Executes one HTTP round-trip.
///
/// Non-2xx statuses are not errors at this level: the transport returns the
/// [`RawResponse`] and the client classifies it. Errors are reserved for
/// failures to obtain a response at all.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends `request` once and reads the whole body. `ctx` carries the try
    /// number of the attempt.
    async fn execute(
        &self,
        ctx: &CallContext,
        request: &PreparedRequest,
        events: &AttemptEvents<'_>,
    ) -> Result<RawResponse>;
}

/// [`Transport`] backed by `reqwest`, with redirects disabled.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be built.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client. It should not follow redirects
    /// itself, or the client will never observe them.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn map_error(request: &PreparedRequest, error: reqwest::Error) -> Error {
        if error.is_timeout() {
            Error::Timeout {
                method: request.method.clone(),
                url: request.url.clone(),
            }
        } else {
            Error::Transport {
                method: request.method.clone(),
                url: request.url.clone(),
                source: error,
            }
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(
        &self,
        _ctx: &CallContext,
        request: &PreparedRequest,
        events: &AttemptEvents<'_>,
    ) -> Result<RawResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let mut response = builder
            .send()
            .await
            .map_err(|e| Self::map_error(request, e))?;

        let status = response.status();
        let headers = response.headers().clone();
        events.response_headers(status, &headers);

        let mut body = BytesMut::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| Self::map_error(request, e))?
        {
            if body.is_empty() && !chunk.is_empty() {
                events.first_byte();
            }
            body.extend_from_slice(&chunk);
        }

        Ok(RawResponse::new(status, headers, body.freeze()))
    }
}
