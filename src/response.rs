//! Raw transport responses and the read-only outcome of a logical call.
//!
//! An [`Outcome`] pairs the [`Request`] that was sent with whatever came back:
//! the last [`RawResponse`], the error, the number of tries and the total
//! latency. The decoded result, if the request had a result target, lives in
//! that target's [`Slot`](crate::Slot).

use crate::{Error, Request, Result};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// One response as read off the wire.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The full response body.
    pub body: Bytes,
}

impl RawResponse {
    /// Creates a response.
    pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// The body as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Returns a header value by name.
    ///
    /// # Examples
    ///
    /// ```
    /// # use callweave::RawResponse;
    /// # use http::{HeaderMap, HeaderValue, StatusCode};
    /// let mut headers = HeaderMap::new();
    /// headers.insert("content-type", HeaderValue::from_static("application/json"));
    /// let response = RawResponse::new(StatusCode::OK, headers, "{}");
    ///
    /// assert_eq!(response.header("content-type"), Some("application/json"));
    /// ```
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)?.to_str().ok()
    }
}

/// The outcome of sending one [`Request`].
#[derive(Debug)]
pub struct Outcome {
    request: Request,
    response: Option<RawResponse>,
    error: Option<Error>,
    attempts: u32,
    latency: Duration,
}

impl Outcome {
    /// Creates an outcome. Produced by [`Sender`](crate::Sender)
    /// implementations.
    pub fn new(
        request: Request,
        response: Option<RawResponse>,
        error: Option<Error>,
        attempts: u32,
        latency: Duration,
    ) -> Self {
        Self {
            request,
            response,
            error,
            attempts,
            latency,
        }
    }

    /// An outcome for a call that failed before anything was sent.
    pub fn failed(request: &Request, error: Error) -> Self {
        Self::new(request.clone(), None, Some(error), 0, Duration::ZERO)
    }

    /// The request that produced this outcome.
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The last response received, if any.
    pub fn response(&self) -> Option<&RawResponse> {
        self.response.as_ref()
    }

    /// The error, if the call failed.
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Returns `true` if the call succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// The status of the last response, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.response.as_ref().map(|r| r.status)
    }

    /// The body of the last response, if any.
    pub fn body(&self) -> Option<&Bytes> {
        self.response.as_ref().map(|r| &r.body)
    }

    /// The number of tries made. `1` when no retry was needed.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Returns `true` if the call required retries.
    pub fn was_retried(&self) -> bool {
        self.attempts > 1
    }

    /// Total latency including every retry and backoff wait.
    pub fn latency(&self) -> Duration {
        self.latency
    }

    /// Splits the outcome into a `Result`, moving the error out.
    pub fn into_result(mut self) -> Result<Outcome> {
        match self.error.take() {
            Some(error) => Err(error),
            None => Ok(self),
        }
    }
}
