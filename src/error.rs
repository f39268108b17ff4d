//! Error types for HTTP calls and their compositions.
//!
//! Every error that comes out of a physical attempt carries the method and
//! URL it was produced for, so a final error can be diagnosed without
//! re-running the call. Errors collected by a [`WaitGroup`](crate::WaitGroup)
//! are kept together in a [`MultiError`].

use http::{HeaderMap, Method, StatusCode};
use std::fmt;
use std::time::Duration;
use url::Url;

/// The main error type for HTTP calls.
///
/// # Examples
///
/// ```no_run
/// use callweave::{CallContext, Client, Error};
///
/// # async fn example() -> Result<(), Error> {
/// let client = Client::builder().base_url("https://api.example.com")?.build()?;
/// let ctx = CallContext::new();
///
/// match client.get("/things/{id}").with_path_param("id", "42").send_raw(&ctx).await {
///     Ok(outcome) => println!("got {:?}", outcome.status()),
///     Err(Error::Http { status, raw_response, .. }) => {
///         eprintln!("HTTP error {}: {}", status, raw_response);
///     }
///     Err(e) => eprintln!("Other error: {}", e),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The call was described incorrectly (missing base URL, unknown path
    /// parameter, invalid header, no sender bound, ...).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An invalid URL was provided.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The request body could not be encoded.
    #[error("Failed to serialize request: {0}")]
    SerializationFailed(String),

    /// A network-level failure (connection refused, DNS, reset, ...).
    #[error("Network error on {method} {url}: {source}")]
    Transport {
        /// The HTTP method of the failed attempt
        method: Method,
        /// The URL of the failed attempt
        url: Url,
        /// The underlying transport error
        #[source]
        source: reqwest::Error,
    },

    /// The attempt exceeded the configured timeout.
    #[error("Request timed out: {method} {url}")]
    Timeout {
        /// The HTTP method of the timed out attempt
        method: Method,
        /// The URL of the timed out attempt
        url: Url,
    },

    /// The server answered with a non-2xx status.
    ///
    /// When the request carried an error target, the decoded payload has
    /// already been written into it.
    #[error("HTTP error {status} on {method} {url}: {raw_response}")]
    Http {
        /// The HTTP method
        method: Method,
        /// The final URL
        url: Url,
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body
        raw_response: String,
        /// The response headers
        headers: HeaderMap,
        /// Wait hint parsed from a `Retry-After` header
        retry_after: Option<Duration>,
    },

    /// A 2xx body could not be decoded into the result target.
    #[error("Failed to deserialize response of {method} {url} (status {status}): {serde_error}")]
    DeserializationFailed {
        /// The HTTP method
        method: Method,
        /// The final URL
        url: Url,
        /// The HTTP status code
        status: StatusCode,
        /// The raw response body that failed to deserialize
        raw_response: String,
        /// The serde error message
        serde_error: String,
    },

    /// The ambient cancellation signal was tripped.
    #[error("Call cancelled")]
    Cancelled,

    /// Several concurrently dispatched calls failed.
    #[error("{0}")]
    Multiple(MultiError),

    /// An error raised by a hook or an external collaborator.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error, typically from inside a hook.
    pub fn other(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Other(error.into())
    }

    /// Returns `true` if this error is potentially retryable.
    ///
    /// Network errors, timeouts, 5xx, 423 and 429 responses are retryable.
    /// Cancellation never is.
    ///
    /// # Examples
    ///
    /// ```
    /// use callweave::Error;
    /// use http::{HeaderMap, Method, StatusCode};
    ///
    /// let err = Error::Http {
    ///     method: Method::GET,
    ///     url: "https://api.example.com/x".parse().unwrap(),
    ///     status: StatusCode::SERVICE_UNAVAILABLE,
    ///     raw_response: "down".to_string(),
    ///     headers: HeaderMap::new(),
    ///     retry_after: None,
    /// };
    /// assert!(err.is_retryable());
    /// assert!(!Error::Cancelled.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport { .. } => true,
            Error::Timeout { .. } => true,
            Error::Http { status, .. } => {
                status.is_server_error() || matches!(status.as_u16(), 423 | 429)
            }
            _ => false,
        }
    }

    /// Returns `true` if this error, or every member of an aggregate, is a
    /// cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Multiple(errors) => errors.iter().all(Error::is_cancelled),
            _ => false,
        }
    }

    /// Returns the HTTP status code if this error has one.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http { status, .. } => Some(*status),
            Error::DeserializationFailed { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Returns the raw response body if this error has one.
    pub fn raw_response(&self) -> Option<&str> {
        match self {
            Error::Http { raw_response, .. } => Some(raw_response),
            Error::DeserializationFailed { raw_response, .. } => Some(raw_response),
            _ => None,
        }
    }

    /// Returns the `Retry-After` hint of an HTTP error.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Http { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Collapses a list of errors: none is `Ok`, one is returned as is,
    /// more become [`Error::Multiple`].
    pub(crate) fn from_many(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multiple(MultiError(errors))),
        }
    }
}

/// A composite of every error collected from concurrently dispatched calls.
#[derive(Debug)]
pub struct MultiError(Vec<Error>);

impl MultiError {
    /// Iterates over the collected errors.
    pub fn iter(&self) -> std::slice::Iter<'_, Error> {
        self.0.iter()
    }

    /// The number of collected errors.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always `false` for errors produced by this crate.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Consumes the aggregate, returning the errors.
    pub fn into_inner(self) -> Vec<Error> {
        self.0
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} calls failed", self.0.len())?;
        for (i, error) in self.0.iter().enumerate() {
            write!(f, "\n  [{}] {}", i, error)?;
        }
        Ok(())
    }
}

impl IntoIterator for MultiError {
    type Item = Error;
    type IntoIter = std::vec::IntoIter<Error>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// A specialized `Result` type for HTTP calls.
pub type Result<T> = std::result::Result<T, Error>;
