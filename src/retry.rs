//! Retry configuration and predicates.
//!
//! A logical call is tried up to [`RetryConfig::count`] times. After a failed
//! try the [`RetryPredicate`] decides whether another one is worth it, and
//! the backoff doubles from [`RetryConfig::initial_wait`] up to
//! [`RetryConfig::max_wait`].

use crate::Error;
use http::HeaderMap;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How a [`Client`](crate::Client) retries failed calls.
///
/// # Examples
///
/// ```
/// use callweave::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default()
///     .with_count(10)
///     .with_initial_wait(Duration::from_millis(50))
///     .with_max_wait(Duration::from_secs(3))
///     .with_randomization(0.0);
///
/// let delays: Vec<u128> = (1..=10).map(|n| config.delay_for_attempt(n).as_millis()).collect();
/// assert_eq!(delays, vec![50, 100, 200, 400, 800, 1600, 3000, 3000, 3000, 3000]);
/// ```
#[derive(Clone)]
pub struct RetryConfig {
    /// Decides whether a failed try is retried.
    pub predicate: Arc<dyn RetryPredicate>,
    /// Maximum number of tries, the first one included.
    pub count: u32,
    /// Delay before the first retry.
    pub initial_wait: Duration,
    /// Upper bound of the backoff delay.
    pub max_wait: Duration,
    /// Spread of the random factor applied to each delay, in `[0, 1]`.
    /// `0` makes the delay sequence deterministic.
    pub randomization: f64,
    /// Whether a `Retry-After` header overrides the backoff delay.
    pub respect_retry_after: bool,
    /// Upper bound of a delay taken from `Retry-After`.
    pub max_retry_after: Duration,
}

/// Multiplier applied to the delay after every retry.
pub const MULTIPLIER: u32 = 2;

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            predicate: Arc::new(RetryOnStatus::locked_or_throttled()),
            count: 1,
            initial_wait: Duration::from_millis(50),
            max_wait: Duration::from_millis(3000),
            randomization: 0.5,
            respect_retry_after: true,
            max_retry_after: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// A configuration that never retries.
    pub fn none() -> Self {
        Self::default()
    }

    /// Sets the maximum number of tries (at least one).
    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count.max(1);
        self
    }

    /// Sets the retry predicate.
    pub fn with_predicate(mut self, predicate: impl RetryPredicate + 'static) -> Self {
        self.predicate = Arc::new(predicate);
        self
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_wait(mut self, wait: Duration) -> Self {
        self.initial_wait = wait;
        self
    }

    /// Sets the upper bound of the backoff delay.
    pub fn with_max_wait(mut self, wait: Duration) -> Self {
        self.max_wait = wait;
        self
    }

    /// Sets the randomization factor, clamped to `[0, 1]`.
    pub fn with_randomization(mut self, randomization: f64) -> Self {
        self.randomization = randomization.clamp(0.0, 1.0);
        self
    }

    /// Configures `Retry-After` handling.
    pub fn with_retry_after(mut self, respect: bool, max: Duration) -> Self {
        self.respect_retry_after = respect;
        self.max_retry_after = max;
        self
    }

    /// Backoff delay after the failed try `attempt` (1-based):
    /// `initial_wait * 2^(attempt - 1)`, randomized, capped at `max_wait`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = MULTIPLIER.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial_wait.saturating_mul(factor);

        let delay = if self.randomization > 0.0 {
            let spread = self.randomization.min(1.0);
            let jitter = rand::thread_rng().gen_range((1.0 - spread)..=(1.0 + spread));
            delay.mul_f64(jitter)
        } else {
            delay
        };

        delay.min(self.max_wait)
    }

    /// Returns `true` if the failed try `attempt` should be followed by
    /// another. Cancellation is never retried.
    pub fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        attempt < self.count
            && !error.is_cancelled()
            && self.predicate.should_retry(error, attempt)
    }

    /// The delay to wait after the failed try `attempt`.
    pub fn next_delay(&self, error: &Error, attempt: u32) -> Duration {
        match error.retry_after() {
            Some(hint) if self.respect_retry_after => hint.min(self.max_retry_after),
            _ => self.delay_for_attempt(attempt),
        }
    }
}

impl fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryConfig")
            .field("count", &self.count)
            .field("initial_wait", &self.initial_wait)
            .field("max_wait", &self.max_wait)
            .field("randomization", &self.randomization)
            .field("respect_retry_after", &self.respect_retry_after)
            .field("max_retry_after", &self.max_retry_after)
            .finish_non_exhaustive()
    }
}

/// Decides whether a failed try should be retried.
///
/// Closures `Fn(&Error, u32) -> bool` implement this trait.
///
/// # Examples
///
/// ```
/// use callweave::{Error, RetryPredicate};
///
/// struct RetryOnRateLimit;
///
/// impl RetryPredicate for RetryOnRateLimit {
///     fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
///         error.status().is_some_and(|s| s.as_u16() == 429)
///     }
/// }
/// ```
pub trait RetryPredicate: Send + Sync {
    /// Returns `true` if the try numbered `attempt` (1-based), which failed
    /// with `error`, should be retried.
    fn should_retry(&self, error: &Error, attempt: u32) -> bool;
}

impl<F> RetryPredicate for F
where
    F: Fn(&Error, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Retry HTTP errors with one of the listed statuses.
#[derive(Debug, Clone)]
pub struct RetryOnStatus(Vec<u16>);

impl RetryOnStatus {
    /// Retries the given statuses.
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self(statuses.into_iter().collect())
    }

    /// Retries 423 (Locked) and 429 (Too Many Requests).
    pub fn locked_or_throttled() -> Self {
        Self::new([423, 429])
    }
}

impl RetryPredicate for RetryOnStatus {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        matches!(error, Error::Http { status, .. } if self.0.contains(&status.as_u16()))
    }
}

/// Retry every error for which [`Error::is_retryable`] holds.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnRetryable;

impl RetryPredicate for RetryOnRetryable {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        error.is_retryable()
    }
}

/// Retry only on 5xx server errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOn5xx;

impl RetryPredicate for RetryOn5xx {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        matches!(error, Error::Http { status, .. } if status.is_server_error())
    }
}

/// Retry only on timeouts.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnTimeout;

impl RetryPredicate for RetryOnTimeout {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        matches!(error, Error::Timeout { .. })
    }
}

/// Retry only on network errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryOnConnectionError;

impl RetryPredicate for RetryOnConnectionError {
    fn should_retry(&self, error: &Error, _attempt: u32) -> bool {
        matches!(error, Error::Transport { .. })
    }
}

/// Retries if any of the predicates does.
pub struct OrPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl OrPredicate {
    /// Creates a new `OrPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for OrPredicate {
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self.predicates
            .iter()
            .any(|p| p.should_retry(error, attempt))
    }
}

/// Retries only if all of the predicates do.
pub struct AndPredicate {
    predicates: Vec<Box<dyn RetryPredicate>>,
}

impl AndPredicate {
    /// Creates a new `AndPredicate` from a list of predicates.
    pub fn new(predicates: Vec<Box<dyn RetryPredicate>>) -> Self {
        Self { predicates }
    }
}

impl RetryPredicate for AndPredicate {
    fn should_retry(&self, error: &Error, attempt: u32) -> bool {
        self.predicates
            .iter()
            .all(|p| p.should_retry(error, attempt))
    }
}

/// Parses a `Retry-After` header, in delay-seconds or HTTP-date form.
pub(crate) fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?;

    if let Ok(seconds) = header.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = httpdate::parse_http_date(header).ok()?;
    Some(
        date.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, Method, StatusCode};

    fn http_error(status: u16) -> Error {
        Error::Http {
            method: Method::GET,
            url: "https://example.com/".parse().unwrap(),
            status: StatusCode::from_u16(status).unwrap(),
            raw_response: String::new(),
            headers: HeaderMap::new(),
            retry_after: None,
        }
    }

    #[test]
    fn test_deterministic_delay_sequence() {
        let config = RetryConfig::default()
            .with_initial_wait(Duration::from_millis(50))
            .with_max_wait(Duration::from_millis(3000))
            .with_randomization(0.0);

        let delays: Vec<u128> = (1..=10)
            .map(|attempt| config.delay_for_attempt(attempt).as_millis())
            .collect();
        assert_eq!(
            delays,
            vec![50, 100, 200, 400, 800, 1600, 3000, 3000, 3000, 3000]
        );
    }

    #[test]
    fn test_randomized_delay_stays_in_bounds() {
        let config = RetryConfig::default()
            .with_initial_wait(Duration::from_millis(100))
            .with_max_wait(Duration::from_secs(10))
            .with_randomization(0.5);

        for _ in 0..100 {
            let delay = config.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(100) && delay <= Duration::from_millis(300));
        }
    }

    #[test]
    fn test_huge_attempt_saturates_to_ceiling() {
        let config = RetryConfig::default().with_randomization(0.0);
        assert_eq!(config.delay_for_attempt(200), config.max_wait);
    }

    #[test]
    fn test_should_retry_honours_count_and_predicate() {
        let config = RetryConfig::default().with_count(3);
        assert!(config.should_retry(&http_error(423), 1));
        assert!(config.should_retry(&http_error(429), 2));
        assert!(!config.should_retry(&http_error(429), 3));
        assert!(!config.should_retry(&http_error(500), 1));
        assert!(!config.should_retry(&Error::Cancelled, 1));
    }

    #[test]
    fn test_cancellation_is_never_retried() {
        let config = RetryConfig::default()
            .with_count(5)
            .with_predicate(|_: &Error, _: u32| true);
        assert!(!config.should_retry(&Error::Cancelled, 1));
        assert!(config.should_retry(&http_error(400), 1));
    }

    #[test]
    fn test_combined_predicates() {
        let or = OrPredicate::new(vec![Box::new(RetryOn5xx), Box::new(RetryOnTimeout)]);
        assert!(or.should_retry(&http_error(503), 1));
        assert!(!or.should_retry(&http_error(404), 1));

        let and = AndPredicate::new(vec![
            Box::new(RetryOn5xx),
            Box::new(|_: &Error, attempt: u32| attempt < 2),
        ]);
        assert!(and.should_retry(&http_error(503), 1));
        assert!(!and.should_retry(&http_error(503), 2));
    }

    #[test]
    fn test_retry_after_overrides_backoff() {
        let mut error = http_error(429);
        if let Error::Http { retry_after, .. } = &mut error {
            *retry_after = Some(Duration::from_secs(120));
        }

        let config = RetryConfig::default();
        assert_eq!(config.next_delay(&error, 1), Duration::from_secs(60));

        let ignoring = RetryConfig::default()
            .with_randomization(0.0)
            .with_retry_after(false, Duration::from_secs(60));
        assert_eq!(ignoring.next_delay(&error, 1), Duration::from_millis(50));
    }

    #[test]
    fn test_parse_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        let past = httpdate::fmt_http_date(SystemTime::UNIX_EPOCH);
        headers.insert("retry-after", HeaderValue::from_str(&past).unwrap());
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));

        headers.insert("retry-after", HeaderValue::from_static("soon"));
        assert_eq!(parse_retry_after(&headers), None);
    }
}
