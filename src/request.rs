//! Immutable description of one outbound call.
//!
//! Every `with_*` / `and_*` operation borrows the request and returns a new
//! one, so a [`Request`] can be kept as a template and branched into many
//! variants. `with_*` replaces a value, `and_*` adds to it.
//!
//! ```
//! use callweave::Request;
//! use http::Method;
//!
//! let template = Request::new(Method::GET, "/branches/{branch}")
//!     .with_base_url("https://api.example.com/v2")
//!     .unwrap();
//!
//! let main = template.with_path_param("branch", "main");
//! let dev = template.with_path_param("branch", "dev").with_query("limit", "10");
//!
//! assert_eq!(main.url().unwrap().as_str(), "https://api.example.com/v2/branches/main");
//! assert_eq!(dev.url().unwrap().as_str(), "https://api.example.com/v2/branches/dev?limit=10");
//! assert!(template.url().is_err());
//! ```

use crate::form;
use crate::transport::PreparedRequest;
use crate::{CallContext, Error, Outcome, Result, Sender, Slot};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Decodes a body into a bound target.
pub(crate) type Decoder = Arc<dyn Fn(&[u8]) -> serde_json::Result<()> + Send + Sync>;

/// Observes the outcome of a request once the sender is done with it.
pub type Listener = Arc<dyn Fn(&CallContext, &Outcome) + Send + Sync>;

/// A request body. Encoding happens when the request is dispatched.
#[derive(Debug, Clone, Default)]
pub enum Body {
    /// No body.
    #[default]
    Empty,
    /// Raw bytes, sent as is.
    Bytes(Bytes),
    /// UTF-8 text.
    Text(String),
    /// A JSON document.
    Json(serde_json::Value),
    /// Flattened form fields, URL-encoded on dispatch.
    Form(Vec<(String, String)>),
}

impl Body {
    /// Encodes the body for the wire.
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::Text(text) => Ok(Bytes::from(text.clone())),
            Body::Json(value) => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| Error::SerializationFailed(e.to_string())),
            Body::Form(fields) => form::encode(fields).map(Bytes::from),
        }
    }
}

/// Immutable description of one HTTP call.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: String,
    base_url: Option<Url>,
    headers: HeaderMap,
    query: Vec<(String, String)>,
    path_params: BTreeMap<String, String>,
    body: Body,
    timeout: Option<Duration>,
    result: Option<Decoder>,
    error: Option<Decoder>,
    listeners: Vec<Listener>,
    sender: Option<Arc<dyn Sender>>,
}

impl Request {
    /// Creates a request for `url`, which may be absolute or relative and
    /// may contain `{name}` placeholders.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            base_url: None,
            headers: HeaderMap::new(),
            query: Vec::new(),
            path_params: BTreeMap::new(),
            body: Body::Empty,
            timeout: None,
            result: None,
            error: None,
            listeners: Vec::new(),
            sender: None,
        }
    }

    fn map(&self, f: impl FnOnce(&mut Self)) -> Self {
        let mut next = self.clone();
        f(&mut next);
        next
    }

    /// Replaces the method.
    pub fn with_method(&self, method: Method) -> Self {
        self.map(|r| r.method = method)
    }

    /// Replaces the URL template.
    pub fn with_url(&self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.map(|r| r.url = url)
    }

    /// Sets the base URL a relative URL is resolved against. The base is
    /// treated as a directory: a missing trailing `/` is added.
    ///
    /// # Errors
    ///
    /// Returns an error if `base` is not an absolute URL.
    pub fn with_base_url(&self, base: impl AsRef<str>) -> Result<Self> {
        let base = Url::parse(base.as_ref())?;
        Ok(self.with_base(base))
    }

    pub(crate) fn with_base(&self, base: Url) -> Self {
        let base = directory_url(base);
        self.map(|r| r.base_url = Some(base))
    }

    /// Sets a header, replacing previous values of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn with_header(&self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        Ok(self.map(|r| {
            r.headers.insert(name, value);
        }))
    }

    /// Adds a header value, keeping previous values of the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if the header name or value is invalid.
    pub fn and_header(&self, name: impl AsRef<str>, value: impl AsRef<str>) -> Result<Self> {
        let (name, value) = parse_header(name.as_ref(), value.as_ref())?;
        Ok(self.map(|r| {
            r.headers.append(name, value);
        }))
    }

    /// Sets every header of `headers`, replacing same-named ones.
    pub fn with_headers(&self, headers: HeaderMap) -> Self {
        self.map(|r| r.headers.extend(headers))
    }

    /// Sets a query parameter, replacing previous values of the same key.
    pub fn with_query(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.map(|r| {
            r.query.retain(|(k, _)| *k != key);
            r.query.push((key, value));
        })
    }

    /// Adds a query parameter, keeping previous values of the same key.
    pub fn and_query(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let (key, value) = (key.into(), value.into());
        self.map(|r| r.query.push((key, value)))
    }

    /// Sets the value substituted into the `{name}` placeholder.
    pub fn with_path_param(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let (name, value) = (name.into(), value.into());
        self.map(|r| {
            r.path_params.insert(name, value);
        })
    }

    /// Sets the body.
    pub fn with_body(&self, body: Body) -> Self {
        self.map(|r| r.body = body)
    }

    /// Sets a raw byte body.
    pub fn with_bytes(&self, bytes: impl Into<Bytes>) -> Self {
        self.with_body(Body::Bytes(bytes.into()))
    }

    /// Sets a text body and `content-type: text/plain`.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.map(|r| {
            r.headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
            r.body = Body::Text(text);
        })
    }

    /// Sets a JSON body and `content-type: application/json`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` cannot be represented as JSON.
    pub fn with_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Self> {
        let value =
            serde_json::to_value(value).map_err(|e| Error::SerializationFailed(e.to_string()))?;
        Ok(self.map(|r| {
            r.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            r.body = Body::Json(value);
        }))
    }

    /// Sets a form body from a map-like value, flattening nested sequences
    /// and maps (see [`form::flatten`]), and
    /// `content-type: application/x-www-form-urlencoded`.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` does not serialize to a map.
    pub fn with_form<T: Serialize + ?Sized>(&self, value: &T) -> Result<Self> {
        let fields = form::flatten(value)?;
        Ok(self.map(|r| {
            r.headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            r.body = Body::Form(fields);
        }))
    }

    /// Sets a per-attempt timeout, overriding the client's.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.map(|r| r.timeout = Some(timeout))
    }

    /// Decodes a successful (2xx) JSON body into `target`. Empty bodies leave
    /// the target untouched.
    pub fn with_result<T>(&self, target: &Slot<T>) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let decoder = decoder_for(target.clone());
        self.map(|r| r.result = Some(decoder))
    }

    /// Decodes a non-2xx JSON body into `target` before the call fails with
    /// [`Error::Http`]. A body that does not decode is ignored.
    pub fn with_error<T>(&self, target: &Slot<T>) -> Self
    where
        T: DeserializeOwned + Send + 'static,
    {
        let decoder = decoder_for(target.clone());
        self.map(|r| r.error = Some(decoder))
    }

    /// Appends a completion listener. Listeners run in registration order
    /// after every send, successful or not.
    pub fn and_listener<F>(&self, listener: F) -> Self
    where
        F: Fn(&CallContext, &Outcome) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        self.map(|r| r.listeners.push(listener))
    }

    /// Binds the sender used by [`send_raw`](Self::send_raw).
    pub fn with_sender(&self, sender: Arc<dyn Sender>) -> Self {
        self.map(|r| r.sender = Some(sender))
    }

    /// The HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The URL as given, placeholders included.
    pub fn url_template(&self) -> &str {
        &self.url
    }

    /// The base URL, if any.
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    /// The request headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The query parameters, in order.
    pub fn query(&self) -> &[(String, String)] {
        &self.query
    }

    /// The path parameters.
    pub fn path_params(&self) -> &BTreeMap<String, String> {
        &self.path_params
    }

    /// The body.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// The per-attempt timeout, if set.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The effective URL: placeholders substituted, resolved against the
    /// base URL when relative, query parameters appended.
    ///
    /// # Errors
    ///
    /// Returns an error for a relative URL without base, a placeholder with
    /// no value, or an unparsable URL.
    pub fn url(&self) -> Result<Url> {
        self.render_url(&|_, value| encode_component(value), &|_, value| {
            encode_component(value)
        })
    }

    /// Builds the effective URL with caller-chosen renderings of path and
    /// query values. Each closure receives `(name, value)` and returns text
    /// to insert verbatim.
    pub(crate) fn render_url(
        &self,
        path_value: &dyn Fn(&str, &str) -> String,
        query_value: &dyn Fn(&str, &str) -> String,
    ) -> Result<Url> {
        let expanded = expand_placeholders(&self.url, &self.path_params, path_value)?;

        let mut url = match Url::parse(&expanded) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = self.base_url.as_ref().ok_or_else(|| {
                    Error::Configuration(format!(
                        "relative URL '{}' requires a base URL",
                        self.url
                    ))
                })?;
                base.join(expanded.trim_start_matches('/'))?
            }
            Err(e) => return Err(e.into()),
        };

        if !self.query.is_empty() {
            let mut query = url.query().unwrap_or_default().to_string();
            for (key, value) in &self.query {
                if !query.is_empty() {
                    query.push('&');
                }
                query.push_str(&encode_component(key));
                query.push('=');
                query.push_str(&query_value(key, value));
            }
            url.set_query(Some(&query));
        }

        Ok(url)
    }

    /// Resolves everything needed for the wire. Defaults fill in headers the
    /// request does not set itself.
    pub(crate) fn prepare(
        &self,
        default_headers: &HeaderMap,
        default_timeout: Option<Duration>,
    ) -> Result<PreparedRequest> {
        let mut headers = default_headers.clone();
        for name in self.headers.keys() {
            headers.remove(name);
        }
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }

        Ok(PreparedRequest {
            method: self.method.clone(),
            url: self.url()?,
            headers,
            body: self.body.encode()?,
            timeout: self.timeout.or(default_timeout),
        })
    }

    pub(crate) fn decode_result(&self, body: &[u8]) -> Option<serde_json::Result<()>> {
        let decoder = self.result.as_ref()?;
        if body.is_empty() {
            return Some(Ok(()));
        }
        Some(decoder(body))
    }

    pub(crate) fn has_result_target(&self) -> bool {
        self.result.is_some()
    }

    pub(crate) fn decode_error(&self, body: &[u8]) {
        if let Some(decoder) = &self.error {
            if !body.is_empty() {
                if let Err(e) = decoder(body) {
                    tracing::debug!(error = %e, "Error payload did not match the error target");
                }
            }
        }
    }

    /// Sends the request through its bound sender and runs the completion
    /// listeners, returning the outcome whether or not the call succeeded.
    pub async fn dispatch(&self, ctx: &CallContext) -> Outcome {
        let Some(sender) = &self.sender else {
            return Outcome::failed(
                self,
                Error::Configuration(format!(
                    "no sender bound to {} {}",
                    self.method, self.url
                )),
            );
        };

        let outcome = sender.send(ctx, self).await;
        ctx.record_attempt(outcome.attempts());
        let ctx = ctx.with_attempt(outcome.attempts());
        for listener in &self.listeners {
            listener(&ctx, &outcome);
        }
        outcome
    }

    /// Sends the request and fails when the call fails.
    pub async fn send_raw(&self, ctx: &CallContext) -> Result<Outcome> {
        self.dispatch(ctx).await.into_result()
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("headers", &self.headers)
            .field("query", &self.query)
            .field("path_params", &self.path_params)
            .field("body", &self.body)
            .field("listeners", &self.listeners.len())
            .field("bound", &self.sender.is_some())
            .finish()
    }
}

fn decoder_for<T>(target: Slot<T>) -> Decoder
where
    T: DeserializeOwned + Send + 'static,
{
    Arc::new(move |body: &[u8]| {
        let value = serde_json::from_slice::<T>(body)?;
        target.set(value);
        Ok(())
    })
}

fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let name = HeaderName::try_from(name)
        .map_err(|e| Error::Configuration(format!("Invalid header name: {}", e)))?;
    let value = HeaderValue::try_from(value)
        .map_err(|e| Error::Configuration(format!("Invalid header value: {}", e)))?;
    Ok((name, value))
}

/// Makes `url` usable as a directory base for relative references.
pub(crate) fn directory_url(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Percent-encodes a path or query component.
pub(crate) fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn expand_placeholders(
    template: &str,
    params: &BTreeMap<String, String>,
    render: &dyn Fn(&str, &str) -> String,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let name = &rest[open + 1..open + close];
        let value = params.get(name).ok_or_else(|| {
            Error::Configuration(format!(
                "missing path parameter '{}' for '{}'",
                name, template
            ))
        })?;

        out.push_str(&rest[..open]);
        out.push_str(&render(name, value));
        rest = &rest[open + close + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    fn template() -> Request {
        Request::new(Method::GET, "/users/{id}")
            .with_base_url("https://api.example.com/v1")
            .unwrap()
    }

    #[test]
    fn test_mutators_never_alter_the_receiver() {
        let base = template();
        let _ = base.with_method(Method::POST);
        let _ = base.with_header("x-a", "1").unwrap();
        let _ = base.with_query("q", "1");
        let _ = base.with_path_param("id", "7");
        let _ = base.with_text("hello");
        let _ = base.and_listener(|_, _| {});

        assert_eq!(base.method(), Method::GET);
        assert!(base.headers().is_empty());
        assert!(base.query().is_empty());
        assert!(base.path_params().is_empty());
        assert!(matches!(base.body(), Body::Empty));
        assert_eq!(base.listeners.len(), 0);
    }

    #[test]
    fn test_branches_are_independent() {
        let base = template().with_path_param("id", "1");
        let a = base.with_query("page", "1");
        let b = a.with_query("page", "2");

        assert_eq!(a.query(), &[("page".to_string(), "1".to_string())]);
        assert_eq!(b.query(), &[("page".to_string(), "2".to_string())]);
    }

    #[test]
    fn test_url_resolution_against_directory_base() {
        let cases = [
            ("https://h.example/api", "/users", "https://h.example/api/users"),
            ("https://h.example/api/", "users", "https://h.example/api/users"),
            ("https://h.example/api/", "//users", "https://h.example/api/users"),
            ("https://h.example", "/users", "https://h.example/users"),
        ];
        for (base, url, expected) in cases {
            let request = Request::new(Method::GET, url).with_base_url(base).unwrap();
            assert_eq!(request.url().unwrap().as_str(), expected, "{} + {}", base, url);
        }
    }

    #[test]
    fn test_absolute_url_ignores_base() {
        let request = template().with_url("https://other.example/x");
        assert_eq!(request.url().unwrap().as_str(), "https://other.example/x");
    }

    #[test]
    fn test_relative_url_without_base_fails() {
        let request = Request::new(Method::GET, "/users");
        assert!(matches!(request.url(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_path_params_are_encoded() {
        let request = template().with_path_param("id", "a b/c");
        assert_eq!(
            request.url().unwrap().as_str(),
            "https://api.example.com/v1/users/a%20b%2Fc"
        );
    }

    #[test]
    fn test_missing_path_param() {
        assert!(matches!(template().url(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_query_with_and_and() {
        let request = template()
            .with_path_param("id", "1")
            .and_query("tag", "a")
            .and_query("tag", "b")
            .with_query("limit", "5")
            .with_query("limit", "10");

        assert_eq!(
            request.url().unwrap().as_str(),
            "https://api.example.com/v1/users/1?tag=a&tag=b&limit=10"
        );
    }

    #[test]
    fn test_headers_with_and_and() {
        let request = template()
            .and_header("x-tag", "a")
            .unwrap()
            .and_header("x-tag", "b")
            .unwrap();
        assert_eq!(request.headers().get_all("x-tag").iter().count(), 2);

        let replaced = request.with_header("x-tag", "c").unwrap();
        assert_eq!(replaced.headers().get_all("x-tag").iter().count(), 1);
        assert!(template().with_header("bad header", "x").is_err());
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let request = template()
            .with_json(&serde_json::json!({"name": "x"}))
            .unwrap();
        assert_eq!(
            request.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(request.body().encode().unwrap().as_ref(), br#"{"name":"x"}"#);
    }

    #[test]
    fn test_form_body_is_flattened_and_encoded() {
        let request = template()
            .with_form(&serde_json::json!({"map": {"k": "v"}, "slice": ["a", "b"]}))
            .unwrap();
        assert_eq!(
            request.headers().get(CONTENT_TYPE).unwrap(),
            "application/x-www-form-urlencoded"
        );
        assert_eq!(
            request.body().encode().unwrap().as_ref(),
            b"map%5Bk%5D=v&slice%5B0%5D=a&slice%5B1%5D=b"
        );
    }

    #[test]
    fn test_prepare_merges_default_headers() {
        let mut defaults = HeaderMap::new();
        defaults.insert("user-agent", HeaderValue::from_static("default"));
        defaults.insert("x-keep", HeaderValue::from_static("yes"));

        let prepared = template()
            .with_path_param("id", "1")
            .with_header("user-agent", "mine")
            .unwrap()
            .prepare(&defaults, Some(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(prepared.headers.get("user-agent").unwrap(), "mine");
        assert_eq!(prepared.headers.get("x-keep").unwrap(), "yes");
        assert_eq!(prepared.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_result_and_error_targets() {
        #[derive(Debug, Default, Deserialize, PartialEq)]
        struct User {
            id: u32,
        }

        let result = Slot::<User>::default();
        let error = Slot::<serde_json::Value>::default();
        let request = template().with_result(&result).with_error(&error);

        assert!(request.decode_result(br#"{"id": 7}"#).unwrap().is_ok());
        assert_eq!(result.take(), User { id: 7 });
        assert!(request.decode_result(b"not json").unwrap().is_err());
        assert!(request.decode_result(b"").unwrap().is_ok());

        request.decode_error(br#"{"code": "not_found"}"#);
        assert_eq!(error.get()["code"], "not_found");
    }

    #[tokio::test]
    async fn test_dispatch_without_sender() {
        let outcome = template().with_path_param("id", "1").dispatch(&CallContext::new()).await;
        assert!(matches!(outcome.error(), Some(Error::Configuration(_))));
    }
}
