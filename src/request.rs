use std::time::Duration;

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::body::{ProgressCallback, RequestBody, ResponseEncoding};
use crate::cookie::{CookieJar, ManualCookies};
use crate::error::{BoxError, Error};
use crate::redirect::RedirectPolicy;
use crate::retry::RetryPolicy;
use crate::util::{append_query_pairs, parse_header_name, parse_header_value};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Everything needed to run one logical request.
///
/// A descriptor is consumed by a single `execute` call. Redirects and retries
/// work on private copies of the method, uri, headers and body.
pub struct RequestDescriptor {
    pub method: Method,
    /// Absolute `http`/`https` URI. Executing without one fails validation.
    pub uri: Option<String>,
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// One deadline covering connect, headers and, in buffered mode, the body.
    pub timeout: Duration,
    pub max_redirects: usize,
    pub follow_redirects: bool,
    /// Undo gzip, deflate and br content encodings.
    pub decompress: bool,
    /// Validate the server certificate chain for `https`.
    pub reject_unauthorized: bool,
    pub retry_policy: RetryPolicy,
    pub redirect_policy: RedirectPolicy,
    pub proxy: Option<String>,
    /// Overrides both the shared and the proxy agents.
    pub agent: Option<Agent>,
    /// `None` falls back to the jar of the executing client, if it has one.
    pub jar: Option<CookieJar>,
    /// `false` turns jar handling off even when the client has a jar.
    pub use_cookies: bool,
    pub cookies: Option<ManualCookies>,
    /// Cap on decoded body bytes in buffered mode.
    pub max_response_size: Option<usize>,
    /// Resolve once headers arrive and hand back a live body stream.
    pub stream: bool,
    pub encoding: ResponseEncoding,
    pub keep_alive: bool,
    pub on_download_progress: Option<ProgressCallback>,
    pub cancellation: Option<CancellationToken>,
}

impl RequestDescriptor {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            uri: Some(uri.into()),
            ..Self::empty(method)
        }
    }

    /// A descriptor without a target; useful for filling fields by hand.
    pub fn empty(method: Method) -> Self {
        Self {
            method,
            uri: None,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            timeout: DEFAULT_TIMEOUT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            follow_redirects: true,
            decompress: true,
            reject_unauthorized: true,
            retry_policy: RetryPolicy::disabled(),
            redirect_policy: RedirectPolicy::default(),
            proxy: None,
            agent: None,
            jar: None,
            use_cookies: true,
            cookies: None,
            max_response_size: None,
            stream: false,
            encoding: ResponseEncoding::Text,
            keep_alive: true,
            on_download_progress: None,
            cancellation: None,
        }
    }

    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(Method::POST, uri)
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn try_header(self, name: &str, value: &str) -> Result<Self, Error> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.header(name, value))
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = RequestBody::Bytes(body.into());
        self
    }

    /// Sends `stream` as the body. Such a request is never retried.
    pub fn with_stream<S, E>(mut self, stream: S, length: Option<u64>) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.body = RequestBody::Stream {
            stream: Box::pin(stream.map(|item| item.map_err(Into::<BoxError>::into))),
            length,
        };
        self
    }

    pub fn with_json<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(payload).map_err(|source| Error::SerializeJson { source })?;
        Ok(self
            .with_body(body)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")))
    }

    pub fn with_form<T>(self, payload: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded =
            serde_urlencoded::to_string(payload).map_err(|source| Error::SerializeForm { source })?;
        Ok(self.with_body(encoded).header(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        ))
    }

    /// Appends serialized query pairs to the uri, keeping any existing query.
    pub fn with_query<T>(mut self, params: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let Some(uri) = self.uri.as_deref() else {
            return Err(Error::Validation {
                message: "cannot add a query to a request without a uri".to_owned(),
            });
        };
        let encoded =
            serde_urlencoded::to_string(params).map_err(|source| Error::SerializeQuery { source })?;
        let pairs = url::form_urlencoded::parse(encoded.as_bytes())
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect::<Vec<_>>();
        self.uri = Some(append_query_pairs(uri, &pairs));
        Ok(self)
    }
}

impl std::fmt::Debug for RequestDescriptor {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RequestDescriptor")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("max_redirects", &self.max_redirects)
            .field("follow_redirects", &self.follow_redirects)
            .field("decompress", &self.decompress)
            .field("reject_unauthorized", &self.reject_unauthorized)
            .field("retry_policy", &self.retry_policy)
            .field("redirect_policy", &self.redirect_policy)
            .field("proxy", &self.proxy.is_some())
            .field("agent", &self.agent)
            .field("jar", &self.jar.is_some())
            .field("use_cookies", &self.use_cookies)
            .field("cookies", &self.cookies.is_some())
            .field("max_response_size", &self.max_response_size)
            .field("stream", &self.stream)
            .field("encoding", &self.encoding)
            .field("keep_alive", &self.keep_alive)
            .field("cancellation", &self.cancellation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Search<'a> {
        q: &'a str,
        page: u32,
    }

    #[test]
    fn defaults_match_documented_values() {
        let descriptor = RequestDescriptor::get("http://example.com/");
        assert_eq!(descriptor.timeout, Duration::from_secs(30));
        assert_eq!(descriptor.max_redirects, 5);
        assert!(descriptor.follow_redirects);
        assert!(descriptor.decompress);
        assert!(descriptor.reject_unauthorized);
        assert_eq!(descriptor.retry_policy.max_attempts(), 1);
        assert!(descriptor.jar.is_none());
    }

    #[test]
    fn with_json_sets_body_and_content_type() {
        let descriptor = RequestDescriptor::post("http://example.com/items")
            .with_json(&serde_json::json!({ "name": "widget" }))
            .expect("json");
        assert_eq!(
            descriptor.headers.get(CONTENT_TYPE),
            Some(&HeaderValue::from_static("application/json"))
        );
        assert_eq!(descriptor.body.content_length(), Some(17));
    }

    #[test]
    fn with_query_appends_pairs() {
        let descriptor = RequestDescriptor::get("http://example.com/search?lang=en")
            .with_query(&Search { q: "rust http", page: 2 })
            .expect("query");
        assert_eq!(
            descriptor.uri.as_deref(),
            Some("http://example.com/search?lang=en&q=rust+http&page=2")
        );
    }

    #[test]
    fn with_query_requires_uri() {
        let error = RequestDescriptor::empty(Method::GET)
            .with_query(&[("a", "b")])
            .expect_err("missing uri");
        assert!(matches!(error, Error::Validation { .. }));
    }

    #[test]
    fn try_header_rejects_invalid_names() {
        let error = RequestDescriptor::get("http://example.com/")
            .try_header("bad header", "x")
            .expect_err("invalid");
        assert!(matches!(error, Error::InvalidHeaderName { .. }));
    }
}
