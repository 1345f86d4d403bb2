use http::Method;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Other,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Where the single request deadline fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeoutPhase {
    Transport,
    ResponseBody,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Transport => "transport",
            Self::ResponseBody => "response_body",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    Validation,
    SerializeJson,
    SerializeQuery,
    SerializeForm,
    RequestBuild,
    InvalidHeaderName,
    InvalidHeaderValue,
    Transport,
    Timeout,
    ReadBody,
    ResponseTooLarge,
    DecodeContentEncoding,
    Sink,
    HttpStatus,
    Deserialize,
    RedirectLimitExceeded,
    InvalidRedirectLocation,
    RedirectBlocked,
    RedirectBodyNotReplayable,
    RetryExhausted,
    InvalidCookie,
    Cancelled,
    Interceptor,
    TlsConfig,
    Config,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::Validation => "validation",
            Self::SerializeJson => "serialize_json",
            Self::SerializeQuery => "serialize_query",
            Self::SerializeForm => "serialize_form",
            Self::RequestBuild => "request_build",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ReadBody => "read_body",
            Self::ResponseTooLarge => "response_too_large",
            Self::DecodeContentEncoding => "decode_content_encoding",
            Self::Sink => "sink",
            Self::HttpStatus => "http_status",
            Self::Deserialize => "deserialize",
            Self::RedirectLimitExceeded => "redirect_limit_exceeded",
            Self::InvalidRedirectLocation => "invalid_redirect_location",
            Self::RedirectBlocked => "redirect_blocked",
            Self::RedirectBodyNotReplayable => "redirect_body_not_replayable",
            Self::RetryExhausted => "retry_exhausted",
            Self::InvalidCookie => "invalid_cookie",
            Self::Cancelled => "cancelled",
            Self::Interceptor => "interceptor",
            Self::TlsConfig => "tls_config",
            Self::Config => "config",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid request: {message}")]
    Validation { message: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request query: {source}")]
    SerializeQuery {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("http transport error ({kind}) for {method} {uri}: {source}")]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out in {phase} after {timeout_ms}ms for {method} {uri}")]
    Timeout {
        phase: TimeoutPhase,
        timeout_ms: u128,
        method: Method,
        uri: String,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error("response body too large (> {limit_bytes} bytes) for {method} {uri}")]
    ResponseTooLarge {
        limit_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response content-encoding {encoding} for {method} {uri}: {message}")]
    DecodeContentEncoding {
        encoding: String,
        method: Method,
        uri: String,
        message: String,
    },
    #[error("failed to write response body to sink: {source}")]
    Sink {
        #[source]
        source: std::io::Error,
    },
    #[error("server responded with {status} for {method} {uri}: {body}")]
    HttpStatus {
        status: u16,
        method: Method,
        uri: String,
        body: String,
    },
    #[error("failed to decode response json: {source}")]
    Deserialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("redirect limit exceeded ({max_redirects}) for {method} {uri}")]
    RedirectLimitExceeded {
        max_redirects: usize,
        method: Method,
        uri: String,
    },
    #[error("invalid redirect location {location} for {method} {uri}")]
    InvalidRedirectLocation {
        location: String,
        method: Method,
        uri: String,
    },
    #[error("redirect to {location} blocked ({reason}) for {method} {uri}")]
    RedirectBlocked {
        reason: &'static str,
        location: String,
        method: Method,
        uri: String,
    },
    #[error("cannot follow redirect for non-replayable request body: {method} {uri}")]
    RedirectBodyNotReplayable { method: Method, uri: String },
    #[error("retry attempts exhausted after {attempts} attempts for {method} {uri}: {source}")]
    RetryExhausted {
        attempts: usize,
        method: Method,
        uri: String,
        #[source]
        source: Box<Error>,
    },
    #[error("invalid cookie: {message}")]
    InvalidCookie { message: String },
    #[error("request cancelled: {method} {uri}")]
    Cancelled { method: Method, uri: String },
    #[error("interceptor failed: {source}")]
    Interceptor {
        #[source]
        source: BoxError,
    },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
    #[error("invalid client configuration: {message}")]
    Config { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::Validation { .. } => ErrorCode::Validation,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeQuery { .. } => ErrorCode::SerializeQuery,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseTooLarge { .. } => ErrorCode::ResponseTooLarge,
            Self::DecodeContentEncoding { .. } => ErrorCode::DecodeContentEncoding,
            Self::Sink { .. } => ErrorCode::Sink,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::RedirectLimitExceeded { .. } => ErrorCode::RedirectLimitExceeded,
            Self::InvalidRedirectLocation { .. } => ErrorCode::InvalidRedirectLocation,
            Self::RedirectBlocked { .. } => ErrorCode::RedirectBlocked,
            Self::RedirectBodyNotReplayable { .. } => ErrorCode::RedirectBodyNotReplayable,
            Self::RetryExhausted { .. } => ErrorCode::RetryExhausted,
            Self::InvalidCookie { .. } => ErrorCode::InvalidCookie,
            Self::Cancelled { .. } => ErrorCode::Cancelled,
            Self::Interceptor { .. } => ErrorCode::Interceptor,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
            Self::Config { .. } => ErrorCode::Config,
        }
    }

    /// Wraps any error raised by a user interceptor.
    pub fn interceptor(source: impl Into<BoxError>) -> Self {
        Self::Interceptor {
            source: source.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns the innermost concrete error behind `RetryExhausted` wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
