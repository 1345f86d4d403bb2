//! Client-level defaults, loadable from JSON.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use http::HeaderMap;
use serde::Deserialize;

use crate::error::Error;
use crate::request::{DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT};
use crate::retry::RetryPolicy;
use crate::util::{parse_header_name, parse_header_value};

/// Defaults applied to every descriptor a [`Client`](crate::Client) creates.
///
/// Keys are camelCase and durations are milliseconds:
///
/// ```json
/// { "baseUrl": "https://api.example.com", "timeout": 5000, "retry": { "attempts": 2 } }
/// ```
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Prefix for relative request paths.
    pub base_url: Option<String>,
    pub default_headers: BTreeMap<String, String>,
    #[serde(rename = "timeout")]
    pub timeout_ms: u64,
    #[serde(rename = "connectTimeout")]
    pub connect_timeout_ms: u64,
    pub max_redirects: usize,
    pub retry: RetryConfig,
    pub keep_alive: bool,
    /// Give the client its own cookie jar.
    pub cookies: bool,
    pub follow_redirects: bool,
    pub decompress: bool,
    pub reject_unauthorized: bool,
    pub proxy: Option<String>,
    pub max_response_size: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_headers: BTreeMap::new(),
            timeout_ms: duration_ms(DEFAULT_TIMEOUT),
            connect_timeout_ms: 10_000,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            retry: RetryConfig::default(),
            keep_alive: true,
            cookies: false,
            follow_redirects: true,
            decompress: true,
            reject_unauthorized: true,
            proxy: None,
            max_response_size: None,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(text).map_err(|source| Error::Config {
            message: source.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| Error::Config {
            message: format!("failed to read {}: {source}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if let Some(base_url) = &self.base_url
            && !base_url.is_empty()
        {
            let parsed = url::Url::parse(base_url).map_err(|_| Error::Config {
                message: format!("baseUrl is not an absolute url: {base_url}"),
            })?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(Error::Config {
                    message: format!("baseUrl must use http or https: {base_url}"),
                });
            }
        }
        if self.timeout_ms == 0 {
            return Err(Error::Config {
                message: "timeout must be greater than zero".to_owned(),
            });
        }
        self.default_headers()?;
        Ok(())
    }

    pub(crate) fn default_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::with_capacity(self.default_headers.len());
        for (name, value) in &self.default_headers {
            let header_name = parse_header_name(name)?;
            let header_value = parse_header_value(name, value)?;
            headers.insert(header_name, header_value);
        }
        Ok(headers)
    }
}

/// The `retry` block. `attempts` counts total tries, not retries.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct RetryConfig {
    pub attempts: usize,
    #[serde(rename = "delay")]
    pub delay_ms: u64,
    #[serde(rename = "maxDelay")]
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_ratio: f64,
    pub retry_on_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: duration_ms(RetryPolicy::DEFAULT_BASE_DELAY),
            max_delay_ms: duration_ms(RetryPolicy::DEFAULT_MAX_DELAY),
            backoff_multiplier: RetryPolicy::DEFAULT_BACKOFF_MULTIPLIER,
            jitter_ratio: 0.0,
            retry_on_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::standard()
            .attempts(config.attempts)
            .base_delay(Duration::from_millis(config.delay_ms))
            .max_delay(Duration::from_millis(config.max_delay_ms))
            .backoff_multiplier(config.backoff_multiplier)
            .jitter_ratio(config.jitter_ratio)
            .retryable_status_codes(config.retry_on_status_codes.iter().copied())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
