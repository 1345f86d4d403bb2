//! `nklient` is an async HTTP/1.1 client built around a request execution
//! pipeline: pooled agents, retry with backoff, redirect following, cookie
//! jars, response decompression and request/response interceptors.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use nklient::prelude::{Client, ClientConfig, RetryPolicy};
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Item {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new(ClientConfig {
//!         base_url: Some("https://api.example.com".to_owned()),
//!         cookies: true,
//!         ..ClientConfig::default()
//!     })?;
//!
//!     let mut descriptor = client
//!         .post("/v1/items")
//!         .with_json(&serde_json::json!({ "name": "demo" }))?;
//!     descriptor.timeout = Duration::from_secs(5);
//!     descriptor.retry_policy = RetryPolicy::standard().base_delay(Duration::from_millis(200));
//!
//!     let item: Item = client.execute(descriptor).await?.json()?;
//!     println!("created id={}", item.id);
//!     Ok(())
//! }
//! ```
//!
//! Descriptors built by hand go through the process-wide client with
//! [`execute`]; [`cleanup`] releases its pooled connections.

mod agent;
mod body;
mod client;
mod config;
mod content_encoding;
mod cookie;
mod error;
mod interceptor;
mod metrics;
mod proxy;
mod redirect;
mod request;
mod response;
mod retry;
mod tls;
mod transport;
mod util;

use std::sync::Arc;

pub use crate::agent::{Agent, AgentOptions, AgentRegistry};
pub use crate::body::{
    BodyStream, ByteStream, DownloadProgress, ProgressCallback, RequestBody, ResponseEncoding,
};
pub use crate::client::Client;
pub use crate::config::{ClientConfig, RetryConfig};
pub use crate::cookie::{CookieJar, CookieRecord, ManualCookies, SameSite};
pub use crate::error::{BoxError, Error, ErrorCode, TimeoutPhase, TransportErrorKind};
pub use crate::interceptor::{Interceptor, InterceptorChain, InterceptorId, Interceptors};
pub use crate::metrics::MetricsSnapshot;
pub use crate::redirect::{RedirectDecision, RedirectHop, RedirectPolicy};
pub use crate::request::{DEFAULT_MAX_REDIRECTS, DEFAULT_TIMEOUT, RequestDescriptor};
pub use crate::response::{RequestEcho, Response, ResponseBody};
pub use crate::retry::{RetryClassifier, RetryDecision, RetryPolicy};
pub use tokio_util::sync::CancellationToken;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        BodyStream, CancellationToken, Client, ClientConfig, CookieJar, Error, ErrorCode,
        Interceptors, ManualCookies, RedirectPolicy, RequestBody, RequestDescriptor, Response,
        ResponseBody, ResponseEncoding, Result, RetryPolicy,
    };
}

/// Executes `descriptor` on the process-wide client. Without a jar of its own
/// the request reads and writes the global jar.
pub async fn execute(descriptor: RequestDescriptor) -> Result<Response> {
    Client::global().execute(descriptor).await
}

/// The interceptor chains of the process-wide client.
pub fn interceptors() -> Arc<Interceptors> {
    Interceptors::global()
}

/// Cookies `jar` (or the global jar) would send to `url`.
pub fn get_cookies(url: &str, jar: Option<&CookieJar>) -> Result<Vec<CookieRecord>> {
    let url = AgentRegistry::global().parse_url(url)?;
    Ok(resolve_jar(jar).cookies_for(&url))
}

/// Stores a `Set-Cookie` style string as if `url` had sent it.
pub fn set_cookie(cookie: &str, url: &str, jar: Option<&CookieJar>) -> Result<()> {
    let url = AgentRegistry::global().parse_url(url)?;
    resolve_jar(jar).set_cookie(cookie, &url)
}

pub fn clear_cookies(jar: Option<&CookieJar>) {
    resolve_jar(jar).clear();
}

fn resolve_jar(jar: Option<&CookieJar>) -> CookieJar {
    jar.cloned().unwrap_or_else(CookieJar::global)
}

/// Drops every cached proxy agent of the global registry.
pub fn clear_proxy_agents() {
    AgentRegistry::global().clear_proxy_agents();
}

/// Drops every shared and proxy agent of the global registry.
pub fn close_agents() {
    AgentRegistry::global().close_agents();
}

pub fn proxy_agent_count() -> usize {
    AgentRegistry::global().proxy_agent_count()
}

/// Closes global agents and empties the global jar and url cache.
pub fn cleanup() {
    let registry = AgentRegistry::global();
    registry.close_agents();
    registry.clear_url_cache();
    CookieJar::global().clear();
}

#[cfg(test)]
mod tests;
