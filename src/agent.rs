use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use http::header::HeaderValue;
use hyper_rustls::HttpsConnectorBuilder;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use moka::notification::RemovalCause;
use tracing::debug;
use url::Url;

use crate::body::ReqBody;
use crate::error::Error;
use crate::proxy::{ProxyConfig, ProxyConnector};
use crate::tls::build_rustls_tls_config;
use crate::util::{lock_unpoisoned, redact_uri_for_logs};

pub(crate) type TransportClient =
    Client<hyper_rustls::HttpsConnector<ProxyConnector>, ReqBody>;

const PROXY_AGENT_CAPACITY: u64 = 100;
const PROXY_AGENT_IDLE_TTL: Duration = Duration::from_secs(5 * 60);
const URL_CACHE_CAPACITY: u64 = 500;
const URL_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentOptions {
    pub connect_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_max_idle_per_host: usize,
    /// When off, connections are not reused between requests.
    pub keep_alive: bool,
    pub reject_unauthorized: bool,
    /// Forward proxy, `http://[user:pass@]host:port`.
    pub proxy: Option<String>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            pool_idle_timeout: Duration::from_secs(90),
            pool_max_idle_per_host: 256,
            keep_alive: true,
            reject_unauthorized: true,
            proxy: None,
        }
    }
}

struct AgentInner {
    client: TransportClient,
    options: AgentOptions,
    proxy_authorization: Option<HeaderValue>,
}

/// A pooled connection manager. Clones share the same pool; the pool is
/// released when the last clone is dropped.
#[derive(Clone)]
pub struct Agent {
    inner: Arc<AgentInner>,
}

impl Agent {
    pub fn new(options: AgentOptions) -> Result<Self, Error> {
        let proxy_config = options
            .proxy
            .as_deref()
            .map(ProxyConfig::parse)
            .transpose()?;
        let proxy_authorization = proxy_config
            .as_ref()
            .and_then(|config| config.authorization.clone());

        let connector =
            ProxyConnector::new(proxy_config, options.connect_timeout, options.keep_alive);
        let tls_config = build_rustls_tls_config(options.reject_unauthorized)?;
        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(connector);
        let max_idle = if options.keep_alive {
            options.pool_max_idle_per_host
        } else {
            0
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(options.pool_idle_timeout)
            .pool_max_idle_per_host(max_idle)
            .build(https);

        Ok(Self {
            inner: Arc::new(AgentInner {
                client,
                options,
                proxy_authorization,
            }),
        })
    }

    pub fn options(&self) -> &AgentOptions {
        &self.inner.options
    }

    pub fn is_proxied(&self) -> bool {
        self.inner.options.proxy.is_some()
    }

    pub(crate) fn transport(&self) -> &TransportClient {
        &self.inner.client
    }

    /// Credentials for plain-http requests sent through the proxy.
    pub(crate) fn proxy_authorization(&self) -> Option<&HeaderValue> {
        self.inner.proxy_authorization.as_ref()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Agent")
            .field(
                "proxy",
                &self.inner.options.proxy.as_deref().map(redact_uri_for_logs),
            )
            .field(
                "reject_unauthorized",
                &self.inner.options.reject_unauthorized,
            )
            .field("keep_alive", &self.inner.options.keep_alive)
            .finish()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct AgentKey {
    scheme: String,
    proxy: Option<String>,
    reject_unauthorized: bool,
}

impl AgentKey {
    pub(crate) fn new(scheme: &str, proxy: Option<&str>, reject_unauthorized: bool) -> Self {
        Self {
            scheme: scheme.to_ascii_lowercase(),
            proxy: proxy.map(ToOwned::to_owned),
            reject_unauthorized,
        }
    }
}

/// Shared agents, the proxy agent cache and the parsed URL cache.
pub struct AgentRegistry {
    shared: Mutex<HashMap<AgentKey, Agent>>,
    proxies: moka::sync::Cache<AgentKey, Agent>,
    urls: moka::sync::Cache<String, Url>,
    connect_timeout: Duration,
}

static GLOBAL_REGISTRY: OnceLock<Arc<AgentRegistry>> = OnceLock::new();

impl AgentRegistry {
    pub fn new() -> Self {
        Self::with_connect_timeout(AgentOptions::default().connect_timeout)
    }

    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        let proxies = moka::sync::Cache::builder()
            .max_capacity(PROXY_AGENT_CAPACITY)
            .time_to_idle(PROXY_AGENT_IDLE_TTL)
            .eviction_listener(|key: Arc<AgentKey>, _agent: Agent, cause: RemovalCause| {
                debug!(
                    scheme = %key.scheme,
                    proxy = key.proxy.as_deref().map(redact_uri_for_logs).unwrap_or_default(),
                    cause = ?cause,
                    "dropping proxy agent"
                );
            })
            .build();
        let urls = moka::sync::Cache::builder()
            .max_capacity(URL_CACHE_CAPACITY)
            .time_to_live(URL_CACHE_TTL)
            .build();
        Self {
            shared: Mutex::new(HashMap::new()),
            proxies,
            urls,
            connect_timeout,
        }
    }

    pub fn global() -> Arc<Self> {
        GLOBAL_REGISTRY
            .get_or_init(|| Arc::new(Self::new()))
            .clone()
    }

    /// The keep-alive agent shared by every direct request for `(scheme, tls flag)`.
    pub(crate) fn shared_agent(
        &self,
        scheme: &str,
        reject_unauthorized: bool,
        keep_alive: bool,
    ) -> Result<Agent, Error> {
        if !keep_alive {
            return Agent::new(self.options(None, reject_unauthorized, false));
        }
        let key = AgentKey::new(scheme, None, reject_unauthorized);
        let mut shared = lock_unpoisoned(&self.shared);
        if let Some(agent) = shared.get(&key) {
            return Ok(agent.clone());
        }
        let agent = Agent::new(self.options(None, reject_unauthorized, true))?;
        shared.insert(key, agent.clone());
        Ok(agent)
    }

    /// A cached agent that routes through `proxy`. Concurrent callers for the
    /// same key wait on a single construction.
    pub(crate) fn proxy_agent(
        &self,
        scheme: &str,
        proxy: &str,
        reject_unauthorized: bool,
    ) -> Result<Agent, Error> {
        ProxyConfig::parse(proxy)?;
        let key = AgentKey::new(scheme, Some(proxy), reject_unauthorized);
        self.proxies
            .try_get_with(key, || {
                debug!(
                    scheme = %scheme.to_ascii_lowercase(),
                    proxy = %redact_uri_for_logs(proxy),
                    "creating proxy agent"
                );
                Agent::new(self.options(Some(proxy), reject_unauthorized, true))
            })
            .map_err(|shared| {
                Arc::try_unwrap(shared).unwrap_or_else(|shared| Error::TlsConfig {
                    message: shared.to_string(),
                })
            })
    }

    fn options(
        &self,
        proxy: Option<&str>,
        reject_unauthorized: bool,
        keep_alive: bool,
    ) -> AgentOptions {
        AgentOptions {
            connect_timeout: self.connect_timeout,
            keep_alive,
            reject_unauthorized,
            proxy: proxy.map(ToOwned::to_owned),
            ..AgentOptions::default()
        }
    }

    /// Parses an absolute `http`/`https` URL, reusing earlier parses.
    pub(crate) fn parse_url(&self, text: &str) -> Result<Url, Error> {
        if let Some(url) = self.urls.get(text) {
            return Ok(url);
        }
        let invalid = || Error::InvalidUri {
            uri: text.to_owned(),
        };
        let url = Url::parse(text).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid());
        }
        self.urls.insert(text.to_owned(), url.clone());
        Ok(url)
    }

    pub fn clear_proxy_agents(&self) {
        self.proxies.invalidate_all();
        self.proxies.run_pending_tasks();
    }

    /// Drops every shared and proxy agent, closing their idle connections.
    pub fn close_agents(&self) {
        lock_unpoisoned(&self.shared).clear();
        self.clear_proxy_agents();
    }

    pub fn clear_url_cache(&self) {
        self.urls.invalidate_all();
    }

    pub fn proxy_agent_count(&self) -> usize {
        self.proxies.run_pending_tasks();
        usize::try_from(self.proxies.entry_count()).unwrap_or(usize::MAX)
    }

    pub fn shared_agent_count(&self) -> usize {
        lock_unpoisoned(&self.shared).len()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("AgentRegistry")
            .field("shared_agents", &self.shared_agent_count())
            .field("proxy_agents", &self.proxies.entry_count())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
