use std::sync::{Arc, OnceLock};
use std::time::Instant;

use http::header::COOKIE;
use http::{HeaderMap, Method, Uri};
use tokio::time::sleep;
use tracing::{Instrument, debug, info_span, warn};
use url::Url;

use crate::agent::AgentRegistry;
use crate::body::RequestBody;
use crate::config::ClientConfig;
use crate::cookie::{CookieJar, CookieRecord};
use crate::error::Error;
use crate::interceptor::Interceptors;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::redirect::{RedirectDecision, RedirectPolicy, RedirectState, sanitize_headers_for_redirect};
use crate::request::RequestDescriptor;
use crate::response::Response;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::transport::{ExchangeSettings, HopRequest, TransportExecutor, with_cancellation};
use crate::util::{ensure_accept_encoding, merge_headers, redact_uri_for_logs, resolve_against_base};

struct ClientInner {
    config: ClientConfig,
    default_headers: HeaderMap,
    retry_policy: RetryPolicy,
    jar: Option<CookieJar>,
    interceptors: Arc<Interceptors>,
    registry: Arc<AgentRegistry>,
    metrics: ClientMetrics,
}

/// Executes request descriptors.
///
/// Clones share configuration, cookie jar, interceptors, agents and metrics.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

static GLOBAL_CLIENT: OnceLock<Client> = OnceLock::new();

/// A descriptor taken apart for the pipeline. The body travels separately so
/// that this part can be shared across hops and attempts.
struct PreparedRequest {
    method: Method,
    uri: Uri,
    redacted_uri: String,
    headers: HeaderMap,
    retry_policy: RetryPolicy,
    redirect_policy: RedirectPolicy,
    follow_redirects: bool,
    max_redirects: usize,
    jar: Option<CookieJar>,
    settings: ExchangeSettings,
}

impl Client {
    /// A client with its own cookie jar (when `config.cookies`), interceptors and agents.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        config.validate()?;
        let registry = Arc::new(AgentRegistry::with_connect_timeout(config.connect_timeout()));
        let jar = config.cookies.then(CookieJar::new);
        Self::assemble(config, jar, Arc::new(Interceptors::new()), registry)
    }

    /// The process-wide client behind the free functions of this crate. It
    /// stores cookies in [`CookieJar::global`].
    pub fn global() -> Self {
        GLOBAL_CLIENT
            .get_or_init(|| {
                let config = ClientConfig::default();
                Self {
                    inner: Arc::new(ClientInner {
                        default_headers: HeaderMap::new(),
                        retry_policy: RetryPolicy::from(&config.retry),
                        config,
                        jar: Some(CookieJar::global()),
                        interceptors: Interceptors::global(),
                        registry: AgentRegistry::global(),
                        metrics: ClientMetrics::default(),
                    }),
                }
            })
            .clone()
    }

    fn assemble(
        config: ClientConfig,
        jar: Option<CookieJar>,
        interceptors: Arc<Interceptors>,
        registry: Arc<AgentRegistry>,
    ) -> Result<Self, Error> {
        let default_headers = config.default_headers()?;
        let retry_policy = RetryPolicy::from(&config.retry);
        Ok(Self {
            inner: Arc::new(ClientInner {
                config,
                default_headers,
                retry_policy,
                jar,
                interceptors,
                registry,
                metrics: ClientMetrics::default(),
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// A descriptor seeded with this client's defaults. Relative `uri`s are
    /// joined onto the configured base url.
    pub fn request(&self, method: Method, uri: impl AsRef<str>) -> RequestDescriptor {
        let config = &self.inner.config;
        let mut descriptor = RequestDescriptor::new(
            method,
            resolve_against_base(config.base_url.as_deref(), uri.as_ref()),
        );
        descriptor.headers = self.inner.default_headers.clone();
        descriptor.timeout = config.timeout();
        descriptor.max_redirects = config.max_redirects;
        descriptor.follow_redirects = config.follow_redirects;
        descriptor.decompress = config.decompress;
        descriptor.reject_unauthorized = config.reject_unauthorized;
        descriptor.keep_alive = config.keep_alive;
        descriptor.retry_policy = self.inner.retry_policy.clone();
        descriptor.proxy = config.proxy.clone();
        descriptor.max_response_size = config.max_response_size;
        descriptor.jar = self.inner.jar.clone();
        descriptor
    }

    pub fn get(&self, uri: impl AsRef<str>) -> RequestDescriptor {
        self.request(Method::GET, uri)
    }

    pub fn post(&self, uri: impl AsRef<str>) -> RequestDescriptor {
        self.request(Method::POST, uri)
    }

    pub fn put(&self, uri: impl AsRef<str>) -> RequestDescriptor {
        self.request(Method::PUT, uri)
    }

    pub fn patch(&self, uri: impl AsRef<str>) -> RequestDescriptor {
        self.request(Method::PATCH, uri)
    }

    pub fn delete(&self, uri: impl AsRef<str>) -> RequestDescriptor {
        self.request(Method::DELETE, uri)
    }

    pub fn head(&self, uri: impl AsRef<str>) -> RequestDescriptor {
        self.request(Method::HEAD, uri)
    }

    pub fn interceptors(&self) -> &Interceptors {
        &self.inner.interceptors
    }

    pub fn cookie_jar(&self) -> Option<&CookieJar> {
        self.inner.jar.as_ref()
    }

    pub fn get_cookies(&self, url: &str) -> Result<Vec<CookieRecord>, Error> {
        let jar = self.require_jar()?;
        Ok(jar.cookies_for(&self.inner.registry.parse_url(url)?))
    }

    pub fn set_cookie(&self, cookie: &str, url: &str) -> Result<(), Error> {
        let jar = self.require_jar()?;
        jar.set_cookie(cookie, &self.inner.registry.parse_url(url)?)
    }

    pub fn clear_cookies(&self) {
        if let Some(jar) = &self.inner.jar {
            jar.clear();
        }
    }

    fn require_jar(&self) -> Result<&CookieJar, Error> {
        self.inner.jar.as_ref().ok_or_else(|| Error::InvalidCookie {
            message: "client has no cookie jar".to_owned(),
        })
    }

    pub fn agents(&self) -> &AgentRegistry {
        &self.inner.registry
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Runs one logical request: interceptors, retries, redirects and cookies.
    pub async fn execute(&self, descriptor: RequestDescriptor) -> Result<Response, Error> {
        let started = Instant::now();
        self.inner.metrics.record_request_started();
        let _in_flight = self.inner.metrics.enter_in_flight();
        let result = self.execute_inner(descriptor).await;
        self.inner
            .metrics
            .record_request_completed(&result, started.elapsed());
        result
    }

    async fn execute_inner(&self, mut descriptor: RequestDescriptor) -> Result<Response, Error> {
        let initial = self.validate(&descriptor)?;
        let redacted_uri = redact_uri_for_logs(&initial.to_string());
        let token = descriptor.cancellation.clone();
        if token.as_ref().is_some_and(|token| token.is_cancelled()) {
            return Err(Error::Cancelled {
                method: descriptor.method.clone(),
                uri: redacted_uri,
            });
        }

        if !descriptor.use_cookies {
            descriptor.jar = None;
        } else if descriptor.jar.is_none() {
            descriptor.jar = self.inner.jar.clone();
        }
        if let Some(cookies) = descriptor.cookies.take() {
            let jar = descriptor.jar.get_or_insert_with(CookieJar::new);
            jar.store_manual(&cookies, &initial)?;
        }

        let method = descriptor.method.clone();
        let descriptor = with_cancellation(
            token.as_ref(),
            &method,
            &redacted_uri,
            self.inner.interceptors.request.run(descriptor),
        )
        .await??;

        let (prepared, body) = self.prepare(descriptor)?;
        let response = self.run_with_retry(prepared, body).await?;
        with_cancellation(
            token.as_ref(),
            &method,
            &redacted_uri,
            self.inner.interceptors.response.run(response),
        )
        .await?
    }

    fn validate(&self, descriptor: &RequestDescriptor) -> Result<Uri, Error> {
        let Some(uri) = descriptor.uri.as_deref().filter(|uri| !uri.trim().is_empty()) else {
            return Err(Error::Validation {
                message: "request uri is required".to_owned(),
            });
        };
        let resolved = resolve_against_base(self.inner.config.base_url.as_deref(), uri);
        let url = self.inner.registry.parse_url(&resolved)?;
        url_to_uri(&url)
    }

    fn prepare(
        &self,
        descriptor: RequestDescriptor,
    ) -> Result<(PreparedRequest, RequestBody), Error> {
        let uri = self.validate(&descriptor)?;
        let RequestDescriptor {
            method,
            headers,
            body,
            timeout,
            max_redirects,
            follow_redirects,
            decompress,
            reject_unauthorized,
            retry_policy,
            redirect_policy,
            proxy,
            agent,
            jar,
            max_response_size,
            stream,
            encoding,
            keep_alive,
            on_download_progress,
            cancellation,
            ..
        } = descriptor;

        let mut headers = merge_headers(&self.inner.default_headers, &headers);
        if decompress {
            ensure_accept_encoding(&mut headers);
        }
        let prepared = PreparedRequest {
            redacted_uri: redact_uri_for_logs(&uri.to_string()),
            method,
            uri,
            headers,
            retry_policy,
            redirect_policy,
            follow_redirects,
            max_redirects,
            jar,
            settings: ExchangeSettings {
                timeout,
                decompress,
                reject_unauthorized,
                keep_alive,
                stream,
                encoding,
                max_response_size,
                proxy,
                agent,
                progress: on_download_progress,
                cancellation,
            },
        };
        Ok((prepared, body))
    }

    async fn run_with_retry(
        &self,
        prepared: PreparedRequest,
        mut body: RequestBody,
    ) -> Result<Response, Error> {
        let policy = prepared.retry_policy.clone();
        let max_attempts = if body.is_replayable() {
            policy.max_attempts()
        } else {
            1
        };
        let method = prepared.method.clone();
        let redacted_uri = prepared.redacted_uri.clone();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let attempt_body = body
                .try_clone()
                .unwrap_or_else(|| std::mem::take(&mut body));
            let span = info_span!(
                "nklient.request",
                method = %method,
                uri = %redacted_uri,
                attempt = attempt,
                max_attempts = max_attempts
            );
            let outcome = self
                .run_redirects(&prepared, attempt_body)
                .instrument(span)
                .await;

            let retry_error = match outcome {
                Ok(response) => {
                    let decision = RetryDecision::for_status(
                        attempt,
                        max_attempts,
                        &method,
                        &redacted_uri,
                        response.status,
                    );
                    if !policy.should_retry_decision(&decision) {
                        return Ok(response);
                    }
                    if attempt >= max_attempts {
                        if max_attempts > 1 {
                            return Err(Error::RetryExhausted {
                                attempts: attempt,
                                method,
                                uri: redacted_uri,
                                source: Box::new(response.status_error()),
                            });
                        }
                        return Ok(response);
                    }
                    response.status_error()
                }
                Err(error) => {
                    let Some(decision) = RetryDecision::for_error(
                        attempt,
                        max_attempts,
                        &method,
                        &redacted_uri,
                        &error,
                    ) else {
                        return Err(error);
                    };
                    if !policy.should_retry_decision(&decision) {
                        return Err(error);
                    }
                    if attempt >= max_attempts {
                        if max_attempts > 1 {
                            return Err(Error::RetryExhausted {
                                attempts: attempt,
                                method,
                                uri: redacted_uri,
                                source: Box::new(error),
                            });
                        }
                        return Err(error);
                    }
                    error
                }
            };

            let retry_delay = policy.delay_for_attempt(attempt - 1);
            warn!(
                method = %method,
                uri = %redacted_uri,
                attempt = attempt,
                delay_ms = u64::try_from(retry_delay.as_millis()).unwrap_or(u64::MAX),
                error = %retry_error,
                "retrying request"
            );
            self.inner.metrics.record_retry();
            if !retry_delay.is_zero() {
                with_cancellation(
                    prepared.settings.cancellation.as_ref(),
                    &method,
                    &redacted_uri,
                    sleep(retry_delay),
                )
                .await?;
            }
        }
    }

    /// One attempt: follows redirects until a final response, sharing one deadline.
    async fn run_redirects(
        &self,
        prepared: &PreparedRequest,
        mut body: RequestBody,
    ) -> Result<Response, Error> {
        let transport = TransportExecutor::new(&self.inner.registry, &prepared.settings);
        let mut redirects = RedirectState::new(
            prepared.follow_redirects,
            prepared.max_redirects,
            prepared.redirect_policy,
        );
        let mut method = prepared.method.clone();
        let mut uri = prepared.uri.clone();
        let mut headers = prepared.headers.clone();

        loop {
            if let Some(jar) = &prepared.jar {
                // Later hops get only what the jar holds for their own url.
                if redirects.count > 0 {
                    headers.remove(COOKIE);
                }
                jar.apply_to_request(&uri, &mut headers);
            }
            let body_replayable = body.is_replayable();
            let hop_body = body
                .try_clone()
                .unwrap_or_else(|| std::mem::take(&mut body));
            let head = transport
                .send(HopRequest {
                    method: method.clone(),
                    uri: uri.clone(),
                    headers: headers.clone(),
                    body: hop_body,
                })
                .await?;
            if let Some(jar) = &prepared.jar {
                jar.absorb_response(&uri, &head.headers);
            }

            let hop = match redirects.decide(
                &method,
                &uri,
                head.status,
                &head.headers,
                body_replayable,
            )? {
                RedirectDecision::Follow(hop) => hop,
                RedirectDecision::Resolved | RedirectDecision::Disabled => {
                    return transport.receive(head).await;
                }
            };
            drop(head);

            debug!(
                from = %redact_uri_for_logs(&uri.to_string()),
                to = %redact_uri_for_logs(&hop.uri.to_string()),
                method = %hop.method,
                hop = redirects.count + 1,
                "following redirect"
            );
            sanitize_headers_for_redirect(&mut headers, &hop);
            if hop.drop_body {
                body = RequestBody::Empty;
            }
            method = hop.method;
            uri = hop.uri;
            redirects.count += 1;
            self.inner.metrics.record_redirect();
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Client")
            .field("config", &self.inner.config)
            .field("cookies", &self.inner.jar.is_some())
            .field("interceptors", &self.inner.interceptors)
            .field("agents", &self.inner.registry)
            .finish()
    }
}

fn url_to_uri(url: &Url) -> Result<Uri, Error> {
    url.as_str().parse::<Uri>().map_err(|_| Error::InvalidUri {
        uri: redact_uri_for_logs(url.as_str()),
    })
}
