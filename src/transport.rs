use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, PROXY_AUTHORIZATION};
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use hyper::body::Incoming;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::agent::{Agent, AgentRegistry};
use crate::body::{BodyStream, ProgressCallback, RequestBody, ResponseEncoding, build_http_request};
use crate::content_encoding::{ContentDecoder, should_decode_content_encoded_body};
use crate::error::{Error, TimeoutPhase};
use crate::response::{RequestEcho, Response, ResponseBody};
use crate::util::{classify_transport_error, redact_uri_for_logs};

/// Per-request exchange settings, detached from the descriptor so that they
/// can be shared across hops and attempts.
#[derive(Clone)]
pub(crate) struct ExchangeSettings {
    pub(crate) timeout: Duration,
    pub(crate) decompress: bool,
    pub(crate) reject_unauthorized: bool,
    pub(crate) keep_alive: bool,
    pub(crate) stream: bool,
    pub(crate) encoding: ResponseEncoding,
    pub(crate) max_response_size: Option<usize>,
    pub(crate) proxy: Option<String>,
    pub(crate) agent: Option<Agent>,
    pub(crate) progress: Option<ProgressCallback>,
    pub(crate) cancellation: Option<CancellationToken>,
}

/// One fully resolved hop.
pub(crate) struct HopRequest {
    pub(crate) method: Method,
    pub(crate) uri: Uri,
    pub(crate) headers: HeaderMap,
    pub(crate) body: RequestBody,
}

/// Status and headers of an exchange whose body has not been read yet.
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    body: Incoming,
    request: RequestEcho,
}

/// Runs single exchanges under one deadline.
///
/// The deadline is fixed when the executor is created, so every hop of an
/// attempt shares it.
pub(crate) struct TransportExecutor<'a> {
    registry: &'a AgentRegistry,
    settings: &'a ExchangeSettings,
    deadline: Instant,
}

impl<'a> TransportExecutor<'a> {
    pub(crate) fn new(registry: &'a AgentRegistry, settings: &'a ExchangeSettings) -> Self {
        Self {
            registry,
            settings,
            deadline: Instant::now() + settings.timeout,
        }
    }

    fn select_agent(&self, uri: &Uri) -> Result<Agent, Error> {
        if let Some(agent) = &self.settings.agent {
            return Ok(agent.clone());
        }
        let scheme = uri.scheme_str().unwrap_or("http");
        if let Some(proxy) = self.settings.proxy.as_deref() {
            return self
                .registry
                .proxy_agent(scheme, proxy, self.settings.reject_unauthorized);
        }
        self.registry.shared_agent(
            scheme,
            self.settings.reject_unauthorized,
            self.settings.keep_alive,
        )
    }

    /// Sends the hop and waits for the response head.
    pub(crate) async fn send(&self, hop: HopRequest) -> Result<ResponseHead, Error> {
        let HopRequest {
            method,
            uri,
            mut headers,
            body,
        } = hop;
        let uri_text = uri.to_string();
        let redacted_uri = redact_uri_for_logs(&uri_text);
        let agent = self.select_agent(&uri)?;

        if !self.settings.keep_alive && !headers.contains_key(CONNECTION) {
            headers.insert(CONNECTION, HeaderValue::from_static("close"));
        }
        if uri.scheme_str() == Some("http")
            && let Some(authorization) = agent.proxy_authorization()
        {
            headers.insert(PROXY_AUTHORIZATION, authorization.clone());
        }

        let request = build_http_request(method.clone(), uri, &headers, body)?;
        debug!(
            method = %method,
            uri = %redacted_uri,
            proxied = agent.is_proxied(),
            "sending http request"
        );
        let sending = agent.transport().request(request);
        let response = self
            .guard(TimeoutPhase::Transport, &method, &redacted_uri, sending)
            .await?
            .map_err(|source| Error::Transport {
                kind: classify_transport_error(&source),
                method: method.clone(),
                uri: redacted_uri.clone(),
                source: Box::new(source),
            })?;

        let (parts, body) = response.into_parts();
        debug!(
            method = %method,
            uri = %redacted_uri,
            status = parts.status.as_u16(),
            "received response head"
        );
        Ok(ResponseHead {
            status: parts.status,
            headers: parts.headers,
            body,
            request: RequestEcho {
                uri: uri_text,
                method,
                headers,
            },
        })
    }

    /// Reads or wraps the body of an accepted exchange.
    pub(crate) async fn receive(&self, head: ResponseHead) -> Result<Response, Error> {
        let ResponseHead {
            status,
            mut headers,
            body,
            request,
        } = head;
        let redacted_uri = redact_uri_for_logs(&request.uri);

        let decoder = if self.settings.decompress
            && should_decode_content_encoded_body(&request.method, status)
        {
            ContentDecoder::from_headers(&headers)
        } else {
            None
        };
        let total = headers
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        if decoder.is_some() {
            headers.remove(CONTENT_ENCODING);
            headers.remove(CONTENT_LENGTH);
        }

        let stream = BodyStream::new(
            body,
            decoder,
            total,
            request.method.clone(),
            redacted_uri.clone(),
        )
        .with_progress(self.settings.progress.clone())
        .with_cancellation(self.settings.cancellation.as_ref());

        if self.settings.stream {
            return Ok(Response {
                status,
                headers,
                body: ResponseBody::Stream(stream),
                request,
            });
        }

        let collected = self
            .guard(
                TimeoutPhase::ResponseBody,
                &request.method,
                &redacted_uri,
                stream.bytes(self.settings.max_response_size),
            )
            .await??;
        debug!(
            method = %request.method,
            uri = %redacted_uri,
            status = status.as_u16(),
            bytes = collected.len(),
            "read response body"
        );
        let body = match self.settings.encoding {
            ResponseEncoding::Raw => ResponseBody::Bytes(collected),
            ResponseEncoding::Text => text_body(&headers, &collected),
        };
        Ok(Response {
            status,
            headers,
            body,
            request,
        })
    }

    async fn guard<F>(
        &self,
        phase: TimeoutPhase,
        method: &Method,
        uri: &str,
        future: F,
    ) -> Result<F::Output, Error>
    where
        F: Future,
    {
        let timed = tokio::time::timeout_at(self.deadline, future);
        let outcome = with_cancellation(self.settings.cancellation.as_ref(), method, uri, timed)
            .await?;
        outcome.map_err(|_| Error::Timeout {
            phase,
            timeout_ms: self.settings.timeout.as_millis(),
            method: method.clone(),
            uri: uri.to_owned(),
        })
    }
}

/// Races `future` against the token; a fired token drops the future.
pub(crate) async fn with_cancellation<F>(
    token: Option<&CancellationToken>,
    method: &Method,
    uri: &str,
    future: F,
) -> Result<F::Output, Error>
where
    F: Future,
{
    let Some(token) = token else {
        return Ok(future.await);
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Error::Cancelled {
            method: method.clone(),
            uri: uri.to_owned(),
        }),
        output = future => Ok(output),
    }
}

fn text_body(headers: &HeaderMap, bytes: &Bytes) -> ResponseBody {
    let text = String::from_utf8_lossy(bytes).into_owned();
    let is_json = headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("application/json"));
    if is_json && let Ok(value) = serde_json::from_str(&text) {
        return ResponseBody::Json(value);
    }
    ResponseBody::Text(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers
    }

    #[test]
    fn json_content_type_parses_when_valid() {
        let body = text_body(&json_headers(), &Bytes::from_static(br#"{"ok":true}"#));
        assert!(matches!(body, ResponseBody::Json(value) if value["ok"] == true));
    }

    #[test]
    fn invalid_json_falls_back_to_text() {
        let body = text_body(&json_headers(), &Bytes::from_static(b"not json"));
        assert!(matches!(body, ResponseBody::Text(text) if text == "not json"));
    }

    #[test]
    fn plain_text_is_lossy_utf8() {
        let body = text_body(&HeaderMap::new(), &Bytes::from_static(b"caf\xff"));
        assert!(matches!(body, ResponseBody::Text(text) if text == "caf\u{fffd}"));
    }

    #[tokio::test]
    async fn cancelled_token_wins_the_race() {
        let token = CancellationToken::new();
        token.cancel();
        let error = with_cancellation(
            Some(&token),
            &Method::GET,
            "http://example.com/",
            std::future::pending::<()>(),
        )
        .await
        .expect_err("cancelled");
        assert!(error.is_cancelled());
    }

    #[tokio::test]
    async fn missing_token_just_awaits() {
        let value = with_cancellation(None, &Method::GET, "http://example.com/", async { 7 })
            .await
            .expect("value");
        assert_eq!(value, 7);
    }
}
