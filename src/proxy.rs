use std::error::Error as StdError;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use base64::Engine;
use http::Uri;
use http::header::HeaderValue;
use http::uri::Authority;
use hyper::rt::{Read as HyperRead, ReadBufCursor, Write as HyperWrite};
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use tower_service::Service;
use url::Url;

use crate::error::Error;
use crate::util::default_port;

pub(crate) type BoxConnectError = Box<dyn StdError + Send + Sync>;

/// A forward proxy parsed from a `scheme://[user:pass@]host[:port]` URI.
#[derive(Clone, Debug)]
pub(crate) struct ProxyConfig {
    pub(crate) uri: Uri,
    pub(crate) authorization: Option<HeaderValue>,
}

impl ProxyConfig {
    pub(crate) fn parse(proxy: &str) -> Result<Self, Error> {
        let invalid = || Error::InvalidUri {
            uri: proxy.to_owned(),
        };
        let mut url = Url::parse(proxy.trim()).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(invalid());
        }

        let authorization = if url.username().is_empty() {
            None
        } else {
            let username = percent_decode(url.username());
            let password = url.password().map(percent_decode).unwrap_or_default();
            let encoded = base64::engine::general_purpose::STANDARD
                .encode(format!("{username}:{password}").as_bytes());
            let mut value =
                HeaderValue::from_str(&format!("Basic {encoded}")).map_err(|_| invalid())?;
            value.set_sensitive(true);
            Some(value)
        };
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_path("");
        url.set_query(None);
        url.set_fragment(None);

        let uri = url.as_str().parse::<Uri>().map_err(|_| invalid())?;
        Ok(Self { uri, authorization })
    }
}

fn percent_decode(text: &str) -> String {
    let escaped = text.replace('+', "%2B");
    url::form_urlencoded::parse(format!("v={escaped}").as_bytes())
        .next()
        .map(|(_, value)| value.into_owned())
        .unwrap_or_else(|| text.to_owned())
}

/// How a connection reaches its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Route {
    Direct,
    /// Plain `http` handed to the proxy with an absolute-form target.
    Forward,
    /// A `CONNECT` tunnel, used for `https` targets.
    Tunnel,
}

/// A socket tagged with its route. Hyper reads the tag to pick between
/// origin-form and absolute-form request targets.
#[derive(Debug)]
pub(crate) struct RoutedStream<T> {
    io: T,
    route: Route,
}

impl<T: HyperRead + Unpin> HyperRead for RoutedStream<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl<T: HyperWrite + Unpin> HyperWrite for RoutedStream<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl<T: Connection> Connection for RoutedStream<T> {
    fn connected(&self) -> Connected {
        self.io.connected().proxy(self.route == Route::Forward)
    }
}

#[derive(Clone)]
struct Upstream {
    uri: Uri,
    tunnel: Tunnel<HttpConnector>,
}

/// Dials the target directly, or the agent's forward proxy when it has one.
/// Tunnel credentials travel on the `CONNECT` request; forwarded requests get
/// theirs from the transport.
#[derive(Clone)]
pub(crate) struct ProxyConnector {
    tcp: HttpConnector,
    upstream: Option<Upstream>,
}

impl ProxyConnector {
    pub(crate) fn new(
        proxy: Option<ProxyConfig>,
        connect_timeout: Duration,
        keep_alive: bool,
    ) -> Self {
        let mut tcp = HttpConnector::new();
        tcp.enforce_http(false);
        tcp.set_connect_timeout(Some(connect_timeout));
        tcp.set_nodelay(true);
        if keep_alive {
            tcp.set_keepalive(Some(Duration::from_secs(60)));
        }
        let upstream = proxy.map(|ProxyConfig { uri, authorization }| {
            let tunnel = Tunnel::new(uri.clone(), tcp.clone());
            let tunnel = match authorization {
                Some(authorization) => tunnel.with_auth(authorization),
                None => tunnel,
            };
            Upstream { uri, tunnel }
        });
        Self { tcp, upstream }
    }

    fn route(&self, dst: &Uri) -> Route {
        match (&self.upstream, dst.scheme_str()) {
            (None, _) => Route::Direct,
            (Some(_), Some(scheme)) if scheme.eq_ignore_ascii_case("https") => Route::Tunnel,
            (Some(_), _) => Route::Forward,
        }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = RoutedStream<<HttpConnector as Service<Uri>>::Response>;
    type Error = BoxConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    // Every route dials through an `HttpConnector`, which is always ready.
    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.tcp.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let route = self.route(&dst);
        let mut tcp = self.tcp.clone();
        let upstream = self.upstream.clone();
        Box::pin(async move {
            let io = match (route, upstream) {
                (Route::Tunnel, Some(mut upstream)) => {
                    upstream.tunnel.call(with_default_port(dst)).await?
                }
                (Route::Forward, Some(upstream)) => tcp.call(upstream.uri).await?,
                _ => tcp.call(dst).await?,
            };
            Ok::<_, BoxConnectError>(RoutedStream { io, route })
        })
    }
}

/// `CONNECT` needs an explicit port in its authority.
fn with_default_port(dst: Uri) -> Uri {
    if dst.port_u16().is_some() {
        return dst;
    }
    let (Some(host), Some(port)) = (dst.host().map(ToOwned::to_owned), default_port(&dst)) else {
        return dst;
    };
    let authority = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let Ok(authority) = authority.parse::<Authority>() else {
        return dst;
    };
    let mut parts = dst.clone().into_parts();
    parts.authority = Some(authority);
    Uri::from_parts(parts).unwrap_or(dst)
}
