use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use http::Method;
use http::header::{ACCEPT_ENCODING, HeaderName, HeaderValue};
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::ClientConfig;
use crate::cookie::{CookieJar, ManualCookies};
use crate::error::{Error, ErrorCode};
use crate::request::RequestDescriptor;
use crate::retry::RetryPolicy;
use crate::util::{ensure_accept_encoding, join_base_path};

fn isolated_client(config: ClientConfig) -> Client {
    Client::new(config).expect("client should build")
}

#[test]
fn join_base_path_handles_slashes() {
    assert_eq!(
        join_base_path("https://api.example.com/v1/", "/users"),
        "https://api.example.com/v1/users"
    );
}

#[test]
fn ensure_accept_encoding_keeps_caller_value() {
    let mut headers = http::HeaderMap::new();
    headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("identity"));
    ensure_accept_encoding(&mut headers);
    assert_eq!(
        headers.get(ACCEPT_ENCODING),
        Some(&HeaderValue::from_static("identity"))
    );
}

#[test]
fn client_request_is_seeded_from_config() {
    let client = isolated_client(ClientConfig {
        base_url: Some("https://api.example.com/v1".to_owned()),
        default_headers: [("x-sdk".to_owned(), "nklient".to_owned())].into(),
        timeout_ms: 1_500,
        max_redirects: 2,
        cookies: true,
        follow_redirects: false,
        ..ClientConfig::default()
    });

    let descriptor = client.get("/users?page=2");
    assert_eq!(
        descriptor.uri.as_deref(),
        Some("https://api.example.com/v1/users?page=2")
    );
    assert_eq!(
        descriptor.headers.get(HeaderName::from_static("x-sdk")),
        Some(&HeaderValue::from_static("nklient"))
    );
    assert_eq!(descriptor.timeout, Duration::from_millis(1_500));
    assert_eq!(descriptor.max_redirects, 2);
    assert!(!descriptor.follow_redirects);
    assert_eq!(descriptor.retry_policy.max_attempts(), 3);
    let jar = descriptor.jar.expect("client jar");
    assert!(jar.ptr_eq(client.cookie_jar().expect("jar")));
}

#[test]
fn clients_are_isolated_from_each_other() {
    let first = isolated_client(ClientConfig {
        cookies: true,
        ..ClientConfig::default()
    });
    let second = isolated_client(ClientConfig {
        cookies: true,
        ..ClientConfig::default()
    });
    first
        .set_cookie("session=abc", "http://example.com/")
        .expect("set cookie");
    assert_eq!(
        first.get_cookies("http://example.com/").expect("cookies").len(),
        1
    );
    assert!(
        second
            .get_cookies("http://example.com/")
            .expect("cookies")
            .is_empty()
    );

    first
        .interceptors()
        .request
        .register(|descriptor: RequestDescriptor| async move { Ok::<_, Error>(descriptor) });
    assert_eq!(first.interceptors().request.len(), 1);
    assert!(second.interceptors().request.is_empty());
}

#[test]
fn cookie_methods_require_a_jar() {
    let client = isolated_client(ClientConfig::default());
    let error = client
        .set_cookie("a=b", "http://example.com/")
        .expect_err("no jar");
    assert_eq!(error.code(), ErrorCode::InvalidCookie);
}

#[tokio::test]
async fn missing_uri_fails_validation() {
    let client = isolated_client(ClientConfig::default());
    let error = client
        .execute(RequestDescriptor::empty(Method::GET))
        .await
        .expect_err("missing uri");
    assert_eq!(error.code(), ErrorCode::Validation);
}

#[tokio::test]
async fn non_http_uri_is_rejected() {
    let client = isolated_client(ClientConfig::default());
    let error = client
        .execute(RequestDescriptor::get("ftp://example.com/file"))
        .await
        .expect_err("ftp");
    assert_eq!(error.code(), ErrorCode::InvalidUri);
}

#[tokio::test]
async fn pre_cancelled_request_never_reaches_interceptors() {
    let client = isolated_client(ClientConfig::default());
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    client
        .interceptors()
        .request
        .register(move |descriptor: RequestDescriptor| {
            seen.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, Error>(descriptor) }
        });

    let token = CancellationToken::new();
    token.cancel();
    let mut descriptor = RequestDescriptor::get("http://127.0.0.1:9/never");
    descriptor.cancellation = Some(token);
    let error = client.execute(descriptor).await.expect_err("cancelled");

    assert!(error.is_cancelled());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let snapshot = client.metrics_snapshot();
    assert_eq!(snapshot.cancelled, 1);
    assert_eq!(snapshot.in_flight, 0);
}

#[tokio::test]
async fn invalid_manual_cookie_fails_before_sending() {
    let client = isolated_client(ClientConfig::default());
    let mut descriptor = RequestDescriptor::get("http://127.0.0.1:9/never");
    descriptor.cookies = Some(ManualCookies::Pairs(vec![(
        "session".to_owned(),
        "a\r\nInjected: yes".to_owned(),
    )]));
    let error = client.execute(descriptor).await.expect_err("invalid cookie");
    assert_eq!(error.code(), ErrorCode::InvalidCookie);
}

#[tokio::test]
async fn request_interceptor_failure_is_terminal() {
    let client = isolated_client(ClientConfig::default());
    client
        .interceptors()
        .request
        .register(|_descriptor: RequestDescriptor| async move {
            Err::<RequestDescriptor, Error>(Error::interceptor("blocked by policy"))
        });
    let mut descriptor = RequestDescriptor::get("http://127.0.0.1:9/never");
    descriptor.retry_policy = RetryPolicy::standard().base_delay(Duration::ZERO);
    let error = client.execute(descriptor).await.expect_err("interceptor");
    assert_eq!(error.code(), ErrorCode::Interceptor);
}

#[test]
fn free_cookie_functions_use_the_supplied_jar() {
    let jar = CookieJar::new();
    crate::set_cookie("theme=dark; Path=/", "http://example.com/", Some(&jar)).expect("set");
    let cookies = crate::get_cookies("http://example.com/settings", Some(&jar)).expect("get");
    assert_eq!(cookies.len(), 1);
    assert_eq!(cookies[0].name, "theme");
    crate::clear_cookies(Some(&jar));
    assert!(jar.is_empty());
}

#[test]
fn global_client_seeds_descriptors_with_the_global_jar() {
    let client = Client::global();
    let global = CookieJar::global();
    assert!(client.cookie_jar().expect("jar").ptr_eq(&global));
    let descriptor = client.get("http://example.com/");
    assert!(descriptor.jar.expect("jar").ptr_eq(&global));
}
