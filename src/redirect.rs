use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use http::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION};
use http::{HeaderMap, Method, StatusCode, Uri};

use crate::error::Error;
use crate::util::{redact_uri_for_logs, same_origin};

/// Security toggles consulted before following a redirect.
///
/// Both protections are on by default: an `https` → `http` hop and a hop from
/// a public host to a loopback, private or link-local address fail with
/// [`Error::RedirectBlocked`] unless explicitly allowed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RedirectPolicy {
    allow_https_downgrade: bool,
    allow_private_network: bool,
}

impl RedirectPolicy {
    pub const fn strict() -> Self {
        Self {
            allow_https_downgrade: false,
            allow_private_network: false,
        }
    }

    pub const fn permissive() -> Self {
        Self {
            allow_https_downgrade: true,
            allow_private_network: true,
        }
    }

    pub const fn allow_https_downgrade(mut self, allow: bool) -> Self {
        self.allow_https_downgrade = allow;
        self
    }

    pub const fn allow_private_network(mut self, allow: bool) -> Self {
        self.allow_private_network = allow;
        self
    }

    fn check(self, from: &Uri, to: &Uri) -> Result<(), &'static str> {
        let from_https = from
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("https"));
        let to_http = to
            .scheme_str()
            .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http"));
        if from_https && to_http && !self.allow_https_downgrade {
            return Err("https_downgrade");
        }

        let from_private = from.host().is_some_and(is_private_host);
        let to_private = to.host().is_some_and(is_private_host);
        if !from_private && to_private && !self.allow_private_network {
            return Err("private_network");
        }
        Ok(())
    }
}

/// Where the next hop goes and how it is sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedirectHop {
    pub uri: Uri,
    pub method: Method,
    /// The request body is dropped for this hop (method downgraded to GET).
    pub drop_body: bool,
    pub same_origin: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RedirectDecision {
    Follow(RedirectHop),
    /// Not a redirect; the response is final.
    Resolved,
    /// A redirect the caller asked not to follow; returned verbatim.
    Disabled,
}

/// Per-request redirect bookkeeping. `count` starts at zero and grows by one per hop.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RedirectState {
    pub(crate) follow: bool,
    pub(crate) max_redirects: usize,
    pub(crate) count: usize,
    pub(crate) policy: RedirectPolicy,
}

impl RedirectState {
    pub(crate) fn new(follow: bool, max_redirects: usize, policy: RedirectPolicy) -> Self {
        Self {
            follow,
            max_redirects,
            count: 0,
            policy,
        }
    }

    pub(crate) fn decide(
        &self,
        method: &Method,
        current_uri: &Uri,
        status: StatusCode,
        headers: &HeaderMap,
        body_replayable: bool,
    ) -> Result<RedirectDecision, Error> {
        if !is_redirect_status(status) {
            return Ok(RedirectDecision::Resolved);
        }
        let Some(location) = redirect_location(headers) else {
            return Ok(RedirectDecision::Resolved);
        };
        if !self.follow {
            return Ok(RedirectDecision::Disabled);
        }
        if self.count >= self.max_redirects {
            return Err(Error::RedirectLimitExceeded {
                max_redirects: self.max_redirects,
                method: method.clone(),
                uri: redact_uri_for_logs(&current_uri.to_string()),
            });
        }

        let Some(next_uri) = resolve_redirect_uri(current_uri, &location) else {
            return Err(Error::InvalidRedirectLocation {
                location: redact_uri_for_logs(&location),
                method: method.clone(),
                uri: redact_uri_for_logs(&current_uri.to_string()),
            });
        };
        if let Err(reason) = self.policy.check(current_uri, &next_uri) {
            return Err(Error::RedirectBlocked {
                reason,
                location: redact_uri_for_logs(&next_uri.to_string()),
                method: method.clone(),
                uri: redact_uri_for_logs(&current_uri.to_string()),
            });
        }

        let next_method = redirect_method(method, status);
        let drop_body = next_method != *method || status == StatusCode::SEE_OTHER;
        if !drop_body && !body_replayable {
            return Err(Error::RedirectBodyNotReplayable {
                method: method.clone(),
                uri: redact_uri_for_logs(&current_uri.to_string()),
            });
        }

        Ok(RedirectDecision::Follow(RedirectHop {
            same_origin: same_origin(current_uri, &next_uri),
            uri: next_uri,
            method: next_method,
            drop_body,
        }))
    }
}

pub(crate) fn is_redirect_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

pub(crate) fn redirect_method(method: &Method, status: StatusCode) -> Method {
    match status {
        StatusCode::SEE_OTHER => Method::GET,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND if *method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

fn redirect_location(headers: &HeaderMap) -> Option<String> {
    headers
        .get(LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

pub(crate) fn resolve_redirect_uri(current_uri: &Uri, location: &str) -> Option<Uri> {
    let base = url::Url::parse(&current_uri.to_string()).ok()?;
    let joined = base.join(location).ok()?;
    if !matches!(joined.scheme(), "http" | "https") {
        return None;
    }
    joined.as_str().parse().ok()
}

pub(crate) fn sanitize_headers_for_redirect(headers: &mut HeaderMap, hop: &RedirectHop) {
    if hop.drop_body {
        headers.remove(CONTENT_LENGTH);
        headers.remove(CONTENT_TYPE);
    }
    if !hop.same_origin {
        headers.remove(AUTHORIZATION);
        headers.remove(COOKIE);
    }
}

fn is_private_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") || host.to_ascii_lowercase().ends_with(".localhost")
    {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(address)) => is_private_v4(address),
        Ok(IpAddr::V6(address)) => match address.to_ipv4_mapped() {
            Some(mapped) => is_private_v4(mapped),
            None => is_private_v6(address),
        },
        Err(_) => false,
    }
}

fn is_private_v4(address: Ipv4Addr) -> bool {
    address.is_loopback()
        || address.is_private()
        || address.is_link_local()
        || address.is_unspecified()
}

fn is_private_v6(address: Ipv6Addr) -> bool {
    let first = address.segments()[0];
    address.is_loopback()
        || address.is_unspecified()
        || (first & 0xfe00) == 0xfc00
        || (first & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers_with_location(location: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static(location));
        headers
    }

    fn uri(text: &str) -> Uri {
        text.parse().expect("uri")
    }

    fn follow(
        state: &RedirectState,
        method: Method,
        from: &str,
        status: u16,
        to: &'static str,
    ) -> Result<RedirectDecision, Error> {
        state.decide(
            &method,
            &uri(from),
            StatusCode::from_u16(status).expect("status"),
            &headers_with_location(to),
            true,
        )
    }

    #[test]
    fn see_other_always_becomes_get_without_body() {
        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        for method in [Method::POST, Method::PUT, Method::DELETE] {
            let decision = follow(&state, method, "http://a.test/x", 303, "/y").expect("decision");
            let RedirectDecision::Follow(hop) = decision else {
                panic!("expected follow");
            };
            assert_eq!(hop.method, Method::GET);
            assert!(hop.drop_body);
            assert_eq!(hop.uri, uri("http://a.test/y"));
        }
    }

    #[test]
    fn temporary_redirect_preserves_method_and_body() {
        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        let RedirectDecision::Follow(hop) =
            follow(&state, Method::POST, "http://a.test/x", 307, "/y").expect("decision")
        else {
            panic!("expected follow");
        };
        assert_eq!(hop.method, Method::POST);
        assert!(!hop.drop_body);
    }

    #[test]
    fn found_downgrades_post_only() {
        assert_eq!(redirect_method(&Method::POST, StatusCode::FOUND), Method::GET);
        assert_eq!(redirect_method(&Method::PUT, StatusCode::FOUND), Method::PUT);
        assert_eq!(
            redirect_method(&Method::POST, StatusCode::MOVED_PERMANENTLY),
            Method::GET
        );
    }

    #[test]
    fn limit_is_checked_before_following() {
        let mut state = RedirectState::new(true, 2, RedirectPolicy::default());
        state.count = 2;
        let error = follow(&state, Method::GET, "http://a.test/x", 302, "/y").expect_err("limit");
        assert!(matches!(error, Error::RedirectLimitExceeded { max_redirects: 2, .. }));
    }

    #[test]
    fn redirect_errors_carry_redacted_uris() {
        let mut state = RedirectState::new(true, 1, RedirectPolicy::default());
        state.count = 1;
        let error = follow(
            &state,
            Method::GET,
            "http://user:pw@a.test/x?token=secret",
            302,
            "/y",
        )
        .expect_err("limit");
        assert!(
            matches!(error, Error::RedirectLimitExceeded { ref uri, .. } if uri == "http://a.test/x")
        );

        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        let error = follow(
            &state,
            Method::GET,
            "https://a.test/x?token=secret",
            302,
            "http://a.test/y?session=abc",
        )
        .expect_err("blocked");
        let Error::RedirectBlocked { location, uri, .. } = error else {
            panic!("expected blocked redirect");
        };
        assert_eq!(uri, "https://a.test/x");
        assert_eq!(location, "http://a.test/y");
    }

    #[test]
    fn disabled_and_non_redirects_are_reported() {
        let state = RedirectState::new(false, 5, RedirectPolicy::default());
        assert_eq!(
            follow(&state, Method::GET, "http://a.test/x", 302, "/y").expect("decision"),
            RedirectDecision::Disabled
        );
        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        assert_eq!(
            follow(&state, Method::GET, "http://a.test/x", 200, "/y").expect("decision"),
            RedirectDecision::Resolved
        );
        let no_location = state
            .decide(
                &Method::GET,
                &uri("http://a.test/x"),
                StatusCode::FOUND,
                &HeaderMap::new(),
                true,
            )
            .expect("decision");
        assert_eq!(no_location, RedirectDecision::Resolved);
    }

    #[test]
    fn https_downgrade_is_blocked_unless_allowed() {
        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        let error = follow(&state, Method::GET, "https://a.test/x", 302, "http://a.test/y")
            .expect_err("blocked");
        assert!(matches!(error, Error::RedirectBlocked { reason: "https_downgrade", .. }));

        let state = RedirectState::new(
            true,
            5,
            RedirectPolicy::default().allow_https_downgrade(true),
        );
        assert!(follow(&state, Method::GET, "https://a.test/x", 302, "http://a.test/y").is_ok());
    }

    #[test]
    fn public_to_private_hop_is_blocked() {
        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        for target in [
            "http://127.0.0.1/admin",
            "http://10.0.0.8/",
            "http://169.254.169.254/latest",
            "http://localhost:8080/",
            "http://[::1]/",
        ] {
            let error = follow(&state, Method::GET, "http://public.test/x", 302, target)
                .expect_err("blocked");
            assert!(matches!(error, Error::RedirectBlocked { reason: "private_network", .. }));
        }
        assert!(follow(&state, Method::GET, "http://127.0.0.1:9/x", 302, "http://127.0.0.1:9/y").is_ok());
    }

    #[test]
    fn non_replayable_body_cannot_be_preserved() {
        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        let error = state
            .decide(
                &Method::PUT,
                &uri("http://a.test/x"),
                StatusCode::TEMPORARY_REDIRECT,
                &headers_with_location("/y"),
                false,
            )
            .expect_err("not replayable");
        assert!(matches!(error, Error::RedirectBodyNotReplayable { .. }));
    }

    #[test]
    fn cross_origin_hop_strips_credentials() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let hop = RedirectHop {
            uri: uri("http://b.test/"),
            method: Method::GET,
            drop_body: true,
            same_origin: false,
        };
        sanitize_headers_for_redirect(&mut headers, &hop);
        assert!(headers.get(AUTHORIZATION).is_none());
        assert!(headers.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn invalid_location_scheme_is_rejected() {
        let state = RedirectState::new(true, 5, RedirectPolicy::default());
        let error = follow(&state, Method::GET, "http://a.test/x", 302, "ftp://a.test/y")
            .expect_err("invalid");
        assert!(matches!(error, Error::InvalidRedirectLocation { .. }));
    }
}
