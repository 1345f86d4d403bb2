use std::sync::{Arc, OnceLock, RwLock};
use std::time::SystemTime;

use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Uri};
use tracing::debug;
use url::Url;

pub use cookie::SameSite;

use crate::error::Error;
use crate::util::{read_unpoisoned, write_unpoisoned};

/// A snapshot of one stored cookie.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CookieRecord {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub expires: Option<SystemTime>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<SameSite>,
}

/// Cookies supplied directly on a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManualCookies {
    /// A `Cookie`-style header string, `name=value; other=value`.
    Header(String),
    Pairs(Vec<(String, String)>),
}

impl ManualCookies {
    fn pairs(&self) -> Result<Vec<(String, String)>, Error> {
        let pairs = match self {
            Self::Header(header) => header
                .split(';')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(|part| match part.split_once('=') {
                    Some((name, value)) => (name.trim().to_owned(), value.trim().to_owned()),
                    None => (part.to_owned(), String::new()),
                })
                .collect::<Vec<_>>(),
            Self::Pairs(pairs) => pairs.clone(),
        };
        for (name, value) in &pairs {
            if name.is_empty() {
                return Err(Error::InvalidCookie {
                    message: "cookie name must not be empty".to_owned(),
                });
            }
            if has_forbidden_chars(name) || has_forbidden_chars(value) {
                return Err(Error::InvalidCookie {
                    message: format!("cookie {name:?} contains CR, LF or NUL"),
                });
            }
        }
        Ok(pairs)
    }
}

fn has_forbidden_chars(text: &str) -> bool {
    text.contains(['\r', '\n', '\0'])
}

/// Shared cookie storage. Clones share the same underlying store.
#[derive(Clone, Debug, Default)]
pub struct CookieJar(Arc<RwLock<cookie_store::CookieStore>>);

static GLOBAL_JAR: OnceLock<CookieJar> = OnceLock::new();

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide jar used when no other jar is supplied.
    pub fn global() -> Self {
        GLOBAL_JAR.get_or_init(Self::new).clone()
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Unexpired cookies that would be sent to `url`.
    pub fn cookies_for(&self, url: &Url) -> Vec<CookieRecord> {
        let store = read_unpoisoned(&self.0);
        store
            .matches(url)
            .into_iter()
            .map(|stored| {
                let raw: &cookie::Cookie<'static> = stored;
                CookieRecord {
                    name: raw.name().to_owned(),
                    value: raw.value().to_owned(),
                    domain: raw
                        .domain()
                        .map(|domain| domain.trim_start_matches('.').to_owned())
                        .or_else(|| url.host_str().map(ToOwned::to_owned))
                        .unwrap_or_default(),
                    path: raw.path().unwrap_or("/").to_owned(),
                    expires: raw.expires_datetime().map(SystemTime::from),
                    secure: raw.secure().unwrap_or(false),
                    http_only: raw.http_only().unwrap_or(false),
                    same_site: raw.same_site(),
                }
            })
            .collect()
    }

    /// Parses one `Set-Cookie` style string and stores it as if `url` had sent it.
    pub fn set_cookie(&self, cookie: &str, url: &Url) -> Result<(), Error> {
        if has_forbidden_chars(cookie) {
            return Err(Error::InvalidCookie {
                message: "cookie contains CR, LF or NUL".to_owned(),
            });
        }
        let mut store = write_unpoisoned(&self.0);
        store
            .parse(cookie, url)
            .map(|_| ())
            .map_err(|error| Error::InvalidCookie {
                message: error.to_string(),
            })
    }

    pub fn clear(&self) {
        write_unpoisoned(&self.0).clear();
    }

    /// Number of unexpired cookies across all domains.
    pub fn len(&self) -> usize {
        read_unpoisoned(&self.0).iter_unexpired().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrites the `Cookie` header with the jar's matches for `uri`.
    /// Leaves the header untouched when nothing matches.
    pub(crate) fn apply_to_request(&self, uri: &Uri, headers: &mut HeaderMap) {
        let Some(url) = uri_to_url(uri) else {
            return;
        };
        let header = {
            let store = read_unpoisoned(&self.0);
            store
                .get_request_values(&url)
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ")
        };
        if header.is_empty() {
            return;
        }
        match HeaderValue::from_str(&header) {
            Ok(value) => {
                headers.insert(COOKIE, value);
            }
            Err(error) => debug!(error = %error, "skipping unrepresentable cookie header"),
        }
    }

    /// Stores every `Set-Cookie` of a response; malformed values are dropped.
    pub(crate) fn absorb_response(&self, uri: &Uri, headers: &HeaderMap) {
        let mut values = headers.get_all(SET_COOKIE).iter().peekable();
        if values.peek().is_none() {
            return;
        }
        let Some(url) = uri_to_url(uri) else {
            return;
        };
        let mut store = write_unpoisoned(&self.0);
        for value in values {
            let Ok(text) = value.to_str() else {
                debug!("ignoring non-ascii set-cookie header");
                continue;
            };
            if let Err(error) = store.parse(text, &url) {
                debug!(error = %error, cookie = text, "ignoring rejected set-cookie header");
            }
        }
    }

    /// Stores manual cookies scoped to the request host with path `/`.
    pub(crate) fn store_manual(&self, cookies: &ManualCookies, uri: &Uri) -> Result<(), Error> {
        let pairs = cookies.pairs()?;
        let Some(url) = uri_to_url(uri) else {
            return Err(Error::InvalidUri {
                uri: uri.to_string(),
            });
        };
        let mut store = write_unpoisoned(&self.0);
        for (name, value) in pairs {
            let raw = cookie::Cookie::build((name, value)).path("/").build();
            store
                .insert_raw(&raw, &url)
                .map_err(|error| Error::InvalidCookie {
                    message: error.to_string(),
                })?;
        }
        Ok(())
    }
}

pub(crate) fn uri_to_url(uri: &Uri) -> Option<Url> {
    Url::parse(&uri.to_string()).ok()
}
