//! HTTP Cookies

use std::{borrow::Cow, fmt, sync::RwLock, time::SystemTime};

use bytes::BufMut;

pub use cookie_crate::{Cookie as RawCookie, Expiration, SameSite};
use http::{header::SET_COOKIE, HeaderValue};

/// Actions for a persistent cookie store providing session support.
pub trait CookieStore: Send + Sync {
    /// Store a set of Set-Cookie header values received from `url`.
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url);

    /// Get any Cookie values in the store for `url`.
    fn cookies(&self, url: &url::Url) -> Option<Vec<HeaderValue>>;
}

/// A single HTTP cookie.
#[derive(Debug, Clone)]
pub struct Cookie<'a>(cookie_crate::Cookie<'a>);

/// A good default `CookieStore` implementation.
///
/// This is the implementation used when simply calling `cookie_store(true)`.
/// This type is exposed to allow creating one and filling it with some
/// existing cookies more easily, before creating a `Client`.
#[derive(Debug)]
pub struct Jar(RwLock<cookie_store::CookieStore>);

// ===== impl Cookie =====

impl<'a> Cookie<'a> {
    fn parse(value: &'a HeaderValue) -> Result<Cookie<'a>, CookieParseError> {
        std::str::from_utf8(value.as_bytes())
            .map_err(cookie_crate::ParseError::from)
            .and_then(cookie_crate::Cookie::parse)
            .map_err(CookieParseError)
            .map(Cookie)
    }

    /// Creates a new `Cookie` instance from the given name and value.
    #[inline]
    pub fn new<N, V>(name: N, value: V) -> Cookie<'a>
    where
        N: Into<Cow<'a, str>>,
        V: Into<Cow<'a, str>>,
    {
        Cookie(RawCookie::new(name, value))
    }

    /// The name of the cookie.
    #[inline]
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// The value of the cookie.
    #[inline]
    pub fn value(&self) -> &str {
        self.0.value()
    }

    /// Returns true if the 'HttpOnly' directive is enabled.
    #[inline]
    pub fn http_only(&self) -> bool {
        self.0.http_only().unwrap_or(false)
    }

    /// Returns true if the 'Secure' directive is enabled.
    #[inline]
    pub fn secure(&self) -> bool {
        self.0.secure().unwrap_or(false)
    }

    /// Returns true if 'SameSite' directive is 'Lax'.
    #[inline]
    pub fn same_site_lax(&self) -> bool {
        self.0.same_site() == Some(SameSite::Lax)
    }

    /// Returns true if 'SameSite' directive is 'Strict'.
    #[inline]
    pub fn same_site_strict(&self) -> bool {
        self.0.same_site() == Some(SameSite::Strict)
    }

    /// Returns the path directive of the cookie, if set.
    #[inline]
    pub fn path(&self) -> Option<&str> {
        self.0.path()
    }

    /// Returns the domain directive of the cookie, if set.
    #[inline]
    pub fn domain(&self) -> Option<&str> {
        self.0.domain()
    }

    /// Get the Max-Age information.
    #[inline]
    pub fn max_age(&self) -> Option<std::time::Duration> {
        self.0.max_age().and_then(|d| d.try_into().ok())
    }

    /// The cookie expiration time.
    #[inline]
    pub fn expires(&self) -> Option<SystemTime> {
        match self.0.expires() {
            Some(Expiration::DateTime(offset)) => Some(SystemTime::from(offset)),
            None | Some(Expiration::Session) => None,
        }
    }

    /// Converts `self` into a `Cookie` with a static lifetime with as few
    /// allocations as possible.
    #[inline]
    pub fn into_owned(self) -> Cookie<'static> {
        Cookie(self.0.into_owned())
    }
}

impl fmt::Display for Cookie<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub(crate) fn extract_response_cookie_headers(
    headers: &http::HeaderMap,
) -> impl Iterator<Item = &'_ HeaderValue> {
    headers.get_all(SET_COOKIE).iter()
}

pub(crate) fn extract_response_cookies(
    headers: &http::HeaderMap,
) -> impl Iterator<Item = Result<Cookie<'_>, CookieParseError>> {
    headers.get_all(SET_COOKIE).iter().map(Cookie::parse)
}

/// Error representing a parse failure of a 'Set-Cookie' header.
pub(crate) struct CookieParseError(cookie_crate::ParseError);

impl fmt::Debug for CookieParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for CookieParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for CookieParseError {}

// ===== impl Jar =====

impl Jar {
    /// Add a cookie str to this jar.
    ///
    /// # Example
    ///
    /// ```
    /// use courier::{cookie::Jar, Url};
    ///
    /// let cookie = "foo=bar; Domain=yolo.local";
    /// let url = "https://yolo.local".parse::<Url>().unwrap();
    ///
    /// let jar = Jar::default();
    /// jar.add_cookie_str(cookie, &url);
    ///
    /// // and now add to a `ClientBuilder`?
    /// ```
    pub fn add_cookie_str(&self, cookie: &str, url: &url::Url) {
        let cookies = cookie_crate::Cookie::parse(cookie)
            .ok()
            .map(|c| c.into_owned())
            .into_iter();
        self.0
            .write()
            .expect("jar lock poisoned")
            .store_response_cookies(cookies, url);
    }

    /// Remove a `Cookie` from the jar by name, for a given URL.
    pub fn remove(&self, name: &str, url: &url::Url) {
        if let Some(domain) = url.host_str() {
            self.0
                .write()
                .expect("jar lock poisoned")
                .remove(domain, url.path(), name);
        }
    }

    /// Clear the contents of the jar.
    pub fn clear(&self) {
        self.0.write().expect("jar lock poisoned").clear();
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &url::Url) {
        let iter =
            cookie_headers.filter_map(|val| Cookie::parse(val).map(|c| c.0.into_owned()).ok());

        self.0
            .write()
            .expect("jar lock poisoned")
            .store_response_cookies(iter, url);
    }

    fn cookies(&self, url: &url::Url) -> Option<Vec<HeaderValue>> {
        let mut cookies = Vec::new();
        let lock = self.0.read().expect("jar lock poisoned");
        for (name, value) in lock.get_request_values(url) {
            let mut cookie = bytes::BytesMut::with_capacity(64);
            cookie.put(name.as_bytes());
            cookie.put(&b"="[..]);
            cookie.put(value.as_bytes());
            if let Ok(cookie) = HeaderValue::from_maybe_shared(cookie) {
                cookies.push(cookie);
            }
        }

        if cookies.is_empty() {
            None
        } else {
            Some(cookies)
        }
    }
}

impl Default for Jar {
    fn default() -> Self {
        Self(RwLock::new(cookie_store::CookieStore::default()))
    }
}

/// Serialize the matching jar entries into one `Cookie` header value.
pub(crate) fn cookie_header_value(
    store: &dyn CookieStore,
    url: &url::Url,
) -> Option<HeaderValue> {
    let cookies = store.cookies(url)?;
    let value = cookies
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect::<Vec<_>>()
        .join("; ");
    HeaderValue::from_maybe_shared(bytes::Bytes::from(value)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jar_round_trip() {
        let url: url::Url = "http://example.com/".parse().unwrap();
        let jar = Jar::default();
        jar.add_cookie_str("session=abc123; Path=/", &url);

        let header = cookie_header_value(&jar, &url).expect("cookie matches");
        assert_eq!(header.to_str().unwrap(), "session=abc123");
    }

    #[test]
    fn jar_respects_domain() {
        let url: url::Url = "http://example.com/".parse().unwrap();
        let other: url::Url = "http://other.example/".parse().unwrap();
        let jar = Jar::default();
        jar.add_cookie_str("session=abc123", &url);

        assert!(cookie_header_value(&jar, &other).is_none());
    }

    #[test]
    fn jar_respects_secure() {
        let https: url::Url = "https://example.com/".parse().unwrap();
        let http: url::Url = "http://example.com/".parse().unwrap();
        let jar = Jar::default();
        jar.add_cookie_str("token=s3cret; Secure", &https);

        assert!(cookie_header_value(&jar, &https).is_some());
        assert!(cookie_header_value(&jar, &http).is_none());
    }

    #[test]
    fn jar_joins_multiple_cookies() {
        let url: url::Url = "http://example.com/".parse().unwrap();
        let jar = Jar::default();
        jar.add_cookie_str("a=1", &url);
        jar.add_cookie_str("b=2", &url);

        let header = cookie_header_value(&jar, &url).unwrap();
        let value = header.to_str().unwrap();
        assert!(value.contains("a=1") && value.contains("b=2"), "{value}");
    }

    #[test]
    fn remove_and_clear() {
        let url: url::Url = "http://example.com/".parse().unwrap();
        let jar = Jar::default();
        jar.add_cookie_str("a=1", &url);
        jar.remove("a", &url);
        assert!(cookie_header_value(&jar, &url).is_none());

        jar.add_cookie_str("b=2", &url);
        jar.clear();
        assert!(cookie_header_value(&jar, &url).is_none());
    }
}
