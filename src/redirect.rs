//! Redirect Handling
//!
//! By default, a `Client` follows redirects with a maximum chain of 20
//! hops, rewriting the request the way browsers do. Use a [`Policy`] with
//! [`ClientBuilder::redirect`](crate::ClientBuilder::redirect) to change or
//! disable this.

use std::{fmt, sync::Arc};

use http::{header, HeaderMap, Method, StatusCode};
use url::Url;

use crate::{
    body::{Body, BodyTrace},
    error::{BoxError, Error, RedirectKind},
};

/// The default maximum redirect chain length.
pub(crate) const DEFAULT_MAX_REDIRECTS: usize = 20;

/// A type that controls the policy on how to handle the following of
/// redirects.
///
/// The default value will catch redirect loops, and has a maximum of 20
/// redirects it will follow in a chain before returning an error.
///
/// - `limited` can be used to have the same behavior as the default, but
///   adjust the allowed maximum redirect hops in a chain.
/// - `none` can be used to disable all redirect behavior.
/// - `custom` can be used to create a customized policy.
#[derive(Clone)]
pub struct Policy {
    inner: PolicyKind,
}

/// A type that holds information on the next request and previous requests
/// in a redirect chain.
#[derive(Debug)]
pub struct Attempt<'a> {
    status: StatusCode,
    next: &'a Url,
    previous: &'a [Url],
}

/// An action to perform when a redirect status code is found.
#[derive(Debug)]
pub struct Action {
    inner: ActionKind,
}

#[derive(Clone)]
enum PolicyKind {
    Custom(Arc<dyn Fn(Attempt) -> Action + Send + Sync + 'static>),
    Limit(usize),
    None,
}

#[derive(Debug)]
pub(crate) enum ActionKind {
    Follow,
    Stop,
    Error(BoxError),
}

// ===== impl Policy =====

impl Policy {
    /// Create a [`Policy`] with a maximum number of redirects.
    ///
    /// An [`Error`] will be returned if the max is reached.
    #[inline]
    pub fn limited(max: usize) -> Self {
        Self {
            inner: PolicyKind::Limit(max),
        }
    }

    /// Create a [`Policy`] that does not follow any redirect.
    #[inline]
    pub fn none() -> Self {
        Self {
            inner: PolicyKind::None,
        }
    }

    /// Create a custom [`Policy`] using the passed function.
    ///
    /// # Note
    ///
    /// The default [`Policy`] handles a maximum redirect chain length and
    /// loop detection; a custom policy replaces only the chain-length
    /// check, and should have some way of handling that.
    ///
    /// Information on the next request and previous requests can be found
    /// on the [`Attempt`] argument passed to the closure. Actions are
    /// created from methods on the [`Attempt`].
    ///
    /// # Example
    ///
    /// ```rust
    /// # use courier::{redirect, Error};
    /// #
    /// # fn run() -> Result<(), Error> {
    /// let custom = redirect::Policy::custom(|attempt| {
    ///     if attempt.previous().len() > 5 {
    ///         attempt.error("too many redirects")
    ///     } else if attempt.url().host_str() == Some("example.domain") {
    ///         // prevent redirects to 'example.domain'
    ///         attempt.stop()
    ///     } else {
    ///         attempt.follow()
    ///     }
    /// });
    /// let client = courier::Client::builder().redirect(custom).build()?;
    /// # Ok(())
    /// # }
    /// ```
    #[inline]
    pub fn custom<T>(policy: T) -> Self
    where
        T: Fn(Attempt) -> Action + Send + Sync + 'static,
    {
        Self {
            inner: PolicyKind::Custom(Arc::new(policy)),
        }
    }

    /// Apply this policy to a given [`Attempt`] to produce an [`Action`].
    pub fn redirect(&self, attempt: Attempt) -> Action {
        match self.inner {
            PolicyKind::Custom(ref custom) => custom(attempt),
            PolicyKind::Limit(max) => {
                // The first URL in previous is the initial URL, not a
                // redirection; it is excluded from the count.
                if attempt.previous.len() > max {
                    attempt.error(TooManyRedirects)
                } else {
                    attempt.follow()
                }
            }
            PolicyKind::None => attempt.stop(),
        }
    }

    pub(crate) fn check(&self, status: StatusCode, next: &Url, previous: &[Url]) -> ActionKind {
        self.redirect(Attempt {
            status,
            next,
            previous,
        })
        .inner
    }

    pub(crate) fn is_none(&self) -> bool {
        matches!(self.inner, PolicyKind::None)
    }
}

impl Default for Policy {
    #[inline]
    fn default() -> Policy {
        Policy::limited(DEFAULT_MAX_REDIRECTS)
    }
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner {
            PolicyKind::Custom(..) => f.pad("Custom"),
            PolicyKind::Limit(max) => f.debug_tuple("Limit").field(&max).finish(),
            PolicyKind::None => f.pad("None"),
        }
    }
}

// ===== impl Attempt =====

impl<'a> Attempt<'a> {
    /// Get the status code of the redirect response.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the next URL to redirect to.
    #[inline]
    pub fn url(&self) -> &Url {
        self.next
    }

    /// Get the list of previous URLs that have already been requested in
    /// this chain.
    #[inline]
    pub fn previous(&self) -> &[Url] {
        self.previous
    }

    /// Returns an action meaning the client should follow the next URL.
    #[inline]
    pub fn follow(self) -> Action {
        Action {
            inner: ActionKind::Follow,
        }
    }

    /// Returns an action meaning the client should not follow the next URL.
    ///
    /// The 30x response will be returned as the `Ok` result.
    #[inline]
    pub fn stop(self) -> Action {
        Action {
            inner: ActionKind::Stop,
        }
    }

    /// Returns an [`Action`] failing the redirect with an error.
    ///
    /// The [`Error`] will be returned for the result of the sent request.
    #[inline]
    pub fn error<E: Into<BoxError>>(self, error: E) -> Action {
        Action {
            inner: ActionKind::Error(error.into()),
        }
    }
}

#[derive(Debug)]
struct TooManyRedirects;

impl fmt::Display for TooManyRedirects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("too many redirects")
    }
}

impl std::error::Error for TooManyRedirects {}

// ===== request rewriting =====

/// The method for the next request, per de-facto browser rules.
pub(crate) fn redirect_method(status: StatusCode, method: &Method) -> Method {
    // https://tools.ietf.org/html/rfc7231#section-6.4.4
    if status == StatusCode::SEE_OTHER && method != Method::HEAD {
        return Method::GET;
    }

    // Do what the browsers do, despite standards: turn 302s into GETs.
    if status == StatusCode::FOUND && method != Method::HEAD {
        return Method::GET;
    }

    // If a POST is responded to with a 301, turn it into a GET.
    if status == StatusCode::MOVED_PERMANENTLY && method == Method::POST {
        return Method::GET;
    }

    method.clone()
}

/// Resolve a `Location` header against the URL that produced it.
pub(crate) fn redirect_url(base: &Url, location: &str) -> crate::Result<Url> {
    // `join` covers all three shapes: absolute, scheme-relative
    // (`//host/...`, adopting the original scheme), and relative
    // references per RFC 7231.
    let mut next = base
        .join(location)
        .map_err(|_| Error::redirect(RedirectKind::InvalidLocation, base.clone()))?;

    if !matches!(next.scheme(), "http" | "https") {
        return Err(Error::redirect(RedirectKind::InvalidLocation, next));
    }

    // Preserve the original fragment only if the new URL lacks one
    // (RFC 7231 7.1.2).
    if next.fragment().is_none() {
        if let Some(fragment) = base.fragment() {
            next.set_fragment(Some(fragment));
        }
    }

    Ok(next)
}

/// The headers for the next request.
pub(crate) fn redirect_headers(
    headers: &HeaderMap,
    method_changed_to_get: bool,
    base: &Url,
    next: &Url,
) -> HeaderMap {
    let mut headers = headers.clone();

    if method_changed_to_get {
        // Switching to GET drops the body, and with it the body-framing
        // headers.
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONTENT_TYPE);
    }

    if cross_origin(base, next) && !is_https_upgrade(base, next) {
        headers.remove(header::AUTHORIZATION);
    }

    // The cookie layer re-derives this from the jar for the next URL.
    headers.remove(header::COOKIE);
    headers.remove(header::HOST);

    headers
}

/// The body for the next request, replaying the original when the method
/// survives the redirect.
pub(crate) fn redirect_body(
    body: &BodyTrace,
    method_changed_to_get: bool,
    next: &Url,
) -> crate::Result<Option<Body>> {
    if method_changed_to_get {
        return Ok(None);
    }
    match body {
        BodyTrace::None => Ok(None),
        BodyTrace::Replayable(body) => Ok(body.try_clone()),
        BodyTrace::OneShot => Err(Error::redirect(RedirectKind::BodyUnavailable, next.clone())),
    }
}

/// Convert a policy [`Action::error`] into the typed redirect error.
pub(crate) fn map_policy_error(err: BoxError, url: &Url) -> Error {
    if err.is::<TooManyRedirects>() {
        Error::redirect(RedirectKind::TooMany, url.clone())
    } else {
        Error::new(
            crate::error::Kind::Redirect(RedirectKind::Policy),
            Some(err),
        )
        .with_url(url.clone())
    }
}

fn cross_origin(base: &Url, next: &Url) -> bool {
    base.scheme() != next.scheme()
        || base.host_str() != next.host_str()
        || base.port_or_known_default() != next.port_or_known_default()
}

/// An `http://host` → `https://host` upgrade on the standard ports keeps
/// its `Authorization` header.
fn is_https_upgrade(base: &Url, next: &Url) -> bool {
    base.scheme() == "http"
        && next.scheme() == "https"
        && base.host_str() == next.host_str()
        && base.port_or_known_default() == Some(80)
        && next.port_or_known_default() == Some(443)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_limit_counts_hops() {
        let policy = Policy::default();
        let next: Url = "http://x.y/z".parse().unwrap();
        let mut previous = (0..=19)
            .map(|i| format!("http://a.b/c/{i}").parse().unwrap())
            .collect::<Vec<Url>>();

        match policy.check(StatusCode::FOUND, &next, &previous) {
            ActionKind::Follow => (),
            other => panic!("unexpected {other:?}"),
        }

        previous.push("http://a.b.d/e/33".parse().unwrap());

        match policy.check(StatusCode::FOUND, &next, &previous) {
            ActionKind::Error(err) if err.is::<TooManyRedirects>() => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn policy_custom() {
        let policy = Policy::custom(|attempt| {
            if attempt.url().host_str() == Some("foo") {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let next: Url = "http://bar/baz".parse().unwrap();
        match policy.check(StatusCode::FOUND, &next, &[]) {
            ActionKind::Follow => (),
            other => panic!("unexpected {other:?}"),
        }

        let next: Url = "http://foo/baz".parse().unwrap();
        match policy.check(StatusCode::FOUND, &next, &[]) {
            ActionKind::Stop => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn method_rewriting() {
        assert_eq!(
            redirect_method(StatusCode::SEE_OTHER, &Method::POST),
            Method::GET
        );
        assert_eq!(
            redirect_method(StatusCode::SEE_OTHER, &Method::HEAD),
            Method::HEAD
        );
        assert_eq!(
            redirect_method(StatusCode::FOUND, &Method::POST),
            Method::GET
        );
        assert_eq!(
            redirect_method(StatusCode::MOVED_PERMANENTLY, &Method::POST),
            Method::GET
        );
        assert_eq!(
            redirect_method(StatusCode::MOVED_PERMANENTLY, &Method::PUT),
            Method::PUT
        );
        assert_eq!(
            redirect_method(StatusCode::TEMPORARY_REDIRECT, &Method::POST),
            Method::POST
        );
        assert_eq!(
            redirect_method(StatusCode::PERMANENT_REDIRECT, &Method::POST),
            Method::POST
        );
    }

    #[test]
    fn url_resolution() {
        let base: Url = "https://example.com/a/b?q=1#frag".parse().unwrap();

        let next = redirect_url(&base, "/c/d").unwrap();
        assert_eq!(next.as_str(), "https://example.com/c/d#frag");

        let next = redirect_url(&base, "//other.example/e").unwrap();
        assert_eq!(next.as_str(), "https://other.example/e#frag");

        let next = redirect_url(&base, "http://plain.example/f#new").unwrap();
        assert_eq!(next.as_str(), "http://plain.example/f#new");

        let err = redirect_url(&base, "ftp://example.com/g").unwrap_err();
        assert!(err.is_invalid_location());
    }

    #[test]
    fn sensitive_headers_stripped_cross_origin() {
        let base: Url = "http://example.com/".parse().unwrap();
        let other: Url = "http://other.example/".parse().unwrap();
        let upgraded: Url = "https://example.com/".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "secret".parse().unwrap());
        headers.insert(header::COOKIE, "a=b".parse().unwrap());
        headers.insert(header::ACCEPT, "*/*".parse().unwrap());

        let rewritten = redirect_headers(&headers, false, &base, &other);
        assert!(!rewritten.contains_key(header::AUTHORIZATION));
        assert!(!rewritten.contains_key(header::COOKIE));
        assert!(rewritten.contains_key(header::ACCEPT));

        // Same-host HTTPS upgrade keeps credentials.
        let rewritten = redirect_headers(&headers, false, &base, &upgraded);
        assert!(rewritten.contains_key(header::AUTHORIZATION));

        // Same-origin keeps credentials but never the cookie header.
        let rewritten = redirect_headers(&headers, false, &base, &base);
        assert!(rewritten.contains_key(header::AUTHORIZATION));
        assert!(!rewritten.contains_key(header::COOKIE));
    }

    #[test]
    fn body_replay_rules() {
        let next: Url = "http://example.com/next".parse().unwrap();

        // Method changed to GET: the body is dropped.
        let trace = BodyTrace::Replayable(Body::from("data"));
        assert!(redirect_body(&trace, true, &next).unwrap().is_none());

        // Preserved method with a replayable body: replayed.
        let body = redirect_body(&trace, false, &next).unwrap().unwrap();
        assert_eq!(body.as_bytes(), Some(&b"data"[..]));

        // Preserved method with a one-shot body: refused.
        let err = redirect_body(&BodyTrace::OneShot, false, &next).unwrap_err();
        assert!(err.is_request_body_unavailable());

        assert!(redirect_body(&BodyTrace::None, false, &next)
            .unwrap()
            .is_none());
    }

    #[test]
    fn body_framing_headers_stripped_on_get() {
        let base: Url = "http://example.com/".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, "11".parse().unwrap());
        headers.insert(header::TRANSFER_ENCODING, "chunked".parse().unwrap());

        let rewritten = redirect_headers(&headers, true, &base, &base);
        assert!(!rewritten.contains_key(header::CONTENT_LENGTH));
        assert!(!rewritten.contains_key(header::TRANSFER_ENCODING));
    }
}
