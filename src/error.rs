use std::{error::Error as StdError, fmt, io};

use url::Url;

use crate::StatusCode;

/// A `Result` alias where the `Err` case is `courier::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// A boxed error type that can be used for dynamic error handling.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur when processing a `Request`.
///
/// Note: Errors may include the full URL used to make the `Request`. If the
/// URL contains sensitive information (e.g. an API key as a query parameter),
/// be sure to remove it ([`without_url`](Error::without_url)).
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
            }),
        }
    }

    pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Builder, Some(e))
    }

    pub(crate) fn url_bad_scheme(url: Url) -> Error {
        Error::new(Kind::Url, Some(BadScheme)).with_url(url)
    }

    pub(crate) fn url_invalid<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Url, Some(e))
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Connect, Some(e))
    }

    pub(crate) fn timeout(kind: TimeoutKind) -> Error {
        Error::new(Kind::Timeout(kind), None::<Error>)
    }

    pub(crate) fn connect_timeout() -> Error {
        Error::timeout(TimeoutKind::Connect)
    }

    pub(crate) fn read_timeout() -> Error {
        Error::timeout(TimeoutKind::Read)
    }

    pub(crate) fn write_timeout() -> Error {
        Error::timeout(TimeoutKind::Write)
    }

    pub(crate) fn pool_timeout() -> Error {
        Error::timeout(TimeoutKind::Pool)
    }

    pub(crate) fn network<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Network, Some(e))
    }

    pub(crate) fn tls<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Tls, Some(e))
    }

    pub(crate) fn protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Protocol, Some(e))
    }

    pub(crate) fn proxy<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Proxy, Some(e))
    }

    pub(crate) fn redirect(kind: RedirectKind, url: Url) -> Error {
        Error::new(Kind::Redirect(kind), None::<Error>).with_url(url)
    }

    pub(crate) fn stream(kind: StreamKind) -> Error {
        Error::new(Kind::Stream(kind), None::<Error>)
    }

    pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Body, Some(e))
    }

    pub(crate) fn decode<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Decode, Some(e))
    }

    pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::Request, Some(e))
    }

    pub(crate) fn status_code(url: Url, status: StatusCode) -> Error {
        Error::new(Kind::Status(status), None::<Error>).with_url(url)
    }
}

impl Error {
    /// Returns a possible URL related to this error.
    ///
    /// # Examples
    ///
    /// ```
    /// # async fn run() {
    /// // displays last stop of a redirect loop
    /// let response = courier::get("http://site.with.redirect.loop").await;
    /// if let Err(e) = response {
    ///     if e.is_redirect() {
    ///         if let Some(final_stop) = e.url() {
    ///             println!("redirect loop at {final_stop}");
    ///         }
    ///     }
    /// }
    /// # }
    /// ```
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Returns a mutable reference to the URL related to this error.
    ///
    /// This is useful if you need to remove sensitive information from the
    /// URL (e.g. an API key in the query), but do not want to remove the URL
    /// entirely.
    pub fn url_mut(&mut self) -> Option<&mut Url> {
        self.inner.url.as_mut()
    }

    /// Add a url related to this error (overwriting any existing).
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related url from this error (if, for example, it contains
    /// sensitive information).
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    /// Returns true if the error is from building a request or client.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error came from an invalid or unsupported URL.
    pub fn is_url(&self) -> bool {
        matches!(self.inner.kind, Kind::Url)
    }

    /// Returns true if the error is related to a timeout of any kind.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout(_)) {
            return true;
        }

        let mut source = self.source();
        while let Some(err) = source {
            if let Some(err) = err.downcast_ref::<Error>() {
                if err.is_timeout() {
                    return true;
                }
            }
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns true if the error is a connect timeout.
    pub fn is_connect_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(TimeoutKind::Connect))
    }

    /// Returns true if the error is a read timeout.
    pub fn is_read_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(TimeoutKind::Read))
    }

    /// Returns true if the error is a write timeout.
    pub fn is_write_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(TimeoutKind::Write))
    }

    /// Returns true if the error is a pool acquisition timeout.
    pub fn is_pool_timeout(&self) -> bool {
        matches!(self.inner.kind, Kind::Timeout(TimeoutKind::Pool))
    }

    /// Returns true if the error is related to establishing a connection.
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the error occurred on an established connection.
    pub fn is_network(&self) -> bool {
        matches!(self.inner.kind, Kind::Network)
    }

    /// Returns true if the error is related to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner.kind, Kind::Tls)
    }

    /// Returns true if the peer violated the HTTP protocol.
    pub fn is_protocol(&self) -> bool {
        matches!(self.inner.kind, Kind::Protocol)
    }

    /// Returns true if the error came from a proxy.
    pub fn is_proxy(&self) -> bool {
        matches!(self.inner.kind, Kind::Proxy)
    }

    /// Returns true if the error is from following redirects.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect(_))
    }

    /// Returns true if the maximum redirect hop count was exceeded.
    pub fn is_too_many_redirects(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect(RedirectKind::TooMany))
    }

    /// Returns true if a redirect cycle was detected.
    pub fn is_redirect_loop(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect(RedirectKind::Loop))
    }

    /// Returns true if a redirect required replaying a request body that
    /// was streaming and is no longer available.
    pub fn is_request_body_unavailable(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Redirect(RedirectKind::BodyUnavailable)
        )
    }

    /// Returns true if a `Location` header could not be parsed or carried
    /// an unsupported scheme.
    pub fn is_invalid_location(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::Redirect(RedirectKind::InvalidLocation)
        )
    }

    /// Returns true if a body stream was used in an invalid way.
    pub fn is_stream(&self) -> bool {
        matches!(self.inner.kind, Kind::Stream(_))
    }

    /// Returns true if the body stream had already been consumed.
    pub fn is_stream_consumed(&self) -> bool {
        matches!(self.inner.kind, Kind::Stream(StreamKind::Consumed))
    }

    /// Returns true if the error is related to a request or response body.
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }

    /// Returns true if the error is related to decoding the response's body.
    pub fn is_decode(&self) -> bool {
        matches!(self.inner.kind, Kind::Decode)
    }

    /// Returns true if the error is from `Response::error_for_status`.
    pub fn is_status(&self) -> bool {
        matches!(self.inner.kind, Kind::Status(_))
    }

    /// Returns true if the error is related to a connection reset.
    pub fn is_connection_reset(&self) -> bool {
        let mut source = self.source();

        while let Some(err) = source {
            if let Some(io) = err.downcast_ref::<io::Error>() {
                if io.kind() == io::ErrorKind::ConnectionReset {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns the status code, if the error was generated from a response.
    pub fn status(&self) -> Option<StatusCode> {
        match self.inner.kind {
            Kind::Status(code) => Some(code),
            _ => None,
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("courier::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }

        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Url => f.write_str("URL error")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Connect => f.write_str("error connecting")?,
            Kind::Timeout(TimeoutKind::Connect) => f.write_str("connect timed out")?,
            Kind::Timeout(TimeoutKind::Read) => f.write_str("read timed out")?,
            Kind::Timeout(TimeoutKind::Write) => f.write_str("write timed out")?,
            Kind::Timeout(TimeoutKind::Pool) => {
                f.write_str("timed out waiting for a pool connection")?
            }
            Kind::Network => f.write_str("network error")?,
            Kind::Tls => f.write_str("tls error")?,
            Kind::Protocol => f.write_str("HTTP protocol error")?,
            Kind::Proxy => f.write_str("proxy error")?,
            Kind::Redirect(RedirectKind::TooMany) => f.write_str("too many redirects")?,
            Kind::Redirect(RedirectKind::Loop) => f.write_str("redirect loop detected")?,
            Kind::Redirect(RedirectKind::BodyUnavailable) => f.write_str(
                "got a redirect response, but the request body was streaming \
                 and is no longer available",
            )?,
            Kind::Redirect(RedirectKind::InvalidLocation) => {
                f.write_str("invalid redirect location")?
            }
            Kind::Redirect(RedirectKind::Policy) => f.write_str("redirect policy error")?,
            Kind::Stream(StreamKind::Consumed) => f.write_str("body stream already consumed")?,
            Kind::Stream(StreamKind::NotRead) => {
                f.write_str("body content accessed before being read")?
            }
            Kind::Stream(StreamKind::Closed) => f.write_str("body stream already closed")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Decode => f.write_str("error decoding response body")?,
            Kind::Status(code) => {
                let prefix = if code.is_client_error() {
                    "HTTP status client error"
                } else {
                    debug_assert!(code.is_server_error());
                    "HTTP status server error"
                };
                write!(f, "{prefix} ({code})")?;
            }
        };

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        if let Some(e) = &self.inner.source {
            write!(f, ": {e}")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug)]
pub(crate) enum Kind {
    Builder,
    Url,
    Request,
    Connect,
    Timeout(TimeoutKind),
    Network,
    Tls,
    Protocol,
    Proxy,
    Redirect(RedirectKind),
    Stream(StreamKind),
    Body,
    Decode,
    Status(StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimeoutKind {
    Connect,
    Read,
    Write,
    Pool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RedirectKind {
    TooMany,
    Loop,
    BodyUnavailable,
    InvalidLocation,
    Policy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Consumed,
    NotRead,
    Closed,
}

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_source_chain() {
        let root = Error::new(Kind::Request, None::<Error>);
        assert!(root.source().is_none());

        let link = Error::body(root);
        assert!(link.source().is_some());
        assert_send::<Error>();
        assert_sync::<Error>();
    }

    #[test]
    fn mem_size_of() {
        use std::mem::size_of;
        assert_eq!(size_of::<Error>(), size_of::<usize>());
    }

    #[test]
    fn is_timeout() {
        let err = Error::read_timeout();
        assert!(err.is_timeout());
        assert!(err.is_read_timeout());
        assert!(!err.is_write_timeout());

        let io = io::Error::from(io::ErrorKind::TimedOut);
        let nested = Error::request(io);
        assert!(nested.is_timeout());
    }

    #[test]
    fn is_connection_reset() {
        let err = Error::network(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        ));
        assert!(err.is_connection_reset());

        let io = io::Error::new(io::ErrorKind::Other, err);
        let nested = Error::request(io);
        assert!(nested.is_connection_reset());
    }

    #[test]
    fn redirect_kinds() {
        let url: Url = "http://a.b/c".parse().unwrap();
        let err = Error::redirect(RedirectKind::Loop, url.clone());
        assert!(err.is_redirect());
        assert!(err.is_redirect_loop());
        assert_eq!(err.url().map(Url::as_str), Some("http://a.b/c"));

        let err = Error::redirect(RedirectKind::TooMany, url);
        assert!(err.is_too_many_redirects());
        assert!(!err.is_redirect_loop());
    }
}
