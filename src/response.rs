use std::fmt;

use bytes::{Bytes, BytesMut};
use encoding_rs::{Encoding, UTF_8};
use http::{header, HeaderMap, StatusCode, Version};
use mime::Mime;
use url::Url;

use crate::{
    error::{Error, StreamKind},
    pool::{PooledBody, TransportResponse},
};

/// A Response to a submitted `Request`.
///
/// The response body is streamed from its connection: reading it to the end
/// (or dropping the response) releases the connection back to the pool.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    reason: Option<String>,
    url: Box<Url>,
    body: BodyState,
    history: Vec<Response>,
}

enum BodyState {
    /// Not yet touched; the connection is still attached.
    Streaming(PooledBody),
    /// Fully read into memory; replayable.
    Buffered(Bytes),
    /// Streamed out chunk by chunk; the bytes are gone.
    Consumed,
    /// Explicitly closed.
    Closed,
}

impl Response {
    pub(crate) fn new(response: TransportResponse, url: Url) -> Response {
        Response {
            status: response.head.status,
            version: response.head.version,
            headers: response.head.headers,
            reason: response.head.reason,
            url: Box::new(url),
            body: BodyState::Streaming(response.body),
            history: Vec::new(),
        }
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the reason phrase sent by the server, if any.
    ///
    /// HTTP/2 has no reason phrases.
    #[inline]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the final `Url` of this `Response`.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the content length of the response, if it is known.
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
    }

    /// The responses walked through while following redirects, oldest
    /// first. Empty when no redirect was followed.
    #[inline]
    pub fn history(&self) -> &[Response] {
        &self.history
    }

    pub(crate) fn set_history(&mut self, history: Vec<Response>) {
        self.history = history;
    }

    /// Whether this response is a redirect that carries a `Location`.
    pub fn is_redirect(&self) -> bool {
        self.status.is_redirection() && self.headers.contains_key(header::LOCATION)
    }

    /// Whether the response has been closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.body, BodyState::Closed)
    }

    /// Whether the raw body stream has been consumed.
    pub fn is_stream_consumed(&self) -> bool {
        matches!(self.body, BodyState::Consumed | BodyState::Buffered(_))
    }

    /// Whether the body has been read and buffered in memory.
    pub fn has_buffered_content(&self) -> bool {
        matches!(self.body, BodyState::Buffered(_))
    }

    /// Get the cookies set by this response.
    ///
    /// # Optional
    ///
    /// This requires the `cookies` feature to be enabled.
    #[cfg(feature = "cookies")]
    pub fn cookies(&self) -> impl Iterator<Item = crate::cookie::Cookie<'_>> {
        crate::cookie::extract_response_cookies(&self.headers).filter_map(Result::ok)
    }

    /// Get the buffered body content.
    ///
    /// Fails unless [`read`](Self::read) has buffered the body first.
    pub fn content(&self) -> crate::Result<Bytes> {
        match self.body {
            BodyState::Buffered(ref bytes) => Ok(bytes.clone()),
            BodyState::Closed => Err(Error::stream(StreamKind::Closed)),
            _ => Err(Error::stream(StreamKind::NotRead)),
        }
    }

    /// Read the full response body into memory, returning the bytes.
    ///
    /// Idempotent: the buffered content stays available on the response
    /// (e.g. for redirect history entries). Fails if the raw stream was
    /// already consumed chunk-wise, or the response was closed.
    pub async fn read(&mut self) -> crate::Result<Bytes> {
        match self.body {
            BodyState::Buffered(ref bytes) => return Ok(bytes.clone()),
            BodyState::Consumed => return Err(Error::stream(StreamKind::Consumed)),
            BodyState::Closed => return Err(Error::stream(StreamKind::Closed)),
            BodyState::Streaming(_) => {}
        }

        let mut body = match std::mem::replace(&mut self.body, BodyState::Consumed) {
            BodyState::Streaming(body) => body,
            _ => unreachable!("checked above"),
        };
        let mut buf = BytesMut::new();
        loop {
            match body.chunk().await {
                Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => return Err(e.with_url((*self.url).clone())),
            }
        }
        let bytes = buf.freeze();
        self.body = BodyState::Buffered(bytes.clone());
        Ok(bytes)
    }

    /// Stream the next raw chunk of the response body.
    ///
    /// Returns `None` once the body is complete. Once streaming has begun,
    /// the body can no longer be buffered with [`read`](Self::read).
    pub async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        match self.body {
            BodyState::Buffered(_) | BodyState::Consumed => {
                if let BodyState::Buffered(_) = self.body {
                    return Err(Error::stream(StreamKind::Consumed));
                }
            }
            BodyState::Closed => return Err(Error::stream(StreamKind::Closed)),
            BodyState::Streaming(_) => {}
        }
        match self.body {
            BodyState::Streaming(ref mut body) => {
                match body.chunk().await {
                    Ok(Some(chunk)) => Ok(Some(chunk)),
                    Ok(None) => {
                        self.body = BodyState::Consumed;
                        Ok(None)
                    }
                    Err(e) => {
                        self.body = BodyState::Consumed;
                        Err(e.with_url((*self.url).clone()))
                    }
                }
            }
            BodyState::Consumed => Ok(None),
            _ => unreachable!("checked above"),
        }
    }

    /// Get the full response body as `Bytes`.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn run() -> Result<(), courier::Error> {
    /// let bytes = courier::get("http://httpbin.org/ip").await?.bytes().await?;
    ///
    /// println!("bytes: {bytes:?}");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn bytes(mut self) -> crate::Result<Bytes> {
        self.read().await
    }

    /// Get the response text, decoded with the charset from the
    /// `Content-Type` header, defaulting to UTF-8.
    pub async fn text(mut self) -> crate::Result<String> {
        let content_type = self
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<Mime>().ok());
        let encoding = content_type
            .as_ref()
            .and_then(|mime| mime.get_param("charset").map(|charset| charset.as_str()))
            .and_then(|charset| Encoding::for_label(charset.as_bytes()))
            .unwrap_or(UTF_8);

        let full = self.read().await?;
        let (text, _, _) = encoding.decode(&full);
        Ok(text.into_owned())
    }

    /// Try to deserialize the response body as JSON.
    ///
    /// # Optional
    ///
    /// This requires the `json` feature to be enabled.
    #[cfg(feature = "json")]
    pub async fn json<T: serde::de::DeserializeOwned>(mut self) -> crate::Result<T> {
        let full = self.read().await?;
        serde_json::from_slice(&full).map_err(Error::decode)
    }

    /// Close the response, releasing its connection without draining the
    /// remaining body.
    pub fn close(&mut self) {
        if let BodyState::Streaming(ref mut body) = self.body {
            body.abandon();
        }
        self.body = BodyState::Closed;
    }

    /// Turn a response into an error if the server returned a 4xx or 5xx
    /// status.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use courier::Error;
    /// # async fn run() -> Result<(), Error> {
    /// let res = courier::get("http://httpbin.org/status/400")
    ///     .await?
    ///     .error_for_status();
    /// if let Err(err) = res {
    ///     assert_eq!(err.status(), Some(courier::StatusCode::BAD_REQUEST));
    /// }
    /// # Ok(())
    /// # }
    /// ```
    pub fn error_for_status(self) -> crate::Result<Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(Error::status_code((*self.url).clone(), self.status))
        } else {
            Ok(self)
        }
    }

    /// As [`error_for_status`](Self::error_for_status), but by reference.
    pub fn error_for_status_ref(&self) -> crate::Result<&Self> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(Error::status_code((*self.url).clone(), self.status))
        } else {
            Ok(self)
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish()
    }
}
