use std::{fmt, pin::Pin};

use bytes::Bytes;
use futures_core::Stream;
use futures_util::StreamExt;

use crate::error::{BoxError, Error};

/// A request body.
///
/// A body is either *replayable* — backed by a buffer that can be iterated
/// any number of times, as required to follow a 307/308 redirect — or a
/// *one-shot* stream that can be sent exactly once.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Reusable(Bytes),
    Streaming(BoxBodyStream),
}

pub(crate) type BoxBodyStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send + 'static>>;

/// Wire framing implied by a body: a known length gets `Content-Length`,
/// an unknown length gets `Transfer-Encoding: chunked` on HTTP/1.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Length(u64),
    Chunked,
}

// ===== impl Body =====

impl Body {
    /// Returns a reference to the internal data of the `Body`.
    ///
    /// `None` is returned, if the underlying data is a stream.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.inner {
            Inner::Reusable(bytes) => Some(bytes.as_ref()),
            Inner::Streaming(..) => None,
        }
    }

    /// Wrap a futures `Stream` in a box inside `Body`.
    ///
    /// The resulting body is one-shot: it cannot be replayed, and a
    /// redirect that must preserve the body will fail with
    /// [`Error::is_request_body_unavailable`](crate::Error::is_request_body_unavailable).
    ///
    /// # Example
    ///
    /// ```
    /// # use courier::Body;
    /// # fn main() {
    /// let chunks: Vec<Result<_, ::std::io::Error>> = vec![Ok("hello"), Ok(" "), Ok("world")];
    ///
    /// let stream = futures_util::stream::iter(chunks);
    ///
    /// let body = Body::wrap_stream(stream);
    /// # }
    /// ```
    pub fn wrap_stream<S>(stream: S) -> Body
    where
        S: futures_util::stream::TryStream + Send + 'static,
        S::Error: Into<BoxError>,
        Bytes: From<S::Ok>,
    {
        use futures_util::TryStreamExt;

        let stream = stream.map_ok(Bytes::from).map_err(Into::into);
        Body {
            inner: Inner::Streaming(Box::pin(stream)),
        }
    }

    pub(crate) fn empty() -> Body {
        Body::reusable(Bytes::new())
    }

    pub(crate) fn reusable(chunk: Bytes) -> Body {
        Body {
            inner: Inner::Reusable(chunk),
        }
    }

    /// Whether this body can be iterated again from the start.
    pub(crate) fn can_replay(&self) -> bool {
        matches!(self.inner, Inner::Reusable(_))
    }

    pub(crate) fn try_clone(&self) -> Option<Body> {
        match self.inner {
            Inner::Reusable(ref chunk) => Some(Body::reusable(chunk.clone())),
            Inner::Streaming { .. } => None,
        }
    }

    /// The exact body length, when known.
    pub(crate) fn content_length(&self) -> Option<u64> {
        match self.inner {
            Inner::Reusable(ref bytes) => Some(bytes.len() as u64),
            Inner::Streaming(..) => None,
        }
    }

    pub(crate) fn framing(&self) -> Framing {
        match self.inner {
            Inner::Reusable(ref bytes) => Framing::Length(bytes.len() as u64),
            Inner::Streaming(..) => Framing::Chunked,
        }
    }

    /// Consume the body into the chunk iterator the protocol engines drive.
    pub(crate) fn into_chunks(self) -> BodyChunks {
        match self.inner {
            Inner::Reusable(bytes) if bytes.is_empty() => BodyChunks::Empty,
            Inner::Reusable(bytes) => BodyChunks::Full(Some(bytes)),
            Inner::Streaming(stream) => BodyChunks::Streaming(stream),
        }
    }
}

impl Default for Body {
    #[inline]
    fn default() -> Body {
        Body::empty()
    }
}

impl From<Bytes> for Body {
    #[inline]
    fn from(bytes: Bytes) -> Body {
        Body::reusable(bytes)
    }
}

impl From<Vec<u8>> for Body {
    #[inline]
    fn from(vec: Vec<u8>) -> Body {
        Body::reusable(vec.into())
    }
}

impl From<&'static [u8]> for Body {
    #[inline]
    fn from(s: &'static [u8]) -> Body {
        Body::reusable(Bytes::from_static(s))
    }
}

impl From<String> for Body {
    #[inline]
    fn from(s: String) -> Body {
        Body::reusable(s.into())
    }
}

impl From<&'static str> for Body {
    #[inline]
    fn from(s: &'static str) -> Body {
        s.as_bytes().into()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner {
            Inner::Reusable(ref bytes) => f
                .debug_struct("Body")
                .field("len", &bytes.len())
                .finish(),
            Inner::Streaming(..) => f.debug_struct("Body").field("stream", &true).finish(),
        }
    }
}

// ===== impl BodyTrace =====

/// What is known about a request body after the request was handed to the
/// transport: enough to decide whether a redirect can replay it.
#[derive(Debug)]
pub(crate) enum BodyTrace {
    None,
    Replayable(Body),
    OneShot,
}

impl BodyTrace {
    pub(crate) fn of(body: Option<&Body>) -> BodyTrace {
        match body {
            None => BodyTrace::None,
            Some(body) => match body.try_clone() {
                Some(clone) => BodyTrace::Replayable(clone),
                None => BodyTrace::OneShot,
            },
        }
    }
}

// ===== impl BodyChunks =====

/// The engines' view of an outgoing body: an async chunk iterator.
pub(crate) enum BodyChunks {
    Empty,
    Full(Option<Bytes>),
    Streaming(BoxBodyStream),
}

impl BodyChunks {
    pub(crate) async fn next(&mut self) -> Option<Result<Bytes, Error>> {
        match self {
            BodyChunks::Empty => None,
            BodyChunks::Full(bytes) => bytes.take().map(Ok),
            BodyChunks::Streaming(stream) => stream
                .next()
                .await
                .map(|chunk| chunk.map_err(Error::body)),
        }
    }

    #[allow(unused)]
    pub(crate) fn is_end(&self) -> bool {
        match self {
            BodyChunks::Empty => true,
            BodyChunks::Full(bytes) => bytes.is_none(),
            BodyChunks::Streaming(..) => false,
        }
    }
}

impl fmt::Debug for BodyChunks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BodyChunks::Empty => f.write_str("BodyChunks::Empty"),
            BodyChunks::Full(_) => f.write_str("BodyChunks::Full"),
            BodyChunks::Streaming(_) => f.write_str("BodyChunks::Streaming"),
        }
    }
}
