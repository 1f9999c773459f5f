//! A single pooled connection: an origin, a transport, and exactly one of
//! the two protocol engines.
//!
//! Connections are created by the pool, lazily dialed by the
//! [`Connector`](crate::connect::Connector), and travel inside the response
//! body they produce so that closing the response releases the connection.

use std::time::Duration;

use bytes::Bytes;
use url::Url;

use crate::{
    body::Body,
    config::Timeout,
    error::Error,
    proto::{h1::Http1Engine, h2::H2RecvBody, h2::Http2Engine, RequestHead, ResponseHead},
};

/// The pool's lookup key: scheme, host, and port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct Origin {
    pub(crate) scheme: Scheme,
    pub(crate) host: String,
    pub(crate) port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Scheme {
    Http,
    Https,
}

impl Origin {
    pub(crate) fn from_url(url: &Url) -> Result<Origin, Error> {
        let scheme = match url.scheme() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(Error::url_bad_scheme(url.clone())),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::url_invalid(format!("URL has no host: {url}")))?
            .to_owned();
        let port = url.port_or_known_default().unwrap_or(match scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        });
        Ok(Origin { scheme, host, port })
    }

    pub(crate) fn is_https(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        write!(f, "{scheme}://{}:{}", self.host, self.port)
    }
}

/// One connection, carrying one of the two protocol engines.
#[derive(Debug)]
pub(crate) struct Connection {
    origin: Origin,
    engine: Engine,
}

#[derive(Debug)]
pub(crate) enum Engine {
    H1(Http1Engine),
    H2(Http2Engine),
}

/// A response head plus the body stream that owns the connection.
#[derive(Debug)]
pub(crate) struct InFlight {
    pub(crate) head: ResponseHead,
    pub(crate) body: ConnBody,
}

/// What became of a connection when its response body finished.
#[derive(Debug)]
pub(crate) enum Finished {
    /// Clean cycle end; the connection can be parked for reuse.
    Reusable(Connection),
    /// The connection is spent; its pool slot must be freed.
    Closed,
    /// A multiplexed connection; the pool keeps its own handle.
    Shared,
}

impl Connection {
    pub(crate) fn new(origin: Origin, engine: Engine) -> Connection {
        Connection { origin, engine }
    }

    pub(crate) fn origin(&self) -> &Origin {
        &self.origin
    }

    pub(crate) fn is_http2(&self) -> bool {
        matches!(self.engine, Engine::H2(_))
    }

    pub(crate) fn is_closed(&self) -> bool {
        match &self.engine {
            Engine::H1(engine) => engine.is_closed(),
            Engine::H2(engine) => engine.is_closed(),
        }
    }

    /// Whether the peer has gone away while the connection sat idle.
    pub(crate) fn is_connection_dropped(&mut self) -> bool {
        match &mut self.engine {
            Engine::H1(engine) => engine.is_connection_dropped(),
            Engine::H2(engine) => engine.is_closed(),
        }
    }

    /// Clone the shareable handle of a multiplexed connection.
    pub(crate) fn share(&self) -> Option<Connection> {
        match &self.engine {
            Engine::H2(engine) => Some(Connection {
                origin: self.origin.clone(),
                engine: Engine::H2(engine.clone()),
            }),
            Engine::H1(_) => None,
        }
    }

    #[allow(unused)]
    pub(crate) fn h2_active_streams(&self) -> usize {
        match &self.engine {
            Engine::H2(engine) => engine.active_streams(),
            Engine::H1(_) => 0,
        }
    }

    /// Send a request. On success the returned body owns this connection;
    /// on failure the connection is consumed and must be considered dead.
    pub(crate) async fn send(
        mut self,
        head: &RequestHead,
        body: Body,
        timeout: &Timeout,
    ) -> Result<InFlight, Error> {
        if let Engine::H2(engine) = &self.engine {
            let engine = engine.clone();
            let (response, recv) = engine.send(head, body, timeout).await?;
            return Ok(InFlight {
                head: response,
                body: ConnBody::H2 {
                    recv,
                    // Keeps the connection driver alive while the body
                    // is still streaming.
                    _conn: self,
                },
            });
        }

        let response = match self.engine {
            Engine::H1(ref mut engine) => engine.send(head, body, timeout).await?,
            Engine::H2(_) => unreachable!("handled above"),
        };
        Ok(InFlight {
            head: response,
            body: ConnBody::H1 {
                conn: Some(Box::new(self)),
                finished: false,
            },
        })
    }
}

/// The streaming body of a response, bound to its connection.
#[derive(Debug)]
pub(crate) enum ConnBody {
    H1 {
        conn: Option<Box<Connection>>,
        finished: bool,
    },
    H2 {
        recv: H2RecvBody,
        _conn: Connection,
    },
}

impl ConnBody {
    pub(crate) async fn chunk(
        &mut self,
        read_timeout: Option<Duration>,
    ) -> Result<Option<Bytes>, Error> {
        match self {
            ConnBody::H1 { conn, finished } => {
                if *finished {
                    return Ok(None);
                }
                let result = match conn.as_mut() {
                    Some(c) => match &mut c.engine {
                        Engine::H1(engine) => engine.next_body_chunk(read_timeout).await,
                        Engine::H2(_) => return Ok(None),
                    },
                    None => return Ok(None),
                };
                match result {
                    Ok(Some(chunk)) => Ok(Some(chunk)),
                    Ok(None) => {
                        *finished = true;
                        Ok(None)
                    }
                    Err(e) => {
                        *finished = true;
                        conn.take();
                        Err(e)
                    }
                }
            }
            ConnBody::H2 { recv, .. } => recv.chunk(read_timeout).await,
        }
    }

    /// Conclude the cycle after the body has been fully read.
    pub(crate) async fn finish(&mut self) -> Finished {
        match self {
            ConnBody::H1 { conn, .. } => match conn.take() {
                Some(mut conn) => {
                    let reusable = match conn.engine {
                        Engine::H1(ref mut engine) => engine.response_closed().await,
                        Engine::H2(_) => false,
                    };
                    if reusable {
                        Finished::Reusable(*conn)
                    } else {
                        Finished::Closed
                    }
                }
                None => Finished::Closed,
            },
            ConnBody::H2 { .. } => Finished::Shared,
        }
    }

    /// Abandon the body: the connection (if any) is dropped on the spot.
    /// Returns true when an exclusive connection's slot must be freed.
    pub(crate) fn discard(&mut self) -> bool {
        match self {
            ConnBody::H1 { conn, finished } => {
                *finished = true;
                conn.take().is_some()
            }
            ConnBody::H2 { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_from_url() {
        let url: Url = "https://example.com/path".parse().unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin.scheme, Scheme::Https);
        assert_eq!(origin.host, "example.com");
        assert_eq!(origin.port, 443);
        assert!(origin.is_https());

        let url: Url = "http://example.com:8080/".parse().unwrap();
        let origin = Origin::from_url(&url).unwrap();
        assert_eq!(origin.port, 8080);
        assert!(!origin.is_https());
    }

    #[test]
    fn origins_hash_by_triple() {
        use std::collections::HashSet;

        let a = Origin::from_url(&"http://example.com/".parse().unwrap()).unwrap();
        let b = Origin::from_url(&"http://example.com:80/other".parse().unwrap()).unwrap();
        let c = Origin::from_url(&"https://example.com/".parse().unwrap()).unwrap();

        let mut set = HashSet::new();
        set.insert(a.clone());
        assert!(set.contains(&b), "default port and explicit port are one origin");
        assert!(!set.contains(&c));
        assert_eq!(a, b);
    }
}
