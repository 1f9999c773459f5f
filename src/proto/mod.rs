//! The per-connection protocol engines.
//!
//! [`h1`] is a strict client-side HTTP/1.1 state machine driving one
//! request/response cycle at a time over a connection. [`h2`] multiplexes
//! concurrent streams over one HTTP/2 connection.

pub(crate) mod h1;
pub(crate) mod h2;

use http::{HeaderMap, Method, StatusCode, Version};
use url::Url;

/// The wire-level request the engines consume: everything but the body.
#[derive(Debug)]
pub(crate) struct RequestHead {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
}

/// The wire-level response the engines produce, before the body is read.
#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub(crate) status: StatusCode,
    pub(crate) version: Version,
    pub(crate) reason: Option<String>,
    pub(crate) headers: HeaderMap,
}

/// The authority for a `Host` header: `host`, or `host:port` for
/// non-default ports. Userinfo never appears.
pub(crate) fn host_header_value(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_owned(),
    }
}

/// Path and query, as used for an origin-form request target and the
/// `:path` pseudo-header. An empty path becomes `/`.
pub(crate) fn full_path(url: &Url) -> String {
    let path = url.path();
    let path = if path.is_empty() { "/" } else { path };
    match url.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    }
}
