#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # courier
//!
//! An ergonomic, batteries-included HTTP client for Rust.
//!
//! - Async, with connection pooling and keep-alive reuse
//! - HTTP/1.1 and HTTP/2 (negotiated via ALPN)
//! - Plain bodies, [JSON](#json), [urlencoded](#forms) forms
//! - Redirects with browser-compatible request rewriting
//! - Authentication flows (Basic, challenge-response, custom)
//! - Cookie store persistence
//! - HTTP and CONNECT proxies, configured explicitly or from the
//!   environment
//! - TLS via rustls
//! - Timeouts for every phase of a request
//!
//! ## Making a GET request
//!
//! For a single request, you can use the [`get`] shortcut method.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), courier::Error> {
//! let body = courier::get("https://www.rust-lang.org")
//!     .await?
//!     .text()
//!     .await?;
//!
//! println!("body = {body:?}");
//! # Ok(())
//! # }
//! ```
//!
//! **NOTE**: If you plan to perform multiple requests, it is best to create
//! a [`Client`] and reuse it, taking advantage of keep-alive connection
//! pooling.
//!
//! ## Making POST requests (or setting request bodies)
//!
//! There are several ways you can set the body of a request. The basic one
//! is by using the `body()` method of a [`RequestBuilder`]. This lets you
//! set the exact raw bytes of what the body should be. It accepts various
//! types, including `String` and `Vec<u8>`. If you wish to pass a custom
//! type, you can use the `courier::Body` constructors.
//!
//! ```rust,no_run
//! # use courier::Error;
//! #
//! # async fn run() -> Result<(), Error> {
//! let client = courier::Client::new();
//! let res = client
//!     .post("http://httpbin.org/post")
//!     .body("the exact body that is sent")
//!     .send()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Forms
//!
//! It's very common to want to send form data in a request body. This can
//! be done with any type that can be serialized into form data.
//!
//! ```rust,no_run
//! # use courier::Error;
//! #
//! # async fn run() -> Result<(), Error> {
//! // This will POST a body of `foo=bar&baz=quux`
//! let params = [("foo", "bar"), ("baz", "quux")];
//! let client = courier::Client::new();
//! let res = client
//!     .post("http://httpbin.org/post")
//!     .form(&params)
//!     .send()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### JSON
//!
//! There is also a `json` method helper on the [`RequestBuilder`] that
//! works in a similar fashion the `form` method. It can take any value
//! that can be serialized into JSON. The feature `json` is required.
//!
//! ```rust,no_run
//! # use courier::Error;
//! # use std::collections::HashMap;
//! #
//! # #[cfg(feature = "json")]
//! # async fn run() -> Result<(), Error> {
//! // This will POST a body of `{"lang":"rust","body":"json"}`
//! let mut map = HashMap::new();
//! map.insert("lang", "rust");
//! map.insert("body", "json");
//!
//! let client = courier::Client::new();
//! let res = client
//!     .post("http://httpbin.org/post")
//!     .json(&map)
//!     .send()
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Redirect Policies
//!
//! By default, a `Client` will automatically handle HTTP redirects,
//! following up to a maximum of 20 hops, detecting loops, and rewriting
//! the request the way browsers do. To customize this behavior, a
//! [`redirect::Policy`] can be used with a `ClientBuilder`.
//!
//! ## Cookies
//!
//! The automatic storing and sending of session cookies can be enabled
//! with the [`cookie_store`][ClientBuilder::cookie_store] method on
//! `ClientBuilder`.
//!
//! ## Proxies
//!
//! A `Client` will use proxies from the `HTTP_PROXY`, `HTTPS_PROXY`,
//! `ALL_PROXY` and `NO_PROXY` environment variables by default, and can be
//! given explicit [`Proxy`] values with
//! [`ClientBuilder::proxy`].
//!
//! ## TLS
//!
//! Connections to `https` URLs are made with rustls, verifying against
//! the bundled webpki roots by default. See [`ClientBuilder`] for options
//! to point verification at a custom CA bundle, present a client
//! certificate, or (for development only) disable verification.
//!
//! ## Optional Features
//!
//! The following are a list of [Cargo features][cargo-features] that can
//! be enabled or disabled:
//!
//! - **cookies** *(enabled by default)*: Provides cookie session support.
//! - **json** *(enabled by default)*: Provides serialization and
//!   deserialization for JSON bodies.
//!
//! [cargo-features]: https://doc.rust-lang.org/stable/cargo/reference/features.html

pub use http::header;
pub use http::Method;
pub use http::StatusCode;
pub use http::Version;
pub use url::Url;

pub use self::auth::{Auth, AuthFlow, BasicAuth, BasicChallengeAuth, FunctionAuth, NoAuth};
pub use self::body::Body;
pub use self::client::{Client, ClientBuilder};
pub use self::config::{Limits, Timeout};
pub use self::error::{Error, Result};
pub use self::into_url::IntoUrl;
pub use self::proxy::{NoProxy, Proxy};
pub use self::redirect::Policy as RedirectPolicy;
pub use self::request::{Request, RequestBuilder};
pub use self::response::Response;
pub use self::tls::Identity;

pub mod auth;
mod backend;
mod body;
mod client;
mod config;
mod connect;
mod connection;
#[cfg(feature = "cookies")]
#[cfg_attr(docsrs, doc(cfg(feature = "cookies")))]
pub mod cookie;
mod error;
mod into_url;
mod io;
mod mount;
mod pool;
mod proto;
mod proxy;
pub mod redirect;
mod request;
mod response;
mod tls;
mod util;

/// Shortcut method to quickly make a `GET` request.
///
/// See also the methods on the [`Response`] type.
///
/// **NOTE**: This function creates a new internal `Client` on each call,
/// and so should not be used if making many requests. Create a
/// [`Client`] instead.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn run() -> Result<(), courier::Error> {
/// let body = courier::get("https://www.rust-lang.org")
///     .await?
///     .text()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// This function fails if:
///
/// - the native TLS backend cannot be initialized
/// - the supplied `Url` cannot be parsed
/// - there was an error while sending request
/// - a redirect loop was detected
/// - the redirect limit was exhausted
pub async fn get<T: IntoUrl>(url: T) -> crate::Result<Response> {
    ClientBuilder::new().build()?.get(url).send().await
}
