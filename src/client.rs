//! The client façade: defaults, mounts, and the middleware loops that turn
//! a single-request transport into redirects, authentication and cookie
//! persistence.

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use http::{
    header::{
        HeaderMap, HeaderValue, ACCEPT, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, COOKIE,
        LOCATION, USER_AGENT,
    },
    Method,
};
use log::debug;
use url::Url;

use crate::{
    auth::{Auth, NoAuth},
    backend::Backend,
    body::{Body, BodyTrace},
    config::{Limits, Timeout},
    connect::Connector,
    error::{Error, RedirectKind},
    into_url::{IntoUrl, IntoUrlSealed},
    mount::Pattern,
    pool::Pool,
    proto::RequestHead,
    proxy::{NoProxy, Proxy},
    redirect,
    request::{AllowRedirects, Request, RequestAuth, RequestBuilder, RequestTimeout},
    response::Response,
    tls::{Identity, TlsConfig, Verify},
};

#[cfg(feature = "cookies")]
use crate::cookie;

/// Client state: created but unused, in use, or terminally closed.
const UNOPENED: u8 = 0;
const OPENED: u8 = 1;
const CLOSED: u8 = 2;

/// An asynchronous `Client` to make Requests with.
///
/// The Client has various configuration values to tweak, but the defaults
/// are set to what is usually the most commonly desired value. To configure
/// a `Client`, use `Client::builder()`.
///
/// The `Client` holds a connection pool internally, so it is advised that
/// you create one and **reuse** it.
///
/// You do **not** have to wrap the `Client` in an [`Rc`] or [`Arc`] to
/// **reuse** it, because it already uses an [`Arc`] internally.
///
/// [`Rc`]: std::rc::Rc
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    default_pool: Pool,
    mounts: Vec<MountEntry>,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    base_url: Option<Url>,
    timeout: Timeout,
    auth: Option<Arc<dyn Auth>>,
    redirect: redirect::Policy,
    #[cfg(feature = "cookies")]
    cookie_store: Option<Arc<dyn cookie::CookieStore>>,
    state: AtomicU8,
}

struct MountEntry {
    pattern: Pattern,
    no_proxy: Option<NoProxy>,
    pool: Pool,
}

/// A `ClientBuilder` can be used to create a `Client` with custom
/// configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    headers: HeaderMap,
    params: Vec<(String, String)>,
    base_url: Option<Url>,
    timeout: Timeout,
    limits: Limits,
    redirect: redirect::Policy,
    auth: Option<Arc<dyn Auth>>,
    proxies: Vec<Proxy>,
    tls: TlsConfig,
    http2: bool,
    trust_env: bool,
    #[cfg(feature = "cookies")]
    cookie_store: Option<Arc<dyn cookie::CookieStore>>,
    #[cfg(unix)]
    unix_socket: Option<std::path::PathBuf>,
    error: Option<Error>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ===== impl ClientBuilder =====

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        ClientBuilder {
            config: Config {
                headers: HeaderMap::new(),
                params: Vec::new(),
                base_url: None,
                timeout: Timeout::default(),
                limits: Limits::default(),
                redirect: redirect::Policy::default(),
                auth: None,
                proxies: Vec::new(),
                tls: TlsConfig {
                    trust_env: true,
                    http2: true,
                    ..TlsConfig::default()
                },
                http2: true,
                trust_env: true,
                #[cfg(feature = "cookies")]
                cookie_store: None,
                #[cfg(unix)]
                unix_socket: None,
                error: None,
            },
        }
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    ///
    /// # Errors
    ///
    /// This method fails if the TLS configuration cannot be loaded, or a
    /// proxy is misconfigured.
    pub fn build(self) -> crate::Result<Client> {
        let mut config = self.config;
        if let Some(err) = config.error {
            return Err(err);
        }

        config.tls.http2 = config.http2;
        let backend = Backend;

        #[cfg(unix)]
        let uds = config.unix_socket.clone();
        #[cfg(not(unix))]
        let uds: Option<std::path::PathBuf> = None;

        let default_pool = Pool::new(
            Connector::new(backend, &config.tls, None, uds)?,
            backend,
            config.limits,
        );

        let mut proxies = config.proxies;
        if config.trust_env && proxies.is_empty() {
            proxies = Proxy::from_env();
        }

        let mut mounts = Vec::with_capacity(proxies.len());
        for proxy in &proxies {
            let pattern = Pattern::parse(proxy.pattern())?;
            let pool = Pool::new(
                Connector::new(backend, &config.tls, Some(proxy.intercept()?), None)?,
                backend,
                config.limits,
            );
            mounts.push(MountEntry {
                pattern,
                no_proxy: proxy.no_proxy_list().cloned(),
                pool,
            });
        }
        mounts.sort_by_key(|entry| std::cmp::Reverse(entry.pattern.priority()));

        let mut headers = config.headers;
        headers
            .entry(ACCEPT)
            .or_insert(HeaderValue::from_static("*/*"));
        // No content codecs are registered by default, so only identity
        // is advertised.
        headers
            .entry(ACCEPT_ENCODING)
            .or_insert(HeaderValue::from_static("identity"));
        headers
            .entry(CONNECTION)
            .or_insert(HeaderValue::from_static("keep-alive"));
        headers.entry(USER_AGENT).or_insert(HeaderValue::from_static(
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")),
        ));

        Ok(Client {
            inner: Arc::new(ClientInner {
                default_pool,
                mounts,
                headers,
                params: config.params,
                base_url: config.base_url,
                timeout: config.timeout,
                auth: config.auth,
                redirect: config.redirect,
                #[cfg(feature = "cookies")]
                cookie_store: config.cookie_store,
                state: AtomicU8::new(UNOPENED),
            }),
        })
    }

    /// Sets the `User-Agent` header to be used by this client.
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => {
                self.config.headers.insert(USER_AGENT, value);
            }
            Err(e) => self.config.error = Some(Error::builder(e.into())),
        }
        self
    }

    /// Sets the default headers for every request.
    ///
    /// Headers set on a request override these.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        crate::util::replace_headers(&mut self.config.headers, headers);
        self
    }

    /// Sets default query params appended to every request URL.
    pub fn default_params<I, K, V>(mut self, params: I) -> ClientBuilder
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.config
            .params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets a base URL that relative request URLs are joined against.
    pub fn base_url<U: IntoUrl>(mut self, base: U) -> ClientBuilder {
        match base.into_url() {
            Ok(url) => self.config.base_url = Some(url),
            Err(e) => self.config.error = Some(e),
        }
        self
    }

    /// Set the timeouts for all four request phases at once, or a
    /// configured [`Timeout`] value.
    pub fn timeout<T: Into<Timeout>>(mut self, timeout: T) -> ClientBuilder {
        self.config.timeout = timeout.into();
        self
    }

    /// Set only the connect timeout.
    pub fn connect_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.config.timeout = self.config.timeout.connect(dur);
        self
    }

    /// Set only the read timeout.
    pub fn read_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.config.timeout = self.config.timeout.read(dur);
        self
    }

    /// Set only the write timeout.
    pub fn write_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.config.timeout = self.config.timeout.write(dur);
        self
    }

    /// Set only the pool acquisition timeout.
    pub fn pool_timeout(mut self, dur: Duration) -> ClientBuilder {
        self.config.timeout = self.config.timeout.pool(dur);
        self
    }

    /// Disable all timeouts.
    pub fn no_timeout(mut self) -> ClientBuilder {
        self.config.timeout = Timeout::none();
        self
    }

    /// Sets the maximum number of connections in the pool.
    pub fn max_connections(mut self, max: usize) -> ClientBuilder {
        self.config.limits = self.config.limits.max_connections(max);
        self
    }

    /// Sets the maximum number of idle keep-alive connections.
    pub fn max_keepalive_connections(mut self, max: usize) -> ClientBuilder {
        self.config.limits = self.config.limits.max_keepalive_connections(max);
        self
    }

    /// Sets how long an idle keep-alive connection may live in the pool.
    pub fn keepalive_expiry(mut self, dur: Duration) -> ClientBuilder {
        self.config.limits = self.config.limits.keepalive_expiry(dur);
        self
    }

    /// Sets the pool [`Limits`] wholesale.
    pub fn limits(mut self, limits: Limits) -> ClientBuilder {
        self.config.limits = limits;
        self
    }

    /// Set a redirect [`Policy`](redirect::Policy) for this client.
    pub fn redirect(mut self, policy: redirect::Policy) -> ClientBuilder {
        self.config.redirect = policy;
        self
    }

    /// Set a default authentication scheme run for every request.
    pub fn auth<A>(mut self, auth: A) -> ClientBuilder
    where
        A: Auth + 'static,
    {
        self.config.auth = Some(Arc::new(auth));
        self
    }

    /// Add a `Proxy` to the list of proxies the `Client` will use.
    ///
    /// Adding a proxy disables reading proxies from environment variables.
    pub fn proxy(mut self, proxy: Proxy) -> ClientBuilder {
        self.config.proxies.push(proxy);
        self
    }

    /// Clear all proxies, including ones from the environment.
    pub fn no_proxy(mut self) -> ClientBuilder {
        self.config.proxies.clear();
        self.config.trust_env = false;
        self
    }

    /// Controls the use of certificate validation.
    ///
    /// Defaults to `true`.
    ///
    /// # Warning
    ///
    /// You should think very carefully before using this method. If
    /// invalid certificates are trusted, *any* certificate for *any* site
    /// will be trusted for use, including expired certificates.
    pub fn cert_verification(mut self, verify: bool) -> ClientBuilder {
        self.config.tls.verify = if verify {
            Verify::Enabled
        } else {
            Verify::Disabled
        };
        self
    }

    /// Verify server certificates against a PEM bundle at the given path
    /// instead of the default roots.
    pub fn ca_bundle(mut self, path: impl Into<std::path::PathBuf>) -> ClientBuilder {
        self.config.tls.verify = Verify::CaBundle(path.into());
        self
    }

    /// Sets the client certificate and key used for mutual TLS.
    pub fn identity(mut self, identity: Identity) -> ClientBuilder {
        self.config.tls.identity = Some(identity);
        self
    }

    /// Use a pre-configured rustls `ClientConfig` for TLS, overriding
    /// `cert_verification`/`ca_bundle`/`identity`. The ALPN offer is still
    /// managed by this client.
    pub fn use_preconfigured_tls(mut self, config: rustls::ClientConfig) -> ClientBuilder {
        self.config.tls.preconfigured = Some(Arc::new(config));
        self
    }

    /// Enable or disable HTTP/2, controlling the ALPN offer. Defaults to
    /// enabled: `h2` is offered before `http/1.1`.
    pub fn http2(mut self, enabled: bool) -> ClientBuilder {
        self.config.http2 = enabled;
        self
    }

    /// Restrict this client to HTTP/1.1.
    pub fn http1_only(self) -> ClientBuilder {
        self.http2(false)
    }

    /// Controls whether proxy and TLS settings are read from the
    /// environment (`HTTP_PROXY`, `NO_PROXY`, `SSL_CERT_FILE`,
    /// `SSLKEYLOGFILE`, ...).
    ///
    /// Defaults to `true`.
    pub fn trust_env(mut self, trust: bool) -> ClientBuilder {
        self.config.trust_env = trust;
        self.config.tls.trust_env = trust;
        self
    }

    /// Enable a persistent cookie store for the client.
    ///
    /// Cookies received in responses will be stored and sent back on
    /// matching requests, surviving across redirects.
    ///
    /// # Optional
    ///
    /// This requires the `cookies` feature to be enabled.
    #[cfg(feature = "cookies")]
    pub fn cookie_store(mut self, enable: bool) -> ClientBuilder {
        self.config.cookie_store = enable
            .then(|| Arc::new(cookie::Jar::default()) as Arc<dyn cookie::CookieStore>);
        self
    }

    /// Use a custom cookie store implementation.
    ///
    /// # Optional
    ///
    /// This requires the `cookies` feature to be enabled.
    #[cfg(feature = "cookies")]
    pub fn cookie_provider(mut self, store: Arc<dyn cookie::CookieStore>) -> ClientBuilder {
        self.config.cookie_store = Some(store);
        self
    }

    /// Route every request through a Unix domain socket instead of TCP.
    ///
    /// # Optional
    ///
    /// Only available on Unix.
    #[cfg(unix)]
    pub fn unix_socket(mut self, path: impl Into<std::path::PathBuf>) -> ClientBuilder {
        self.config.unix_socket = Some(path.into());
        self
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("timeout", &self.config.timeout)
            .field("limits", &self.config.limits)
            .finish()
    }
}

// ===== impl Client =====

impl Client {
    /// Constructs a new `Client` with the default configuration.
    ///
    /// # Panics
    ///
    /// This method panics if the TLS backend cannot be initialized. Use
    /// `Client::builder()` if you wish to handle the failure as an `Error`
    /// instead of panicking.
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("Client::new()")
    }

    /// Creates a `ClientBuilder` to configure a `Client`.
    ///
    /// This is the same as `ClientBuilder::new()`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `PATCH` request to a URL.
    pub fn patch<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PATCH, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    ///
    /// When the client carries a base URL, relative URLs are joined
    /// against it.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and
    /// the request body before sending.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let url = self.merge_url(url);
        RequestBuilder::new(self.clone(), url.map(|url| Request::new(method, url)))
    }

    fn merge_url<U: IntoUrl>(&self, url: U) -> crate::Result<Url> {
        match &self.inner.base_url {
            Some(base) => base
                .join(url.as_str())
                .map_err(Error::url_invalid)
                .and_then(IntoUrlSealed::into_url),
            None => url.into_url(),
        }
    }

    /// Executes a `Request`, running the configured auth, redirect and
    /// cookie layers.
    ///
    /// A `Request` can be built manually with `Request::new()` or obtained
    /// from a RequestBuilder with `RequestBuilder::build()`.
    ///
    /// You should prefer to use the `RequestBuilder` and
    /// `RequestBuilder::send()`.
    pub async fn execute(&self, request: Request) -> crate::Result<Response> {
        if self.inner.state.load(Ordering::SeqCst) == CLOSED {
            return Err(Error::builder("client is closed"));
        }
        self.inner.state.store(OPENED, Ordering::SeqCst);

        let mut request = request;
        self.apply_defaults(&mut request);

        let timeout = request
            .extensions()
            .get::<RequestTimeout>()
            .map(|RequestTimeout(t)| *t)
            .unwrap_or(self.inner.timeout);
        let allow_redirects = request
            .extensions()
            .get::<AllowRedirects>()
            .map(|AllowRedirects(allow)| *allow)
            .unwrap_or(true);
        let auth = request
            .extensions()
            .get::<RequestAuth>()
            .map(|RequestAuth(auth)| auth.clone())
            .or_else(|| self.inner.auth.clone())
            .unwrap_or_else(|| Arc::new(NoAuth));

        self.send_handling_redirects(request, auth, &timeout, allow_redirects)
            .await
    }

    /// Close the client, tearing down its pools.
    ///
    /// Requests made after closing fail; responses already in flight may
    /// still drain their bodies.
    pub fn close(&self) {
        self.inner.state.store(CLOSED, Ordering::SeqCst);
        self.inner.default_pool.close();
        for mount in &self.inner.mounts {
            mount.pool.close();
        }
    }

    fn apply_defaults(&self, request: &mut Request) {
        // Client defaults fill the gaps; request values win.
        for key in self.inner.headers.keys() {
            if !request.headers().contains_key(key) {
                for value in self.inner.headers.get_all(key) {
                    request.headers_mut().append(key.clone(), value.clone());
                }
            }
        }

        if !self.inner.params.is_empty() {
            let mut pairs = request.url_mut().query_pairs_mut();
            for (k, v) in &self.inner.params {
                pairs.append_pair(k, v);
            }
        }
    }

    async fn send_handling_redirects(
        &self,
        request: Request,
        auth: Arc<dyn Auth>,
        timeout: &Timeout,
        allow_redirects: bool,
    ) -> crate::Result<Response> {
        let mut history: Vec<Response> = Vec::new();
        let mut previous: Vec<Url> = Vec::new();
        let mut seen: HashSet<Url> = HashSet::new();
        let mut request = request;

        loop {
            seen.insert(request.url().clone());
            let (sent, mut response) = self
                .send_handling_auth(request, &auth, timeout, &mut history)
                .await?;

            if !allow_redirects
                || self.inner.redirect.is_none()
                || !response.is_redirect()
            {
                response.set_history(history);
                return Ok(response);
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
                .ok_or_else(|| {
                    Error::redirect(RedirectKind::InvalidLocation, sent.url.clone())
                })?;
            let next_url = redirect::redirect_url(&sent.url, &location)?;
            let status = response.status();

            previous.push(sent.url.clone());
            match self.inner.redirect.check(status, &next_url, &previous) {
                redirect::ActionKind::Follow => {}
                redirect::ActionKind::Stop => {
                    response.set_history(history);
                    return Ok(response);
                }
                redirect::ActionKind::Error(err) => {
                    return Err(redirect::map_policy_error(err, &next_url));
                }
            }

            if seen.contains(&next_url) {
                return Err(Error::redirect(RedirectKind::Loop, next_url));
            }

            // The redirect response's body is fully read before it goes
            // into the history; this releases its connection.
            response.read().await?;

            let method = redirect::redirect_method(status, &sent.method);
            let changed_to_get = method == Method::GET && sent.method != Method::GET;
            let headers =
                redirect::redirect_headers(&sent.headers, changed_to_get, &sent.url, &next_url);
            let body = redirect::redirect_body(&sent.body, changed_to_get, &next_url)?;

            debug!(
                "redirect {} -> {} {} {}",
                status,
                method,
                next_url,
                if changed_to_get { "(rewritten)" } else { "" }
            );

            let mut next = Request::new(method, next_url);
            *next.headers_mut() = headers;
            *next.body_mut() = body;
            *next.extensions_mut() = sent.extensions.clone();

            history.push(response);
            request = next;
        }
    }

    async fn send_handling_auth(
        &self,
        mut request: Request,
        auth: &Arc<dyn Auth>,
        timeout: &Timeout,
        history: &mut Vec<Response>,
    ) -> crate::Result<(SentRequest, Response)> {
        if auth.requires_request_body() {
            buffer_request_body(&mut request).await?;
        }

        let mut flow = auth.flow();
        let mut request = flow.start(request)?;

        loop {
            let sent = SentRequest::of(&request);
            let mut response = self.send_single_request(request, timeout).await?;
            if auth.requires_response_body() {
                response.read().await?;
            }
            match flow.resume(&response)? {
                None => return Ok((sent, response)),
                Some(next) => {
                    response.read().await?;
                    history.push(response);
                    request = next;
                }
            }
        }
    }

    /// Sends a single request, without handling redirects or auth. The
    /// cookie layer runs here so it sees every request, including
    /// intermediate hops.
    async fn send_single_request(
        &self,
        mut request: Request,
        timeout: &Timeout,
    ) -> crate::Result<Response> {
        let url = request.url().clone();

        #[cfg(feature = "cookies")]
        if let Some(store) = &self.inner.cookie_store {
            if !request.headers().contains_key(COOKIE) {
                if let Some(value) = cookie::cookie_header_value(&**store, &url) {
                    request.headers_mut().insert(COOKIE, value);
                }
            }
        }
        #[cfg(not(feature = "cookies"))]
        let _ = COOKIE;

        // An empty body on methods with payload semantics still gets an
        // explicit zero length.
        let payload_method = request.method() == Method::POST
            || request.method() == Method::PUT
            || request.method() == Method::PATCH;
        if payload_method
            && request.body().is_none()
            && !request.headers().contains_key(CONTENT_LENGTH)
        {
            request
                .headers_mut()
                .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        }

        let head = RequestHead {
            method: request.method().clone(),
            url: url.clone(),
            headers: request.headers().clone(),
        };
        let body = request.body_mut().take().unwrap_or_default();

        let pool = self.transport_for_url(&url);
        let transport_response = pool.send(head, body, timeout).await?;

        #[cfg(feature = "cookies")]
        if let Some(store) = &self.inner.cookie_store {
            let mut cookies =
                cookie::extract_response_cookie_headers(&transport_response.head.headers)
                    .peekable();
            if cookies.peek().is_some() {
                store.set_cookies(&mut cookies, &url);
            }
        }

        let response = Response::new(transport_response, url);
        debug!(
            "HTTP Request: {} {} \"{:?} {}\"",
            request.method(),
            response.url(),
            response.version(),
            response.status()
        );
        Ok(response)
    }

    fn transport_for_url(&self, url: &Url) -> &Pool {
        for mount in &self.inner.mounts {
            if !mount.pattern.matches(url) {
                continue;
            }
            let bypass = mount
                .no_proxy
                .as_ref()
                .zip(url.host_str())
                .map_or(false, |(no_proxy, host)| no_proxy.contains(host));
            if !bypass {
                return &mount.pool;
            }
        }
        &self.inner.default_pool
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self.inner.state.load(Ordering::SeqCst) {
            UNOPENED => "unopened",
            OPENED => "opened",
            _ => "closed",
        };
        f.debug_struct("Client")
            .field("state", &state)
            .field("mounts", &self.inner.mounts.len())
            .finish()
    }
}

impl fmt::Debug for MountEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MountEntry")
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// What was actually sent, kept for computing a redirect follow-up after
/// the request itself (and its one-shot body) is gone.
struct SentRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    extensions: http::Extensions,
    body: BodyTrace,
}

impl SentRequest {
    fn of(request: &Request) -> SentRequest {
        SentRequest {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            extensions: request.extensions().clone(),
            body: BodyTrace::of(request.body()),
        }
    }
}

/// Read a one-shot body into memory so an auth flow can replay it.
async fn buffer_request_body(request: &mut Request) -> crate::Result<()> {
    let body = match request.body_mut().take() {
        Some(body) if !body.can_replay() => body,
        other => {
            *request.body_mut() = other;
            return Ok(());
        }
    };

    let mut chunks = body.into_chunks();
    let mut buf = bytes::BytesMut::new();
    while let Some(chunk) = chunks.next().await {
        buf.extend_from_slice(&chunk?);
    }
    *request.body_mut() = Some(Body::from(buf.freeze().to_vec()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_starts_unopened() {
        let client = Client::new();
        assert!(format!("{client:?}").contains("unopened"));
    }

    #[tokio::test]
    async fn closed_client_rejects_requests() {
        let client = Client::new();
        client.close();
        let err = client
            .get("http://localhost/")
            .send()
            .await
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[test]
    fn base_url_joins_relative_paths() {
        let client = Client::builder()
            .base_url("http://example.com/api/")
            .build()
            .unwrap();
        let req = client.get("v1/status").build().unwrap();
        assert_eq!(req.url().as_str(), "http://example.com/api/v1/status");

        // Absolute URLs are unaffected by the base.
        let req = client.get("http://other.example/x").build().unwrap();
        assert_eq!(req.url().as_str(), "http://other.example/x");
    }

    #[test]
    fn default_headers_fill_gaps_only() {
        let mut defaults = HeaderMap::new();
        defaults.insert("x-app", HeaderValue::from_static("one"));
        let client = Client::builder()
            .default_headers(defaults)
            .build()
            .unwrap();

        let mut req = client
            .get("http://example.com/")
            .header("x-app", "two")
            .build()
            .unwrap();
        client.apply_defaults(&mut req);
        assert_eq!(req.headers().get("x-app").unwrap(), "two");
        // The stock defaults land when the request does not set them.
        assert_eq!(req.headers().get(ACCEPT).unwrap(), "*/*");
        assert_eq!(req.headers().get(CONNECTION).unwrap(), "keep-alive");
        assert!(req
            .headers()
            .get(USER_AGENT)
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("courier/"));
    }

    #[test]
    fn default_params_are_appended() {
        let client = Client::builder()
            .default_params([("token", "abc")])
            .build()
            .unwrap();
        let mut req = client.get("http://example.com/?q=1").build().unwrap();
        client.apply_defaults(&mut req);
        assert_eq!(req.url().query(), Some("q=1&token=abc"));
    }

    #[test]
    fn proxy_mount_dispatch() {
        let proxy = Proxy::http("http://proxy.example:3128")
            .unwrap()
            .no_proxy(NoProxy::from_string("internal.example"));
        let client = Client::builder().proxy(proxy).build().unwrap();

        let direct = &client.inner.default_pool;
        let proxied = client.transport_for_url(&"http://example.com/".parse().unwrap());
        assert!(!std::ptr::eq(proxied, direct));

        // HTTPS is not intercepted by an http:// proxy.
        let https = client.transport_for_url(&"https://example.com/".parse().unwrap());
        assert!(std::ptr::eq(https, direct));

        // NO_PROXY entries bypass the mount.
        let bypassed =
            client.transport_for_url(&"http://svc.internal.example/".parse().unwrap());
        assert!(std::ptr::eq(bypassed, direct));
    }
}
