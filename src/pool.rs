//! The connection pool: origin-keyed reuse of keep-alive connections,
//! admission control via a semaphore, idle expiry, and stream-multiplexed
//! sharing of HTTP/2 connections.
//!
//! Slot accounting: every underlying connection holds exactly one semaphore
//! slot from the moment it starts dialing until it is closed or dropped. A
//! keep-alive connection parked for reuse keeps its slot; releasing a
//! closed connection frees it. HTTP/2 connections free their slot when the
//! connection driver terminates.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use bytes::Bytes;
use log::{debug, trace};
use tokio::{sync::Semaphore, time::Instant};

use crate::{
    backend::{Backend, Negotiated},
    body::Body,
    config::{Limits, Timeout},
    connect::{Connector, Established},
    connection::{ConnBody, Connection, Engine, Finished, Origin},
    error::Error,
    proto::{h1::Http1Engine, h2::Http2Engine, RequestHead, ResponseHead},
};

/// A connection pool implementing the single-request transport: one call,
/// one request/response exchange, with connection reuse handled inside.
#[derive(Clone, Debug)]
pub(crate) struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    connector: Connector,
    backend: Backend,
    limits: Limits,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    closed: AtomicBool,
}

#[derive(Default)]
struct PoolState {
    /// Idle keep-alive connections by origin; most recently parked last.
    idle: HashMap<Origin, Vec<Idle>>,
    /// Live multiplexed connections by origin.
    h2: HashMap<Origin, Connection>,
    /// Exclusive connections currently out (carrying a request or dialing).
    active: usize,
}

struct Idle {
    conn: Connection,
    idle_at: Instant,
}

/// The response a pool send produces: the head plus a body stream that owns
/// the connection and returns it on completion.
#[derive(Debug)]
pub(crate) struct TransportResponse {
    pub(crate) head: ResponseHead,
    pub(crate) body: PooledBody,
}

impl Pool {
    pub(crate) fn new(connector: Connector, backend: Backend, limits: Limits) -> Pool {
        let semaphore = backend.create_semaphore(limits.max_connections);
        Pool {
            inner: Arc::new(PoolInner {
                connector,
                backend,
                limits,
                semaphore,
                state: Mutex::new(PoolState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Send a single request and return the streamed response.
    pub(crate) async fn send(
        &self,
        head: RequestHead,
        body: Body,
        timeout: &Timeout,
    ) -> crate::Result<TransportResponse> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::builder("connection pool is closed"));
        }

        let origin = Origin::from_url(&head.url)?;
        let conn = self.acquire_connection(origin, timeout).await?;
        let exclusive = !conn.is_http2();

        match conn.send(&head, body, timeout).await {
            Ok(in_flight) => Ok(TransportResponse {
                head: in_flight.head,
                body: PooledBody {
                    inner: Some(in_flight.body),
                    pool: Arc::downgrade(&self.inner),
                    read_timeout: timeout.read,
                    done: false,
                },
            }),
            Err(e) => {
                // The connection died before producing a response; it must
                // not leak its slot.
                if exclusive {
                    self.inner.release_closed();
                }
                Err(e.with_url(head.url))
            }
        }
    }

    async fn acquire_connection(
        &self,
        origin: Origin,
        timeout: &Timeout,
    ) -> crate::Result<Connection> {
        let now = self.inner.backend.monotonic_time();

        {
            let mut guard = self.inner.state.lock().expect("pool lock poisoned");
            let state = &mut *guard;
            self.inner.evict_expired(state, now);

            // A live multiplexed connection carries any number of
            // concurrent streams.
            if let Some(shared) = state.h2.get(&origin) {
                if shared.is_closed() {
                    state.h2.remove(&origin);
                } else {
                    trace!("reusing h2 connection for {origin}");
                    return Ok(shared.share().expect("h2 entries are shareable"));
                }
            }

            if let Some(conns) = state.idle.get_mut(&origin) {
                while let Some(mut idle) = conns.pop() {
                    if idle.conn.is_closed() || idle.conn.is_connection_dropped() {
                        self.inner.semaphore.add_permits(1);
                        continue;
                    }
                    trace!("reusing keep-alive connection for {origin}");
                    state.active += 1;
                    return Ok(idle.conn);
                }
                state.idle.remove(&origin);
            }
        }

        // No reusable connection: wait for a slot and dial a fresh one.
        let permit = match deadline(timeout.pool, self.inner.semaphore.acquire()).await {
            Some(Ok(permit)) => permit,
            Some(Err(_)) => return Err(Error::builder("connection pool is closed")),
            None => return Err(Error::pool_timeout()),
        };
        permit.forget();
        {
            let mut state = self.inner.state.lock().expect("pool lock poisoned");
            state.active += 1;
        }

        match self.dial(origin.clone(), timeout).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                self.inner.release_closed();
                Err(e)
            }
        }
    }

    async fn dial(&self, origin: Origin, timeout: &Timeout) -> crate::Result<Connection> {
        debug!("establishing new connection to {origin}");
        let Established {
            io,
            negotiated,
            via_proxy,
            proxy_auth,
        } = self.inner.connector.connect(&origin, timeout).await?;

        match negotiated {
            Negotiated::Http11 => {
                let (reader, writer) = crate::io::split(io);
                let mut engine =
                    Http1Engine::new(reader, writer, via_proxy, self.inner.backend);
                engine.set_proxy_authorization(proxy_auth);
                Ok(Connection::new(origin, Engine::H1(engine)))
            }
            Negotiated::Http2 => {
                let weak = Arc::downgrade(&self.inner);
                let token = SlotToken {
                    pool: weak.clone(),
                    released: AtomicBool::new(false),
                };
                let close_origin = origin.clone();
                let engine = Http2Engine::handshake(io, self.inner.backend, move || {
                    token.release();
                    if let Some(pool) = weak.upgrade() {
                        pool.remove_closed_h2(&close_origin);
                    }
                })
                .await?;

                let conn = Connection::new(origin.clone(), Engine::H2(engine));
                let shared = conn.share().expect("h2 connections are shareable");
                let mut state = self.inner.state.lock().expect("pool lock poisoned");
                // The dial slot now belongs to the shared connection;
                // it is freed when the connection driver ends.
                state.active -= 1;
                state.h2.insert(origin, conn);
                Ok(shared)
            }
        }
    }

    /// Close the pool: idle keep-alives are torn down now, active
    /// connections drain naturally via their owning responses.
    pub(crate) fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut state = self.inner.state.lock().expect("pool lock poisoned");
        let mut freed = 0;
        for (_, conns) in state.idle.drain() {
            freed += conns.len();
        }
        state.h2.clear();
        if freed > 0 {
            self.inner.semaphore.add_permits(freed);
        }
    }

    #[cfg(test)]
    pub(crate) fn active_count(&self) -> usize {
        let state = self.inner.state.lock().expect("pool lock poisoned");
        state.active
            + state
                .h2
                .values()
                .filter(|c| !c.is_closed() && c.h2_active_streams() > 0)
                .count()
    }

    #[cfg(test)]
    pub(crate) fn keepalive_count(&self) -> usize {
        let state = self.inner.state.lock().expect("pool lock poisoned");
        state.idle.values().map(Vec::len).sum::<usize>()
            + state
                .h2
                .values()
                .filter(|c| !c.is_closed() && c.h2_active_streams() == 0)
                .count()
    }
}

impl PoolInner {
    /// Drop keep-alive entries whose idle time exceeded the expiry, or
    /// whose peer has disconnected.
    fn evict_expired(&self, state: &mut PoolState, now: Instant) {
        let expiry = self.limits.keepalive_expiry;
        let mut freed = 0;
        state.idle.retain(|origin, conns| {
            conns.retain_mut(|idle| {
                let expired = now.saturating_duration_since(idle.idle_at) >= expiry;
                let dropped = idle.conn.is_connection_dropped();
                if expired || dropped {
                    trace!(
                        "evicting idle connection to {origin} (expired={expired}, dropped={dropped})"
                    );
                    freed += 1;
                    false
                } else {
                    true
                }
            });
            !conns.is_empty()
        });
        if freed > 0 {
            self.semaphore.add_permits(freed);
        }
    }

    /// Park a reusable connection, enforcing the keep-alive soft cap.
    fn release(&self, conn: Connection) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.active = state.active.saturating_sub(1);

        let keepalive_total: usize = state.idle.values().map(Vec::len).sum();
        if self.closed.load(Ordering::SeqCst)
            || conn.is_closed()
            || keepalive_total >= self.limits.max_keepalive
        {
            drop(conn);
            self.semaphore.add_permits(1);
            return;
        }

        trace!("parking keep-alive connection for {}", conn.origin());
        let idle_at = Instant::now();
        state
            .idle
            .entry(conn.origin().clone())
            .or_default()
            .push(Idle { conn, idle_at });
    }

    /// A connection died while out of the pool: free its slot.
    fn release_closed(&self) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        state.active = state.active.saturating_sub(1);
        drop(state);
        self.semaphore.add_permits(1);
    }

    fn remove_closed_h2(&self, origin: &Origin) {
        let mut state = self.state.lock().expect("pool lock poisoned");
        if state.h2.get(origin).map_or(false, Connection::is_closed) {
            state.h2.remove(origin);
        }
    }
}

impl std::fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("limits", &self.limits)
            .finish()
    }
}

/// Frees one semaphore slot exactly once, either when the h2 connection
/// driver reports closure or when the driver is torn down.
struct SlotToken {
    pool: Weak<PoolInner>,
    released: AtomicBool,
}

impl SlotToken {
    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            if let Some(pool) = self.pool.upgrade() {
                pool.semaphore.add_permits(1);
            }
        }
    }
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        self.release();
    }
}

// ===== impl PooledBody =====

/// A response body stream holding its connection; finishing or dropping the
/// body returns the connection to the pool.
#[derive(Debug)]
pub(crate) struct PooledBody {
    inner: Option<ConnBody>,
    pool: Weak<PoolInner>,
    read_timeout: Option<Duration>,
    done: bool,
}

impl PooledBody {
    pub(crate) async fn chunk(&mut self) -> crate::Result<Option<Bytes>> {
        if self.done {
            return Ok(None);
        }
        let inner = match self.inner.as_mut() {
            Some(inner) => inner,
            None => return Ok(None),
        };
        match inner.chunk(self.read_timeout).await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                self.finish().await;
                Ok(None)
            }
            Err(e) => {
                self.abandon();
                Err(e)
            }
        }
    }

    async fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(mut inner) = self.inner.take() {
            match inner.finish().await {
                Finished::Reusable(conn) => match self.pool.upgrade() {
                    Some(pool) => pool.release(conn),
                    None => drop(conn),
                },
                Finished::Closed => {
                    if let Some(pool) = self.pool.upgrade() {
                        pool.release_closed();
                    }
                }
                Finished::Shared => {}
            }
        }
    }

    /// Close without draining: the connection cannot be reused.
    pub(crate) fn abandon(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(mut inner) = self.inner.take() {
            if inner.discard() {
                if let Some(pool) = self.pool.upgrade() {
                    pool.release_closed();
                }
            }
        }
    }
}

impl Drop for PooledBody {
    fn drop(&mut self) {
        self.abandon();
    }
}

async fn deadline<F>(limit: Option<Duration>, fut: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    match limit {
        Some(dur) => tokio::time::timeout(dur, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use http::{HeaderMap, Method};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tls::TlsConfig;

    /// A loopback HTTP/1.1 server answering every request on every
    /// connection with the same response, counting accepted connections.
    async fn spawn_server(response: &'static str) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepts = Arc::new(AtomicUsize::new(0));
        let counter = accepts.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    loop {
                        let mut seen = Vec::new();
                        loop {
                            let n = match socket.read(&mut buf).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => n,
                            };
                            seen.extend_from_slice(&buf[..n]);
                            if seen.windows(4).any(|w| w == b"\r\n\r\n") {
                                break;
                            }
                        }
                        if socket.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        (addr, accepts)
    }

    fn pool_with_limits(limits: Limits) -> Pool {
        let connector = Connector::new(Backend, &TlsConfig::default(), None, None).unwrap();
        Pool::new(connector, Backend, limits)
    }

    fn get_head(addr: std::net::SocketAddr) -> RequestHead {
        RequestHead {
            method: Method::GET,
            url: format!("http://{addr}/").parse().unwrap(),
            headers: HeaderMap::new(),
        }
    }

    async fn drain(body: &mut PooledBody) -> Vec<u8> {
        let mut collected = Vec::new();
        while let Some(chunk) = body.chunk().await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        collected
    }

    #[tokio::test]
    async fn sequential_requests_reuse_one_connection() {
        let (addr, accepts) =
            spawn_server("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let pool = pool_with_limits(Limits::default());
        let timeout = Timeout::default();

        for _ in 0..2 {
            let mut response = pool
                .send(get_head(addr), Body::empty(), &timeout)
                .await
                .unwrap();
            assert_eq!(response.head.status, 200);
            assert_eq!(drain(&mut response.body).await, b"ok");
        }

        assert_eq!(accepts.load(Ordering::SeqCst), 1);
        assert_eq!(pool.keepalive_count(), 1);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_body_closes_connection() {
        let (addr, accepts) =
            spawn_server("HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello").await;
        let pool = pool_with_limits(Limits::default());
        let timeout = Timeout::default();

        let response = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap();
        // Dropped without reading the body: not reusable.
        drop(response);
        assert_eq!(pool.keepalive_count(), 0);
        assert_eq!(pool.active_count(), 0);

        let mut response = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap();
        assert_eq!(drain(&mut response.body).await, b"hello");
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn pool_timeout_when_exhausted() {
        let (addr, _accepts) =
            spawn_server("HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello").await;
        let pool = pool_with_limits(Limits::default().max_connections(1));
        let timeout = Timeout::default().pool(Duration::from_millis(50));

        // Hold the only slot by not reading the first response body.
        let held = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap();

        let err = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap_err();
        assert!(err.is_pool_timeout());

        drop(held);
        // The slot comes back once the held response is dropped.
        let mut response = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap();
        assert_eq!(drain(&mut response.body).await, b"hello");
    }

    #[tokio::test]
    async fn keepalive_expiry_evicts_idle_connections() {
        let (addr, accepts) =
            spawn_server("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let pool = pool_with_limits(
            Limits::default().keepalive_expiry(Duration::from_millis(50)),
        );
        let timeout = Timeout::default();

        let mut response = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap();
        drain(&mut response.body).await;
        drop(response);
        assert_eq!(pool.keepalive_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let mut response = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap();
        drain(&mut response.body).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn keepalive_soft_cap_closes_excess() {
        let (addr, _accepts) =
            spawn_server("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let pool = pool_with_limits(Limits::default().max_keepalive_connections(0));
        let timeout = Timeout::default();

        let mut response = pool
            .send(get_head(addr), Body::empty(), &timeout)
            .await
            .unwrap();
        drain(&mut response.body).await;
        drop(response);
        assert_eq!(pool.keepalive_count(), 0);
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_requests() {
        let (addr, _accepts) =
            spawn_server("HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
        let pool = pool_with_limits(Limits::default());
        pool.close();
        let err = pool
            .send(get_head(addr), Body::empty(), &Timeout::default())
            .await
            .unwrap_err();
        assert!(err.is_builder());
    }

    #[tokio::test]
    async fn connect_failure_frees_slot() {
        // A port with nothing listening on it.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = pool_with_limits(Limits::default().max_connections(1));
        let timeout = Timeout::default().connect(Duration::from_millis(200));

        for _ in 0..3 {
            let err = pool
                .send(get_head(addr), Body::empty(), &timeout)
                .await
                .unwrap_err();
            assert!(err.is_connect() || err.is_connect_timeout(), "{err:?}");
        }
        assert_eq!(pool.active_count(), 0);
    }
}
