//! The concurrency backend: everything the rest of the crate needs from the
//! async runtime, kept behind one narrow surface so the protocol engines and
//! the pool stay runtime-agnostic.
//!
//! The backend dials TCP/UDS (wrapping TLS and reporting the ALPN result),
//! creates the pool semaphore and per-connection locks, reads monotonic
//! time, and spawns background tasks whose lifetime is bound to an enclosing
//! operation.

use std::{sync::Arc, time::Duration};

use rustls_pki_types::ServerName;
use tokio::{
    net::TcpStream,
    sync::{Mutex, Semaphore},
    task::JoinHandle,
    time::Instant,
};
use tokio_rustls::TlsConnector;

use crate::{
    error::Error,
    io::{AsyncStream, BoxStream},
};

/// Protocol identifier negotiated during connection setup (via ALPN for TLS
/// streams; plaintext streams are always HTTP/1.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Negotiated {
    Http11,
    Http2,
}

/// TLS parameters for a dial: the configured connector plus the name to
/// authenticate.
pub(crate) struct TlsHandshake {
    pub(crate) connector: TlsConnector,
    pub(crate) server_name: ServerName<'static>,
}

/// The tokio-backed concurrency backend.
///
/// Cooperative scheduling comes from whichever tokio runtime flavor the
/// caller runs on; the choice is externally observable only in how
/// cancellation propagates and how time advances.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Backend;

impl Backend {
    /// Open a TCP stream to `host:port`, optionally wrapping it in TLS.
    ///
    /// The connect timeout covers both the TCP dial and the TLS handshake.
    /// Returns the stream and the negotiated protocol.
    pub(crate) async fn open_tcp_stream(
        &self,
        host: &str,
        port: u16,
        tls: Option<TlsHandshake>,
        timeout: Option<Duration>,
    ) -> Result<(BoxStream, Negotiated), Error> {
        let dial = async {
            let stream = TcpStream::connect((host, port))
                .await
                .map_err(Error::connect)?;
            let _ = stream.set_nodelay(true);
            self.maybe_tls(stream, tls).await
        };

        match deadline(timeout, dial).await {
            Some(result) => result,
            None => Err(Error::connect_timeout()),
        }
    }

    /// Open a Unix domain socket stream, optionally wrapping it in TLS.
    #[cfg(unix)]
    pub(crate) async fn open_uds_stream(
        &self,
        path: &std::path::Path,
        tls: Option<TlsHandshake>,
        timeout: Option<Duration>,
    ) -> Result<(BoxStream, Negotiated), Error> {
        let dial = async {
            let stream = tokio::net::UnixStream::connect(path)
                .await
                .map_err(Error::connect)?;
            self.maybe_tls(stream, tls).await
        };

        match deadline(timeout, dial).await {
            Some(result) => result,
            None => Err(Error::connect_timeout()),
        }
    }

    async fn maybe_tls<S>(
        &self,
        stream: S,
        tls: Option<TlsHandshake>,
    ) -> Result<(BoxStream, Negotiated), Error>
    where
        S: AsyncStream + 'static,
    {
        match tls {
            None => Ok((Box::new(stream), Negotiated::Http11)),
            Some(TlsHandshake {
                connector,
                server_name,
            }) => {
                let tls_stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(Error::tls)?;
                let negotiated = match tls_stream.get_ref().1.alpn_protocol() {
                    Some(b"h2") => Negotiated::Http2,
                    _ => Negotiated::Http11,
                };
                Ok((Box::new(tls_stream), negotiated))
            }
        }
    }

    /// Wrap an already-established stream (e.g. a proxy tunnel) in TLS.
    pub(crate) async fn start_tls(
        &self,
        stream: BoxStream,
        tls: TlsHandshake,
        timeout: Option<Duration>,
    ) -> Result<(BoxStream, Negotiated), Error> {
        match deadline(timeout, self.maybe_tls(stream, Some(tls))).await {
            Some(result) => result,
            None => Err(Error::connect_timeout()),
        }
    }

    /// Create the admission semaphore for a pool.
    pub(crate) fn create_semaphore(&self, max: usize) -> Arc<Semaphore> {
        Arc::new(Semaphore::new(max))
    }

    /// Create a lock for intra-connection ordering.
    ///
    /// The bundled engines serialize connection setup internally, so this
    /// exists for alternative transports built on the same backend.
    #[allow(unused)]
    pub(crate) fn create_lock(&self) -> Arc<Mutex<()>> {
        Arc::new(Mutex::new(()))
    }

    /// The backend's monotonic clock.
    pub(crate) fn monotonic_time(&self) -> Instant {
        Instant::now()
    }

    /// Spawn a background task bound to the enclosing operation: the
    /// returned handle aborts the task when dropped, so no task outlives
    /// the scope that spawned it.
    pub(crate) fn spawn_scoped<F>(&self, task: F) -> ScopedTask<F::Output>
    where
        F: std::future::Future + Send + 'static,
        F::Output: Send + 'static,
    {
        ScopedTask {
            handle: tokio::spawn(task),
        }
    }
}

/// Handle to a background task whose lifetime is nested in the operation
/// that spawned it. Dropping the handle cancels the task.
#[derive(Debug)]
pub(crate) struct ScopedTask<T> {
    handle: JoinHandle<T>,
}

impl<T> ScopedTask<T> {
    /// Wait for the task to finish and take its output.
    pub(crate) async fn join(mut self) -> Result<T, Error> {
        self.wait().await
    }

    /// As [`join`](Self::join), but by reference so the caller can race the
    /// task against other work before deciding to keep or cancel it.
    pub(crate) async fn wait(&mut self) -> Result<T, Error> {
        let result = (&mut self.handle).await;
        result.map_err(|e| {
            Error::request(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("background task failed: {e}"),
            ))
        })
    }
}

impl<T> Drop for ScopedTask<T> {
    fn drop(&mut self) {
        self.handle.abort();
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
