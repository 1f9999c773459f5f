//! Byte-oriented reader/writer over a (possibly TLS-wrapped) transport.
//!
//! The `Reader` and `Writer` halves encapsulate per-operation deadlines so
//! the protocol engines stay free of timer plumbing. Both halves accept an
//! optional [`TimeoutFlag`] so a read and a write on the same connection can
//! run concurrently while only one side enforces its deadline at a time.

use std::{
    io,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};

use crate::error::Error;

/// Transport object the engines read and write: a TCP stream, a TLS stream,
/// or an in-memory pipe in tests.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

impl std::fmt::Debug for dyn AsyncStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn AsyncStream")
    }
}

pub(crate) type BoxStream = Box<dyn AsyncStream>;

/// Inner deadline used when an operation's direction is not currently
/// allowed to raise: poll briefly, then re-check the flag.
pub(crate) const SPIN_INTERVAL: Duration = Duration::from_millis(10);

/// A timeout flag holds a state of either read-timeout or write-timeout mode.
///
/// During a request/response cycle we start in write-timeout mode. Once the
/// request has been sent fully, or once we start seeing a response, the flag
/// switches to read-timeout mode instead. This lets a response be observed
/// while the request body is still uploading, without the peer's silence on
/// the write side failing the request.
#[derive(Debug)]
pub(crate) struct TimeoutFlag {
    raise_on_read: AtomicBool,
}

impl TimeoutFlag {
    pub(crate) fn new() -> TimeoutFlag {
        TimeoutFlag {
            raise_on_read: AtomicBool::new(false),
        }
    }

    /// Switch to read-timeout mode.
    pub(crate) fn set_read_mode(&self) {
        self.raise_on_read.store(true, Ordering::Relaxed);
    }

    /// Switch back to write-timeout mode.
    #[allow(unused)]
    pub(crate) fn set_write_mode(&self) {
        self.raise_on_read.store(false, Ordering::Relaxed);
    }

    pub(crate) fn raise_on_read(&self) -> bool {
        self.raise_on_read.load(Ordering::Relaxed)
    }

    pub(crate) fn raise_on_write(&self) -> bool {
        !self.raise_on_read.load(Ordering::Relaxed)
    }
}

/// The read half of a connection's transport.
pub(crate) struct Reader {
    inner: ReadHalf<BoxStream>,
    // A byte consumed by a liveness probe, handed back on the next read.
    peeked: Option<Bytes>,
}

/// The write half of a connection's transport.
pub(crate) struct Writer {
    inner: WriteHalf<BoxStream>,
}

pub(crate) fn split(io: BoxStream) -> (Reader, Writer) {
    let (read, write) = tokio::io::split(io);
    (
        Reader {
            inner: read,
            peeked: None,
        },
        Writer { inner: write },
    )
}

impl Reader {
    /// Read up to `max` bytes. Returns an empty buffer on EOF.
    ///
    /// When `flag` says the connection is in write-timeout mode, the read
    /// polls with a short inner deadline and never raises; otherwise the
    /// deadline is `timeout` and expiry fails with a read timeout.
    pub(crate) async fn read(
        &mut self,
        max: usize,
        timeout: Option<Duration>,
        flag: Option<&TimeoutFlag>,
    ) -> Result<Bytes, Error> {
        if let Some(peeked) = self.peeked.take() {
            return Ok(peeked);
        }

        let mut buf = vec![0u8; max];
        loop {
            let should_raise = flag.map_or(true, TimeoutFlag::raise_on_read);
            let limit = if should_raise {
                timeout
            } else {
                Some(SPIN_INTERVAL)
            };

            match deadline(limit, self.inner.read(&mut buf)).await {
                Some(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(Bytes::from(buf));
                }
                Some(Err(e)) => return Err(Error::network(e)),
                None if should_raise => return Err(Error::read_timeout()),
                None => continue,
            }
        }
    }

    /// Whether the peer has closed its side of the connection.
    ///
    /// Distinguishes a peer-initiated close from a normal idle state by
    /// probing readability without consuming data: a byte that arrives
    /// during the probe is buffered and handed back on the next `read`.
    pub(crate) fn is_connection_dropped(&mut self) -> bool {
        if self.peeked.is_some() {
            return false;
        }

        let mut cx = Context::from_waker(futures_util::task::noop_waker_ref());
        let mut buf = [0u8; 1];
        let mut read_buf = ReadBuf::new(&mut buf);
        match Pin::new(&mut self.inner).poll_read(&mut cx, &mut read_buf) {
            Poll::Ready(Ok(())) if read_buf.filled().is_empty() => true,
            Poll::Ready(Ok(())) => {
                self.peeked = Some(Bytes::copy_from_slice(read_buf.filled()));
                false
            }
            Poll::Ready(Err(_)) => true,
            Poll::Pending => false,
        }
    }
}

impl Writer {
    /// Write all of `data`, with the deadline applied per OS-level write.
    ///
    /// Symmetric to [`Reader::read`]: in read-timeout mode the write spins
    /// instead of raising.
    pub(crate) async fn write(
        &mut self,
        mut data: &[u8],
        timeout: Option<Duration>,
        flag: Option<&TimeoutFlag>,
    ) -> Result<(), Error> {
        while !data.is_empty() {
            let should_raise = flag.map_or(true, TimeoutFlag::raise_on_write);
            let limit = if should_raise {
                timeout
            } else {
                Some(SPIN_INTERVAL)
            };

            match deadline(limit, self.inner.write(data)).await {
                Some(Ok(0)) => {
                    return Err(Error::network(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write to connection",
                    )));
                }
                Some(Ok(n)) => data = &data[n..],
                Some(Err(e)) => return Err(Error::network(e)),
                None if should_raise => return Err(Error::write_timeout()),
                None => continue,
            }
        }
        Ok(())
    }

    pub(crate) async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

/// Await `fut` under an optional deadline. `None` in the result marks an
/// expired deadline.
async fn deadline<F>(limit: Option<Duration>, fut: F) -> Option<F::Output>
where
    F: std::future::Future,
{
    match limit {
        Some(dur) => tokio::time::timeout(dur, fut).await.ok(),
        None => Some(fut.await),
    }
}
