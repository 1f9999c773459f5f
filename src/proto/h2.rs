//! Client-side HTTP/2 connection engine.
//!
//! One engine multiplexes many concurrent streams over a single connection.
//! Framing, HPACK, and the connection-level state machine come from the
//! [`h2`] crate; this engine owns stream lifecycle, per-stream flow control
//! while sending bodies, and per-stream timeout regimes. A background task
//! drives the `h2` connection future, fanning received frames out to the
//! per-stream receivers; it is bound to the engine's lifetime and aborted
//! when the last handle drops.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use h2::client::SendRequest;
use http::{header, HeaderValue, Version};
use log::{debug, trace};

use super::{RequestHead, ResponseHead};
use crate::{
    backend::{Backend, ScopedTask},
    body::{Body, BodyChunks},
    config::Timeout,
    error::Error,
    io::{BoxStream, TimeoutFlag, SPIN_INTERVAL},
};

// A large initial window: the engine acknowledges DATA promptly, so a
// bigger-than-default window just keeps fast peers from stalling.
const INITIAL_WINDOW_SIZE: u32 = 1 << 24;
const MAX_CONCURRENT_STREAMS: u32 = 100;
const MAX_HEADER_LIST_SIZE: u32 = 65536;

/// A cloneable handle to one HTTP/2 connection.
#[derive(Clone)]
pub(crate) struct Http2Engine {
    send_request: SendRequest<Bytes>,
    state: Arc<H2State>,
    // Keeps the connection driver alive; aborted when the last handle
    // (pool entry or in-flight response) goes away.
    _driver: Arc<DriverGuard>,
    backend: Backend,
}

#[derive(Debug)]
struct H2State {
    streams: AtomicUsize,
    closed: AtomicBool,
}

struct DriverGuard {
    _task: ScopedTask<()>,
}

enum SendBodyError {
    /// The caller's body stream failed.
    User(Error),
    /// The stream or connection failed while sending.
    Stream(Error),
}

impl Http2Engine {
    /// Perform the connection preface and settings exchange, and spawn the
    /// task that drives the connection from then on.
    ///
    /// `on_close` fires when the connection terminates, however that
    /// happens; the pool uses it to drop its entry and free the slot.
    pub(crate) async fn handshake<F>(
        io: BoxStream,
        backend: Backend,
        on_close: F,
    ) -> Result<Http2Engine, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut builder = h2::client::Builder::new();
        builder
            .initial_window_size(INITIAL_WINDOW_SIZE)
            .initial_connection_window_size(INITIAL_WINDOW_SIZE)
            .max_concurrent_streams(MAX_CONCURRENT_STREAMS)
            .max_header_list_size(MAX_HEADER_LIST_SIZE)
            .enable_push(false);

        let (send_request, connection) = builder
            .handshake::<_, Bytes>(io)
            .await
            .map_err(map_h2_error)?;

        let state = Arc::new(H2State {
            streams: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });

        let driver_state = state.clone();
        let task = backend.spawn_scoped(async move {
            if let Err(e) = connection.await {
                debug!("h2 connection terminated: {e}");
            }
            driver_state.closed.store(true, Ordering::SeqCst);
            on_close();
        });

        Ok(Http2Engine {
            send_request,
            state,
            _driver: Arc::new(DriverGuard { _task: task }),
            backend,
        })
    }

    /// Send a request on a new stream and read the response head. The body
    /// chunks are then pulled from the returned [`H2RecvBody`].
    pub(crate) async fn send(
        &self,
        head: &RequestHead,
        body: Body,
        timeout: &Timeout,
    ) -> Result<(ResponseHead, H2RecvBody), Error> {
        // Readiness respects the peer's MAX_CONCURRENT_STREAMS.
        let mut sender = self
            .send_request
            .clone()
            .ready()
            .await
            .map_err(map_h2_error)?;

        let uri = crate::into_url::try_uri(&head.url)?;
        let mut request = http::Request::builder()
            .method(head.method.clone())
            .uri(uri)
            .body(())
            .map_err(Error::builder)?;
        // `host` and `transfer-encoding` are protocol-level in HTTP/2; the
        // authority travels in the `:authority` pseudo-header instead.
        for (name, value) in head.headers.iter() {
            if name == header::HOST || name == header::TRANSFER_ENCODING {
                continue;
            }
            request.headers_mut().append(name.clone(), value.clone());
        }

        if let Some(len) = body.content_length() {
            if len > 0 && !request.headers().contains_key(header::CONTENT_LENGTH) {
                request
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
            }
        }

        let end_stream = body.content_length() == Some(0);
        trace!(
            "send_headers method={} authority={:?} end_stream={end_stream}",
            head.method,
            head.url.host_str()
        );
        let (response_fut, send_stream) = sender
            .send_request(request, end_stream)
            .map_err(map_h2_error)?;

        self.state.streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard {
            state: self.state.clone(),
        };

        let flag = Arc::new(TimeoutFlag::new());
        let mut task = if end_stream {
            flag.set_read_mode();
            None
        } else {
            Some(self.backend.spawn_scoped(send_body_task(
                send_stream,
                body.into_chunks(),
                flag.clone(),
                timeout.write,
            )))
        };

        // Await the response head while the body task runs, in the
        // per-stream timeout regime.
        let mut response_fut = Box::pin(response_fut);
        let mut task_done = task.is_none();
        let response = loop {
            let should_raise = flag.raise_on_read();
            let limit = if should_raise {
                timeout.read
            } else {
                Some(SPIN_INTERVAL)
            };

            if task_done {
                match deadline(limit, response_fut.as_mut()).await {
                    Some(result) => break result.map_err(map_h2_error)?,
                    None if should_raise => return Err(Error::read_timeout()),
                    None => continue,
                }
            } else {
                let running = task.as_mut().expect("task present until joined");
                tokio::select! {
                    outcome = running.wait() => {
                        task_done = true;
                        match outcome? {
                            Ok(()) => {}
                            Err(SendBodyError::User(e)) => return Err(e),
                            Err(SendBodyError::Stream(e)) => {
                                // The peer may have replied and reset our
                                // sending half; defer to the response.
                                debug!("h2 request body send failed: {e}");
                            }
                        }
                    }
                    result = deadline(limit, response_fut.as_mut()) => {
                        match result {
                            Some(result) => break result.map_err(map_h2_error)?,
                            None if should_raise => return Err(Error::read_timeout()),
                            None => continue,
                        }
                    }
                }
            }
        };

        // Join the body task before handing the response to the caller. A
        // peer that responded without draining our body resets the stream
        // when the task is dropped.
        if let Some(running) = task.take() {
            if !task_done {
                match deadline(timeout.write, running.join()).await {
                    Some(outcome) => match outcome? {
                        Ok(()) | Err(SendBodyError::Stream(_)) => {}
                        Err(SendBodyError::User(e)) => return Err(e),
                    },
                    None => drop_task_for_reset(),
                }
            }
        }

        let (parts, recv) = response.into_parts();
        trace!("receive_event stream event=Response({})", parts.status);
        let head = ResponseHead {
            status: parts.status,
            version: Version::HTTP_2,
            reason: None,
            headers: parts.headers,
        };
        let body = H2RecvBody {
            recv,
            flag,
            complete: false,
            _guard: guard,
        };
        Ok((head, body))
    }

    /// Number of streams currently open on this connection.
    pub(crate) fn active_streams(&self) -> usize {
        self.state.streams.load(Ordering::SeqCst)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Http2Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Http2Engine")
            .field("streams", &self.active_streams())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// Nothing to do: dropping the task's SendStream makes h2 reset the stream.
fn drop_task_for_reset() {}

/// Decrements the engine's stream count when a stream finishes.
struct StreamGuard {
    state: Arc<H2State>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.state.streams.fetch_sub(1, Ordering::SeqCst);
    }
}

/// The receive half of one HTTP/2 stream.
pub(crate) struct H2RecvBody {
    recv: h2::RecvStream,
    flag: Arc<TimeoutFlag>,
    complete: bool,
    _guard: StreamGuard,
}

impl H2RecvBody {
    /// Pull the next DATA chunk. `None` marks the end of the stream; a
    /// peer reset also ends the stream cleanly.
    pub(crate) async fn chunk(
        &mut self,
        read_timeout: Option<Duration>,
    ) -> Result<Option<Bytes>, Error> {
        if self.complete {
            return Ok(None);
        }

        let next = loop {
            let should_raise = self.flag.raise_on_read();
            let limit = if should_raise {
                read_timeout
            } else {
                Some(SPIN_INTERVAL)
            };
            let poll = deadline(
                limit,
                std::future::poll_fn(|cx| self.recv.poll_data(cx)),
            )
            .await;
            match poll {
                Some(next) => break next,
                None if should_raise => return Err(Error::read_timeout()),
                None => continue,
            }
        };

        match next {
            Some(Ok(data)) => {
                trace!("receive_event stream event=Data({} bytes)", data.len());
                // Acknowledge before yielding so the peer's window stays
                // open regardless of how slowly the caller consumes.
                if !data.is_empty() {
                    let _ = self
                        .recv
                        .flow_control()
                        .release_capacity(data.len());
                }
                Ok(Some(data))
            }
            Some(Err(e)) if e.is_reset() => {
                trace!("receive_event stream event=StreamReset");
                self.complete = true;
                Ok(None)
            }
            Some(Err(e)) => {
                self.complete = true;
                Err(map_h2_error(e))
            }
            None => {
                trace!("receive_event stream event=StreamEnded");
                self.complete = true;
                Ok(None)
            }
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.complete
    }
}

impl std::fmt::Debug for H2RecvBody {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("H2RecvBody")
            .field("complete", &self.complete)
            .finish()
    }
}

async fn send_body_task(
    mut stream: h2::SendStream<Bytes>,
    mut chunks: BodyChunks,
    flag: Arc<TimeoutFlag>,
    write_timeout: Option<Duration>,
) -> Result<(), SendBodyError> {
    let result = drive_send(&mut stream, &mut chunks, &flag, write_timeout).await;
    if let Err(SendBodyError::User(_)) = result {
        stream.send_reset(h2::Reason::CANCEL);
    }
    flag.set_read_mode();
    result
}

async fn drive_send(
    stream: &mut h2::SendStream<Bytes>,
    chunks: &mut BodyChunks,
    flag: &TimeoutFlag,
    write_timeout: Option<Duration>,
) -> Result<(), SendBodyError> {
    while let Some(chunk) = chunks.next().await {
        let mut chunk = chunk.map_err(SendBodyError::User)?;
        while !chunk.is_empty() {
            // Each chunk is split into sub-chunks no larger than the
            // stream's current flow-control allowance; a zero window
            // parks the task until the peer sends WINDOW_UPDATE.
            stream.reserve_capacity(chunk.len());
            let allowed = loop {
                let should_raise = flag.raise_on_write();
                let limit = if should_raise {
                    write_timeout
                } else {
                    Some(SPIN_INTERVAL)
                };
                let poll = deadline(
                    limit,
                    std::future::poll_fn(|cx| stream.poll_capacity(cx)),
                )
                .await;
                match poll {
                    Some(Some(Ok(n))) => break n,
                    Some(Some(Err(e))) => {
                        return Err(SendBodyError::Stream(map_h2_error(e)))
                    }
                    Some(None) => {
                        return Err(SendBodyError::Stream(Error::network(
                            "h2 stream closed while awaiting flow control",
                        )))
                    }
                    None if should_raise => {
                        return Err(SendBodyError::Stream(Error::write_timeout()))
                    }
                    None => continue,
                }
            };

            let frame = chunk.split_to(allowed.min(chunk.len()));
            trace!("send_data stream data=Data({} bytes)", frame.len());
            stream
                .send_data(frame, false)
                .map_err(|e| SendBodyError::Stream(map_h2_error(e)))?;
        }
    }

    stream
        .send_data(Bytes::new(), true)
        .map_err(|e| SendBodyError::Stream(map_h2_error(e)))?;
    trace!("send_event stream event=EndOfMessage");
    Ok(())
}

fn map_h2_error(e: h2::Error) -> Error {
    if e.is_io() {
        Error::network(e)
    } else {
        Error::protocol(e)
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
    use http::{HeaderMap, Method, Request, Response, StatusCode};

    use super::*;

    fn request_head(method: Method, url: &str) -> RequestHead {
        RequestHead {
            method,
            url: url.parse().unwrap(),
            headers: HeaderMap::new(),
        }
    }

    async fn serve_one<F>(io: tokio::io::DuplexStream, handler: F)
    where
        F: FnOnce(
                Request<h2::RecvStream>,
                h2::server::SendResponse<Bytes>,
            ) -> futures_util::future::BoxFuture<'static, ()>
            + Send
            + 'static,
    {
        let mut conn = h2::server::handshake(io).await.expect("server handshake");
        if let Some(result) = conn.accept().await {
            let (request, respond) = result.expect("accept");
            handler(request, respond).await;
        }
        // Drive the connection until the client goes away.
        while (conn.accept().await).is_some() {}
    }

    #[tokio::test]
    async fn get_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(65536);
        let server = tokio::spawn(serve_one(server_io, |request, mut respond| {
            Box::pin(async move {
                assert_eq!(request.method(), Method::GET);
                assert_eq!(request.uri().path(), "/hello");
                let response = Response::builder()
                    .status(StatusCode::OK)
                    .body(())
                    .unwrap();
                let mut stream = respond.send_response(response, false).unwrap();
                stream
                    .send_data(Bytes::from_static(b"Hello, world!"), true)
                    .unwrap();
            })
        }));

        let engine = Http2Engine::handshake(Box::new(client_io), Backend, || {})
            .await
            .unwrap();
        let head = request_head(Method::GET, "https://example.com/hello");
        let (response, mut body) = engine
            .send(&head, Body::empty(), &Timeout::default())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.version, Version::HTTP_2);
        assert_eq!(engine.active_streams(), 1);

        let mut collected = Vec::new();
        while let Some(chunk) = body.chunk(None).await.unwrap() {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(&collected[..], b"Hello, world!");
        assert!(body.is_complete());

        drop(body);
        assert_eq!(engine.active_streams(), 0);
        drop(engine);
        let _ = server.await;
    }

    #[tokio::test]
    async fn request_body_is_streamed() {
        let (client_io, server_io) = tokio::io::duplex(65536);
        let server = tokio::spawn(serve_one(server_io, |mut request, mut respond| {
            Box::pin(async move {
                let mut received = Vec::new();
                let body = request.body_mut();
                while let Some(chunk) = std::future::poll_fn(|cx| body.poll_data(cx)).await {
                    let chunk = chunk.unwrap();
                    let _ = body.flow_control().release_capacity(chunk.len());
                    received.extend_from_slice(&chunk);
                }
                assert_eq!(&received[..], b"one two three");
                let response = Response::builder()
                    .status(StatusCode::CREATED)
                    .body(())
                    .unwrap();
                let mut stream = respond.send_response(response, false).unwrap();
                stream.send_data(Bytes::new(), true).unwrap();
            })
        }));

        let engine = Http2Engine::handshake(Box::new(client_io), Backend, || {})
            .await
            .unwrap();
        let head = request_head(Method::POST, "https://example.com/upload");
        let (response, mut body) = engine
            .send(&head, Body::from("one two three"), &Timeout::default())
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::CREATED);
        while body.chunk(None).await.unwrap().is_some() {}
        drop(body);
        drop(engine);
        let _ = server.await;
    }

    #[tokio::test]
    async fn stream_reset_ends_body_cleanly() {
        let (client_io, server_io) = tokio::io::duplex(65536);
        let server = tokio::spawn(serve_one(server_io, |_request, mut respond| {
            Box::pin(async move {
                let response = Response::builder()
                    .status(StatusCode::OK)
                    .body(())
                    .unwrap();
                let mut stream = respond.send_response(response, false).unwrap();
                stream
                    .send_data(Bytes::from_static(b"partial"), false)
                    .unwrap();
                stream.send_reset(h2::Reason::CANCEL);
            })
        }));

        let engine = Http2Engine::handshake(Box::new(client_io), Backend, || {})
            .await
            .unwrap();
        let head = request_head(Method::GET, "https://example.com/flaky");
        let (_response, mut body) = engine
            .send(&head, Body::empty(), &Timeout::default())
            .await
            .unwrap();

        let mut collected = Vec::new();
        loop {
            match body.chunk(None).await {
                Ok(Some(chunk)) => collected.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => panic!("reset should end the body cleanly: {e}"),
            }
        }
        assert_eq!(&collected[..], b"partial");
        drop(body);
        drop(engine);
        let _ = server.await;
    }
}
