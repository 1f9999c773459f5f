//! Client-side HTTP/1.1 connection engine.
//!
//! One engine drives one request/response cycle at a time. Our side steps
//! through idle → send-headers → send-body → done while the peer's side
//! steps through idle → recv-response → recv-body → done. When both sides
//! reach done the engine resets for the next cycle on the same stream
//! (keep-alive); any other terminal state closes the connection.
//!
//! The request body is driven by a background task scoped to the cycle, so
//! the response head can be observed while the body is still uploading. The
//! task is joined before the response is handed to the caller.

use std::{sync::Arc, time::Duration};

use bytes::{Buf, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use log::{debug, trace};

use super::{full_path, host_header_value, RequestHead, ResponseHead};
use crate::{
    backend::Backend,
    body::{Body, BodyChunks, Framing},
    config::Timeout,
    error::Error,
    io::{Reader, TimeoutFlag, Writer},
};

pub(crate) const READ_NUM_BYTES: usize = 4096;
const MAX_HEADERS: usize = 100;
const MAX_HEAD_SIZE: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    SendBody,
    RecvResponse,
    RecvBody,
    Done,
    Error,
}

#[derive(Debug)]
enum BodyDecoder {
    Empty,
    Length(u64),
    Chunked(ChunkPhase),
    UntilEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkPhase {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Complete,
}

enum Decoded {
    Chunk(Bytes),
    Complete,
    NeedMore,
}

enum SendBodyError {
    /// The transport failed while writing. If the response head still
    /// arrives, the error is ignored and the connection marked unreusable.
    Io(Error),
    /// The caller's body stream failed; the request cannot complete.
    User(Error),
}

pub(crate) struct Http1Engine {
    reader: Reader,
    writer: Option<Writer>,
    buf: BytesMut,
    our_state: State,
    their_state: State,
    decoder: BodyDecoder,
    flag: Arc<TimeoutFlag>,
    keepalive: bool,
    send_failed: bool,
    closed: bool,
    via_proxy: bool,
    proxy_authorization: Option<HeaderValue>,
    backend: Backend,
}

impl Http1Engine {
    pub(crate) fn new(reader: Reader, writer: Writer, via_proxy: bool, backend: Backend) -> Self {
        Http1Engine {
            reader,
            writer: Some(writer),
            buf: BytesMut::new(),
            our_state: State::Idle,
            their_state: State::Idle,
            decoder: BodyDecoder::Empty,
            flag: Arc::new(TimeoutFlag::new()),
            keepalive: true,
            send_failed: false,
            closed: false,
            via_proxy,
            proxy_authorization: None,
            backend,
        }
    }

    /// Credentials to forward with every request on a proxied connection.
    pub(crate) fn set_proxy_authorization(&mut self, auth: Option<HeaderValue>) {
        self.proxy_authorization = auth;
    }

    /// Send a request and read the response head. After this returns, the
    /// response body is pulled with [`next_body_chunk`](Self::next_body_chunk)
    /// and the cycle is finished with [`response_closed`](Self::response_closed).
    pub(crate) async fn send(
        &mut self,
        head: &RequestHead,
        body: Body,
        timeout: &Timeout,
    ) -> Result<ResponseHead, Error> {
        if self.closed || self.our_state != State::Idle || self.their_state != State::Idle {
            return Err(Error::protocol("connection is not idle"));
        }

        let framing = body.framing();
        let head_bytes = self.encode_head(head, framing);
        trace!(
            "send_headers method={} target={} ({} header bytes)",
            head.method,
            full_path(&head.url),
            head_bytes.len()
        );

        self.flag = Arc::new(TimeoutFlag::new());
        self.our_state = State::SendBody;
        self.their_state = State::RecvResponse;

        let writer = self
            .writer
            .take()
            .ok_or_else(|| Error::protocol("connection writer unavailable"))?;
        let mut task = self.backend.spawn_scoped(send_body_task(
            writer,
            head_bytes,
            body.into_chunks(),
            framing == Framing::Chunked,
            timeout.write,
            self.flag.clone(),
        ));

        // Read the response head while the body task runs. A response may
        // legitimately arrive before our body is fully sent.
        let mut task_outcome = None;
        let response = loop {
            if task_outcome.is_some() {
                match self.read_response_head(timeout.read).await {
                    Ok(head) => break head,
                    Err(e) => {
                        self.closed = true;
                        return Err(e);
                    }
                }
            }
            tokio::select! {
                outcome = task.wait() => {
                    match outcome? {
                        // A failing body stream means the request cannot
                        // complete; surface it without waiting for the
                        // peer.
                        (writer, Err(SendBodyError::User(e))) => {
                            self.writer = Some(writer);
                            self.our_state = State::Error;
                            self.closed = true;
                            return Err(e);
                        }
                        other => task_outcome = Some(other),
                    }
                }
                result = self.read_response_head(timeout.read) => {
                    match result {
                        Ok(head) => break head,
                        Err(e) => {
                            drop(task);
                            self.closed = true;
                            return Err(e);
                        }
                    }
                }
            }
        };

        // Join the body task before returning the response to the caller.
        let outcome = match task_outcome {
            Some(outcome) => Some(outcome),
            None => match deadline(timeout.write, task.wait()).await {
                Some(outcome) => Some(outcome?),
                None => {
                    // The peer responded but stopped draining our body.
                    // Abandon the upload; the connection cannot be reused.
                    drop(task);
                    self.send_failed = true;
                    self.our_state = State::Error;
                    None
                }
            },
        };
        if let Some(outcome) = outcome {
            self.finish_send(outcome)?;
        }

        self.prepare_body(&head.method, &response)?;
        Ok(response)
    }

    fn finish_send(&mut self, (writer, result): (Writer, Result<(), SendBodyError>)) -> Result<(), Error> {
        self.writer = Some(writer);
        match result {
            Ok(()) => {
                self.our_state = State::Done;
                Ok(())
            }
            Err(SendBodyError::Io(e)) => {
                // The response head was received, so defer to it; the
                // connection is marked unreusable.
                debug!("request body send failed after response: {e}");
                self.send_failed = true;
                self.our_state = State::Error;
                Ok(())
            }
            Err(SendBodyError::User(e)) => {
                self.send_failed = true;
                self.our_state = State::Error;
                self.closed = true;
                Err(e)
            }
        }
    }

    fn encode_head(&self, head: &RequestHead, framing: Framing) -> Vec<u8> {
        let target = if head.method == Method::CONNECT {
            format!(
                "{}:{}",
                head.url.host_str().unwrap_or_default(),
                head.url.port_or_known_default().unwrap_or(80)
            )
        } else if self.via_proxy && head.url.scheme() == "http" {
            // Absolute-form target when talking through an HTTP proxy.
            let mut absolute = head.url.clone();
            absolute.set_fragment(None);
            absolute.to_string()
        } else {
            full_path(&head.url)
        };

        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(head.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(target.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");

        if !head.headers.contains_key(header::HOST) {
            out.extend_from_slice(b"host: ");
            out.extend_from_slice(host_header_value(&head.url).as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if self.via_proxy {
            if let Some(auth) = &self.proxy_authorization {
                if !head.headers.contains_key(header::PROXY_AUTHORIZATION) {
                    out.extend_from_slice(b"proxy-authorization: ");
                    out.extend_from_slice(auth.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
            }
        }

        for (name, value) in head.headers.iter() {
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        match framing {
            Framing::Length(len) => {
                if len > 0 && !head.headers.contains_key(header::CONTENT_LENGTH) {
                    out.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
                }
            }
            Framing::Chunked => {
                if !head.headers.contains_key(header::TRANSFER_ENCODING) {
                    out.extend_from_slice(b"transfer-encoding: chunked\r\n");
                }
            }
        }

        out.extend_from_slice(b"\r\n");
        out
    }

    async fn read_response_head(&mut self, timeout: Option<Duration>) -> Result<ResponseHead, Error> {
        loop {
            if let Some(head) = parse_head(&mut self.buf)? {
                if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                    trace!("receive_event event=InformationalResponse({})", head.status);
                    continue;
                }
                trace!("receive_event event=Response({})", head.status);
                return Ok(head);
            }

            let data = self
                .reader
                .read(READ_NUM_BYTES, timeout, Some(&self.flag))
                .await?;
            if data.is_empty() {
                let msg = if self.buf.is_empty() {
                    "connection closed before a response was received"
                } else {
                    "connection closed while reading the response head"
                };
                return Err(Error::network(msg));
            }
            // Seeing the response begin switches the timeout regime even
            // if the request body is still uploading.
            self.flag.set_read_mode();
            self.buf.extend_from_slice(&data);
        }
    }

    fn prepare_body(&mut self, method: &Method, response: &ResponseHead) -> Result<(), Error> {
        let status = response.status;
        self.decoder = if method == Method::HEAD
            || (method == Method::CONNECT && status.is_success())
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            BodyDecoder::Empty
        } else if response
            .headers
            .get(header::TRANSFER_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.to_ascii_lowercase().contains("chunked"))
        {
            BodyDecoder::Chunked(ChunkPhase::Size)
        } else if let Some(value) = response.headers.get(header::CONTENT_LENGTH) {
            let len = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or_else(|| Error::protocol("invalid Content-Length header"))?;
            if len == 0 {
                BodyDecoder::Empty
            } else {
                BodyDecoder::Length(len)
            }
        } else {
            BodyDecoder::UntilEof
        };

        let connection_close = response
            .headers
            .get(header::CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |v| v.to_ascii_lowercase().contains("close"));
        let http10_no_keepalive = response.version == Version::HTTP_10
            && !response
                .headers
                .get(header::CONNECTION)
                .and_then(|v| v.to_str().ok())
                .map_or(false, |v| v.to_ascii_lowercase().contains("keep-alive"));
        self.keepalive = !connection_close
            && !http10_no_keepalive
            && !matches!(self.decoder, BodyDecoder::UntilEof);

        self.their_state = if matches!(self.decoder, BodyDecoder::Empty) {
            State::Done
        } else {
            State::RecvBody
        };
        Ok(())
    }

    /// Pull the next response body chunk. `None` marks the end of the body.
    pub(crate) async fn next_body_chunk(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<Option<Bytes>, Error> {
        if self.their_state != State::RecvBody {
            return Ok(None);
        }

        loop {
            match self.decoder.decode(&mut self.buf)? {
                Decoded::Chunk(chunk) => {
                    trace!("receive_event event=Data({} bytes)", chunk.len());
                    return Ok(Some(chunk));
                }
                Decoded::Complete => {
                    trace!("receive_event event=EndOfMessage");
                    self.their_state = State::Done;
                    return Ok(None);
                }
                Decoded::NeedMore => {
                    let read = self
                        .reader
                        .read(READ_NUM_BYTES, timeout, Some(&self.flag))
                        .await;
                    let data = match read {
                        Ok(data) => data,
                        Err(e) => {
                            self.closed = true;
                            return Err(e);
                        }
                    };
                    if data.is_empty() {
                        if matches!(self.decoder, BodyDecoder::UntilEof) {
                            self.their_state = State::Done;
                            self.keepalive = false;
                            return Ok(None);
                        }
                        self.closed = true;
                        return Err(Error::network("connection closed mid-body"));
                    }
                    self.buf.extend_from_slice(&data);
                }
            }
        }
    }

    /// Finish the cycle. Returns true if the connection may be reused.
    pub(crate) async fn response_closed(&mut self) -> bool {
        trace!(
            "response_closed our_state={:?} their_state={:?}",
            self.our_state,
            self.their_state
        );
        if self.our_state == State::Done
            && self.their_state == State::Done
            && self.keepalive
            && !self.send_failed
        {
            // Get ready for another request/response cycle.
            self.our_state = State::Idle;
            self.their_state = State::Idle;
            self.decoder = BodyDecoder::Empty;
            true
        } else {
            self.close().await;
            false
        }
    }

    pub(crate) async fn close(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            writer.close().await;
        }
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn is_connection_dropped(&mut self) -> bool {
        self.reader.is_connection_dropped()
    }
}

impl std::fmt::Debug for Http1Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Http1Engine")
            .field("our_state", &self.our_state)
            .field("their_state", &self.their_state)
            .field("closed", &self.closed)
            .finish()
    }
}

async fn send_body_task(
    mut writer: Writer,
    head: Vec<u8>,
    mut chunks: BodyChunks,
    chunked: bool,
    timeout: Option<Duration>,
    flag: Arc<TimeoutFlag>,
) -> (Writer, Result<(), SendBodyError>) {
    let result = drive_send(&mut writer, head, &mut chunks, chunked, timeout, &flag).await;
    // Whatever happened, the sending half is finished: only reads may
    // enforce a deadline from here on.
    flag.set_read_mode();
    (writer, result)
}

async fn drive_send(
    writer: &mut Writer,
    head: Vec<u8>,
    chunks: &mut BodyChunks,
    chunked: bool,
    timeout: Option<Duration>,
    flag: &TimeoutFlag,
) -> Result<(), SendBodyError> {
    writer
        .write(&head, timeout, Some(flag))
        .await
        .map_err(SendBodyError::Io)?;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(SendBodyError::User)?;
        if chunk.is_empty() {
            continue;
        }
        trace!("send_data data=Data({} bytes)", chunk.len());
        if chunked {
            let framed = format!("{:x}\r\n", chunk.len());
            writer
                .write(framed.as_bytes(), timeout, Some(flag))
                .await
                .map_err(SendBodyError::Io)?;
            writer
                .write(&chunk, timeout, Some(flag))
                .await
                .map_err(SendBodyError::Io)?;
            writer
                .write(b"\r\n", timeout, Some(flag))
                .await
                .map_err(SendBodyError::Io)?;
        } else {
            writer
                .write(&chunk, timeout, Some(flag))
                .await
                .map_err(SendBodyError::Io)?;
        }
    }

    if chunked {
        writer
            .write(b"0\r\n\r\n", timeout, Some(flag))
            .await
            .map_err(SendBodyError::Io)?;
    }
    trace!("send_event event=EndOfMessage");
    Ok(())
}

pub(crate) fn parse_head(buf: &mut BytesMut) -> Result<Option<ResponseHead>, Error> {
    let (head, len) = {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut headers);
        match parsed.parse(&buf[..]) {
            Ok(httparse::Status::Complete(len)) => {
                let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                    .map_err(Error::protocol)?;
                let version = match parsed.version {
                    Some(0) => Version::HTTP_10,
                    _ => Version::HTTP_11,
                };
                let reason = parsed
                    .reason
                    .filter(|r| !r.is_empty())
                    .map(str::to_owned);
                let mut map = HeaderMap::with_capacity(parsed.headers.len());
                for h in parsed.headers.iter() {
                    let name = HeaderName::from_bytes(h.name.as_bytes())
                        .map_err(Error::protocol)?;
                    let value = HeaderValue::from_bytes(h.value).map_err(Error::protocol)?;
                    map.append(name, value);
                }
                (
                    ResponseHead {
                        status,
                        version,
                        reason,
                        headers: map,
                    },
                    len,
                )
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_SIZE {
                    return Err(Error::protocol("response head exceeds size limit"));
                }
                return Ok(None);
            }
            Err(e) => return Err(Error::protocol(e)),
        }
    };
    buf.advance(len);
    Ok(Some(head))
}

impl BodyDecoder {
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, Error> {
        match self {
            BodyDecoder::Empty => Ok(Decoded::Complete),
            BodyDecoder::Length(remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::Complete);
                }
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                Ok(Decoded::Chunk(buf.split_to(take).freeze()))
            }
            BodyDecoder::UntilEof => {
                if buf.is_empty() {
                    Ok(Decoded::NeedMore)
                } else {
                    let len = buf.len();
                    Ok(Decoded::Chunk(buf.split_to(len).freeze()))
                }
            }
            BodyDecoder::Chunked(phase) => decode_chunked(phase, buf),
        }
    }
}

fn decode_chunked(phase: &mut ChunkPhase, buf: &mut BytesMut) -> Result<Decoded, Error> {
    loop {
        match phase {
            ChunkPhase::Size => {
                let Some(pos) = find_crlf(buf) else {
                    if buf.len() > 256 {
                        return Err(Error::protocol("chunk size line too long"));
                    }
                    return Ok(Decoded::NeedMore);
                };
                let line = buf.split_to(pos + 2);
                let line = &line[..pos];
                let digits = line
                    .split(|&b| b == b';')
                    .next()
                    .unwrap_or_default();
                let digits =
                    std::str::from_utf8(digits).map_err(|_| Error::protocol("bad chunk size"))?;
                let size = u64::from_str_radix(digits.trim(), 16)
                    .map_err(|_| Error::protocol("bad chunk size"))?;
                *phase = if size == 0 {
                    ChunkPhase::Trailers
                } else {
                    ChunkPhase::Data(size)
                };
            }
            ChunkPhase::Data(remaining) => {
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let take = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= take as u64;
                if *remaining == 0 {
                    *phase = ChunkPhase::DataEnd;
                }
                return Ok(Decoded::Chunk(buf.split_to(take).freeze()));
            }
            ChunkPhase::DataEnd => {
                if buf.len() < 2 {
                    return Ok(Decoded::NeedMore);
                }
                if &buf[..2] != b"\r\n" {
                    return Err(Error::protocol("missing CRLF after chunk data"));
                }
                buf.advance(2);
                *phase = ChunkPhase::Size;
            }
            ChunkPhase::Trailers => {
                let Some(pos) = find_crlf(buf) else {
                    return Ok(Decoded::NeedMore);
                };
                let empty = pos == 0;
                buf.advance(pos + 2);
                if empty {
                    *phase = ChunkPhase::Complete;
                    return Ok(Decoded::Complete);
                }
            }
            ChunkPhase::Complete => return Ok(Decoded::Complete),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
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
