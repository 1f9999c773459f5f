//! Establishing transports: direct TCP, Unix domain sockets, and HTTP
//! proxies (absolute-form forwarding for `http://`, CONNECT tunnels for
//! `https://`).

use std::{sync::Arc, time::Duration};

use bytes::BytesMut;
use http::HeaderValue;
use log::{debug, trace};
use rustls::ClientConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use crate::{
    backend::{Backend, Negotiated, TlsHandshake},
    config::Timeout,
    connection::Origin,
    error::Error,
    io::BoxStream,
    proto::h1,
    tls::{self, TlsConfig},
};

/// A proxy this connector routes through.
#[derive(Clone, Debug)]
pub(crate) struct Intercept {
    pub(crate) origin: Origin,
    pub(crate) basic_auth: Option<HeaderValue>,
}

/// An established transport plus what was learned while dialing it.
pub(crate) struct Established {
    pub(crate) io: BoxStream,
    pub(crate) negotiated: Negotiated,
    /// Requests must use absolute-form targets (plain HTTP via a proxy).
    pub(crate) via_proxy: bool,
    /// `Proxy-Authorization` to attach to forwarded requests.
    pub(crate) proxy_auth: Option<HeaderValue>,
}

/// Dials origins on behalf of one pool.
#[derive(Clone)]
pub(crate) struct Connector {
    backend: Backend,
    /// TLS for origin servers, offering the configured ALPN set.
    tls: Arc<ClientConfig>,
    /// TLS for proxy servers themselves: HTTP/1.1 only.
    tls_h1: Arc<ClientConfig>,
    proxy: Option<Intercept>,
    #[cfg(unix)]
    uds: Option<std::path::PathBuf>,
}

impl Connector {
    pub(crate) fn new(
        backend: Backend,
        tls_config: &TlsConfig,
        proxy: Option<Intercept>,
        uds: Option<std::path::PathBuf>,
    ) -> crate::Result<Connector> {
        let tls = tls_config.build()?;
        let tls_h1 = TlsConfig {
            http2: false,
            ..tls_config.clone()
        }
        .build()?;
        #[cfg(not(unix))]
        let _ = &uds;
        Ok(Connector {
            backend,
            tls,
            tls_h1,
            proxy,
            #[cfg(unix)]
            uds,
        })
    }

    fn origin_handshake(&self, host: &str) -> crate::Result<TlsHandshake> {
        Ok(TlsHandshake {
            connector: TlsConnector::from(self.tls.clone()),
            server_name: tls::server_name(host)?,
        })
    }

    fn proxy_handshake(&self, host: &str) -> crate::Result<TlsHandshake> {
        Ok(TlsHandshake {
            connector: TlsConnector::from(self.tls_h1.clone()),
            server_name: tls::server_name(host)?,
        })
    }

    /// Dial a transport for `origin`.
    pub(crate) async fn connect(
        &self,
        origin: &Origin,
        timeout: &Timeout,
    ) -> crate::Result<Established> {
        #[cfg(unix)]
        if let Some(path) = &self.uds {
            trace!("connecting to {origin} via unix socket {}", path.display());
            let tls = origin
                .is_https()
                .then(|| self.origin_handshake(&origin.host))
                .transpose()?;
            let (io, negotiated) = self
                .backend
                .open_uds_stream(path, tls, timeout.connect)
                .await?;
            return Ok(Established {
                io,
                negotiated,
                via_proxy: false,
                proxy_auth: None,
            });
        }

        match &self.proxy {
            None => {
                trace!("connecting to {origin}");
                let tls = origin
                    .is_https()
                    .then(|| self.origin_handshake(&origin.host))
                    .transpose()?;
                let (io, negotiated) = self
                    .backend
                    .open_tcp_stream(&origin.host, origin.port, tls, timeout.connect)
                    .await?;
                Ok(Established {
                    io,
                    negotiated,
                    via_proxy: false,
                    proxy_auth: None,
                })
            }
            Some(proxy) => self.connect_via_proxy(origin, proxy, timeout).await,
        }
    }

    async fn connect_via_proxy(
        &self,
        origin: &Origin,
        proxy: &Intercept,
        timeout: &Timeout,
    ) -> crate::Result<Established> {
        trace!("connecting to {origin} via proxy {}", proxy.origin);
        let tls = proxy
            .origin
            .is_https()
            .then(|| self.proxy_handshake(&proxy.origin.host))
            .transpose()?;
        let (io, _) = self
            .backend
            .open_tcp_stream(&proxy.origin.host, proxy.origin.port, tls, timeout.connect)
            .await?;

        if !origin.is_https() {
            // Plain HTTP is forwarded with absolute-form targets; no
            // tunnel needed.
            return Ok(Established {
                io,
                negotiated: Negotiated::Http11,
                via_proxy: true,
                proxy_auth: proxy.basic_auth.clone(),
            });
        }

        let io = match deadline(
            timeout.connect,
            tunnel(io, origin, proxy.basic_auth.as_ref()),
        )
        .await
        {
            Some(result) => result?,
            None => return Err(Error::connect_timeout()),
        };

        let (io, negotiated) = self
            .backend
            .start_tls(io, self.origin_handshake(&origin.host)?, timeout.connect)
            .await?;
        Ok(Established {
            io,
            negotiated,
            via_proxy: false,
            proxy_auth: None,
        })
    }
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("proxy", &self.proxy)
            .finish()
    }
}

/// Issue a CONNECT request on `io` and wait for a 2xx before handing the
/// stream back for TLS.
async fn tunnel(
    mut io: BoxStream,
    origin: &Origin,
    auth: Option<&HeaderValue>,
) -> crate::Result<BoxStream> {
    let authority = format!("{}:{}", origin.host, origin.port);
    let mut request = Vec::with_capacity(128);
    request.extend_from_slice(format!("CONNECT {authority} HTTP/1.1\r\n").as_bytes());
    request.extend_from_slice(format!("host: {authority}\r\n").as_bytes());
    if let Some(auth) = auth {
        request.extend_from_slice(b"proxy-authorization: ");
        request.extend_from_slice(auth.as_bytes());
        request.extend_from_slice(b"\r\n");
    }
    request.extend_from_slice(b"\r\n");

    io.write_all(&request).await.map_err(Error::proxy)?;

    let mut buf = BytesMut::with_capacity(1024);
    let head = loop {
        if let Some(head) = h1::parse_head(&mut buf).map_err(|e| Error::proxy(e))? {
            break head;
        }
        let mut chunk = [0u8; 1024];
        let n = io.read(&mut chunk).await.map_err(Error::proxy)?;
        if n == 0 {
            return Err(Error::proxy("proxy closed connection during CONNECT"));
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    if !head.status.is_success() {
        debug!("proxy CONNECT refused: {}", head.status);
        return Err(Error::proxy(format!(
            "proxy CONNECT to {authority} failed with status {}",
            head.status
        )));
    }
    trace!("proxy CONNECT to {authority} established");
    Ok(io)
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
