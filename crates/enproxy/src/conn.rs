//! The client end of a tunnel: a full-duplex stream whose far side is a
//! background pump translating bytes into HTTP request/response pairs.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1::SendRequest;
use hyper::header::{self, HeaderValue};
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::time::timeout;
use tracing::debug;

use crate::{io_err, Config, MAX_FRAME_BYTES, X_ENPROXY_DEST_ADDR, X_ENPROXY_EOF, X_ENPROXY_ID};

/// A byte channel to `addr`, carried over the proxy named in the config.
///
/// Behaves like a TCP connection: full-duplex, closable from either side.
/// Dropping it (or shutting down the write half) ends the tunnel after one
/// final EOF-flagged exchange with the proxy.
pub struct Conn {
    io: DuplexStream,
}

impl Conn {
    /// Dial the proxy and start the encapsulation pump.
    ///
    /// Returns as soon as the transport to the proxy is established; the
    /// first encapsulation request goes out when the caller writes (or after
    /// one flush interval, whichever comes first).
    pub async fn connect(addr: impl Into<String>, config: Arc<Config>) -> io::Result<Conn> {
        let addr = addr.into();
        let stream = (config.dial_proxy)(&addr).await?;

        let (sender, driver) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(io_err)?;
        tokio::spawn(async move {
            if let Err(err) = driver.await {
                debug!(error = %err, "proxy transport closed");
            }
        });

        let (local, remote) = tokio::io::duplex(2 * MAX_FRAME_BYTES);
        let id = conn_id();
        tokio::spawn(async move {
            let label = id.clone();
            if let Err(err) = pump(remote, sender, config, id, addr).await {
                debug!(id = %label, error = %err, "tunnel pump ended");
            }
        });

        Ok(Conn { io: local })
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Request/response loop for one conn.
///
/// Each iteration gathers up to one frame of outbound bytes (waiting at most
/// one flush interval), sends it as a request, and writes the response body
/// back into the duplex stream. An empty gather still goes out as a poll so
/// the proxy can deliver server-to-client bytes.
async fn pump(
    mut io: DuplexStream,
    mut sender: SendRequest<Full<Bytes>>,
    config: Arc<Config>,
    id: String,
    addr: String,
) -> io::Result<()> {
    let mut buf = vec![0u8; MAX_FRAME_BYTES];
    let mut last_activity = Instant::now();

    loop {
        let (chunk, local_eof) = match timeout(config.flush_interval, io.read(&mut buf)).await {
            Ok(Ok(0)) => (Bytes::new(), true),
            Ok(Ok(n)) => (Bytes::copy_from_slice(&buf[..n]), false),
            Ok(Err(err)) => return Err(err),
            Err(_) => (Bytes::new(), false),
        };
        if !chunk.is_empty() {
            last_activity = Instant::now();
        } else if !local_eof && last_activity.elapsed() >= config.idle_timeout {
            debug!(id = %id, "tunnel idle timeout");
            return Ok(());
        }

        let request = encapsulate(&config, &id, &addr, chunk, local_eof)?;
        sender.ready().await.map_err(io_err)?;
        let response = sender.send_request(request).await.map_err(io_err)?;
        if !response.status().is_success() {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("proxy answered {}", response.status()),
            ));
        }
        let remote_eof = response.headers().contains_key(&X_ENPROXY_EOF);

        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(io_err)?;
            if let Ok(data) = frame.into_data() {
                if !data.is_empty() {
                    io.write_all(&data).await?;
                    last_activity = Instant::now();
                }
            }
        }

        if local_eof || remote_eof {
            return Ok(());
        }
    }
}

/// Wrap one chunk of outbound bytes in an encapsulation request.
///
/// The request from `new_request` is addressed `http://<host>/`; it goes out
/// origin-form with an explicit `Host` header so an intermediary routes on
/// the host, not on the request target.
fn encapsulate(
    config: &Config,
    id: &str,
    addr: &str,
    chunk: Bytes,
    eof: bool,
) -> io::Result<Request<Full<Bytes>>> {
    let mut request =
        (config.new_request)(None, Method::POST, Full::new(chunk)).map_err(io_err)?;

    if let Some(authority) = request.uri().authority().cloned() {
        let host = HeaderValue::from_str(authority.as_str()).map_err(io_err)?;
        request.headers_mut().insert(header::HOST, host);
        let target = request
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
            .parse::<Uri>()
            .map_err(io_err)?;
        *request.uri_mut() = target;
    }

    let headers = request.headers_mut();
    headers.insert(X_ENPROXY_ID.clone(), HeaderValue::from_str(id).map_err(io_err)?);
    headers.insert(
        X_ENPROXY_DEST_ADDR.clone(),
        HeaderValue::from_str(addr).map_err(io_err)?,
    );
    if eof {
        headers.insert(X_ENPROXY_EOF.clone(), HeaderValue::from_static("true"));
    }

    Ok(request)
}

fn conn_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
