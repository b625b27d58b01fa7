//! Tunnels arbitrary TCP byte streams as sequences of HTTP request/response
//! pairs.
//!
//! A [`Conn`] dials the remote proxy exactly once through the caller-supplied
//! [`Config::dial_proxy`] callback and then speaks HTTP/1.1 over that stream:
//! bytes written to the conn are batched into POST requests built by
//! [`Config::new_request`], and the body of each response carries whatever the
//! proxy has buffered in the other direction. The logical destination travels
//! in the `X-Enproxy-Dest-Addr` header; the proxy end owns the real outbound
//! connection.
//!
//! [`intercept`] is the server-side entry point for a local HTTP proxy: it
//! answers an inbound CONNECT, waits for the hijacked connection, and splices
//! it onto a fresh tunnel stream.

mod conn;
mod intercept;

pub use conn::Conn;
pub use intercept::intercept;

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::HeaderName;
use hyper::{Method, Request};
use tokio::io::{AsyncRead, AsyncWrite};

/// Connection identifier, assigned by the client end of the tunnel.
pub static X_ENPROXY_ID: HeaderName = HeaderName::from_static("x-enproxy-id");
/// Logical destination (`host:port`) the proxy should relay bytes to.
pub static X_ENPROXY_DEST_ADDR: HeaderName = HeaderName::from_static("x-enproxy-dest-addr");
/// Marks the final request of a conn, or a response carrying the remote EOF.
pub static X_ENPROXY_EOF: HeaderName = HeaderName::from_static("x-enproxy-eof");

/// How long a conn gathers outbound bytes before flushing them as a request.
/// Doubles as the poll cadence while the conn is read-only.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(15);

/// A conn with no traffic in either direction for this long is torn down.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(70);

pub(crate) const MAX_FRAME_BYTES: usize = 32 * 1024;

/// Anything a tunnel can ride on: a TCP stream, a TLS stream, an in-memory
/// pipe in tests.
pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BoxedStream = Box<dyn ProxyStream>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Opens the transport to the proxy. The argument is the logical destination
/// address, for implementations that care; dialers for fronted setups ignore
/// it and always connect to their configured endpoint.
pub type DialProxyFn = Arc<dyn Fn(&str) -> BoxFuture<io::Result<BoxedStream>> + Send + Sync>;

/// Builds one encapsulation request. `upstream_host` is the host the request
/// should be addressed to; `None` means the implementation's configured
/// default (for fronted setups, the real origin).
pub type NewRequestFn = Arc<
    dyn Fn(Option<&str>, Method, Full<Bytes>) -> hyper::http::Result<Request<Full<Bytes>>>
        + Send
        + Sync,
>;

/// Everything a [`Conn`] needs to reach its proxy.
#[derive(Clone)]
pub struct Config {
    pub dial_proxy: DialProxyFn,
    pub new_request: NewRequestFn,
    pub flush_interval: Duration,
    pub idle_timeout: Duration,
}

impl Config {
    pub fn new(dial_proxy: DialProxyFn, new_request: NewRequestFn) -> Self {
        Self {
            dial_proxy,
            new_request,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

pub(crate) fn io_err<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::Other, err)
}
