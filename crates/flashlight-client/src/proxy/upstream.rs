//! Per-upstream bundle: the tunnel configuration, an HTTP client that dials
//! through it, and the forwarding path used for non-CONNECT requests.

use std::convert::Infallible;
use std::fmt::Display;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header;
use hyper::rt::ReadBufCursor;
use hyper::{HeaderMap, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tracing::{error, info};

use crate::config::ServerInfo;
use crate::proxy::tls::FrontedDialer;

type TunnelHttpClient = HyperClient<EnproxyConnector, BoxBody<Bytes, hyper::Error>>;

/// One upstream server as the dispatcher sees it: selection metadata plus the
/// two ways of moving bytes through it. Immutable once built; rebuilt only by
/// reconfiguration.
pub struct ServerHandle {
    weight: u32,
    qos: u32,
    tunnel: Arc<enproxy::Config>,
    client: TunnelHttpClient,
    dump_headers: bool,
}

impl ServerHandle {
    /// Build a handle from its configuration, applying weight and timeout
    /// defaults. `tunnel` overrides the tunnel configuration that would
    /// otherwise be derived from `info` (used by tests to stub the
    /// transport).
    pub fn build(
        info: &ServerInfo,
        dump_headers: bool,
        tunnel: Option<Arc<enproxy::Config>>,
    ) -> Result<Arc<Self>, anyhow::Error> {
        let tunnel = match tunnel {
            Some(tunnel) => tunnel,
            None => Arc::new(build_tunnel_config(info)?),
        };

        // Keepalives stay off: some upstreams advertise keepalive but close
        // the connection immediately, which would surface as a spurious error
        // on the next pooled request. HTTPS is unaffected since it rides the
        // CONNECT path where the browser owns the connection.
        let client = HyperClient::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(EnproxyConnector {
                tunnel: Arc::clone(&tunnel),
            });

        Ok(Arc::new(Self {
            weight: info.weight(),
            qos: info.qos,
            tunnel,
            client,
            dump_headers,
        }))
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn qos(&self) -> u32 {
        self.qos
    }

    /// The tunnel configuration, for the CONNECT intercept path.
    pub fn tunnel_config(&self) -> Arc<enproxy::Config> {
        Arc::clone(&self.tunnel)
    }

    /// Forward a plain HTTP request through the tunnel, streaming the
    /// response back verbatim. The upstream proxy expects the real origin in
    /// the request line and headers, so nothing is rewritten.
    pub async fn forward(
        &self,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        let req = req.map(BoxBody::new);
        if self.dump_headers {
            dump_headers(
                "request",
                format_args!("{} {}", req.method(), req.uri()),
                req.headers(),
            );
        }

        match self.client.request(req).await {
            Ok(response) => {
                if self.dump_headers {
                    dump_headers("response", response.status(), response.headers());
                }
                response.map(BoxBody::new)
            }
            Err(err) => {
                error!(error = %err, "upstream request failed");
                error_response(StatusCode::BAD_GATEWAY, "upstream request failed")
            }
        }
    }
}

/// Derive the tunnel configuration for one server: dials go to the fronted
/// endpoint, encapsulation requests are addressed to the real origin.
fn build_tunnel_config(info: &ServerInfo) -> Result<enproxy::Config, anyhow::Error> {
    let dialer = Arc::new(FrontedDialer::new(info)?);
    let origin = info.host.clone();

    let dial_proxy: enproxy::DialProxyFn = Arc::new(move |_addr| {
        let dialer = Arc::clone(&dialer);
        Box::pin(async move {
            let stream = dialer.dial().await?;
            Ok(Box::new(stream) as enproxy::BoxedStream)
        })
    });

    let new_request: enproxy::NewRequestFn = Arc::new(move |upstream_host, method, body| {
        let host = upstream_host.unwrap_or(&origin);
        Request::builder()
            .method(method)
            .uri(format!("http://{host}/"))
            .body(body)
    });

    Ok(enproxy::Config::new(dial_proxy, new_request))
}

/// Connector handing the hyper client tunnel streams instead of TCP
/// connections. The request's authority becomes the logical destination the
/// tunnel carries to the upstream proxy.
#[derive(Clone)]
struct EnproxyConnector {
    tunnel: Arc<enproxy::Config>,
}

impl tower_service::Service<Uri> for EnproxyConnector {
    type Response = TunnelConn;
    type Error = io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<TunnelConn, io::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let tunnel = Arc::clone(&self.tunnel);
        Box::pin(async move {
            let addr = host_addr(&dst).ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("request target must carry a host: {dst}"),
                )
            })?;
            let conn = enproxy::Conn::connect(addr, tunnel).await?;
            Ok(TunnelConn {
                io: TokioIo::new(conn),
            })
        })
    }
}

/// A tunnel stream dressed up for hyper's connection pool.
struct TunnelConn {
    io: TokioIo<enproxy::Conn>,
}

impl hyper::rt::Read for TunnelConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for TunnelConn {
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

impl Connection for TunnelConn {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

/// `host:port` from a request target, defaulting the port from the scheme.
fn host_addr(uri: &Uri) -> Option<String> {
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    });
    Some(format!("{host}:{port}"))
}

/// Log one header block of proxied traffic.
fn dump_headers(direction: &str, line: impl Display, headers: &HeaderMap) {
    info!(
        target: "flashlight_client::headers",
        "{direction} {line}\n{}",
        format_header_block(headers)
    );
}

fn format_header_block(headers: &HeaderMap) -> String {
    let mut block = String::new();
    for (name, value) in headers {
        block.push_str(name.as_str());
        block.push_str(": ");
        block.push_str(value.to_str().unwrap_or("<binary>"));
        block.push('\n');
    }
    block
}

pub fn error_response(
    status: StatusCode,
    message: &str,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(BoxBody::new(
            Full::new(Bytes::from(message.to_string()))
                .map_err(|never: Infallible| match never {}),
        ))
        .unwrap()
}
