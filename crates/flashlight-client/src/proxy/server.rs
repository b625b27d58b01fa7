//! The client proxy: a local HTTP listener that relays every request through
//! one of the configured upstream servers.
//!
//! CONNECT requests are hijacked and spliced onto a tunnel stream; everything
//! else is forwarded through the selected server's HTTP client. The server
//! set can be swapped at any time with [`Client::configure`]; traffic already
//! dispatched keeps the handle it was given.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use super::select;
use super::upstream::{error_response, ServerHandle};
use crate::config::ClientConfig;

/// Last-installed configuration and everything derived from it. Swapped as a
/// unit under the client's lock so a request never observes a half-built
/// server set.
struct Installed {
    cfg: ClientConfig,
    servers: Vec<Arc<ServerHandle>>,
    total_weight: u32,
}

/// An HTTP proxy that accepts connections from local programs and relays
/// them via remote upstream servers.
pub struct Client {
    addr: SocketAddr,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    installed: RwLock<Option<Installed>>,
}

impl Client {
    pub fn new(
        addr: SocketAddr,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Self {
        Self {
            addr,
            read_timeout,
            write_timeout,
            installed: RwLock::new(None),
        }
    }

    /// Install a new configuration.
    ///
    /// Callable before or after [`Client::run`], any number of times. A
    /// config structurally equal to the installed one is a no-op: the
    /// existing handles — and with them any state such as TLS session caches
    /// — stay in place. On error nothing is installed and the previous
    /// configuration keeps serving.
    pub fn configure(&self, cfg: ClientConfig) -> Result<(), anyhow::Error> {
        self.configure_with_tunnels(cfg, None)
    }

    /// [`Client::configure`], with explicitly supplied tunnel configurations
    /// for the servers in `cfg` in lieu of building them from each
    /// `ServerInfo`. Mostly useful for testing. The list must align with
    /// `cfg.servers`.
    pub fn configure_with_tunnels(
        &self,
        cfg: ClientConfig,
        tunnels: Option<Vec<Arc<enproxy::Config>>>,
    ) -> Result<(), anyhow::Error> {
        let mut installed = self.installed.write();

        if let Some(current) = installed.as_ref() {
            if current.cfg == cfg {
                debug!("configuration unchanged");
                return Ok(());
            }
        }
        if let Some(tunnels) = &tunnels {
            anyhow::ensure!(
                tunnels.len() == cfg.servers.len(),
                "got {} tunnel configs for {} servers",
                tunnels.len(),
                cfg.servers.len()
            );
        }

        let mut servers = Vec::with_capacity(cfg.servers.len());
        for (i, info) in cfg.servers.iter().enumerate() {
            let tunnel = tunnels.as_ref().map(|tunnels| Arc::clone(&tunnels[i]));
            servers.push(ServerHandle::build(info, cfg.should_dump_headers, tunnel)?);
        }
        let total_weight = servers.iter().map(|server| server.weight()).sum();

        info!(servers = servers.len(), total_weight, "installed configuration");
        *installed = Some(Installed {
            cfg,
            servers,
            total_weight,
        });
        Ok(())
    }

    /// Listen for local HTTP connections until the listener fails.
    pub async fn run(self: Arc<Self>) -> Result<(), anyhow::Error> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("client proxy listening on {}", self.addr);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), anyhow::Error> {
        let mut http = http1::Builder::new();
        http.timer(TokioTimer::new());
        if let Some(timeout) = self.read_timeout {
            http.header_read_timeout(timeout);
        }

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            self.apply_write_timeout(&stream);
            let client = Arc::clone(&self);
            let http = http.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let client = Arc::clone(&client);
                    async move { client.handle(req).await }
                });

                if let Err(err) = http.serve_connection(io, service).with_upgrades().await {
                    debug!(%remote_addr, error = %err, "connection ended with error");
                }
            });
        }
    }

    /// Classify one inbound request and hand it off. One server selection
    /// per request, no retry: a transport failure surfaces to the caller.
    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        debug!(method = %req.method(), target = %req.uri(), "handling request");

        let Some(server) = self.select_server(req.headers()) else {
            return Ok(error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "no upstream servers configured",
            ));
        };

        let response = if req.method() == Method::CONNECT {
            enproxy::intercept(server.tunnel_config(), req).await
        } else {
            server.forward(req).await
        };
        Ok(response)
    }

    /// One weighted pick against the current snapshot. The lock is held only
    /// for the pick itself; the returned handle is used outside it.
    pub(crate) fn select_server(&self, headers: &HeaderMap) -> Option<Arc<ServerHandle>> {
        let installed = self.installed.read();
        let current = installed.as_ref()?;
        if current.servers.is_empty() {
            return None;
        }
        let target_qos = select::target_qos(headers);
        Some(Arc::clone(select::pick(
            &current.servers,
            current.total_weight,
            target_qos,
        )))
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> Option<(Vec<Arc<ServerHandle>>, u32)> {
        let installed = self.installed.read();
        installed
            .as_ref()
            .map(|current| (current.servers.clone(), current.total_weight))
    }

    #[cfg(target_os = "linux")]
    fn apply_write_timeout(&self, stream: &TcpStream) {
        if let Some(timeout) = self.write_timeout {
            // TCP_USER_TIMEOUT bounds how long unacknowledged writes may sit
            // before the kernel fails the connection.
            let _ = socket2::SockRef::from(stream).set_tcp_user_timeout(Some(timeout));
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_write_timeout(&self, _stream: &TcpStream) {}
}
