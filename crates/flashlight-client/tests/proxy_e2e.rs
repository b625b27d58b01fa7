//! End-to-end dispatch through the listener: a CONNECT is hijacked onto the
//! tunnel, a plain GET is forwarded through it. The upstream side is an
//! in-process relay speaking the encapsulation protocol.

use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use flashlight_client::{Client, ClientConfig, ServerInfo};

/// Relay that answers each encapsulation request by echoing its body, like a
/// relay in front of an echo destination.
async fn start_echo_relay() -> SocketAddr {
    async fn echo(req: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let eof = req.headers().contains_key(&enproxy::X_ENPROXY_EOF);
        let body = req.into_body().collect().await.unwrap().to_bytes();
        let mut response = Response::new(Full::new(body));
        if eof {
            response
                .headers_mut()
                .insert(enproxy::X_ENPROXY_EOF.clone(), "true".parse().unwrap());
        }
        Ok(response)
    }

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service_fn(echo))
                    .await;
            });
        }
    });
    addr
}

/// Relay in front of a canned HTTP destination: once a full request head has
/// arrived for a tunnel id, the next response body carries a fixed `200 OK`.
async fn start_http_relay() -> SocketAddr {
    #[derive(Default)]
    struct TunnelState {
        buf: Vec<u8>,
        answered: bool,
    }

    let state: Arc<Mutex<HashMap<String, TunnelState>>> = Arc::new(Mutex::new(HashMap::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let state = Arc::clone(&state);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let state = Arc::clone(&state);
                    async move {
                        let id = req.headers()[&enproxy::X_ENPROXY_ID]
                            .to_str()
                            .unwrap()
                            .to_string();
                        let eof = req.headers().contains_key(&enproxy::X_ENPROXY_EOF);
                        let body = req.into_body().collect().await.unwrap().to_bytes();

                        let reply = {
                            let mut state = state.lock().unwrap();
                            let tunnel = state.entry(id).or_default();
                            tunnel.buf.extend_from_slice(&body);
                            if !tunnel.answered
                                && tunnel.buf.windows(4).any(|w| w == b"\r\n\r\n")
                            {
                                tunnel.answered = true;
                                Bytes::from_static(
                                    b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok",
                                )
                            } else {
                                Bytes::new()
                            }
                        };

                        let mut response = Response::new(Full::new(reply));
                        if eof {
                            response
                                .headers_mut()
                                .insert(enproxy::X_ENPROXY_EOF.clone(), "true".parse().unwrap());
                        }
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// Tunnel config whose transport is a plain TCP connection to the relay.
fn relay_tunnel(relay: SocketAddr) -> Arc<enproxy::Config> {
    let dial_proxy: enproxy::DialProxyFn = Arc::new(move |_addr| {
        Box::pin(async move {
            let stream = TcpStream::connect(relay).await?;
            Ok(Box::new(stream) as enproxy::BoxedStream)
        })
    });
    let new_request: enproxy::NewRequestFn = Arc::new(|host, method, body| {
        Request::builder()
            .method(method)
            .uri(format!("http://{}/", host.unwrap_or("origin.example")))
            .body(body)
    });
    Arc::new(enproxy::Config::new(dial_proxy, new_request))
}

/// Start a proxy client on an ephemeral port, tunnelling through `relay`.
async fn start_proxy(relay: SocketAddr) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = Arc::new(Client::new(addr, None, None));
    let config = ClientConfig {
        servers: vec![ServerInfo {
            host: "origin.example".to_string(),
            port: 443,
            masquerade_as: None,
            root_ca: None,
            insecure_skip_verify: false,
            dial_timeout_millis: 0,
            keep_alive_millis: 0,
            weight: 100,
            qos: 0,
        }],
        should_dump_headers: false,
    };
    client
        .configure_with_tunnels(config, Some(vec![relay_tunnel(relay)]))
        .unwrap();

    tokio::spawn(client.serve(listener));
    addr
}

/// Read from the stream until the end of the HTTP response head.
async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).await.unwrap();
        assert!(n > 0, "connection closed before end of response head");
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn connect_requests_are_intercepted_and_tunnelled() {
    let relay = start_echo_relay().await;
    let proxy = start_proxy(relay).await;

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    browser
        .write_all(b"CONNECT secure.example:443 HTTP/1.1\r\nhost: secure.example:443\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut browser).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got response head: {head}");

    browser.write_all(b"hello through the tunnel").await.unwrap();
    let mut buf = [0u8; 24];
    browser.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello through the tunnel");
}

#[tokio::test]
async fn plain_requests_are_forwarded_through_the_tunnel() {
    let relay = start_http_relay().await;
    let proxy = start_proxy(relay).await;

    let mut browser = TcpStream::connect(proxy).await.unwrap();
    browser
        .write_all(
            b"GET http://origin.example/hello HTTP/1.1\r\nhost: origin.example\r\nconnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut response = Vec::new();
    browser.read_to_end(&mut response).await.unwrap();
    let response = String::from_utf8_lossy(&response);

    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.ends_with("ok"), "got: {response}");
}

#[tokio::test]
async fn without_configured_servers_requests_are_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = Arc::new(Client::new(addr, None, None));
    tokio::spawn(client.serve(listener));

    let mut browser = TcpStream::connect(addr).await.unwrap();
    browser
        .write_all(b"GET http://origin.example/ HTTP/1.1\r\nhost: origin.example\r\n\r\n")
        .await
        .unwrap();

    let head = read_response_head(&mut browser).await;
    assert!(head.starts_with("HTTP/1.1 503"), "got response head: {head}");
}
