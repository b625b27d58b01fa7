//! CONNECT interception: hijack an inbound tunnel request and splice it onto
//! a fresh [`Conn`].

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tracing::{debug, warn};

use crate::{Config, Conn};

/// Handle an inbound CONNECT request.
///
/// Dials a tunnel to the requested destination, answers `200 OK`, then pumps
/// bytes between the upgraded client connection and the tunnel until either
/// side closes. The response must be sent before the upgrade completes, so
/// the pumping happens on a spawned task.
pub async fn intercept(
    config: Arc<Config>,
    req: Request<Incoming>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let Some(addr) = connect_addr(req.uri()) else {
        warn!(target_uri = %req.uri(), "rejecting CONNECT without host:port target");
        return text_response(
            StatusCode::BAD_REQUEST,
            "CONNECT target must be host:port",
        );
    };

    let tunnel = match Conn::connect(addr.clone(), config).await {
        Ok(tunnel) => tunnel,
        Err(err) => {
            warn!(%addr, error = %err, "tunnel dial failed");
            return text_response(StatusCode::BAD_GATEWAY, "failed to reach upstream proxy");
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                let mut tunnel = tunnel;
                match tokio::io::copy_bidirectional(&mut client, &mut tunnel).await {
                    Ok((up, down)) => {
                        debug!(%addr, bytes_up = up, bytes_down = down, "tunnel closed")
                    }
                    Err(err) => debug!(%addr, error = %err, "tunnel closed with error"),
                }
            }
            Err(err) => warn!(%addr, error = %err, "CONNECT upgrade failed"),
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .body(BoxBody::new(
            Empty::<Bytes>::new().map_err(|never: Infallible| match never {}),
        ))
        .unwrap()
}

/// Destination of a CONNECT request. Authority-form per RFC 7231 §4.3.6;
/// a missing port defaults to 443 since CONNECT is overwhelmingly TLS.
fn connect_addr(uri: &Uri) -> Option<String> {
    let authority = uri.authority()?;
    match authority.port_u16() {
        Some(_) => Some(authority.to_string()),
        None => Some(format!("{}:443", authority.host())),
    }
}

fn text_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(BoxBody::new(
            Full::new(Bytes::from(message.to_string()))
                .map_err(|never: Infallible| match never {}),
        ))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_addr_keeps_explicit_port() {
        let uri: Uri = "example.com:8443".parse().unwrap();
        assert_eq!(connect_addr(&uri).unwrap(), "example.com:8443");
    }

    #[test]
    fn connect_addr_defaults_to_443() {
        let uri: Uri = "example.com".parse().unwrap();
        assert_eq!(connect_addr(&uri).unwrap(), "example.com:443");
    }

    #[test]
    fn connect_addr_rejects_missing_authority() {
        let uri: Uri = "/no-authority".parse().unwrap();
        assert_eq!(connect_addr(&uri), None);
    }
}
