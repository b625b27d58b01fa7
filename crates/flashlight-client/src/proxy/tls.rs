//! TLS dialing with host-spoofing semantics.
//!
//! A [`FrontedDialer`] connects to the front endpoint (the masquerade host
//! when one is configured) and verifies the presented chain against that same
//! front hostname, while sending a ClientHello with **no** SNI extension.
//! Fastly cross-checks SNI against the `Host` header of the tunnelled request
//! and answers `400 Bad Request` on a mismatch; since the `Host` header names
//! the real origin and SNI would name the front, SNI has to stay out of the
//! hello entirely.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ClientSessionMemoryCache, Resumption, WebPkiServerVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::ServerInfo;

/// Sessions cached per dialer, so repeated dials to the same front resume.
const SESSION_CACHE_SIZE: usize = 1000;

/// Dials the front endpoint of one upstream server.
///
/// Every dial opens a fresh TCP connection with the configured timeout and
/// keepalive interval, then completes a TLS handshake whose verification is
/// pinned to the front hostname. All dials share one client session cache.
pub struct FrontedDialer {
    front_addr: String,
    server_name: ServerName<'static>,
    connector: TlsConnector,
    dial_timeout: Duration,
    keep_alive: Duration,
}

impl FrontedDialer {
    pub fn new(info: &ServerInfo) -> Result<Self, anyhow::Error> {
        let front = info.front_host();
        let server_name = ServerName::try_from(front.to_string())
            .with_context(|| format!("invalid front host name '{front}'"))?;

        let mut tls = if info.insecure_skip_verify {
            warn!(
                host = %info.host,
                "certificate verification DISABLED for this server (testing only)"
            );
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        } else {
            let roots = Arc::new(trust_roots(info.root_ca.as_deref())?);
            let inner = WebPkiServerVerifier::builder(roots)
                .build()
                .context("building certificate verifier")?;
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(FrontVerifier {
                    front: server_name.clone(),
                    inner,
                }))
                .with_no_client_auth()
        };

        tls.resumption = Resumption::store(Arc::new(ClientSessionMemoryCache::new(
            SESSION_CACHE_SIZE,
        )));
        // No SNI. Verification runs against `server_name` regardless.
        tls.enable_sni = false;

        Ok(Self {
            front_addr: info.front_addr(),
            server_name,
            connector: TlsConnector::from(Arc::new(tls)),
            dial_timeout: info.dial_timeout(),
            keep_alive: info.keep_alive(),
        })
    }

    /// Open an authenticated stream to the front endpoint.
    pub async fn dial(&self) -> io::Result<TlsStream<TcpStream>> {
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&self.front_addr))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dialing {} timed out", self.front_addr),
                )
            })??;

        let keepalive = TcpKeepalive::new()
            .with_time(self.keep_alive)
            .with_interval(self.keep_alive);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;

        debug!(front = %self.front_addr, "dialing upstream front");
        self.connector
            .connect(self.server_name.clone(), stream)
            .await
    }
}

/// Trust pool: the configured CA alone when present, the bundled web-PKI
/// roots otherwise.
fn trust_roots(root_ca: Option<&str>) -> Result<RootCertStore, anyhow::Error> {
    let mut store = RootCertStore::empty();
    match root_ca {
        Some(pem) => {
            let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut pem.as_bytes())
                .collect::<Result<_, _>>()
                .context("parsing root CA PEM")?;
            if certs.is_empty() {
                anyhow::bail!("no certificates found in root CA PEM");
            }
            for cert in certs {
                store.add(cert).context("adding root CA certificate")?;
            }
        }
        None => {
            store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(store)
}

/// Standard web-PKI verification, but always against the front hostname
/// rather than whatever name the connection was opened with. This is what
/// decouples certificate verification from the (absent) SNI and from the
/// logical upstream host.
#[derive(Debug)]
struct FrontVerifier {
    front: ServerName<'static>,
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for FrontVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.front, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// No-op certificate verifier backing `insecure_skip_verify`.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
        ]
    }
}
