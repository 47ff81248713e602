//! Outbound transports. Spec §4.2: four variants dialed per
//! `server_type`, each built atop TCP, optional TLS, and optional
//! WebSocket framing, exposing the same streaming interface to the
//! session.
//!
//! Ground: teacher `listener.rs`'s `configure_tls`/rustls usage for the
//! TLS client setup shape (adapted from server-side to client-side
//! `ServerName`-verified connections), enriched with `webpki-roots` the
//! way `jitlabs-sg-mihomo-rust`'s stack does for outbound TLS.

pub mod trojan_gfw;
pub mod trojan_ws;
pub mod v2ray_tcp;
pub mod v2ray_ws;
pub mod ws_stream;

use std::pin::Pin;
use std::sync::Arc;

use pegas_shared::{ServerDescriptor, ServerType};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::codec::Destination;
use crate::error::{OutboundDialError, SessionError, TlsError};

/// Type-erased bidirectional byte stream, the common surface every
/// outbound variant reduces to once TCP/TLS/WS/VMess layering is done.
/// Sessions proxy bytes against this without caring which variant is in
/// play (spec §4.2: "Each variant exposes the same three operations to
/// the session").
pub type BoxedStream = Pin<Box<dyn AsyncReadWrite>>;

pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Send {}
impl<T: AsyncRead + AsyncWrite + Send> AsyncReadWrite for T {}

/// Opens the outbound transport for `server`, writes whatever protocol
/// header the variant requires, and returns a stream ready for
/// bidirectional proxying.
pub async fn dial(server: &ServerDescriptor, dest: &Destination) -> Result<BoxedStream, SessionError> {
    match server.server_type {
        ServerType::TrojanGfw => trojan_gfw::connect(server, dest).await,
        ServerType::TrojanWs => trojan_ws::connect(server, dest).await,
        ServerType::V2rayTcp => v2ray_tcp::connect(server, dest).await,
        ServerType::V2rayWs => v2ray_ws::connect(server, dest).await,
    }
}

/// Plain non-blocking TCP connect to the configured upstream.
pub async fn tcp_connect(server: &ServerDescriptor) -> Result<TcpStream, OutboundDialError> {
    let addr = format!("{}:{}", server.address, server.port);
    TcpStream::connect(&addr)
        .await
        .map_err(|source| OutboundDialError::Connect { addr, source })
}

struct NoVerify;

impl tokio_rustls::rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[tokio_rustls::rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: tokio_rustls::rustls::pki_types::UnixTime,
    ) -> Result<tokio_rustls::rustls::client::danger::ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &tokio_rustls::rustls::pki_types::CertificateDer<'_>,
        _dss: &tokio_rustls::rustls::DigitallySignedStruct,
    ) -> Result<tokio_rustls::rustls::client::danger::HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(tokio_rustls::rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<tokio_rustls::rustls::SignatureScheme> {
        tokio_rustls::rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// TLS-wraps `stream` toward `sni`, with ALPN `h2,http/1.1` (spec §4.2:
/// "ALPN `h2,http/1.1`, SNI=config.sni"). Honors `tls_insecure` to skip
/// certificate verification for self-signed test upstreams.
pub async fn tls_connect(
    stream: TcpStream,
    sni: &str,
    insecure: bool,
) -> Result<TlsStream<TcpStream>, TlsError> {
    let server_name = ServerName::try_from(sni.to_string())
        .map_err(|_| TlsError::InvalidServerName(sni.to_string()))?;

    let mut config = if insecure {
        let mut config = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        config
    } else {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let mut config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        config
    };
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let connector = TlsConnector::from(Arc::new(config));
    connector
        .connect(server_name, stream)
        .await
        .map_err(TlsError::Handshake)
}

/// Boxes a concrete stream into the common [`BoxedStream`] surface.
pub fn boxed<S: AsyncRead + AsyncWrite + Send + 'static>(stream: S) -> BoxedStream {
    Box::pin(stream)
}
