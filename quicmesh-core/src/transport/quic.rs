//! QUIC transport on `quinn`.
//!
//! One endpoint per node, bound to the listen port, serves both directions.
//! Packets travel as length-prefixed frames on unidirectional streams; each
//! side lazily opens a single send stream per connection.

use crate::socket::bind_udp;
use crate::transport::codec::{read_frame, write_frame};
use crate::transport::{Connection, ConnectionRef, Handshake, PacketStream, Transport};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{ClientConfig, Endpoint, EndpointConfig, IdleTimeout, ServerConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const SERVER_NAME: &str = "quicmesh";
const ALPN: &[u8] = b"quicmesh/1";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);
const IDLE_TIMEOUT_MS: u32 = 60_000;

pub fn ensure_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn transport_config() -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(IDLE_TIMEOUT_MS))));
    transport.keep_alive_interval(Some(KEEP_ALIVE_INTERVAL));
    transport.max_concurrent_bidi_streams(0_u8.into());
    transport
}

fn server_config() -> io::Result<ServerConfig> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec![SERVER_NAME.into()]).map_err(io::Error::other)?;
    let cert_chain = vec![CertificateDer::from(cert.der().to_vec())];
    let key = PrivatePkcs8KeyDer::from(key_pair.serialize_der());
    let mut tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key.into())
        .map_err(io::Error::other)?;
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let crypto = QuicServerConfig::try_from(tls).map_err(io::Error::other)?;
    let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport_config()));
    Ok(server_config)
}

fn client_config() -> io::Result<ClientConfig> {
    let mut tls = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(AnyServerCert::new())
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];
    let crypto = QuicClientConfig::try_from(tls).map_err(io::Error::other)?;
    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()));
    Ok(client_config)
}

fn connection_error<E: std::error::Error + Send + Sync + 'static>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, e)
}

pub struct QuicTransport {
    endpoint: Endpoint,
}

impl QuicTransport {
    /// Bind the node endpoint. Inbound sessions are only accepted when
    /// `accept_inbound` is set; dialing works either way.
    pub fn bind(addr: SocketAddr, accept_inbound: bool) -> io::Result<Self> {
        ensure_crypto_provider();
        let socket = bind_udp(addr, true)?;
        let server_config = if accept_inbound {
            Some(server_config()?)
        } else {
            None
        };
        let mut endpoint = Endpoint::new(
            EndpointConfig::default(),
            server_config,
            socket,
            Arc::new(quinn::TokioRuntime),
        )?;
        endpoint.set_default_client_config(client_config()?);
        log::debug!(
            "quic endpoint bound on {:?}, inbound {}",
            endpoint.local_addr(),
            accept_inbound
        );
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    async fn dial(&self, remote: SocketAddr) -> io::Result<ConnectionRef> {
        let connecting = self
            .endpoint
            .connect(remote, SERVER_NAME)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let connection = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("dial {remote} timeout")))?
            .map_err(connection_error)?;
        Ok(Arc::new(QuicConnection::new(connection)))
    }

    async fn accept(&self) -> Option<Box<dyn Handshake>> {
        let incoming = self.endpoint.accept().await?;
        Some(Box::new(QuicHandshake { incoming }))
    }

    fn close(&self) {
        self.endpoint.close(VarInt::from_u32(0), b"shutdown");
    }
}

struct QuicHandshake {
    incoming: quinn::Incoming,
}

#[async_trait]
impl Handshake for QuicHandshake {
    fn remote_addr(&self) -> SocketAddr {
        self.incoming.remote_address()
    }

    async fn complete(self: Box<Self>) -> io::Result<ConnectionRef> {
        let remote = self.incoming.remote_address();
        let connecting = self.incoming.accept().map_err(connection_error)?;
        let connection = tokio::time::timeout(HANDSHAKE_TIMEOUT, connecting)
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("handshake with {remote} timeout"),
                )
            })?
            .map_err(connection_error)?;
        Ok(Arc::new(QuicConnection::new(connection)))
    }
}

pub struct QuicConnection {
    connection: quinn::Connection,
    send: Mutex<Option<quinn::SendStream>>,
}

impl QuicConnection {
    pub fn new(connection: quinn::Connection) -> Self {
        Self {
            connection,
            send: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connection for QuicConnection {
    fn stable_id(&self) -> usize {
        self.connection.stable_id()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    async fn send_bytes(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.send.lock().await;
        if guard.is_none() {
            let stream = self.connection.open_uni().await.map_err(connection_error)?;
            guard.replace(stream);
        }
        if let Some(stream) = guard.as_mut() {
            if let Err(e) = write_frame(stream, buf).await {
                // reopen on the next packet
                guard.take();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn accept_stream(&self) -> io::Result<Box<dyn PacketStream>> {
        let recv = self
            .connection
            .accept_uni()
            .await
            .map_err(connection_error)?;
        Ok(Box::new(QuicPacketStream {
            recv,
            buf: BytesMut::with_capacity(2048),
        }))
    }

    async fn closed(&self) {
        let reason = self.connection.closed().await;
        log::debug!(
            "connection {} to {} closed: {reason}",
            self.connection.stable_id(),
            self.connection.remote_address()
        );
    }

    fn close(&self) {
        self.connection.close(VarInt::from_u32(0), b"closed");
    }
}

struct QuicPacketStream {
    recv: quinn::RecvStream,
    buf: BytesMut,
}

#[async_trait]
impl PacketStream for QuicPacketStream {
    async fn recv_packet(&mut self) -> io::Result<Option<Bytes>> {
        read_frame(&mut self.recv, &mut self.buf).await
    }
}

/// Accepts any server certificate; peers are identified by configuration,
/// not by PKI. Handshake signatures are still checked.
#[derive(Debug)]
struct AnyServerCert {
    crypto: Arc<rustls::crypto::CryptoProvider>,
}

impl AnyServerCert {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            crypto: Arc::new(rustls::crypto::ring::default_provider()),
        })
    }
}

impl rustls::client::danger::ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.crypto.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.crypto.signature_verification_algorithms.supported_schemes()
    }
}
