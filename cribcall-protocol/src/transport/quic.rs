//! QUIC transport backend
//!
//! Datagram-oriented backend built on quinn. Each connection runs one
//! bidirectional control stream carrying the same length-framed JSON as
//! the WebSocket backend. The client opens the stream and announces it
//! with a keep-alive frame so the server's `accept_bi` resolves promptly.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::frame::{encode_frame, FrameDecoder};
use crate::identity::Identity;
use crate::message::ControlMessage;
use crate::tls::{client_tls_config, peer_fingerprint, server_tls_config, ServerPin, CONTROL_ALPN};

use super::{ConnectionInfo, ListenerConfig, TransportConnection, TransportListener, CONNECT_TIMEOUT};

/// Connections idle longer than this are closed by the transport.
const IDLE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Read chunk size for the control stream.
const READ_CHUNK: usize = 8192;

/// A QUIC control connection (either role).
pub struct QuicConnection {
    /// Client side keeps its endpoint alive for the connection's life.
    _endpoint: Option<quinn::Endpoint>,
    connection: quinn::Connection,
    send: quinn::SendStream,
    recv: quinn::RecvStream,
    info: ConnectionInfo,
    trusted: bool,
    decoder: FrameDecoder,
    pending: VecDeque<Vec<u8>>,
}

impl QuicConnection {
    /// Connect to a remote listener, pinning its certificate per `pin`.
    pub async fn connect(
        addr: SocketAddr,
        identity: Arc<Identity>,
        pin: ServerPin,
    ) -> Result<Self> {
        let trusted = matches!(pin, ServerPin::Fingerprint(_));
        let tls_config = client_tls_config(&identity, pin, Some(CONTROL_ALPN))?;
        let quic_config = quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)
            .map_err(|e| ProtocolError::Handshake(format!("quic client config: {e}")))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(quic_config));
        client_config.transport_config(Arc::new(transport_config()?));

        let bind: SocketAddr = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("valid bind addr"),
            SocketAddr::V6(_) => "[::]:0".parse().expect("valid bind addr"),
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint
            .connect(addr, &addr.ip().to_string())
            .map_err(|e| ProtocolError::Handshake(format!("quic connect to {addr}: {e}")))?;
        let connection = timeout(CONNECT_TIMEOUT, connecting)
            .await
            .map_err(|_| ProtocolError::Timeout(format!("quic handshake with {addr}")))?
            .map_err(|e| ProtocolError::Handshake(format!("quic handshake with {addr}: {e}")))?;

        let peer_fp = peer_fingerprint_of(&connection)?;

        let (mut send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| ProtocolError::Handshake(format!("opening control stream: {e}")))?;

        // Announce the stream; quinn only signals it to the peer once
        // bytes are written.
        let hello = encode_frame(&ControlMessage::Ping.to_payload()?)?;
        send.write_all(&hello)
            .await
            .map_err(|e| ProtocolError::Handshake(format!("announcing control stream: {e}")))?;

        let info = ConnectionInfo {
            connection_id: format!("{:08x}", connection.stable_id()),
            peer_fingerprint: peer_fp,
            remote_addr: addr,
        };
        info!(
            connection_id = %info.connection_id,
            peer = %info.peer_fingerprint,
            "quic connection established"
        );

        Ok(Self {
            _endpoint: Some(endpoint),
            connection,
            send,
            recv,
            info,
            trusted,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        })
    }
}

#[async_trait]
impl TransportConnection for QuicConnection {
    fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    fn is_trusted(&self) -> bool {
        self.trusted
    }

    fn elevate(&mut self) {
        if !self.trusted {
            info!(
                connection_id = %self.info.connection_id,
                peer = %self.info.peer_fingerprint,
                "connection elevated to trusted"
            );
            self.trusted = true;
        }
    }

    async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let frame = encode_frame(payload)?;
        self.send.write_all(&frame).await.map_err(map_write_error)
    }

    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let mut buf = [0u8; READ_CHUNK];
            match self.recv.read(&mut buf).await {
                Ok(Some(n)) => {
                    self.decoder.extend(&buf[..n]);
                    while let Some(frame) = self.decoder.next_frame()? {
                        self.pending.push_back(frame);
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return map_read_error(e),
            }
        }
    }

    async fn close(&mut self, reason: &str) -> Result<()> {
        debug!(
            connection_id = %self.info.connection_id,
            reason,
            "closing quic connection"
        );
        let _ = self.send.finish();
        self.connection
            .close(quinn::VarInt::from_u32(0x100), reason.as_bytes());
        Ok(())
    }
}

fn map_write_error(error: quinn::WriteError) -> ProtocolError {
    use quinn::WriteError;
    match error {
        WriteError::ConnectionLost(e) => map_connection_error(e),
        WriteError::ClosedStream | WriteError::Stopped(_) => {
            ProtocolError::Closed("control stream closed".to_string())
        }
        other => ProtocolError::Transport(format!("quic send: {other}")),
    }
}

fn map_read_error(error: quinn::ReadError) -> Result<Option<Vec<u8>>> {
    use quinn::ReadError;
    match error {
        // A close initiated by the application on either side is a clean
        // end of stream, not a transport failure.
        ReadError::ConnectionLost(quinn::ConnectionError::ApplicationClosed(close)) => {
            debug!(reason = %String::from_utf8_lossy(&close.reason), "peer closed connection");
            Ok(None)
        }
        ReadError::ConnectionLost(e) => Err(map_connection_error(e)),
        ReadError::ClosedStream | ReadError::Reset(_) => Ok(None),
        other => Err(ProtocolError::Transport(format!("quic recv: {other}"))),
    }
}

fn map_connection_error(error: quinn::ConnectionError) -> ProtocolError {
    use quinn::ConnectionError;
    match error {
        ConnectionError::TimedOut => ProtocolError::Timeout("idle timeout".to_string()),
        ConnectionError::ApplicationClosed(close) => ProtocolError::Closed(format!(
            "closed by peer: {}",
            String::from_utf8_lossy(&close.reason)
        )),
        ConnectionError::LocallyClosed => ProtocolError::Closed("locally closed".to_string()),
        other => ProtocolError::Transport(format!("quic: {other}")),
    }
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut config = quinn::TransportConfig::default();
    config.max_idle_timeout(Some(quinn::IdleTimeout::try_from(IDLE_TIMEOUT).map_err(
        |e| ProtocolError::Handshake(format!("idle timeout out of range: {e}")),
    )?));
    Ok(config)
}

fn peer_fingerprint_of(connection: &quinn::Connection) -> Result<String> {
    let identity = connection
        .peer_identity()
        .ok_or_else(|| ProtocolError::Handshake("no peer certificate".to_string()))?;
    let certs = identity
        .downcast::<Vec<CertificateDer<'static>>>()
        .map_err(|_| ProtocolError::Handshake("unexpected peer identity type".to_string()))?;
    peer_fingerprint(&certs)
        .ok_or_else(|| ProtocolError::Handshake("peer certificate chain is empty".to_string()))
}

/// A bound QUIC listener generation.
pub struct QuicListener {
    endpoint: Option<quinn::Endpoint>,
    identity: Arc<Identity>,
    trusted: HashSet<String>,
    local_addr: SocketAddr,
}

impl QuicListener {
    pub fn bind(identity: Arc<Identity>, config: ListenerConfig) -> Result<Self> {
        let endpoint = quinn::Endpoint::server(make_server_config(&identity)?, config.bind_addr)?;
        let local_addr = endpoint.local_addr()?;
        info!(
            addr = %local_addr,
            trusted = config.trusted.len(),
            "quic listener bound"
        );

        Ok(Self {
            endpoint: Some(endpoint),
            identity,
            trusted: config.trusted,
            local_addr,
        })
    }
}

fn make_server_config(identity: &Identity) -> Result<quinn::ServerConfig> {
    let tls_config = server_tls_config(identity, true, Some(CONTROL_ALPN))?;
    let quic_config = quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)
        .map_err(|e| ProtocolError::Handshake(format!("quic server config: {e}")))?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_config));
    server_config.transport_config(Arc::new(transport_config()?));
    Ok(server_config)
}

#[async_trait]
impl TransportListener for QuicListener {
    async fn accept(&mut self) -> Result<Box<dyn TransportConnection>> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or_else(|| ProtocolError::Closed("listener closed".to_string()))?;

        let incoming = endpoint
            .accept()
            .await
            .ok_or_else(|| ProtocolError::Closed("listener closed".to_string()))?;
        let remote_addr = incoming.remote_address();

        let connection = incoming
            .await
            .map_err(|e| ProtocolError::Handshake(format!("quic handshake with {remote_addr}: {e}")))?;
        let peer_fp = peer_fingerprint_of(&connection)?;

        let (send, recv) = timeout(CONNECT_TIMEOUT, connection.accept_bi())
            .await
            .map_err(|_| ProtocolError::Timeout(format!("control stream from {remote_addr}")))?
            .map_err(|e| ProtocolError::Handshake(format!("control stream from {remote_addr}: {e}")))?;

        let trusted = self.trusted.contains(&peer_fp);
        if !trusted {
            warn!(
                remote = %remote_addr,
                peer = %peer_fp,
                "accepted connection from untrusted peer (pairing traffic only)"
            );
        }

        let info = ConnectionInfo {
            connection_id: format!("{:08x}", connection.stable_id()),
            peer_fingerprint: peer_fp,
            remote_addr,
        };
        info!(
            connection_id = %info.connection_id,
            peer = %info.peer_fingerprint,
            trusted,
            "quic connection established"
        );

        Ok(Box::new(QuicConnection {
            _endpoint: None,
            connection,
            send,
            recv,
            info,
            trusted,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn update_trust(&mut self, trusted: HashSet<String>) -> Result<()> {
        self.trusted = trusted;
        if let Some(endpoint) = &self.endpoint {
            // Fresh server crypto generation; the UDP socket and live
            // connections are untouched, only new handshakes see it.
            endpoint.set_server_config(Some(make_server_config(&self.identity)?));
        }
        info!(
            addr = %self.local_addr,
            trusted = self.trusted.len(),
            "quic listener generation updated with new trust set"
        );
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            // Refuse new connections; connections already accepted keep
            // their own handles and continue to run.
            endpoint.set_server_config(None);
        }
        info!(addr = %self.local_addr, "quic listener closed");
    }
}
