//! WebSocket-over-TLS transport backend
//!
//! Stream-oriented backend: TCP + mutual TLS (fingerprint-pinned), then a
//! WebSocket upgrade. Frames keep their 4-byte length prefix inside
//! binary WebSocket messages, so the wire format is identical across
//! backends and frames may span or share WebSocket messages.

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::frame::{encode_frame, FrameDecoder};
use crate::identity::Identity;
use crate::tls::{client_tls_config, peer_fingerprint, server_tls_config, ServerPin};

use super::{ConnectionInfo, ListenerConfig, TransportConnection, TransportListener, CONNECT_TIMEOUT};

/// A WebSocket control connection (either role).
pub struct WsConnection {
    ws: WebSocketStream<TlsStream<TcpStream>>,
    info: ConnectionInfo,
    trusted: bool,
    decoder: FrameDecoder,
    pending: VecDeque<Vec<u8>>,
}

impl WsConnection {
    /// Connect to a remote listener, pinning its certificate per `pin`.
    pub async fn connect(
        addr: SocketAddr,
        identity: Arc<Identity>,
        pin: ServerPin,
    ) -> Result<Self> {
        let trusted = matches!(pin, ServerPin::Fingerprint(_));
        let tls_config = client_tls_config(&identity, pin, None)?;
        let connector = TlsConnector::from(Arc::new(tls_config));

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("connecting to {addr}")))??;

        let server_name = rustls::pki_types::ServerName::IpAddress(addr.ip().into());
        let tls = timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {addr}")))?
            .map_err(|e| ProtocolError::Handshake(format!("TLS handshake with {addr}: {e}")))?;

        let peer_fp = {
            let (_, session) = tls.get_ref();
            session
                .peer_certificates()
                .and_then(peer_fingerprint)
                .ok_or_else(|| {
                    ProtocolError::Handshake("server presented no certificate".to_string())
                })?
        };

        let url = format!("ws://{addr}/control");
        let (ws, _response) = timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::client_async(url.as_str(), TlsStream::from(tls)),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(format!("WebSocket upgrade with {addr}")))?
        .map_err(map_ws_error)?;

        let info = ConnectionInfo {
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            peer_fingerprint: peer_fp,
            remote_addr: addr,
        };
        info!(
            connection_id = %info.connection_id,
            peer = %info.peer_fingerprint,
            "websocket connection established"
        );

        Ok(Self {
            ws,
            info,
            trusted,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        })
    }

    fn from_accepted(
        ws: WebSocketStream<TlsStream<TcpStream>>,
        info: ConnectionInfo,
        trusted: bool,
    ) -> Self {
        Self {
            ws,
            info,
            trusted,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl TransportConnection for WsConnection {
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
        self.ws
            .send(Message::Binary(frame.into()))
            .await
            .map_err(map_ws_error)
    }

    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(Some(frame));
            }
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            match self.ws.next().await {
                None => return Ok(None),
                Some(Ok(Message::Binary(data))) => {
                    self.decoder.extend(&data);
                    while let Some(frame) = self.decoder.next_frame()? {
                        self.pending.push_back(frame);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        connection_id = %self.info.connection_id,
                        reason = ?frame,
                        "peer closed websocket"
                    );
                    return Ok(None);
                }
                // tungstenite answers pings internally
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    return Err(ProtocolError::ProtocolViolation(
                        "text frame on control channel".to_string(),
                    ));
                }
                Some(Err(e)) => return Err(map_ws_error(e)),
            }
        }
    }

    async fn close(&mut self, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        // Best effort: the peer may already be gone.
        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!(
                connection_id = %self.info.connection_id,
                "error closing websocket: {e}"
            );
        }
        Ok(())
    }
}

fn map_ws_error(error: tokio_tungstenite::tungstenite::Error) -> ProtocolError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match error {
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            ProtocolError::Closed("websocket closed".to_string())
        }
        WsError::Io(e) => ProtocolError::from_io_error(e, "websocket"),
        WsError::Protocol(e) => ProtocolError::ProtocolViolation(format!("websocket: {e}")),
        WsError::Capacity(e) => ProtocolError::ProtocolViolation(format!("websocket: {e}")),
        other => ProtocolError::Transport(format!("websocket: {other}")),
    }
}

/// A bound WebSocket listener generation.
pub struct WsListener {
    tcp: Option<TcpListener>,
    acceptor: TlsAcceptor,
    trusted: HashSet<String>,
    local_addr: SocketAddr,
}

impl WsListener {
    pub async fn bind(identity: Arc<Identity>, config: ListenerConfig) -> Result<Self> {
        let tls_config = server_tls_config(&identity, true, None)?;
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        let tcp = TcpListener::bind(config.bind_addr).await?;
        let local_addr = tcp.local_addr()?;
        info!(
            addr = %local_addr,
            trusted = config.trusted.len(),
            "websocket listener bound"
        );

        Ok(Self {
            tcp: Some(tcp),
            acceptor,
            trusted: config.trusted,
            local_addr,
        })
    }
}

#[async_trait]
impl TransportListener for WsListener {
    async fn accept(&mut self) -> Result<Box<dyn TransportConnection>> {
        let tcp = self
            .tcp
            .as_ref()
            .ok_or_else(|| ProtocolError::Closed("listener closed".to_string()))?;

        let (stream, remote_addr) = tcp.accept().await?;
        debug!(remote = %remote_addr, "tcp connection accepted");

        let tls = timeout(CONNECT_TIMEOUT, self.acceptor.accept(stream))
            .await
            .map_err(|_| ProtocolError::Timeout(format!("TLS handshake with {remote_addr}")))?
            .map_err(|e| ProtocolError::Handshake(format!("TLS handshake with {remote_addr}: {e}")))?;

        let peer_fp = {
            let (_, session) = tls.get_ref();
            session
                .peer_certificates()
                .and_then(peer_fingerprint)
                .ok_or_else(|| {
                    ProtocolError::Handshake("client presented no certificate".to_string())
                })?
        };

        let ws = timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::accept_async(TlsStream::from(tls)),
        )
        .await
        .map_err(|_| ProtocolError::Timeout(format!("WebSocket upgrade with {remote_addr}")))?
        .map_err(map_ws_error)?;

        let trusted = self.trusted.contains(&peer_fp);
        if !trusted {
            warn!(
                remote = %remote_addr,
                peer = %peer_fp,
                "accepted connection from untrusted peer (pairing traffic only)"
            );
        }

        let info = ConnectionInfo {
            connection_id: uuid::Uuid::new_v4().simple().to_string(),
            peer_fingerprint: peer_fp,
            remote_addr,
        };
        info!(
            connection_id = %info.connection_id,
            peer = %info.peer_fingerprint,
            trusted,
            "websocket connection established"
        );

        Ok(Box::new(WsConnection::from_accepted(ws, info, trusted)))
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.local_addr)
    }

    async fn update_trust(&mut self, trusted: HashSet<String>) -> Result<()> {
        self.trusted = trusted;
        // New socket generation on the same address. Close-then-bind:
        // accepted connections are independent sockets and survive; a
        // closed listening socket frees the port immediately.
        self.tcp.take();
        let tcp = TcpListener::bind(self.local_addr).await?;
        self.local_addr = tcp.local_addr()?;
        self.tcp = Some(tcp);
        info!(
            addr = %self.local_addr,
            trusted = self.trusted.len(),
            "websocket listener rebound with updated trust set"
        );
        Ok(())
    }

    async fn close(&mut self) {
        self.tcp.take();
        info!(addr = %self.local_addr, "websocket listener closed");
    }
}
