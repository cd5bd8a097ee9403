//! Trust-pinned transport
//!
//! Two interchangeable backends behind one interface: a stream-oriented
//! WebSocket-over-TLS transport and a datagram-oriented QUIC transport.
//! Both provide mutually authenticated, certificate-pinned connections
//! carrying length-framed JSON.
//!
//! A connection whose peer fingerprint is absent from the listener's
//! trust snapshot is still accepted so pairing can proceed; the caller
//! restricts it to pairing traffic and may elevate it in place once the
//! peer enters the trust set — no reconnection required.
//!
//! Listeners carry an immutable trust snapshot. Trust-store changes are
//! picked up by binding a new listener generation while connections
//! accepted by older generations keep running.

pub mod quic;
pub mod websocket;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::identity::Identity;
use crate::tls::ServerPin;

/// Bound on connect + TLS handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Which backend to use. Selected at startup, never branched on at call
/// sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Websocket,
    Quic,
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "websocket" | "ws" => Ok(TransportKind::Websocket),
            "quic" => Ok(TransportKind::Quic),
            other => Err(format!("unknown transport kind: {other}")),
        }
    }
}

/// Immutable facts about an established connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Backend-assigned id (hex / uuid), stable for the connection's life.
    pub connection_id: String,
    /// Verified peer certificate fingerprint, lowercase hex.
    pub peer_fingerprint: String,
    pub remote_addr: SocketAddr,
}

/// One bidirectional, mutually authenticated connection.
///
/// `recv_frame` returns `Ok(None)` on clean close. Exactly one frame is
/// written per `send_frame` call; callers serialize sends.
#[async_trait]
pub trait TransportConnection: Send {
    fn info(&self) -> &ConnectionInfo;

    /// Whether the peer is currently trusted (trust snapshot at accept
    /// time, or pinned connect, or elevated since).
    fn is_trusted(&self) -> bool;

    /// Promote this connection to trusted in place (pairing success).
    fn elevate(&mut self);

    async fn send_frame(&mut self, payload: &[u8]) -> Result<()>;

    async fn recv_frame(&mut self) -> Result<Option<Vec<u8>>>;

    /// Close with a reason surfaced to the peer where the backend allows.
    async fn close(&mut self, reason: &str) -> Result<()>;
}

/// A bound listener generation with a fixed trust snapshot.
#[async_trait]
pub trait TransportListener: Send {
    async fn accept(&mut self) -> Result<Box<dyn TransportConnection>>;

    fn local_addr(&self) -> Result<SocketAddr>;

    /// Begin a new listener generation with an updated trust snapshot.
    ///
    /// Connections accepted by previous generations keep running; only
    /// new accepts see the new snapshot. Completion of this call is what
    /// makes a trust-store mutation externally visible.
    async fn update_trust(&mut self, trusted: HashSet<String>) -> Result<()>;

    /// Stop accepting new connections. Connections already accepted are
    /// unaffected.
    async fn close(&mut self);
}

/// Listener construction parameters.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub bind_addr: SocketAddr,
    /// Trust snapshot for this listener generation (normalized
    /// fingerprints).
    pub trusted: HashSet<String>,
}

/// Bind a listener of the selected backend.
pub async fn listen(
    kind: TransportKind,
    identity: Arc<Identity>,
    config: ListenerConfig,
) -> Result<Box<dyn TransportListener>> {
    match kind {
        TransportKind::Websocket => Ok(Box::new(
            websocket::WsListener::bind(identity, config).await?,
        )),
        TransportKind::Quic => Ok(Box::new(quic::QuicListener::bind(identity, config)?)),
    }
}

/// Connect to a remote listener of the selected backend.
pub async fn connect(
    kind: TransportKind,
    addr: SocketAddr,
    identity: Arc<Identity>,
    pin: ServerPin,
) -> Result<Box<dyn TransportConnection>> {
    match kind {
        TransportKind::Websocket => Ok(Box::new(
            websocket::WsConnection::connect(addr, identity, pin).await?,
        )),
        TransportKind::Quic => Ok(Box::new(
            quic::QuicConnection::connect(addr, identity, pin).await?,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kind_parses() {
        assert_eq!("ws".parse::<TransportKind>(), Ok(TransportKind::Websocket));
        assert_eq!(
            "websocket".parse::<TransportKind>(),
            Ok(TransportKind::Websocket)
        );
        assert_eq!("quic".parse::<TransportKind>(), Ok(TransportKind::Quic));
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }
}
