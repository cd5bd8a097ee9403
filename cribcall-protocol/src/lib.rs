//! CribCall Protocol Implementation
//!
//! This library implements the CribCall secure pairing and
//! control-channel protocol: device identity and fingerprint-pinned
//! trust, numeric-comparison and one-time-token pairing, and two
//! interchangeable mutually authenticated transports (WebSocket-over-TLS
//! and QUIC) carrying length-framed JSON control messages.

pub mod canonical;
pub mod frame;
pub mod identity;
pub mod message;
pub mod pairing;
pub mod tls;
pub mod transport;
pub mod trust;

mod error;

pub use error::{ProtocolError, Result};
pub use frame::{encode_frame, FrameDecoder, MAX_FRAME_LEN};
pub use identity::{certificate_fingerprint, normalize_fingerprint, Identity};
pub use message::{ControlMessage, StreamType};
pub use pairing::{PairingClient, PairingEngine, PairingFailure};
pub use tls::ServerPin;
pub use transport::{
    connect, listen, ConnectionInfo, ListenerConfig, TransportConnection, TransportKind,
    TransportListener,
};
pub use trust::{MemoryTrustStore, TrustStore, TrustedPeer};

/// Protocol version we implement
pub const PROTOCOL_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
