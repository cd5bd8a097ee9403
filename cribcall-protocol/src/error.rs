//! Error handling for the CribCall protocol
//!
//! One error type covers the whole protocol crate. Errors are converted
//! from underlying library errors with `thiserror`, and transport-facing
//! variants carry the canonical phrases the control-channel failure
//! classifier keys on ("fingerprint mismatch", "untrusted client",
//! "protocol violation", "idle timeout").

use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur during protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// I/O error (sockets, streams)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TLS error (handshake, configuration, certificate validation)
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate generation error
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// The peer presented a certificate whose fingerprint does not match
    /// the pinned expectation.
    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// The peer's certificate fingerprint is not in the trust set and the
    /// connection attempted non-pairing traffic.
    #[error("untrusted client: {0}")]
    UntrustedClient(String),

    /// The peer violated the wire protocol (malformed frame, disallowed
    /// message type on an untrusted connection).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A frame declared a length beyond the configured maximum.
    #[error("frame too large: {0} bytes (max {1})")]
    FrameTooLarge(usize, usize),

    /// Received a message that is structurally valid JSON but not a known
    /// wire message.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Connect / handshake / send deadline elapsed.
    #[error("idle timeout: {0}")]
    Timeout(String),

    /// The connection was closed (clean close or local dispose).
    #[error("connection closed: {0}")]
    Closed(String),

    /// Transport-level failure that is not one of the specific cases above.
    #[error("transport error: {0}")]
    Transport(String),

    /// Handshake-level failure (WebSocket upgrade, QUIC handshake).
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// Operation attempted in a state that does not allow it.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ProtocolError {
    /// Refine a generic I/O error into a more specific variant where the
    /// error kind allows it.
    pub fn from_io_error(error: std::io::Error, context: &str) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(format!("{context}: {error}")),
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                ProtocolError::Closed(format!("{context}: {error}"))
            }
            _ => ProtocolError::Io(error),
        }
    }

    /// Whether retrying the operation might succeed. Trust and protocol
    /// failures are permanent until the operator intervenes.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Io(_)
                | ProtocolError::Timeout(_)
                | ProtocolError::Closed(_)
                | ProtocolError::Transport(_)
        )
    }

    /// A simplified, actionable message suitable for presentation layers.
    pub fn user_message(&self) -> String {
        match self {
            ProtocolError::FingerprintMismatch { .. } => {
                "Peer's certificate changed — re-pair the devices.".to_string()
            }
            ProtocolError::UntrustedClient(_) => {
                "Device is not paired. Pair it before connecting.".to_string()
            }
            ProtocolError::ProtocolViolation(msg) => {
                format!("Invalid data received: {msg}.")
            }
            ProtocolError::FrameTooLarge(size, max) => {
                format!("Message too large ({size} bytes, max {max} bytes).")
            }
            ProtocolError::Timeout(msg) => {
                format!("Connection timed out: {msg}. Check the network.")
            }
            ProtocolError::Closed(_) => "Connection closed.".to_string(),
            ProtocolError::Tls(e) => format!("Secure connection error: {e}."),
            ProtocolError::Certificate(e) => format!("Certificate error: {e}."),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_refinement() {
        use std::io::{Error, ErrorKind};

        let err = ProtocolError::from_io_error(
            Error::new(ErrorKind::TimedOut, "read timed out"),
            "receiving frame",
        );
        assert!(matches!(err, ProtocolError::Timeout(_)));

        let err = ProtocolError::from_io_error(
            Error::new(ErrorKind::BrokenPipe, "pipe"),
            "sending frame",
        );
        assert!(matches!(err, ProtocolError::Closed(_)));
    }

    #[test]
    fn fingerprint_mismatch_message_contains_phrase() {
        let err = ProtocolError::FingerprintMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(err.to_string().contains("fingerprint mismatch"));
    }

    #[test]
    fn recoverability() {
        assert!(ProtocolError::Timeout("t".into()).is_recoverable());
        assert!(!ProtocolError::UntrustedClient("x".into()).is_recoverable());
        assert!(!ProtocolError::ProtocolViolation("y".into()).is_recoverable());
    }
}
