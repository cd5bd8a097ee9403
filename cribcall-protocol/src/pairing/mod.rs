//! Device pairing
//!
//! Two trust-establishment flows between a monitor (host) and a remote:
//!
//! - **Numeric comparison**: both sides derive a 6-digit code from an
//!   x25519 exchange; users compare the codes visually; the remote proves
//!   key possession with an HMAC over a canonical transcript.
//! - **One-time token**: possession of a short-lived out-of-band secret
//!   (QR payload) replaces the interactive verification step.
//!
//! On success the host inserts a [`crate::trust::TrustedPeer`] into its
//! trust store and returns its own certificate to the remote; from then
//! on the transport layer pins both directions by fingerprint.

pub mod client;
pub mod derive;
pub mod engine;
pub mod session;
pub mod wire;

pub use client::{poll_confirm, PairingClient, PendingPairing, CONFIRM_POLL_INTERVAL, CONFIRM_POLL_TIMEOUT};
pub use engine::{
    ConfirmResult, IssuedToken, PairingAccepted, PairingEngine, PairingFailure, TOKEN_TTL_SECS,
};
pub use session::{PairingSession, SESSION_TTL_SECS};
pub use wire::{
    MonitorDescriptor, PairConfirmRequest, PairInitRequest, PairInitResponse, PairOutcome,
    PairStatus, PairTokenRequest, PairTranscript,
};
