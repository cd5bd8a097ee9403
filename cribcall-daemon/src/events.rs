//! Daemon events
//!
//! Surfaced to external collaborators (UI, media engine) over a broadcast
//! channel. The daemon core never renders anything itself.

use cribcall_protocol::ControlMessage;
use serde_json::Value;

use crate::failure::Failure;

#[derive(Debug, Clone)]
pub enum DaemonEvent {
    /// A numeric-comparison session started; show this code to the user.
    PairingCode {
        session_id: String,
        device_name: String,
        code: String,
    },
    /// A peer completed pairing and entered the trust store.
    PeerPaired {
        fingerprint: String,
        device_id: String,
        display_name: String,
    },
    /// A peer was unpaired and removed.
    PeerRemoved { fingerprint: String },
    /// A control channel reached Connected.
    ChannelUp {
        fingerprint: String,
        connection_id: String,
    },
    /// A control channel reached a terminal state.
    ChannelDown {
        fingerprint: String,
        connection_id: String,
        failure: Option<Failure>,
    },
    /// WebRTC signaling to hand to the media engine, verbatim.
    Signaling {
        fingerprint: String,
        message: ControlMessage,
    },
    /// Stream start/end/pin request for the media engine.
    StreamRequest {
        fingerprint: String,
        message: ControlMessage,
    },
    /// Effective settings changed via the control channel.
    SettingsUpdated { settings: Value },
}
