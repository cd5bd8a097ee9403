//! Control-channel wire messages
//!
//! A closed, tagged set of messages carried inside frames on the pinned
//! control channel. The `type` discriminant is a stable string enum;
//! adding variants is backward compatible, renaming is not.
//!
//! WebRTC signaling payloads are opaque: the channel forwards them
//! verbatim and never interprets their contents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::pairing::wire::{
    PairConfirmRequest, PairInitRequest, PairInitResponse, PairOutcome, PairTokenRequest,
};

/// Media stream kind for stream-signaling messages.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamType {
    Audio,
    Video,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
        }
    }
}

/// All messages that may appear on a control connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Noise detection event fanned out to subscribed remotes.
    NoiseAlert {
        timestamp_ms: i64,
        peak_level: f64,
    },
    /// Ask the monitor to start streaming.
    StreamStart {
        stream_type: StreamType,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_sec: Option<u64>,
    },
    /// Stop an active stream.
    StreamEnd { stream_type: StreamType },
    /// Pin a stream so it survives the auto-stream duration.
    StreamPin {
        stream_type: StreamType,
        pinned: bool,
    },
    /// WebRTC SDP offer, forwarded verbatim.
    WebrtcOffer { payload: Value },
    /// WebRTC SDP answer, forwarded verbatim.
    WebrtcAnswer { payload: Value },
    /// WebRTC ICE candidate, forwarded verbatim.
    WebrtcIce { payload: Value },
    /// Keep-alive probe.
    Ping,
    /// Keep-alive reply.
    Pong,
    /// Remote rotated its push token.
    PushTokenUpdate { token: String, platform: String },
    /// Ask for the monitor's effective settings.
    SettingsGet,
    /// Settings snapshot or update (opaque to the channel).
    SettingsUpdate { settings: Value },
    /// Pairing init over a not-yet-trusted connection.
    PairInit(PairInitRequest),
    /// Reply to `PairInit`.
    PairInitAck(PairInitResponse),
    /// Pairing confirmation attempt.
    PairConfirm(PairConfirmRequest),
    /// Reply to `PairConfirm` (also used for token redemption replies).
    PairConfirmAck(PairOutcome),
    /// One-time-token redemption.
    PairToken(PairTokenRequest),
}

impl ControlMessage {
    /// The wire discriminant, for dispatch and logging.
    pub fn message_type(&self) -> &'static str {
        match self {
            ControlMessage::NoiseAlert { .. } => "noise_alert",
            ControlMessage::StreamStart { .. } => "stream_start",
            ControlMessage::StreamEnd { .. } => "stream_end",
            ControlMessage::StreamPin { .. } => "stream_pin",
            ControlMessage::WebrtcOffer { .. } => "webrtc_offer",
            ControlMessage::WebrtcAnswer { .. } => "webrtc_answer",
            ControlMessage::WebrtcIce { .. } => "webrtc_ice",
            ControlMessage::Ping => "ping",
            ControlMessage::Pong => "pong",
            ControlMessage::PushTokenUpdate { .. } => "push_token_update",
            ControlMessage::SettingsGet => "settings_get",
            ControlMessage::SettingsUpdate { .. } => "settings_update",
            ControlMessage::PairInit(_) => "pair_init",
            ControlMessage::PairInitAck(_) => "pair_init_ack",
            ControlMessage::PairConfirm(_) => "pair_confirm",
            ControlMessage::PairConfirmAck(_) => "pair_confirm_ack",
            ControlMessage::PairToken(_) => "pair_token",
        }
    }

    /// Whether this message may be carried on a connection whose peer is
    /// not (yet) in the trust set. Only pairing traffic and keep-alives
    /// qualify; anything else on an untrusted connection is a protocol
    /// violation.
    pub fn allowed_when_untrusted(&self) -> bool {
        matches!(
            self,
            ControlMessage::Ping
                | ControlMessage::Pong
                | ControlMessage::PairInit(_)
                | ControlMessage::PairInitAck(_)
                | ControlMessage::PairConfirm(_)
                | ControlMessage::PairConfirmAck(_)
                | ControlMessage::PairToken(_)
        )
    }

    /// Serialize to frame payload bytes (UTF-8 JSON).
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse a frame payload.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload)
            .map_err(|e| ProtocolError::InvalidMessage(format!("unparseable control message: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tagged_serialization() {
        let msg = ControlMessage::NoiseAlert {
            timestamp_ms: 1_700_000_000_000,
            peak_level: 72.5,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "noise_alert");
        assert_eq!(json["peak_level"], 72.5);
    }

    #[test]
    fn unit_variants_roundtrip() {
        for msg in [ControlMessage::Ping, ControlMessage::Pong, ControlMessage::SettingsGet] {
            let bytes = msg.to_payload().unwrap();
            assert_eq!(ControlMessage::from_payload(&bytes).unwrap(), msg);
        }
    }

    #[test]
    fn webrtc_payload_is_preserved_verbatim() {
        let payload = json!({"sdp": "v=0...", "mid": 3, "nested": {"k": [1, 2]}});
        let msg = ControlMessage::WebrtcOffer {
            payload: payload.clone(),
        };
        let bytes = msg.to_payload().unwrap();
        match ControlMessage::from_payload(&bytes).unwrap() {
            ControlMessage::WebrtcOffer { payload: p } => assert_eq!(p, payload),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn untrusted_whitelist() {
        let allowed = ControlMessage::Ping;
        assert!(allowed.allowed_when_untrusted());

        let denied = ControlMessage::NoiseAlert {
            timestamp_ms: 0,
            peak_level: 1.0,
        };
        assert!(!denied.allowed_when_untrusted());

        let stream = ControlMessage::StreamStart {
            stream_type: StreamType::Video,
            duration_sec: Some(30),
        };
        assert!(!stream.allowed_when_untrusted());
    }

    #[test]
    fn unknown_type_is_invalid_message() {
        let err =
            ControlMessage::from_payload(br#"{"type":"time_travel"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn discriminant_matches_wire_tag() {
        let msg = ControlMessage::PushTokenUpdate {
            token: "t".into(),
            platform: "android".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], msg.message_type());
    }
}
