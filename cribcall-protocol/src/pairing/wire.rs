//! Pairing wire types
//!
//! Request/response bodies exchanged during pairing. The same shapes ride
//! the HTTPS side-channel and, wrapped in control messages, a
//! not-yet-trusted control connection. Field names are camelCase on the
//! wire for compatibility with existing remotes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::canonicalize;

/// Remote identity material submitted when starting either pairing flow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairInitRequest {
    /// Remote device id (UUID string).
    pub device_id: String,
    /// Human-readable remote name shown in the confirmation UI.
    pub device_name: String,
    /// Remote's x25519 exchange public key, base64.
    pub identity_public_key: String,
    /// Remote's certificate, base64 DER.
    pub certificate_der: String,
}

/// Response to a successful init step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairInitResponse {
    pub pairing_session_id: String,
    /// Monitor's x25519 exchange public key, base64.
    pub monitor_public_key: String,
    pub expires_in_sec: u64,
}

/// Transcript bound into the confirmation HMAC.
///
/// Canonicalized (sorted keys) before the HMAC is computed so both sides
/// hash identical bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairTranscript {
    pub session_id: String,
    pub remote_device_id: String,
    pub remote_cert_fingerprint: String,
    pub host_cert_fingerprint: String,
}

impl PairTranscript {
    /// Canonical JSON bytes of the transcript — the exact HMAC input.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let value: Value =
            serde_json::to_value(self).expect("transcript serialization cannot fail");
        canonicalize(&value).into_bytes()
    }
}

/// Confirmation step: the remote proves possession of the derived pairing
/// key via an HMAC over the canonical transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairConfirmRequest {
    pub session_id: String,
    pub transcript: PairTranscript,
    /// HMAC-SHA-256 tag, base64.
    pub auth_tag: String,
}

/// One-time-token redemption: token possession replaces the interactive
/// confirmation step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairTokenRequest {
    /// The out-of-band token, base64url.
    pub token: String,
    #[serde(flatten)]
    pub identity: PairInitRequest,
}

/// Terminal / wait states of a confirm or token request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PairStatus {
    Accepted,
    Rejected,
    Pending,
}

/// Host identity returned to the remote on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MonitorDescriptor {
    pub remote_device_id: String,
    pub monitor_name: String,
    pub cert_fingerprint: String,
    /// Monitor certificate, base64 DER.
    pub certificate_der: String,
}

/// Outcome of a confirm or token request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairOutcome {
    pub status: PairStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub monitor: Option<MonitorDescriptor>,
}

impl PairOutcome {
    pub fn pending() -> Self {
        Self {
            status: PairStatus::Pending,
            reason: None,
            monitor: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            status: PairStatus::Rejected,
            reason: Some(reason.into()),
            monitor: None,
        }
    }

    pub fn accepted(monitor: MonitorDescriptor) -> Self {
        Self {
            status: PairStatus::Accepted,
            reason: None,
            monitor: Some(monitor),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_canonical_bytes_are_key_order_stable() {
        let t = PairTranscript {
            session_id: "s1".into(),
            remote_device_id: "r1".into(),
            remote_cert_fingerprint: "aa".into(),
            host_cert_fingerprint: "bb".into(),
        };
        let bytes = t.canonical_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        // Keys appear sorted in the canonical form.
        let host_pos = text.find("hostCertFingerprint").unwrap();
        let session_pos = text.find("sessionId").unwrap();
        assert!(host_pos < session_pos);
        assert_eq!(bytes, t.canonical_bytes());
    }

    #[test]
    fn outcome_accepted_flattens_monitor_fields() {
        let outcome = PairOutcome::accepted(MonitorDescriptor {
            remote_device_id: "mon-1".into(),
            monitor_name: "Nursery".into(),
            cert_fingerprint: "cc".into(),
            certificate_der: "ZGVy".into(),
        });
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "accepted");
        assert_eq!(json["monitorName"], "Nursery");
        assert!(json.get("monitor").is_none());
    }

    #[test]
    fn outcome_pending_omits_reason() {
        let json = serde_json::to_value(PairOutcome::pending()).unwrap();
        assert_eq!(json["status"], "pending");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn token_request_flattens_identity() {
        let req = PairTokenRequest {
            token: "tok".into(),
            identity: PairInitRequest {
                device_id: "d".into(),
                device_name: "Phone".into(),
                identity_public_key: "cGs=".into(),
                certificate_der: "Y2VydA==".into(),
            },
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["token"], "tok");
        assert_eq!(json["deviceId"], "d");
        let back: PairTokenRequest = serde_json::from_value(json).unwrap();
        assert_eq!(back, req);
    }
}
