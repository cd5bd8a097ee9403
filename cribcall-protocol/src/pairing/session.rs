//! Pairing session state
//!
//! One in-memory record per numeric-comparison attempt, keyed by session
//! id and expiring 60 seconds after init. Destroyed on confirm, reject,
//! or expiry.

use chrono::{DateTime, Duration, Utc};

use super::derive::{PairingSecret, PAIRING_KEY_LEN};

/// Session time-to-live.
pub const SESSION_TTL_SECS: i64 = 60;

/// State of a numeric-comparison pairing attempt on the host side.
#[derive(Debug, Clone)]
pub struct PairingSession {
    pub session_id: String,
    pub remote_device_id: String,
    pub display_name: String,
    pub remote_public_key: [u8; 32],
    pub remote_certificate_der: Vec<u8>,
    pub remote_fingerprint: String,
    /// Surfaced to the host user for visual comparison.
    pub comparison_code: String,
    /// Only an HMAC computed with this ever leaves the process.
    pub(crate) pairing_key: [u8; PAIRING_KEY_LEN],
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Host user confirmed the code match.
    pub confirmed: bool,
    /// Host user rejected the code match.
    pub rejected: bool,
}

impl PairingSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: String,
        remote_device_id: String,
        display_name: String,
        remote_public_key: [u8; 32],
        remote_certificate_der: Vec<u8>,
        remote_fingerprint: String,
        secret: PairingSecret,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id,
            remote_device_id,
            display_name,
            remote_public_key,
            remote_certificate_der,
            remote_fingerprint,
            comparison_code: secret.comparison_code,
            pairing_key: secret.pairing_key,
            created_at: now,
            expires_at: now + Duration::seconds(SESSION_TTL_SECS),
            confirmed: false,
            rejected: false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::derive::derive_pairing_secret;

    fn session(now: DateTime<Utc>) -> PairingSession {
        PairingSession::new(
            "s1".into(),
            "remote".into(),
            "Phone".into(),
            [1u8; 32],
            vec![1, 2, 3],
            "aa".into(),
            derive_pairing_secret(&[4u8; 32]),
            now,
        )
    }

    #[test]
    fn expires_after_ttl() {
        let now = Utc::now();
        let s = session(now);
        assert!(!s.is_expired(now));
        assert!(!s.is_expired(now + Duration::seconds(SESSION_TTL_SECS - 1)));
        assert!(s.is_expired(now + Duration::seconds(SESSION_TTL_SECS)));
    }
}
