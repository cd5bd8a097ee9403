//! Host-side pairing engine
//!
//! Implements both trust-establishment flows:
//!
//! 1. **Numeric comparison** — `init` derives the comparison code and
//!    pairing key from an x25519 exchange; the host user confirms the
//!    code out of band (`user_confirm`/`user_reject`); `confirm`
//!    validates the remote's HMAC over the canonical transcript. The
//!    remote polls `confirm` and receives `pending` until the host user
//!    has acted.
//! 2. **One-time token** — a 32-byte random token with a 5-minute expiry
//!    is shown as a QR payload; redemption is single-use and needs no
//!    user confirmation.
//!
//! The engine owns only in-memory state. Persisting the resulting
//! [`TrustedPeer`] records is the caller's concern.

use std::collections::HashMap;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::identity::{certificate_fingerprint, normalize_fingerprint, Identity};
use crate::trust::TrustedPeer;

use super::derive::{derive_pairing_secret, verify_auth_tag};
use super::session::{PairingSession, SESSION_TTL_SECS};
use super::wire::{
    MonitorDescriptor, PairConfirmRequest, PairInitRequest, PairInitResponse, PairOutcome,
    PairTokenRequest,
};

/// One-time-token time-to-live.
pub const TOKEN_TTL_SECS: i64 = 300;

/// Why a pairing step failed. `Pending` is a legitimate wait state, not
/// a failure; it is grouped here because it shares the wire taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingFailure {
    NoActiveToken,
    TokenExpired,
    InvalidToken,
    SessionNotFound,
    SessionExpired,
    Pending,
    AuthValidationFailed,
}

impl PairingFailure {
    /// Stable wire code.
    pub fn code(&self) -> &'static str {
        match self {
            PairingFailure::NoActiveToken => "no_active_token",
            PairingFailure::TokenExpired => "token_expired",
            PairingFailure::InvalidToken => "invalid_token",
            PairingFailure::SessionNotFound => "session_not_found",
            PairingFailure::SessionExpired => "session_expired",
            PairingFailure::Pending => "pending",
            PairingFailure::AuthValidationFailed => "auth_validation_failed",
        }
    }

    /// Human-actionable reason string.
    pub fn describe(&self) -> &'static str {
        match self {
            PairingFailure::NoActiveToken => "no pairing token is active",
            PairingFailure::TokenExpired => "token expired",
            PairingFailure::InvalidToken => "invalid token",
            PairingFailure::SessionNotFound => "pairing session not found",
            PairingFailure::SessionExpired => "pairing session expired",
            PairingFailure::Pending => "waiting for confirmation",
            PairingFailure::AuthValidationFailed => "codes did not match",
        }
    }
}

impl std::fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// A successfully established pairing.
#[derive(Debug, Clone)]
pub struct PairingAccepted {
    /// Record to insert into the trust store.
    pub peer: TrustedPeer,
    /// Host identity returned to the remote.
    pub monitor: MonitorDescriptor,
}

/// Result of a confirm poll.
#[derive(Debug, Clone)]
pub enum ConfirmResult {
    Accepted(Box<PairingAccepted>),
    Pending,
    Rejected(PairingFailure),
}

impl ConfirmResult {
    pub fn to_outcome(&self) -> PairOutcome {
        match self {
            ConfirmResult::Accepted(accepted) => PairOutcome::accepted(accepted.monitor.clone()),
            ConfirmResult::Pending => PairOutcome::pending(),
            ConfirmResult::Rejected(failure) => PairOutcome::rejected(failure.describe()),
        }
    }
}

/// An issued one-time pairing token.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    /// base64url token bytes; this is the QR payload.
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Host-side pairing state machine.
pub struct PairingEngine {
    identity: std::sync::Arc<Identity>,
    monitor_name: String,
    sessions: HashMap<String, PairingSession>,
    active_token: Option<IssuedToken>,
}

impl PairingEngine {
    pub fn new(identity: std::sync::Arc<Identity>, monitor_name: impl Into<String>) -> Self {
        Self {
            identity,
            monitor_name: monitor_name.into(),
            sessions: HashMap::new(),
            active_token: None,
        }
    }

    /// Start a numeric-comparison session.
    ///
    /// Returns the wire response for the remote plus the comparison code
    /// to surface to the host's user.
    pub fn init(&mut self, request: &PairInitRequest) -> Result<(PairInitResponse, String)> {
        self.init_at(request, Utc::now())
    }

    pub fn init_at(
        &mut self,
        request: &PairInitRequest,
        now: DateTime<Utc>,
    ) -> Result<(PairInitResponse, String)> {
        self.sweep_expired(now);

        let remote_public = decode_public_key(&request.identity_public_key)?;
        let remote_cert = BASE64
            .decode(&request.certificate_der)
            .map_err(|e| ProtocolError::InvalidMessage(format!("bad certificate encoding: {e}")))?;
        let remote_fingerprint = certificate_fingerprint(&remote_cert);

        let shared = self.identity.diffie_hellman(&remote_public);
        let secret = derive_pairing_secret(&shared);
        let comparison_code = secret.comparison_code.clone();

        let session_id = uuid::Uuid::new_v4().to_string();
        let session = PairingSession::new(
            session_id.clone(),
            request.device_id.clone(),
            request.device_name.clone(),
            remote_public,
            remote_cert,
            remote_fingerprint,
            secret,
            now,
        );

        info!(
            session_id = %session_id,
            remote = %request.device_id,
            "pairing session started"
        );
        self.sessions.insert(session_id.clone(), session);

        let response = PairInitResponse {
            pairing_session_id: session_id,
            monitor_public_key: BASE64.encode(self.identity.exchange_public()),
            expires_in_sec: SESSION_TTL_SECS as u64,
        };
        Ok((response, comparison_code))
    }

    /// The host user confirmed the comparison code for a session.
    pub fn user_confirm(&mut self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.confirmed = true;
                info!(session_id = %session_id, "pairing confirmed by user");
                true
            }
            None => false,
        }
    }

    /// The host user rejected the comparison code for a session.
    pub fn user_reject(&mut self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(session) => {
                session.rejected = true;
                info!(session_id = %session_id, "pairing rejected by user");
                true
            }
            None => false,
        }
    }

    /// Comparison code for an active session (for the host UI).
    pub fn comparison_code(&self, session_id: &str) -> Option<&str> {
        self.sessions
            .get(session_id)
            .map(|s| s.comparison_code.as_str())
    }

    /// Handle one confirm poll from the remote.
    pub fn confirm(&mut self, request: &PairConfirmRequest) -> ConfirmResult {
        self.confirm_at(request, Utc::now())
    }

    pub fn confirm_at(&mut self, request: &PairConfirmRequest, now: DateTime<Utc>) -> ConfirmResult {
        let Some(session) = self.sessions.get(&request.session_id) else {
            return ConfirmResult::Rejected(PairingFailure::SessionNotFound);
        };

        if session.is_expired(now) {
            self.sessions.remove(&request.session_id);
            return ConfirmResult::Rejected(PairingFailure::SessionExpired);
        }

        if session.rejected {
            self.sessions.remove(&request.session_id);
            return ConfirmResult::Rejected(PairingFailure::AuthValidationFailed);
        }

        if !session.confirmed {
            // Host user has not acted yet; the remote keeps polling.
            return ConfirmResult::Pending;
        }

        // The tag only proves key possession over whatever transcript the
        // remote sent, so every binding field must match our own view.
        let transcript = &request.transcript;
        let binding_ok = transcript.session_id == session.session_id
            && transcript.remote_device_id == session.remote_device_id
            && normalize_fingerprint(&transcript.remote_cert_fingerprint)
                == session.remote_fingerprint
            && normalize_fingerprint(&transcript.host_cert_fingerprint)
                == self.identity.fingerprint();

        let tag = BASE64.decode(&request.auth_tag).unwrap_or_default();
        let tag_ok = binding_ok && verify_auth_tag(&session.pairing_key, transcript, &tag);

        let session = self
            .sessions
            .remove(&request.session_id)
            .expect("session present, checked above");

        if !tag_ok {
            warn!(
                session_id = %request.session_id,
                remote = %session.remote_device_id,
                "pairing auth tag validation failed"
            );
            return ConfirmResult::Rejected(PairingFailure::AuthValidationFailed);
        }

        info!(
            session_id = %request.session_id,
            remote = %session.remote_device_id,
            fingerprint = %session.remote_fingerprint,
            "pairing accepted"
        );

        ConfirmResult::Accepted(Box::new(PairingAccepted {
            peer: TrustedPeer {
                device_id: session.remote_device_id,
                display_name: session.display_name,
                fingerprint: session.remote_fingerprint,
                certificate_der: Some(session.remote_certificate_der),
                push_token: None,
            },
            monitor: self.monitor_descriptor(),
        }))
    }

    /// Issue a fresh one-time token, replacing any previous one.
    pub fn issue_token(&mut self) -> IssuedToken {
        self.issue_token_at(Utc::now())
    }

    pub fn issue_token_at(&mut self, now: DateTime<Utc>) -> IssuedToken {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let token = IssuedToken {
            token: BASE64_URL.encode(bytes),
            expires_at: now + Duration::seconds(TOKEN_TTL_SECS),
        };
        debug!(expires_at = %token.expires_at, "issued pairing token");
        self.active_token = Some(token.clone());
        token
    }

    /// Redeem a one-time token.
    ///
    /// The active token is invalidated on the first redemption attempt
    /// regardless of outcome.
    pub fn redeem_token(
        &mut self,
        request: &PairTokenRequest,
    ) -> std::result::Result<PairingAccepted, PairingFailure> {
        self.redeem_token_at(request, Utc::now())
    }

    pub fn redeem_token_at(
        &mut self,
        request: &PairTokenRequest,
        now: DateTime<Utc>,
    ) -> std::result::Result<PairingAccepted, PairingFailure> {
        // Single use: cleared before any validation result is returned.
        let Some(active) = self.active_token.take() else {
            return Err(PairingFailure::NoActiveToken);
        };

        if now >= active.expires_at {
            return Err(PairingFailure::TokenExpired);
        }

        if !constant_time_eq::constant_time_eq(active.token.as_bytes(), request.token.as_bytes()) {
            warn!("pairing token mismatch");
            return Err(PairingFailure::InvalidToken);
        }

        let remote_cert = BASE64
            .decode(&request.identity.certificate_der)
            .map_err(|_| PairingFailure::InvalidToken)?;
        let fingerprint = certificate_fingerprint(&remote_cert);

        info!(
            remote = %request.identity.device_id,
            fingerprint = %fingerprint,
            "token pairing accepted"
        );

        Ok(PairingAccepted {
            peer: TrustedPeer {
                device_id: request.identity.device_id.clone(),
                display_name: request.identity.device_name.clone(),
                fingerprint,
                certificate_der: Some(remote_cert),
                push_token: None,
            },
            monitor: self.monitor_descriptor(),
        })
    }

    /// Number of live sessions (after lazily dropping expired ones).
    pub fn active_sessions(&mut self, now: DateTime<Utc>) -> usize {
        self.sweep_expired(now);
        self.sessions.len()
    }

    fn monitor_descriptor(&self) -> MonitorDescriptor {
        MonitorDescriptor {
            remote_device_id: self.identity.device_id().to_string(),
            monitor_name: self.monitor_name.clone(),
            cert_fingerprint: self.identity.fingerprint().to_string(),
            certificate_der: BASE64.encode(self.identity.certificate_der()),
        }
    }

    fn sweep_expired(&mut self, now: DateTime<Utc>) {
        self.sessions.retain(|id, session| {
            let keep = !session.is_expired(now);
            if !keep {
                debug!(session_id = %id, "pairing session expired");
            }
            keep
        });
    }
}

fn decode_public_key(b64: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(b64)
        .map_err(|e| ProtocolError::InvalidMessage(format!("bad public key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| ProtocolError::InvalidMessage("public key must be 32 bytes".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::client::PairingClient;
    use std::sync::Arc;

    fn host_engine() -> (PairingEngine, Arc<Identity>) {
        let identity = Arc::new(Identity::generate("monitor-1").unwrap());
        (
            PairingEngine::new(identity.clone(), "Nursery Monitor"),
            identity,
        )
    }

    fn remote() -> (PairingClient, Arc<Identity>) {
        let identity = Arc::new(Identity::generate("remote-1").unwrap());
        (PairingClient::new(identity.clone(), "Parent Phone"), identity)
    }

    #[test]
    fn init_yields_matching_codes_on_both_sides() {
        let (mut engine, host_id) = host_engine();
        let (client, _remote_id) = remote();

        let (response, host_code) = engine.init(&client.init_request()).unwrap();
        let pending = client
            .process_init(&response, host_id.fingerprint())
            .unwrap();

        assert_eq!(host_code, pending.comparison_code());
    }

    #[test]
    fn confirm_is_pending_until_user_confirms() {
        let (mut engine, host_id) = host_engine();
        let (client, _) = remote();

        let (response, _) = engine.init(&client.init_request()).unwrap();
        let pending = client
            .process_init(&response, host_id.fingerprint())
            .unwrap();
        let confirm = pending.confirm_request();

        assert!(matches!(engine.confirm(&confirm), ConfirmResult::Pending));
        // Still pending on a second poll.
        assert!(matches!(engine.confirm(&confirm), ConfirmResult::Pending));

        engine.user_confirm(&response.pairing_session_id);
        match engine.confirm(&confirm) {
            ConfirmResult::Accepted(accepted) => {
                assert_eq!(accepted.peer.device_id, "remote-1");
                assert_eq!(
                    accepted.monitor.cert_fingerprint,
                    host_id.fingerprint()
                );
            }
            other => panic!("expected accepted, got {other:?}"),
        }

        // Session is single-shot.
        assert!(matches!(
            engine.confirm(&confirm),
            ConfirmResult::Rejected(PairingFailure::SessionNotFound)
        ));
    }

    #[test]
    fn user_rejection_terminates_the_session() {
        let (mut engine, host_id) = host_engine();
        let (client, _) = remote();

        let (response, _) = engine.init(&client.init_request()).unwrap();
        let pending = client
            .process_init(&response, host_id.fingerprint())
            .unwrap();

        engine.user_reject(&response.pairing_session_id);
        assert!(matches!(
            engine.confirm(&pending.confirm_request()),
            ConfirmResult::Rejected(PairingFailure::AuthValidationFailed)
        ));
        // The session is gone afterwards.
        assert!(matches!(
            engine.confirm(&pending.confirm_request()),
            ConfirmResult::Rejected(PairingFailure::SessionNotFound)
        ));
    }

    #[test]
    fn expired_session_cannot_be_confirmed() {
        let (mut engine, host_id) = host_engine();
        let (client, _) = remote();

        let now = Utc::now();
        let (response, _) = engine.init_at(&client.init_request(), now).unwrap();
        let pending = client
            .process_init(&response, host_id.fingerprint())
            .unwrap();
        engine.user_confirm(&response.pairing_session_id);

        let late = now + Duration::seconds(SESSION_TTL_SECS + 1);
        assert!(matches!(
            engine.confirm_at(&pending.confirm_request(), late),
            ConfirmResult::Rejected(PairingFailure::SessionExpired)
        ));
    }

    #[test]
    fn tampered_tag_is_rejected_after_user_confirm() {
        let (mut engine, host_id) = host_engine();
        let (client, _) = remote();

        let (response, _) = engine.init(&client.init_request()).unwrap();
        let pending = client
            .process_init(&response, host_id.fingerprint())
            .unwrap();
        engine.user_confirm(&response.pairing_session_id);

        let mut confirm = pending.confirm_request();
        confirm.auth_tag = BASE64.encode([0u8; 32]);
        assert!(matches!(
            engine.confirm(&confirm),
            ConfirmResult::Rejected(PairingFailure::AuthValidationFailed)
        ));
    }

    #[test]
    fn transcript_host_fingerprint_mismatch_is_rejected() {
        // A remote that observed a different host fingerprint (MITM) fails
        // even with a correctly computed tag.
        let (mut engine, _host_id) = host_engine();
        let (client, _) = remote();

        let (response, _) = engine.init(&client.init_request()).unwrap();
        let pending = client
            .process_init(&response, "0000000000000000000000000000000000000000000000000000000000000000")
            .unwrap();
        engine.user_confirm(&response.pairing_session_id);

        assert!(matches!(
            engine.confirm(&pending.confirm_request()),
            ConfirmResult::Rejected(PairingFailure::AuthValidationFailed)
        ));
    }

    #[test]
    fn token_flow_round_trip() {
        let (mut engine, _) = host_engine();
        let (client, _) = remote();

        let issued = engine.issue_token();
        let accepted = engine
            .redeem_token(&client.token_request(&issued.token))
            .unwrap();
        assert_eq!(accepted.peer.device_id, "remote-1");
        assert!(accepted.peer.certificate_der.is_some());
    }

    #[test]
    fn token_is_single_use_even_on_failure() {
        let (mut engine, _) = host_engine();
        let (client, _) = remote();

        engine.issue_token();
        assert_eq!(
            engine
                .redeem_token(&client.token_request("wrong-token"))
                .unwrap_err(),
            PairingFailure::InvalidToken
        );
        // The real token no longer works either: single use.
        assert_eq!(
            engine
                .redeem_token(&client.token_request("anything"))
                .unwrap_err(),
            PairingFailure::NoActiveToken
        );
    }

    #[test]
    fn expired_token_is_rejected() {
        let (mut engine, _) = host_engine();
        let (client, _) = remote();

        let now = Utc::now();
        let issued = engine.issue_token_at(now);
        let late = now + Duration::seconds(TOKEN_TTL_SECS + 1);
        assert_eq!(
            engine
                .redeem_token_at(&client.token_request(&issued.token), late)
                .unwrap_err(),
            PairingFailure::TokenExpired
        );
    }

    #[test]
    fn redeem_without_token_fails() {
        let (mut engine, _) = host_engine();
        let (client, _) = remote();
        assert_eq!(
            engine
                .redeem_token(&client.token_request("t"))
                .unwrap_err(),
            PairingFailure::NoActiveToken
        );
    }

    #[test]
    fn expired_sessions_are_swept_lazily() {
        let (mut engine, _) = host_engine();
        let (client, _) = remote();

        let now = Utc::now();
        engine.init_at(&client.init_request(), now).unwrap();
        assert_eq!(engine.active_sessions(now), 1);
        assert_eq!(
            engine.active_sessions(now + Duration::seconds(SESSION_TTL_SECS + 1)),
            0
        );
    }
}
