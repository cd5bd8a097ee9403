//! Remote-side pairing helpers
//!
//! The remote drives pairing against a host it has not yet pinned: it
//! submits its identity, derives the same comparison code the host shows,
//! and — once its own user confirms — polls `confirm` until the host's
//! user has acted. Host-side confirmation is asynchronous, so `pending`
//! responses are expected and polled through.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tracing::debug;

use crate::error::{ProtocolError, Result};
use crate::identity::{normalize_fingerprint, Identity};

use super::derive::{compute_auth_tag, derive_pairing_secret, PairingSecret};
use super::wire::{
    PairConfirmRequest, PairInitRequest, PairInitResponse, PairOutcome, PairStatus,
    PairTokenRequest, PairTranscript,
};

/// How often the remote polls `confirm`.
pub const CONFIRM_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Overall wall-clock budget for the confirm poll loop.
pub const CONFIRM_POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Remote-side pairing context.
pub struct PairingClient {
    identity: Arc<Identity>,
    device_name: String,
}

impl PairingClient {
    pub fn new(identity: Arc<Identity>, device_name: impl Into<String>) -> Self {
        Self {
            identity,
            device_name: device_name.into(),
        }
    }

    /// Identity material for `init` or token redemption.
    pub fn init_request(&self) -> PairInitRequest {
        PairInitRequest {
            device_id: self.identity.device_id().to_string(),
            device_name: self.device_name.clone(),
            identity_public_key: BASE64.encode(self.identity.exchange_public()),
            certificate_der: BASE64.encode(self.identity.certificate_der()),
        }
    }

    /// Token redemption request for an out-of-band token (QR payload).
    pub fn token_request(&self, token: &str) -> PairTokenRequest {
        PairTokenRequest {
            token: token.to_string(),
            identity: self.init_request(),
        }
    }

    /// Process the host's init response: run the same ECDH + HKDF
    /// derivation and bind the observed host fingerprint into the
    /// transcript. A man in the middle shows up as a comparison-code or
    /// transcript mismatch, never as transmitted secrets.
    pub fn process_init(
        &self,
        response: &PairInitResponse,
        observed_host_fingerprint: &str,
    ) -> Result<PendingPairing> {
        let monitor_public: [u8; 32] = BASE64
            .decode(&response.monitor_public_key)
            .map_err(|e| ProtocolError::InvalidMessage(format!("bad monitor key encoding: {e}")))?
            .try_into()
            .map_err(|_| {
                ProtocolError::InvalidMessage("monitor public key must be 32 bytes".to_string())
            })?;

        let shared = self.identity.diffie_hellman(&monitor_public);
        let secret = derive_pairing_secret(&shared);

        debug!(
            session_id = %response.pairing_session_id,
            "derived comparison code"
        );

        let transcript = PairTranscript {
            session_id: response.pairing_session_id.clone(),
            remote_device_id: self.identity.device_id().to_string(),
            remote_cert_fingerprint: self.identity.fingerprint().to_string(),
            host_cert_fingerprint: normalize_fingerprint(observed_host_fingerprint),
        };

        Ok(PendingPairing { secret, transcript })
    }
}

/// Derived state awaiting host-side confirmation.
pub struct PendingPairing {
    secret: PairingSecret,
    transcript: PairTranscript,
}

impl PendingPairing {
    /// The 6-digit code to show the remote's user.
    pub fn comparison_code(&self) -> &str {
        &self.secret.comparison_code
    }

    /// Build the confirm request carrying the transcript HMAC.
    pub fn confirm_request(&self) -> PairConfirmRequest {
        let tag = compute_auth_tag(&self.secret.pairing_key, &self.transcript);
        PairConfirmRequest {
            session_id: self.transcript.session_id.clone(),
            transcript: self.transcript.clone(),
            auth_tag: BASE64.encode(tag),
        }
    }
}

/// Poll `confirm` until it is terminal.
///
/// `submit` performs one confirm round trip. `pending` responses sleep
/// for `interval` and retry; the loop gives up with a timeout error once
/// `overall_timeout` has elapsed. Transport errors abort immediately —
/// the caller decides whether to restart the flow.
pub async fn poll_confirm<F, Fut>(
    request: PairConfirmRequest,
    mut submit: F,
    interval: Duration,
    overall_timeout: Duration,
) -> Result<PairOutcome>
where
    F: FnMut(PairConfirmRequest) -> Fut,
    Fut: Future<Output = Result<PairOutcome>>,
{
    let deadline = tokio::time::Instant::now() + overall_timeout;

    loop {
        let outcome = submit(request.clone()).await?;
        if outcome.status != PairStatus::Pending {
            return Ok(outcome);
        }

        if tokio::time::Instant::now() + interval >= deadline {
            return Err(ProtocolError::Timeout(
                "pairing confirmation timed out".to_string(),
            ));
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dummy_request() -> PairConfirmRequest {
        PairConfirmRequest {
            session_id: "s".into(),
            transcript: PairTranscript {
                session_id: "s".into(),
                remote_device_id: "r".into(),
                remote_cert_fingerprint: "aa".into(),
                host_cert_fingerprint: "bb".into(),
            },
            auth_tag: "dGFn".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn poll_returns_on_terminal_status() {
        let polls = AtomicUsize::new(0);
        let outcome = poll_confirm(
            dummy_request(),
            |_req| {
                let n = polls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Ok(PairOutcome::pending())
                    } else {
                        Ok(PairOutcome::rejected("codes did not match"))
                    }
                }
            },
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        assert_eq!(outcome.status, PairStatus::Rejected);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_times_out_while_pending() {
        let err = poll_confirm(
            dummy_request(),
            |_req| async { Ok(PairOutcome::pending()) },
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProtocolError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn poll_aborts_on_transport_error() {
        let err = poll_confirm(
            dummy_request(),
            |_req| async { Err(ProtocolError::Transport("socket died".into())) },
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProtocolError::Transport(_)));
    }
}
