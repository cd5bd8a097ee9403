//! Two-party pairing simulation
//!
//! Drives the host engine and remote client against each other in memory,
//! covering the full numeric-comparison handshake, the one-time-token
//! path, and the trust-store handoff.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use cribcall_protocol::pairing::{ConfirmResult, PairStatus, PairingClient, PairingEngine};
use cribcall_protocol::{Identity, MemoryTrustStore, TrustStore};

fn monitor() -> (PairingEngine, Arc<Identity>) {
    let identity = Arc::new(Identity::generate("monitor-sim").unwrap());
    (
        PairingEngine::new(identity.clone(), "Sim Monitor"),
        identity,
    )
}

fn remote(name: &str) -> (PairingClient, Arc<Identity>) {
    let identity = Arc::new(Identity::generate(name).unwrap());
    (PairingClient::new(identity.clone(), name), identity)
}

#[test]
fn numeric_comparison_end_to_end() {
    let (mut engine, monitor_id) = monitor();
    let (client, remote_id) = remote("remote-sim");
    let trust = MemoryTrustStore::new();

    // Init: both sides derive the same code without exchanging secrets.
    let (response, host_code) = engine.init(&client.init_request()).unwrap();
    let pending = client
        .process_init(&response, monitor_id.fingerprint())
        .unwrap();
    assert_eq!(host_code, pending.comparison_code());
    assert_eq!(host_code.len(), 6);

    // Remote polls before the host user confirmed: pending, repeatedly.
    let confirm = pending.confirm_request();
    for _ in 0..3 {
        assert!(matches!(engine.confirm(&confirm), ConfirmResult::Pending));
    }

    // Host user confirms; the next poll is accepted.
    assert!(engine.user_confirm(&response.pairing_session_id));
    let accepted = match engine.confirm(&confirm) {
        ConfirmResult::Accepted(accepted) => accepted,
        other => panic!("expected accepted, got {other:?}"),
    };

    // The returned monitor descriptor lets the remote pin the host.
    assert_eq!(accepted.monitor.cert_fingerprint, monitor_id.fingerprint());
    let cert = BASE64.decode(&accepted.monitor.certificate_der).unwrap();
    assert_eq!(
        cribcall_protocol::certificate_fingerprint(&cert),
        monitor_id.fingerprint()
    );

    // The host inserts the remote into its trust store.
    trust.upsert(accepted.peer.clone());
    assert!(trust.is_trusted(remote_id.fingerprint()));
    assert_eq!(
        trust.get(remote_id.fingerprint()).unwrap().device_id,
        "remote-sim"
    );
}

#[test]
fn mitm_with_different_exchange_key_shows_different_codes() {
    let (mut engine, _monitor_id) = monitor();
    let (client, _) = remote("remote-sim");
    let (attacker, _) = remote("attacker");

    // The attacker relays the init but substitutes its own exchange key.
    let (response, host_code) = engine.init(&attacker.init_request()).unwrap();
    let victim_view = client
        .process_init(&response, "00".repeat(32).as_str())
        .unwrap();

    // Host derives with the attacker key, victim with its own: the codes
    // the two users see disagree, which is exactly what the visual
    // comparison catches.
    assert_ne!(host_code, victim_view.comparison_code());
}

#[test]
fn token_pairing_end_to_end() {
    let (mut engine, monitor_id) = monitor();
    let (client, remote_id) = remote("qr-remote");
    let trust = MemoryTrustStore::new();

    let issued = engine.issue_token();
    let accepted = engine.redeem_token(&client.token_request(&issued.token)).unwrap();

    assert_eq!(accepted.peer.fingerprint, remote_id.fingerprint());
    assert_eq!(accepted.monitor.cert_fingerprint, monitor_id.fingerprint());

    trust.upsert(accepted.peer);
    assert!(trust.is_trusted(remote_id.fingerprint()));

    // Single use: a second redemption with the same token fails.
    assert!(engine
        .redeem_token(&client.token_request(&issued.token))
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn poll_confirm_drives_engine_to_acceptance() {
    let (mut engine, monitor_id) = monitor();
    let (client, _) = remote("polling-remote");

    let (response, _) = engine.init(&client.init_request()).unwrap();
    let pending = client
        .process_init(&response, monitor_id.fingerprint())
        .unwrap();
    let session_id = response.pairing_session_id.clone();

    // The host user confirms after the second poll.
    let engine = Arc::new(tokio::sync::Mutex::new(engine));
    let polls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let outcome = cribcall_protocol::pairing::poll_confirm(
        pending.confirm_request(),
        {
            let engine = engine.clone();
            let polls = polls.clone();
            let session_id = session_id.clone();
            move |request| {
                let engine = engine.clone();
                let polls = polls.clone();
                let session_id = session_id.clone();
                async move {
                    let mut engine = engine.lock().await;
                    if polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                        engine.user_confirm(&session_id);
                    }
                    Ok(engine.confirm(&request).to_outcome())
                }
            }
        },
        std::time::Duration::from_secs(1),
        std::time::Duration::from_secs(60),
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, PairStatus::Accepted);
    assert_eq!(
        outcome.monitor.unwrap().cert_fingerprint,
        monitor_id.fingerprint()
    );
}
