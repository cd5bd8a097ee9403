//! Trust store: paired-peer records keyed by certificate fingerprint
//!
//! The fingerprint (SHA-256 of the DER certificate, lowercase hex) is the
//! sole basis for trust decisions. At most one record exists per
//! fingerprint; `upsert` refreshes pairing results in place.
//!
//! [`MemoryTrustStore`] is the in-process implementation; persistence is
//! an external collaborator that hands the peer list in at startup and
//! receives snapshots back.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::identity::normalize_fingerprint;

/// A peer that completed pairing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrustedPeer {
    /// Remote device id.
    pub device_id: String,
    /// Human-readable name chosen during pairing.
    pub display_name: String,
    /// Certificate fingerprint, normalized lowercase hex. Uniquely
    /// identifies the peer within the store.
    pub fingerprint: String,
    /// DER certificate bytes, when captured during pairing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_der: Option<Vec<u8>>,
    /// Push delivery token, updated by the control-message handler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub push_token: Option<String>,
}

/// Trait for checking and managing peer trust state.
///
/// Implementations must be `Send + Sync`: the store is shared across the
/// accept loop, TLS verifiers, and the pairing service.
pub trait TrustStore: Send + Sync {
    fn is_trusted(&self, fingerprint: &str) -> bool;

    fn get(&self, fingerprint: &str) -> Option<TrustedPeer>;

    /// Insert or refresh a peer record (keyed by fingerprint).
    fn upsert(&self, peer: TrustedPeer);

    /// Remove a peer; returns the removed record if present.
    fn remove(&self, fingerprint: &str) -> Option<TrustedPeer>;

    /// Update the stored push token for a peer. Returns false if the
    /// peer is unknown.
    fn set_push_token(&self, fingerprint: &str, token: Option<String>) -> bool;

    /// Consistent snapshot of all peers.
    fn snapshot(&self) -> Vec<TrustedPeer>;

    /// The trusted fingerprint set, for listener construction.
    fn fingerprints(&self) -> HashSet<String> {
        self.snapshot().into_iter().map(|p| p.fingerprint).collect()
    }
}

/// In-memory trust store backed by `RwLock<HashMap>`.
#[derive(Default)]
pub struct MemoryTrustStore {
    peers: RwLock<HashMap<String, TrustedPeer>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from a persisted peer list.
    pub fn with_peers(peers: impl IntoIterator<Item = TrustedPeer>) -> Self {
        let store = Self::new();
        for peer in peers {
            store.upsert(peer);
        }
        store
    }
}

impl TrustStore for MemoryTrustStore {
    fn is_trusted(&self, fingerprint: &str) -> bool {
        self.peers
            .read()
            .unwrap()
            .contains_key(&normalize_fingerprint(fingerprint))
    }

    fn get(&self, fingerprint: &str) -> Option<TrustedPeer> {
        self.peers
            .read()
            .unwrap()
            .get(&normalize_fingerprint(fingerprint))
            .cloned()
    }

    fn upsert(&self, mut peer: TrustedPeer) {
        peer.fingerprint = normalize_fingerprint(&peer.fingerprint);
        self.peers
            .write()
            .unwrap()
            .insert(peer.fingerprint.clone(), peer);
    }

    fn remove(&self, fingerprint: &str) -> Option<TrustedPeer> {
        self.peers
            .write()
            .unwrap()
            .remove(&normalize_fingerprint(fingerprint))
    }

    fn set_push_token(&self, fingerprint: &str, token: Option<String>) -> bool {
        match self
            .peers
            .write()
            .unwrap()
            .get_mut(&normalize_fingerprint(fingerprint))
        {
            Some(peer) => {
                peer.push_token = token;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self) -> Vec<TrustedPeer> {
        self.peers.read().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(fingerprint: &str) -> TrustedPeer {
        TrustedPeer {
            device_id: format!("dev-{fingerprint}"),
            display_name: "Phone".into(),
            fingerprint: fingerprint.into(),
            certificate_der: None,
            push_token: None,
        }
    }

    #[test]
    fn empty_store_trusts_nobody() {
        let store = MemoryTrustStore::new();
        assert!(!store.is_trusted("aabb"));
        assert!(store.get("aabb").is_none());
    }

    #[test]
    fn upsert_and_lookup() {
        let store = MemoryTrustStore::new();
        store.upsert(peer("aabb"));
        assert!(store.is_trusted("aabb"));
        assert!(store.is_trusted("AA:BB"));
        assert_eq!(store.get("aabb").unwrap().display_name, "Phone");
    }

    #[test]
    fn upsert_is_keyed_by_fingerprint() {
        let store = MemoryTrustStore::new();
        store.upsert(peer("aabb"));
        let mut renamed = peer("aabb");
        renamed.display_name = "New Phone".into();
        store.upsert(renamed);

        assert_eq!(store.snapshot().len(), 1);
        assert_eq!(store.get("aabb").unwrap().display_name, "New Phone");
    }

    #[test]
    fn remove_returns_the_record() {
        let store = MemoryTrustStore::new();
        store.upsert(peer("aabb"));
        let removed = store.remove("AA:BB").unwrap();
        assert_eq!(removed.fingerprint, "aabb");
        assert!(!store.is_trusted("aabb"));
    }

    #[test]
    fn push_token_update() {
        let store = MemoryTrustStore::new();
        store.upsert(peer("aabb"));
        assert!(store.set_push_token("aabb", Some("tok-1".into())));
        assert_eq!(store.get("aabb").unwrap().push_token.as_deref(), Some("tok-1"));
        assert!(store.set_push_token("aabb", None));
        assert_eq!(store.get("aabb").unwrap().push_token, None);
        assert!(!store.set_push_token("ffff", Some("x".into())));
    }

    #[test]
    fn fingerprints_reflect_snapshot() {
        let store = MemoryTrustStore::with_peers([peer("aa"), peer("bb")]);
        let fps = store.fingerprints();
        assert!(fps.contains("aa") && fps.contains("bb"));
        assert_eq!(fps.len(), 2);
    }
}
