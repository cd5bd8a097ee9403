//! Device identity
//!
//! An identity bundles everything a device needs to authenticate itself:
//! a stable device id, an x25519 exchange keypair used by the pairing
//! derivation, a self-signed X.509 certificate for TLS, and the SHA-256
//! fingerprint of the DER-encoded certificate.
//!
//! Trust decisions are made on the fingerprint alone — there is no
//! certificate-authority chain. The fingerprint is lowercase hex of the
//! SHA-256 digest over the DER bytes.
//!
//! Identities are normally supplied by the platform's identity provider
//! and treated as immutable for the process lifetime; [`Identity::generate`]
//! exists for provisioning and tests.

use rcgen::{CertificateParams, DnType, KeyPair, PKCS_ED25519};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::Result;

/// Certificate validity period in days.
const CERT_VALIDITY_DAYS: i64 = 3650;

/// Compute the SHA-256 fingerprint of a DER-encoded certificate as
/// lowercase hex.
pub fn certificate_fingerprint(cert_der: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cert_der);
    hex::encode(hasher.finalize())
}

/// Normalize a fingerprint for comparison (strips separators, lowercases).
pub fn normalize_fingerprint(fp: &str) -> String {
    fp.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect::<String>()
        .to_lowercase()
}

/// A device's local identity. Immutable once created.
pub struct Identity {
    /// Stable device identifier (UUID string).
    device_id: String,
    /// x25519 secret half of the exchange keypair.
    exchange_secret: StaticSecret,
    /// DER-encoded self-signed certificate.
    certificate_der: Vec<u8>,
    /// PKCS#8 DER private key backing the certificate.
    private_key_der: Vec<u8>,
    /// SHA-256 fingerprint of the certificate (lowercase hex).
    fingerprint: String,
}

impl Identity {
    /// Generate a fresh identity: new x25519 exchange keypair and a
    /// self-signed Ed25519 certificate with the device id as Common Name.
    pub fn generate(device_id: impl Into<String>) -> Result<Self> {
        let device_id = device_id.into();

        let key_pair = KeyPair::generate_for(&PKCS_ED25519)?;

        let mut params = CertificateParams::new(Vec::new())?;
        params
            .distinguished_name
            .push(DnType::CommonName, device_id.clone());
        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + time::Duration::days(CERT_VALIDITY_DAYS);

        let cert = params.self_signed(&key_pair)?;
        let certificate_der = cert.der().to_vec();
        let private_key_der = key_pair.serialize_der();

        let exchange_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let fingerprint = certificate_fingerprint(&certificate_der);

        tracing::info!(
            device_id = %device_id,
            fingerprint = %fingerprint,
            "generated identity"
        );

        Ok(Self {
            device_id,
            exchange_secret,
            certificate_der,
            private_key_der,
            fingerprint,
        })
    }

    /// Assemble an identity from parts supplied by an external identity
    /// provider. The fingerprint is always recomputed from the DER bytes.
    pub fn from_parts(
        device_id: impl Into<String>,
        exchange_secret: [u8; 32],
        certificate_der: Vec<u8>,
        private_key_der: Vec<u8>,
    ) -> Self {
        let fingerprint = certificate_fingerprint(&certificate_der);
        Self {
            device_id: device_id.into(),
            exchange_secret: StaticSecret::from(exchange_secret),
            certificate_der,
            private_key_der,
            fingerprint,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// Public half of the exchange keypair.
    pub fn exchange_public(&self) -> [u8; 32] {
        PublicKey::from(&self.exchange_secret).to_bytes()
    }

    /// x25519 Diffie-Hellman with a remote exchange public key.
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = PublicKey::from(*their_public);
        self.exchange_secret
            .diffie_hellman(&their_public)
            .to_bytes()
    }

    /// Certificate chain in the form rustls expects (single self-signed
    /// leaf).
    pub fn tls_cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.certificate_der.clone())]
    }

    /// Private key in the form rustls expects.
    pub fn tls_private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.private_key_der.clone()))
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("device_id", &self.device_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_produces_nonempty_cert_and_fingerprint() {
        let id = Identity::generate("device-1").unwrap();
        assert!(!id.certificate_der().is_empty());
        assert_eq!(id.fingerprint().len(), 64);
        assert!(id.fingerprint().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let id = Identity::generate("device-1").unwrap();
        assert_eq!(
            certificate_fingerprint(id.certificate_der()),
            id.fingerprint()
        );
    }

    #[test]
    fn distinct_identities_have_distinct_fingerprints() {
        let a = Identity::generate("device-a").unwrap();
        let b = Identity::generate("device-b").unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn diffie_hellman_is_symmetric() {
        let a = Identity::generate("device-a").unwrap();
        let b = Identity::generate("device-b").unwrap();

        let ab = a.diffie_hellman(&b.exchange_public());
        let ba = b.diffie_hellman(&a.exchange_public());
        assert_eq!(ab, ba);
    }

    #[test]
    fn normalize_accepts_colon_separated() {
        assert_eq!(normalize_fingerprint("AA:BB:cc"), "aabbcc");
        assert_eq!(normalize_fingerprint("aabbcc"), "aabbcc");
    }

    #[test]
    fn from_parts_recomputes_fingerprint() {
        let gen = Identity::generate("device-x").unwrap();
        let rebuilt = Identity::from_parts(
            "device-x",
            [7u8; 32],
            gen.certificate_der().to_vec(),
            vec![0u8; 8],
        );
        assert_eq!(rebuilt.fingerprint(), gen.fingerprint());
    }
}
