//! Comparison-code and pairing-key derivation
//!
//! Both pairing parties run x25519 ECDH between their exchange keys, then
//! expand the shared secret with HKDF-SHA-256 and a fixed protocol info
//! string into 32 bytes: the first 3 bytes (24-bit big-endian integer mod
//! 1,000,000) become the 6-digit comparison code, the remaining 29 bytes
//! the pairing key. Neither the shared secret nor the pairing key ever
//! crosses the wire — only an HMAC computed with the key does.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::wire::PairTranscript;

type HmacSha256 = Hmac<Sha256>;

/// HKDF info string; bump the suffix on incompatible derivation changes.
const PAIRING_HKDF_INFO: &[u8] = b"cribcall-pairing-v1";

/// Pairing key length: 32 derived bytes minus the 3 code bytes.
pub const PAIRING_KEY_LEN: usize = 29;

/// Output of the pairing derivation.
#[derive(Clone)]
pub struct PairingSecret {
    /// 6 ASCII digits, zero padded.
    pub comparison_code: String,
    /// Key for the confirmation HMAC. Never transmitted.
    pub pairing_key: [u8; PAIRING_KEY_LEN],
}

impl std::fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key bytes intentionally not printed.
        f.debug_struct("PairingSecret")
            .field("comparison_code", &self.comparison_code)
            .finish_non_exhaustive()
    }
}

/// Expand an ECDH shared secret into the comparison code and pairing key.
pub fn derive_pairing_secret(shared_secret: &[u8; 32]) -> PairingSecret {
    let hk = Hkdf::<Sha256>::new(None, shared_secret);
    let mut okm = [0u8; 32];
    hk.expand(PAIRING_HKDF_INFO, &mut okm)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    let code_value =
        u32::from_be_bytes([0, okm[0], okm[1], okm[2]]) % 1_000_000;
    let comparison_code = format!("{code_value:06}");

    let mut pairing_key = [0u8; PAIRING_KEY_LEN];
    pairing_key.copy_from_slice(&okm[3..]);

    PairingSecret {
        comparison_code,
        pairing_key,
    }
}

/// HMAC-SHA-256 over the canonical transcript bytes.
pub fn compute_auth_tag(pairing_key: &[u8], transcript: &PairTranscript) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(pairing_key)
        .expect("HMAC accepts any key length");
    mac.update(&transcript.canonical_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Constant-time comparison of a submitted tag against the expected one.
pub fn verify_auth_tag(pairing_key: &[u8], transcript: &PairTranscript, tag: &[u8]) -> bool {
    let expected = compute_auth_tag(pairing_key, transcript);
    constant_time_eq::constant_time_eq(&expected, tag)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn transcript() -> PairTranscript {
        PairTranscript {
            session_id: "sess".into(),
            remote_device_id: "remote".into(),
            remote_cert_fingerprint: "aa".into(),
            host_cert_fingerprint: "bb".into(),
        }
    }

    #[test]
    fn both_key_orders_derive_identical_secret() {
        let a = Identity::generate("a").unwrap();
        let b = Identity::generate("b").unwrap();

        let ab = derive_pairing_secret(&a.diffie_hellman(&b.exchange_public()));
        let ba = derive_pairing_secret(&b.diffie_hellman(&a.exchange_public()));

        assert_eq!(ab.comparison_code, ba.comparison_code);
        assert_eq!(ab.pairing_key, ba.pairing_key);
    }

    #[test]
    fn comparison_code_is_six_digits() {
        let a = Identity::generate("a").unwrap();
        let b = Identity::generate("b").unwrap();
        let secret = derive_pairing_secret(&a.diffie_hellman(&b.exchange_public()));

        assert_eq!(secret.comparison_code.len(), 6);
        assert!(secret
            .comparison_code
            .chars()
            .all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn code_is_zero_padded() {
        // Value 7 must render as 000007; force it through the formatter.
        let code = format!("{:06}", 7u32);
        assert_eq!(code, "000007");
    }

    #[test]
    fn auth_tag_verifies_and_rejects_tamper() {
        let secret = derive_pairing_secret(&[9u8; 32]);
        let t = transcript();
        let tag = compute_auth_tag(&secret.pairing_key, &t);
        assert!(verify_auth_tag(&secret.pairing_key, &t, &tag));

        let mut tampered = t.clone();
        tampered.host_cert_fingerprint = "cc".into();
        assert!(!verify_auth_tag(&secret.pairing_key, &tampered, &tag));

        let mut bad_tag = tag.clone();
        bad_tag[0] ^= 0x01;
        assert!(!verify_auth_tag(&secret.pairing_key, &t, &bad_tag));
    }

    #[test]
    fn different_shared_secrets_yield_different_keys() {
        let one = derive_pairing_secret(&[1u8; 32]);
        let two = derive_pairing_secret(&[2u8; 32]);
        assert_ne!(one.pairing_key, two.pairing_key);
    }
}
