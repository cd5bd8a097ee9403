//! Custom rustls verifiers for fingerprint-pinned trust
//!
//! No certificate-authority chain is ever consulted. The client pins the
//! server to an expected SHA-256 certificate fingerprint (or, during
//! pairing, accepts an unknown server and lets the pairing protocol
//! verify it cryptographically). The server accepts any client
//! certificate at the TLS layer — possession of the key is proven by the
//! handshake signature — and the trust decision against the fingerprint
//! set is made where the message whitelist is enforced, so pairing
//! traffic from unknown peers can still reach the engine.
//!
//! Signature verification is delegated to the rustls ring provider; only
//! chain validation is customized.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, Error as TlsError, SignatureScheme};

use crate::identity::{certificate_fingerprint, normalize_fingerprint};

/// How a client validates the server it is connecting to.
#[derive(Debug, Clone)]
pub enum ServerPin {
    /// Expect this exact certificate fingerprint (lowercase hex).
    Fingerprint(String),
    /// Accept any server certificate. Pairing only: the comparison code
    /// and transcript HMAC verify the server after the fact.
    AllowUnpinned,
}

/// Get the ring provider's supported signature verification algorithms.
fn ring_signature_algorithms() -> &'static rustls::crypto::WebPkiSupportedAlgorithms {
    use std::sync::LazyLock;
    static ALGORITHMS: LazyLock<rustls::crypto::WebPkiSupportedAlgorithms> = LazyLock::new(|| {
        rustls::crypto::ring::default_provider().signature_verification_algorithms
    });
    &ALGORITHMS
}

// ---------------------------------------------------------------------------
// Client-side: verifies the server's certificate
// ---------------------------------------------------------------------------

/// Pins the server certificate by SHA-256 fingerprint.
#[derive(Debug)]
pub struct PinnedServerVerifier {
    pin: ServerPin,
}

impl PinnedServerVerifier {
    pub fn new(pin: ServerPin) -> Self {
        Self { pin }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if let ServerPin::Fingerprint(expected) = &self.pin {
            let expected = normalize_fingerprint(expected);
            let actual = certificate_fingerprint(end_entity.as_ref());
            if actual != expected {
                return Err(TlsError::General(format!(
                    "fingerprint mismatch: expected {expected}, got {actual}"
                )));
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring_signature_algorithms().supported_schemes()
    }
}

// ---------------------------------------------------------------------------
// Server-side: verifies the client's certificate
// ---------------------------------------------------------------------------

/// Accepts any client certificate whose handshake signature checks out.
///
/// With `mandatory = true` (control listeners) a connection without a
/// client certificate fails the handshake; with `mandatory = false`
/// (HTTPS side-channel) anonymous clients are allowed and the subscribe
/// endpoints reject them at the route level.
#[derive(Debug)]
pub struct AnyClientCertVerifier {
    mandatory: bool,
}

impl AnyClientCertVerifier {
    pub fn new(mandatory: bool) -> Self {
        Self { mandatory }
    }
}

impl ClientCertVerifier for AnyClientCertVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // No CA roots — self-signed certificates. Return empty.
        &[]
    }

    fn client_auth_mandatory(&self) -> bool {
        self.mandatory
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, TlsError> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, ring_signature_algorithms())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring_signature_algorithms().supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn cert_of(identity: &Identity) -> CertificateDer<'static> {
        CertificateDer::from(identity.certificate_der().to_vec())
    }

    fn dummy_server_name() -> ServerName<'static> {
        ServerName::try_from("127.0.0.1".to_string()).unwrap()
    }

    #[test]
    fn matching_pin_is_accepted() {
        let id = Identity::generate("srv").unwrap();
        let verifier =
            PinnedServerVerifier::new(ServerPin::Fingerprint(id.fingerprint().to_string()));
        let result = verifier.verify_server_cert(
            &cert_of(&id),
            &[],
            &dummy_server_name(),
            &[],
            UnixTime::now(),
        );
        assert!(result.is_ok());
    }

    #[test]
    fn mismatched_pin_is_rejected_with_canonical_phrase() {
        let srv = Identity::generate("srv").unwrap();
        let other = Identity::generate("other").unwrap();
        let verifier =
            PinnedServerVerifier::new(ServerPin::Fingerprint(other.fingerprint().to_string()));
        let err = verifier
            .verify_server_cert(&cert_of(&srv), &[], &dummy_server_name(), &[], UnixTime::now())
            .unwrap_err();
        assert!(err.to_string().contains("fingerprint mismatch"));
    }

    #[test]
    fn allow_unpinned_accepts_anything() {
        let srv = Identity::generate("srv").unwrap();
        let verifier = PinnedServerVerifier::new(ServerPin::AllowUnpinned);
        assert!(verifier
            .verify_server_cert(&cert_of(&srv), &[], &dummy_server_name(), &[], UnixTime::now())
            .is_ok());
    }

    #[test]
    fn client_verifier_mandatory_flag() {
        assert!(AnyClientCertVerifier::new(true).client_auth_mandatory());
        assert!(!AnyClientCertVerifier::new(false).client_auth_mandatory());
    }
}
