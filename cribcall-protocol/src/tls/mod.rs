//! TLS configuration for fingerprint-pinned transports
//!
//! Builds `rustls` client and server configs with the custom verifiers
//! from [`verifier`]: TLS 1.3, ring provider, self-signed identity
//! certificates, no certificate-authority trust anywhere.

pub mod verifier;

use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::pki_types::CertificateDer;
use rustls::server::danger::ClientCertVerifier;

use crate::error::{ProtocolError, Result};
use crate::identity::{certificate_fingerprint, Identity};

pub use verifier::{AnyClientCertVerifier, PinnedServerVerifier, ServerPin};

/// ALPN identifier for the control channel.
pub const CONTROL_ALPN: &[u8] = b"cribcall-ctrl";

/// Build a server config presenting the identity certificate.
///
/// `require_client_cert` decides whether anonymous clients fail the
/// handshake (control listeners) or are admitted without a certificate
/// (the HTTPS side-channel, where pairing endpoints must be reachable by
/// not-yet-provisioned remotes).
pub fn server_tls_config(
    identity: &Identity,
    require_client_cert: bool,
    alpn: Option<&[u8]>,
) -> Result<rustls::ServerConfig> {
    let client_verifier: Arc<dyn ClientCertVerifier> =
        Arc::new(AnyClientCertVerifier::new(require_client_cert));

    let mut config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ProtocolError::Handshake(format!("TLS version config: {e}")))?
    .with_client_cert_verifier(client_verifier)
    .with_single_cert(identity.tls_cert_chain(), identity.tls_private_key())?;

    if let Some(alpn) = alpn {
        config.alpn_protocols = vec![alpn.to_vec()];
    }

    Ok(config)
}

/// Build a client config pinning the server per `pin` and presenting the
/// identity certificate for mutual authentication.
pub fn client_tls_config(
    identity: &Identity,
    pin: ServerPin,
    alpn: Option<&[u8]>,
) -> Result<rustls::ClientConfig> {
    let server_verifier: Arc<dyn ServerCertVerifier> = Arc::new(PinnedServerVerifier::new(pin));

    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(&[&rustls::version::TLS13])
    .map_err(|e| ProtocolError::Handshake(format!("TLS version config: {e}")))?
    .dangerous()
    .with_custom_certificate_verifier(server_verifier)
    .with_client_auth_cert(identity.tls_cert_chain(), identity.tls_private_key())?;

    if let Some(alpn) = alpn {
        config.alpn_protocols = vec![alpn.to_vec()];
    }

    Ok(config)
}

/// Fingerprint of the leaf certificate in a presented chain.
pub fn peer_fingerprint(certs: &[CertificateDer<'_>]) -> Option<String> {
    certs.first().map(|c| certificate_fingerprint(c.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_config_builds() {
        let id = Identity::generate("srv").unwrap();
        assert!(server_tls_config(&id, true, Some(CONTROL_ALPN)).is_ok());
        assert!(server_tls_config(&id, false, None).is_ok());
    }

    #[test]
    fn client_config_builds_for_both_pin_modes() {
        let id = Identity::generate("cli").unwrap();
        assert!(client_tls_config(
            &id,
            ServerPin::Fingerprint("ab".repeat(32)),
            Some(CONTROL_ALPN)
        )
        .is_ok());
        assert!(client_tls_config(&id, ServerPin::AllowUnpinned, None).is_ok());
    }

    #[test]
    fn alpn_is_applied() {
        let id = Identity::generate("srv").unwrap();
        let config = server_tls_config(&id, true, Some(CONTROL_ALPN)).unwrap();
        assert_eq!(config.alpn_protocols, vec![CONTROL_ALPN.to_vec()]);
    }

    #[test]
    fn peer_fingerprint_of_leaf() {
        let id = Identity::generate("peer").unwrap();
        let chain = id.tls_cert_chain();
        assert_eq!(
            peer_fingerprint(&chain).as_deref(),
            Some(id.fingerprint())
        );
        assert_eq!(peer_fingerprint(&[]), None);
    }
}
