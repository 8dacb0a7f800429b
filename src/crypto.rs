//! # Cryptographic Infrastructure
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification for
//!   DHT records
//! - **TLS**: self-signed Ed25519 certificates for the QUIC host, where the
//!   certificate key determines the peer's [`PeerId`]
//!
//! Certificates are not chained to any CA. A client dials a PeerId, encodes
//! it in the SNI, and accepts the server only if BLAKE3 of the certificate's
//! public key equals that PeerId. Servers require a client certificate with
//! a valid Ed25519 key and learn the caller's PeerId from it.

use std::sync::Arc;

use anyhow::{Context, Result};
use ed25519_dalek::{Signature, VerifyingKey};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Keypair, PeerId};

// ============================================================================
// Signature Error Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
    /// The public key does not hash to the claimed author.
    KeyMismatch,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
            SignatureError::KeyMismatch => write!(f, "public key does not belong to author"),
        }
    }
}

impl std::error::Error for SignatureError {}

// ============================================================================
// Domain-Separated Signatures
// ============================================================================

/// Domain separation prefix for DHT record signatures.
pub const RECORD_SIGNATURE_DOMAIN: &[u8] = b"kadroute-record-v1:";

pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify `signature` over `domain || data` under an Ed25519 public key.
pub fn verify_with_domain(
    public_key: &[u8; 32],
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> std::result::Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SignatureError::InvalidPublicKey)?;

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::VerificationFailed)
}

// ============================================================================
// TLS for the QUIC host
// ============================================================================

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN identifier for DHT connections.
pub const ALPN: &[u8] = b"kadroute";

/// PKCS#8 v1 wrapper for a raw Ed25519 secret key (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, 0x02, 0x01, 0x00, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x04, 0x22, 0x04,
    0x20,
];

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut pkcs8 = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + 32);
    pkcs8.extend_from_slice(&ED25519_PKCS8_PREFIX);
    pkcs8.extend_from_slice(&keypair.secret_key_bytes());

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to load Ed25519 key into certificate generator")?;

    let mut params = rcgen::CertificateParams::new(vec!["kadroute".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.peer_id().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to self-sign Ed25519 certificate")?;

    Ok((
        vec![CertificateDer::from(cert.der().to_vec())],
        PrivateKeyDer::Pkcs8(pkcs8.into()),
    ))
}

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .with_client_cert_verifier(Arc::new(PeerCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        quinn::IdleTimeout::try_from(std::time::Duration::from_secs(60))
            .context("idle timeout out of range")?,
    ));
    transport.max_concurrent_bidi_streams(256u32.into());
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unavailable")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(PeerCertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    )))
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    cert.public_key().subject_public_key.data.as_ref().try_into().ok()
}

/// Public key presented by the remote side of an established connection.
pub fn verified_public_key(connection: &quinn::Connection) -> Option<[u8; 32]> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    extract_public_key_from_cert(certs.first()?.as_ref())
}

/// DNS-safe server name carrying a PeerId (two 32-char hex labels).
pub(crate) fn peer_id_to_sni(peer: &PeerId) -> String {
    let hex = peer.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn peer_id_from_sni(sni: &str) -> Option<PeerId> {
    let joined: String = sni.split('.').collect();
    PeerId::from_hex(&joined).ok()
}

fn cert_public_key(end_entity: &CertificateDer<'_>) -> std::result::Result<[u8; 32], rustls::Error> {
    let public_key = extract_public_key_from_cert(end_entity.as_ref())
        .ok_or(rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;
    VerifyingKey::from_bytes(&public_key).map_err(|_| {
        rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
    })?;
    Ok(public_key)
}

/// Certificate verifier used on both sides of a connection.
#[derive(Debug)]
struct PeerCertVerifier;

impl rustls::client::danger::ServerCertVerifier for PeerCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ));
        };
        let expected = peer_id_from_sni(name.as_ref())
            .ok_or(rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding))?;

        let public_key = cert_public_key(end_entity)?;
        if !expected.matches_public_key(&public_key) {
            return Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::NotValidForName,
            ));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }
}

impl rustls::server::danger::ClientCertVerifier for PeerCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        cert_public_key(end_entity)?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![rustls::SignatureScheme::ED25519]
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_signature_round_trip() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, RECORD_SIGNATURE_DOMAIN, b"data");
        assert!(
            verify_with_domain(&keypair.public_key_bytes(), RECORD_SIGNATURE_DOMAIN, b"data", &sig)
                .is_ok()
        );
    }

    #[test]
    fn domain_separation_rejects_other_domains() {
        let keypair = Keypair::generate();
        let sig = sign_with_domain(&keypair, b"other-domain:", b"data");
        assert_eq!(
            verify_with_domain(&keypair.public_key_bytes(), RECORD_SIGNATURE_DOMAIN, b"data", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn malformed_signatures_are_classified() {
        let pk = Keypair::generate().public_key_bytes();
        assert_eq!(
            verify_with_domain(&pk, RECORD_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            verify_with_domain(&pk, RECORD_SIGNATURE_DOMAIN, b"x", &[1u8; 10]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn certificate_carries_keypair_public_key() {
        let keypair = Keypair::generate();
        let (certs, _key) = generate_ed25519_cert(&keypair).expect("cert generation");
        let pk = extract_public_key_from_cert(certs[0].as_ref()).expect("public key in cert");
        assert_eq!(pk, keypair.public_key_bytes());
    }

    #[test]
    fn sni_round_trip() {
        let peer = Keypair::generate().peer_id();
        let sni = peer_id_to_sni(&peer);
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(peer_id_from_sni(&sni), Some(peer));
    }
}
