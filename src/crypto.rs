//! # Transport Authentication
//!
//! Every profilemesh connection is mutually authenticated QUIC:
//!
//! - Each node presents a self-signed certificate over its Ed25519 node key
//! - The certificate's public key *is* the node's [`Identity`]
//! - Clients dial a peer by identity: the expected identity is encoded in the
//!   SNI, and the server's certificate must carry exactly that key
//! - Servers require a client certificate and take the caller's identity from
//!   it ([`extract_verified_identity`])
//!
//! There is no CA. Trust is knowing the identity you dialed, and the caller
//! identity handed to protocol logic is always the one proven here.
//!
//! The `dangerous()` rustls APIs are used on purpose: verification binds
//! the certificate to an identity instead of to a CA chain.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use quinn::ClientConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::identity::{Identity, Keypair};

static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

/// ALPN protocol identifier for profilemesh connections.
pub const ALPN: &[u8] = b"profilemesh";

/// Idle QUIC connections are closed after this long.
const MAX_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_CONCURRENT_BIDI_STREAMS: u32 = 64;

/// PKCS#8 v1 prefix for a raw Ed25519 private key (RFC 8410).
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, // AlgorithmIdentifier id-Ed25519
    0x04, 0x22, 0x04, 0x20, // OCTET STRING { OCTET STRING (32) }
];

pub fn generate_ed25519_cert(
    keypair: &Keypair,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut pkcs8 = Vec::with_capacity(ED25519_PKCS8_PREFIX.len() + 32);
    pkcs8.extend_from_slice(&ED25519_PKCS8_PREFIX);
    pkcs8.extend_from_slice(&keypair.secret_key_bytes());

    let pkcs8_der = PrivatePkcs8KeyDer::from(pkcs8.clone());
    let key_pair = rcgen::KeyPair::try_from(&pkcs8_der)
        .context("failed to create Ed25519 key pair for certificate")?;

    let mut params = rcgen::CertificateParams::new(vec!["profilemesh".to_string()])
        .context("failed to create certificate params")?;
    params.distinguished_name.push(
        rcgen::DnType::CommonName,
        rcgen::DnValue::Utf8String(keypair.identity().to_hex()),
    );

    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed Ed25519 certificate")?;

    let key = PrivateKeyDer::Pkcs8(pkcs8.into());
    let cert_der = CertificateDer::from(cert.der().to_vec());
    Ok((vec![cert_der], key))
}

static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

pub fn create_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<quinn::ServerConfig> {
    let mut server_crypto = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(TLS13_ONLY)
        .context("failed to select TLS versions")?
        .with_client_cert_verifier(Arc::new(Ed25519ClientCertVerifier))
        .with_single_cert(certs, key)
        .context("failed to create server TLS config")?;
    server_crypto.alpn_protocols = vec![ALPN.to_vec()];

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
            .context("failed to create QUIC server config")?,
    ));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(
        MAX_IDLE_TIMEOUT
            .try_into()
            .context("idle timeout out of range")?,
    ));
    transport.max_concurrent_bidi_streams(MAX_CONCURRENT_BIDI_STREAMS.into());
    transport.max_concurrent_uni_streams(0u32.into());
    server_config.transport_config(Arc::new(transport));

    Ok(server_config)
}

pub fn create_client_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ClientConfig> {
    let mut client_crypto = rustls::ClientConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_protocol_versions(TLS13_ONLY)
        .context("failed to select TLS versions")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(Ed25519CertVerifier))
        .with_client_auth_cert(certs, key)
        .context("failed to create client TLS config with client auth")?;
    client_crypto.alpn_protocols = vec![ALPN.to_vec()];

    Ok(ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
            .context("failed to create QUIC client config")?,
    )))
}

/// Server and client QUIC configs for a node key.
pub fn endpoint_configs(keypair: &Keypair) -> Result<(quinn::ServerConfig, ClientConfig)> {
    let (certs, key) = generate_ed25519_cert(keypair)?;
    let server = create_server_config(certs.clone(), key.clone_key())?;
    let client = create_client_config(certs, key)?;
    Ok((server, client))
}

pub fn extract_public_key_from_cert(cert_der: &[u8]) -> Option<[u8; 32]> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let key_bytes = &cert.public_key().subject_public_key.data;
    <[u8; 32]>::try_from(&key_bytes[..]).ok()
}

/// The peer identity proven by the connection's client certificate.
pub fn extract_verified_identity(connection: &quinn::Connection) -> Option<Identity> {
    let peer_identity = connection.peer_identity()?;
    let certs: &Vec<CertificateDer> = peer_identity.downcast_ref()?;
    let public_key = extract_public_key_from_cert(certs.first()?.as_ref())?;
    Some(Identity::from_bytes(public_key))
}

/// 64 hex chars exceed the 63-byte DNS label limit, so split in two labels.
pub(crate) fn identity_to_sni(identity: &Identity) -> String {
    let hex = identity.to_hex();
    format!("{}.{}", &hex[..32], &hex[32..])
}

fn parse_identity_from_sni(sni: &str) -> Option<Identity> {
    let hex_str: String = sni.split('.').collect();
    Identity::from_hex(&hex_str).ok()
}

fn bad_cert(error: rustls::CertificateError) -> rustls::Error {
    rustls::Error::InvalidCertificate(error)
}

type SignatureValid = rustls::client::danger::HandshakeSignatureValid;

#[derive(Clone, Copy)]
enum TlsVersion {
    Tls12,
    Tls13,
}

/// Handshake signatures are checked with the pinned provider's algorithms;
/// only Ed25519 is ever offered.
fn handshake_signature(
    version: TlsVersion,
    message: &[u8],
    cert: &CertificateDer<'_>,
    dss: &rustls::DigitallySignedStruct,
) -> Result<SignatureValid, rustls::Error> {
    let algorithms = &CRYPTO_PROVIDER.signature_verification_algorithms;
    match version {
        TlsVersion::Tls12 => rustls::crypto::verify_tls12_signature(message, cert, dss, algorithms),
        TlsVersion::Tls13 => rustls::crypto::verify_tls13_signature(message, cert, dss, algorithms),
    }
}

fn ed25519_only() -> Vec<rustls::SignatureScheme> {
    vec![rustls::SignatureScheme::ED25519]
}

#[derive(Debug)]
struct Ed25519ClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for Ed25519ClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_cert(rustls::CertificateError::BadEncoding))?;
        if !Identity::from_bytes(public_key).is_valid() {
            return Err(bad_cert(rustls::CertificateError::ApplicationVerificationFailure));
        }
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<SignatureValid, rustls::Error> {
        handshake_signature(TlsVersion::Tls12, message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<SignatureValid, rustls::Error> {
        handshake_signature(TlsVersion::Tls13, message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        ed25519_only()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct Ed25519CertVerifier;

impl rustls::client::danger::ServerCertVerifier for Ed25519CertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let rustls::pki_types::ServerName::DnsName(name) = server_name else {
            return Err(bad_cert(rustls::CertificateError::ApplicationVerificationFailure));
        };
        let expected = parse_identity_from_sni(name.as_ref())
            .ok_or(bad_cert(rustls::CertificateError::BadEncoding))?;
        let public_key = extract_public_key_from_cert(end_entity.as_ref())
            .ok_or(bad_cert(rustls::CertificateError::BadEncoding))?;

        if Identity::from_bytes(public_key) != expected {
            return Err(bad_cert(rustls::CertificateError::NotValidForName));
        }
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<SignatureValid, rustls::Error> {
        handshake_signature(TlsVersion::Tls12, message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<SignatureValid, rustls::Error> {
        handshake_signature(TlsVersion::Tls13, message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        ed25519_only()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn certificate_carries_node_identity() {
        for _ in 0..20 {
            let keypair = Keypair::generate();
            let (certs, _key) = generate_ed25519_cert(&keypair).expect("cert generation");
            let extracted = extract_public_key_from_cert(certs[0].as_ref()).expect("extract");
            assert_eq!(Identity::from_bytes(extracted), keypair.identity());
        }
    }

    #[test]
    fn distinct_keys_give_distinct_certificates() {
        let mut seen = HashSet::new();
        for _ in 0..50 {
            let (certs, _) = generate_ed25519_cert(&Keypair::generate()).expect("cert generation");
            let pk = extract_public_key_from_cert(certs[0].as_ref()).expect("extract");
            assert!(seen.insert(pk));
        }
    }

    #[test]
    fn sni_roundtrips_identity() {
        let identity = Keypair::generate().identity();
        let sni = identity_to_sni(&identity);
        assert!(sni.split('.').all(|label| label.len() <= 63));
        assert_eq!(parse_identity_from_sni(&sni), Some(identity));
        assert_eq!(parse_identity_from_sni("not-an-identity"), None);
    }

    #[test]
    fn garbage_certificate_yields_no_key() {
        assert!(extract_public_key_from_cert(&[0u8; 40]).is_none());
    }

    #[test]
    fn endpoint_configs_build() {
        assert!(endpoint_configs(&Keypair::generate()).is_ok());
    }
}
