//! TLS configuration for the daemon's listener and peer clients.
//!
//! Trust works differently here than in web TLS. The listener accepts any
//! client certificate at handshake time and defers the trust decision to
//! the per-request auth gate, because the temporary trust store changes
//! while connections are open. On the client side a peer is either pinned
//! to an exact certificate learned earlier in the session, or, for the
//! joiner's very first call only, verification is skipped and the served
//! certificate is captured from the handshake instead.

use std::sync::Arc;

use anyhow::{Context, Result};
use microcloud_core::Certificate;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig,
    SignatureScheme,
};

use crate::identity::Identity;

/// How to verify the server certificate of an outgoing peer connection.
#[derive(Debug, Clone)]
pub enum ServerVerify {
    /// Require this exact certificate.
    Pinned(Certificate),
    /// Accept anything; the caller captures the served certificate from
    /// the handshake. Used only for the joiner's first contact.
    Insecure,
}

/// Install the process-wide rustls crypto provider. Safe to call more
/// than once.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Listener TLS config: serve our identity, request (but do not judge)
/// client certificates.
pub fn server_config(identity: &Identity) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyClientCert))
        .with_single_cert(vec![identity_cert(identity)], identity_key(identity))
        .context("Failed to build server TLS config")?;

    Ok(Arc::new(config))
}

/// Client TLS config presenting our identity as client certificate.
pub fn client_config(identity: &Identity, verify: ServerVerify) -> Result<Arc<ClientConfig>> {
    let verifier: Arc<dyn ServerCertVerifier> = match verify {
        ServerVerify::Pinned(cert) => Arc::new(PinnedServerCert {
            expected: cert.der().to_vec(),
        }),
        ServerVerify::Insecure => Arc::new(AcceptAnyServerCert),
    };

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_client_auth_cert(vec![identity_cert(identity)], identity_key(identity))
        .context("Failed to build client TLS config")?;

    Ok(Arc::new(config))
}

fn identity_cert(identity: &Identity) -> CertificateDer<'static> {
    CertificateDer::from(identity.certificate().der().to_vec())
}

fn identity_key(identity: &Identity) -> PrivateKeyDer<'static> {
    PrivatePkcs8KeyDer::from(identity.key_der().to_vec()).into()
}

fn provider() -> &'static Arc<CryptoProvider> {
    CryptoProvider::get_default().expect("crypto provider must be installed")
}

/// Accepts every client certificate; the request-time auth gate decides
/// whether the connection may actually do anything.
#[derive(Debug)]
struct AcceptAnyClientCert;

impl ClientCertVerifier for AcceptAnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &provider().signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &provider().signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        provider().signature_verification_algorithms.supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        // Front-ends without an identity (tests, local tooling) may still
        // reach endpoints that do not require mTLS.
        false
    }
}

/// Accepts only one exact certificate, byte-compared against the pin.
#[derive(Debug)]
struct PinnedServerCert {
    expected: Vec<u8>,
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &provider().signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &provider().signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        provider().signature_verification_algorithms.supported_schemes()
    }
}

/// Accepts any server certificate. The one legitimate use is the joiner's
/// first call, where the initiator's certificate is unknown and gets
/// captured from the handshake for pinning everything that follows.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &provider().signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &provider().signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        provider().signature_verification_algorithms.supported_schemes()
    }
}
