//! Certificate parsing and fingerprinting.
//!
//! Join intents carry the peer's server certificate as PEM; the daemon
//! parses it into DER, validates the X.509 structure and identifies the
//! certificate by the SHA-256 digest of its DER encoding. Fingerprints
//! drive intent deduplication and the human comparison step.

use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("Invalid certificate PEM: {0}")]
    Pem(String),
    #[error("PEM block is not a certificate (tag {0:?})")]
    NotACertificate(String),
    #[error("Failed to parse X.509 certificate: {0}")]
    X509(String),
}

/// A validated X.509 certificate, stored as owned DER bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
}

impl Certificate {
    /// Parse the first `CERTIFICATE` block of a PEM string.
    pub fn from_pem(pem_str: &str) -> Result<Self, CertError> {
        let block = pem::parse(pem_str).map_err(|e| CertError::Pem(e.to_string()))?;
        if block.tag() != "CERTIFICATE" {
            return Err(CertError::NotACertificate(block.tag().to_string()));
        }

        Self::from_der(block.contents().to_vec())
    }

    /// Validate DER bytes as an X.509 certificate.
    pub fn from_der(der: Vec<u8>) -> Result<Self, CertError> {
        x509_parser::parse_x509_certificate(&der).map_err(|e| CertError::X509(e.to_string()))?;

        Ok(Self { der })
    }

    /// Raw DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// PEM encoding of the certificate.
    pub fn to_pem(&self) -> String {
        pem::encode(&pem::Pem::new("CERTIFICATE", self.der.clone()))
    }

    /// SHA-256 fingerprint of the DER encoding, lowercase hex.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.der)
    }

    /// The subject common name, if the certificate carries one.
    pub fn common_name(&self) -> Option<String> {
        let (_, cert) = x509_parser::parse_x509_certificate(&self.der).ok()?;
        let name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);
        name
    }
}

/// SHA-256 fingerprint of DER-encoded certificate bytes, lowercase hex.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}
