//! Passphrase-bound request authentication.
//!
//! A request body is bound to the session passphrase by deriving a key from
//! the passphrase with Argon2id and computing an HMAC-SHA256 over the exact
//! body bytes. The MAC travels in the `Authorization` header as
//! `"<version> <lowercase hex>"`; both sides must agree on the conf,
//! which is tagged with the protocol version.

use argon2::{Algorithm, Argon2, Params, Version};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::PROTOCOL_VERSION;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Failed to derive HMAC key: {0}")]
    Derive(String),
    #[error("Missing or malformed Authorization header")]
    MalformedHeader,
    #[error("Unknown Authorization version {0:?}")]
    UnknownVersion(String),
    #[error("HMAC does not match the request body")]
    Mismatch,
}

/// Argon2id parameters shared by all participants of a session.
///
/// The version tag is part of the conf: a peer speaking a different
/// protocol revision derives a different header and is rejected.
#[derive(Debug, Clone)]
pub struct HmacConf {
    pub version: &'static str,
    pub salt: &'static [u8],
    /// Memory cost in KiB.
    pub memory: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub key_length: usize,
}

impl Default for HmacConf {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            salt: b"microcloud.session.hmac",
            memory: 64 * 1024,
            iterations: 3,
            parallelism: 4,
            key_length: 32,
        }
    }
}

/// A derived HMAC key, cached for the lifetime of a session.
///
/// Deriving is intentionally expensive (Argon2); callers on async tasks
/// should derive on a blocking thread.
#[derive(Clone)]
pub struct HmacKey {
    version: &'static str,
    key: Vec<u8>,
}

impl HmacKey {
    /// Derive a key from the session passphrase.
    pub fn derive(passphrase: &str, conf: &HmacConf) -> Result<Self, AuthError> {
        let params = Params::new(
            conf.memory,
            conf.iterations,
            conf.parallelism,
            Some(conf.key_length),
        )
        .map_err(|e| AuthError::Derive(e.to_string()))?;

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key = vec![0u8; conf.key_length];
        argon2
            .hash_password_into(passphrase.as_bytes(), conf.salt, &mut key)
            .map_err(|e| AuthError::Derive(e.to_string()))?;

        Ok(Self {
            version: conf.version,
            key,
        })
    }

    /// Compute the `Authorization` header value for a request body.
    pub fn authorization_header(&self, body: &[u8]) -> String {
        format!("{} {}", self.version, hex::encode(self.mac(body)))
    }

    /// Verify an `Authorization` header against the received body bytes.
    ///
    /// The MAC comparison is constant-time.
    pub fn verify_header(&self, header: &str, body: &[u8]) -> Result<(), AuthError> {
        let (version, mac_hex) = header.split_once(' ').ok_or(AuthError::MalformedHeader)?;
        if version != self.version {
            return Err(AuthError::UnknownVersion(version.to_string()));
        }

        let claimed = hex::decode(mac_hex).map_err(|_| AuthError::MalformedHeader)?;
        let expected = self.mac(body);
        if expected.ct_eq(claimed.as_slice()).into() {
            Ok(())
        } else {
            Err(AuthError::Mismatch)
        }
    }

    fn mac(&self, body: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(body);
        mac.finalize().into_bytes().to_vec()
    }
}

impl std::fmt::Debug for HmacKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The derived key never appears in logs.
        f.debug_struct("HmacKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cheap parameters so the suite doesn't burn CPU on Argon2.
    fn test_conf() -> HmacConf {
        HmacConf {
            memory: 8 * 1024,
            iterations: 1,
            parallelism: 1,
            ..HmacConf::default()
        }
    }

    #[test]
    fn test_round_trip() {
        let key = HmacKey::derive("correct horse battery staple", &test_conf()).unwrap();
        let header = key.authorization_header(b"{\"name\":\"node-a\"}");

        assert!(header.starts_with(&format!("{PROTOCOL_VERSION} ")));
        key.verify_header(&header, b"{\"name\":\"node-a\"}").unwrap();
    }

    #[test]
    fn test_rejects_other_passphrase() {
        let conf = test_conf();
        let signer = HmacKey::derive("correct horse battery staple", &conf).unwrap();
        let verifier = HmacKey::derive("foo bar baz qux", &conf).unwrap();

        let header = signer.authorization_header(b"body");
        assert!(matches!(
            verifier.verify_header(&header, b"body"),
            Err(AuthError::Mismatch)
        ));
    }

    #[test]
    fn test_rejects_tampered_body() {
        let key = HmacKey::derive("correct horse battery staple", &test_conf()).unwrap();
        let header = key.authorization_header(b"body");

        assert!(matches!(
            key.verify_header(&header, b"other body"),
            Err(AuthError::Mismatch)
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let key = HmacKey::derive("correct horse battery staple", &test_conf()).unwrap();
        let header = key.authorization_header(b"body");
        let mac = header.split_once(' ').unwrap().1;

        let err = key
            .verify_header(&format!("MicroCloud-9.9 {mac}"), b"body")
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownVersion(v) if v == "MicroCloud-9.9"));
    }

    #[test]
    fn test_rejects_malformed_header() {
        let key = HmacKey::derive("correct horse battery staple", &test_conf()).unwrap();

        assert!(matches!(
            key.verify_header("nospace", b"body"),
            Err(AuthError::MalformedHeader)
        ));
        assert!(matches!(
            key.verify_header(&format!("{PROTOCOL_VERSION} not-hex"), b"body"),
            Err(AuthError::MalformedHeader)
        ));
    }

    #[test]
    fn test_header_is_lowercase_hex() {
        let key = HmacKey::derive("correct horse battery staple", &test_conf()).unwrap();
        let header = key.authorization_header(b"body");
        let mac = header.split_once(' ').unwrap().1;

        assert_eq!(mac.len(), 64);
        assert!(mac.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
