//! Server identity: a persistent self-signed keypair and certificate.
//!
//! The certificate is this node's face towards its peers: its PEM rides in
//! every join intent, its fingerprint is what humans compare, and the TLS
//! listener serves it. Generated on first start, reloaded afterwards.

use std::path::Path;

use anyhow::{bail, Context, Result};
use microcloud_core::Certificate;
use rcgen::{CertificateParams, DnType, KeyPair};
use tracing::info;

const CERT_FILE: &str = "server.crt";
const KEY_FILE: &str = "server.key";

#[derive(Clone)]
pub struct Identity {
    cert: Certificate,
    /// PKCS#8 DER encoding of the private key.
    key_der: Vec<u8>,
}

impl Identity {
    /// Load the identity from the state directory, generating and
    /// persisting a fresh one if none exists yet.
    pub fn load_or_create(state_dir: &Path, name: &str) -> Result<Self> {
        let cert_path = state_dir.join(CERT_FILE);
        let key_path = state_dir.join(KEY_FILE);

        if cert_path.exists() && key_path.exists() {
            return Self::load(&cert_path, &key_path);
        }

        let identity = Self::generate(name)?;
        std::fs::create_dir_all(state_dir)
            .with_context(|| format!("Failed to create state directory {state_dir:?}"))?;
        std::fs::write(&cert_path, identity.cert.to_pem())
            .with_context(|| format!("Failed to write {cert_path:?}"))?;
        std::fs::write(&key_path, pem::encode(&pem::Pem::new("PRIVATE KEY", identity.key_der.clone())))
            .with_context(|| format!("Failed to write {key_path:?}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600))?;
        }

        info!(fingerprint = %identity.fingerprint(), "Generated server identity");
        Ok(identity)
    }

    /// Generate a fresh self-signed identity for the given node name.
    pub fn generate(name: &str) -> Result<Self> {
        let key = KeyPair::generate().context("Failed to generate server key")?;

        let mut params = CertificateParams::new(vec![name.to_string()])
            .context("Failed to build certificate parameters")?;
        params.distinguished_name.push(DnType::CommonName, name);

        let cert = params
            .self_signed(&key)
            .context("Failed to self-sign server certificate")?;

        Ok(Self {
            cert: Certificate::from_der(cert.der().to_vec())?,
            key_der: key.serialize_der(),
        })
    }

    fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)
            .with_context(|| format!("Failed to read {cert_path:?}"))?;
        let cert = Certificate::from_pem(&cert_pem)?;

        let key_pem = std::fs::read_to_string(key_path)
            .with_context(|| format!("Failed to read {key_path:?}"))?;
        let block = pem::parse(&key_pem).context("Failed to parse server key PEM")?;
        if block.tag() != "PRIVATE KEY" {
            bail!("Unexpected PEM tag {:?} in {key_path:?}", block.tag());
        }

        Ok(Self {
            cert,
            key_der: block.contents().to_vec(),
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn cert_pem(&self) -> String {
        self.cert.to_pem()
    }

    pub fn fingerprint(&self) -> String {
        self.cert.fingerprint()
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }
}
