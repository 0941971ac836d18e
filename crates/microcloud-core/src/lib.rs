//! microcloud-core: Protocol primitives for trust establishment.
//!
//! This crate holds the pure data layer of the trust-establishment
//! session: passphrases, the HMAC request authenticator, certificate
//! fingerprints, the mDNS record payload, and the wire frames spoken over
//! the session websocket. The daemon crate supplies the runtime around
//! these primitives.

pub mod auth;
pub mod certs;
pub mod duration;
pub mod frames;
pub mod passphrase;
pub mod record;
pub mod service;

/// Protocol version tag.
///
/// Doubles as the mDNS/intent `version` field and the `Authorization`
/// header scheme. There is no negotiation: a mismatch is fatal.
pub const PROTOCOL_VERSION: &str = "MicroCloud-1.0";

pub use auth::{AuthError, HmacConf, HmacKey};
pub use certs::{fingerprint, CertError, Certificate};
pub use duration::{parse_duration, DurationError};
pub use frames::{JoinIntent, SessionFrame};
pub use passphrase::PassphraseError;
pub use record::{join_segments, txt_segments, ServerInfo, SERVICE_NAME};
pub use service::{NodeStatus, Service, ServiceType, UnknownServiceType};
