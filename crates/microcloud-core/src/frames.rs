//! Wire types for the session control channel.
//!
//! The websocket between front-end and daemon carries [`SessionFrame`]s: a
//! single JSON object whose populated subset of fields depends on where the
//! protocol currently stands. Unknown fields are ignored so minor additions
//! stay compatible.

use serde::{Deserialize, Serialize};

use crate::service::ServiceType;

/// A joiner's signed request to be admitted to the forming cluster.
///
/// Sent by the joiner to the initiator's join endpoint, shown to the
/// initiator's front-end for confirmation, and mirrored back by the
/// initiator once confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinIntent {
    /// Protocol version tag.
    pub version: String,
    /// Sender's node name.
    pub name: String,
    /// `host:port` the sender listens on.
    pub address: String,
    /// PEM encoding of the sender's server certificate.
    pub certificate: String,
    /// Service types the sender offers.
    pub services: Vec<ServiceType>,
}

/// One frame on the session websocket.
///
/// All fields are optional; each frame is interpreted by its position in
/// the protocol rather than by a discriminator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFrame {
    // Front-end → daemon configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passphrase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<ServiceType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup_timeout: Option<String>,

    // Daemon → front-end, joiner side only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_fingerprint: Option<String>,

    // Intent exchange.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<JoinIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed_intents: Option<Vec<JoinIntent>>,

    // Terminal frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SessionFrame {
    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("SessionFrame serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
