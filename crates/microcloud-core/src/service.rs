//! Service registry contract.
//!
//! Cluster members run a set of services next to the core daemon. During
//! trust establishment the services participate only as an opaque
//! capability list: each side advertises the service types it offers and
//! rejects peers that are missing one of its own.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("Unknown service type {0:?}")]
pub struct UnknownServiceType(String);

/// Tag identifying a service a cluster member can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    /// The trust-establishment daemon itself.
    Core,
    Storage,
    Network,
    Compute,
}

impl ServiceType {
    pub const ALL: [ServiceType; 4] = [
        ServiceType::Core,
        ServiceType::Storage,
        ServiceType::Network,
        ServiceType::Compute,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::Core => "core",
            ServiceType::Storage => "storage",
            ServiceType::Network => "network",
            ServiceType::Compute => "compute",
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceType {
    type Err = UnknownServiceType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownServiceType(s.to_string()))
    }
}

/// What the trust-establishment core consumes from a registered service.
pub trait Service: Send + Sync {
    fn service_type(&self) -> ServiceType;
    fn name(&self) -> &str;
    fn address(&self) -> &str;
}

/// Payload of the status endpoint, fetched by joiners to learn the
/// initiator's human-readable name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub name: String,
    pub address: String,
    pub services: Vec<ServiceType>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_wire_format() {
        for service in ServiceType::ALL {
            let json = serde_json::to_string(&service).unwrap();
            assert_eq!(json, format!("\"{service}\""));
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for service in ServiceType::ALL {
            assert_eq!(service.as_str().parse::<ServiceType>().unwrap(), service);
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!("hypervisor".parse::<ServiceType>().is_err());
        assert!("".parse::<ServiceType>().is_err());
    }
}
