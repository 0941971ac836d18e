//! Registered services of this cluster member.
//!
//! The trust-establishment core treats services as opaque capabilities:
//! a joining peer must offer every type registered here, and the types are
//! what this node advertises in its own join intents.

use microcloud_core::{Service, ServiceType};

/// A service running next to the daemon on this host.
pub struct RegisteredService {
    service_type: ServiceType,
    name: String,
    address: String,
}

impl Service for RegisteredService {
    fn service_type(&self) -> ServiceType {
        self.service_type
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> &str {
        &self.address
    }
}

/// The per-member service presence map.
pub struct ServiceRegistry {
    services: Vec<RegisteredService>,
}

impl ServiceRegistry {
    /// Register the core service plus the additionally configured types.
    pub fn new(name: &str, address: &str, extra: impl IntoIterator<Item = ServiceType>) -> Self {
        let mut types = vec![ServiceType::Core];
        for service_type in extra {
            if !types.contains(&service_type) {
                types.push(service_type);
            }
        }
        types.sort();

        let services = types
            .into_iter()
            .map(|service_type| RegisteredService {
                service_type,
                name: name.to_string(),
                address: address.to_string(),
            })
            .collect();

        Self { services }
    }

    /// The registered service types, sorted.
    pub fn types(&self) -> Vec<ServiceType> {
        self.services.iter().map(|s| s.service_type()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Service> {
        self.services.iter().map(|s| s as &dyn Service)
    }

    /// The service types a peer is missing, if any.
    pub fn missing_from<'a>(&self, offered: &'a [ServiceType]) -> Vec<ServiceType> {
        self.types()
            .into_iter()
            .filter(|required| !offered.contains(required))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_is_always_registered() {
        let registry = ServiceRegistry::new("node-a", "10.0.0.1:9444", []);
        assert_eq!(registry.types(), vec![ServiceType::Core]);
    }

    #[test]
    fn test_extra_types_are_deduplicated() {
        let registry = ServiceRegistry::new(
            "node-a",
            "10.0.0.1:9444",
            [ServiceType::Storage, ServiceType::Storage, ServiceType::Core],
        );
        assert_eq!(registry.types(), vec![ServiceType::Core, ServiceType::Storage]);
    }

    #[test]
    fn test_missing_from() {
        let registry =
            ServiceRegistry::new("node-a", "10.0.0.1:9444", [ServiceType::Storage]);

        assert!(registry
            .missing_from(&[ServiceType::Core, ServiceType::Storage])
            .is_empty());
        assert_eq!(
            registry.missing_from(&[ServiceType::Core]),
            vec![ServiceType::Storage]
        );
    }

    #[test]
    fn test_services_expose_contract() {
        let registry = ServiceRegistry::new("node-a", "10.0.0.1:9444", []);
        let service = registry.iter().next().unwrap();

        assert_eq!(service.service_type(), ServiceType::Core);
        assert_eq!(service.name(), "node-a");
        assert_eq!(service.address(), "10.0.0.1:9444");
    }
}
