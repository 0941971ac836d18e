//! Shared daemon state.

use std::collections::HashMap;
use std::sync::RwLock;

use microcloud_core::Certificate;

use crate::identity::Identity;
use crate::registry::ServiceRegistry;
use crate::session::SessionRegistry;

/// Everything the endpoints and the engine share.
pub struct AppState {
    /// This node's human-readable name.
    pub name: String,
    /// Advertised address (`host` or `host:port`).
    pub address: String,
    /// Port the TLS listener is bound to.
    pub port: u16,
    pub identity: Identity,
    pub sessions: SessionRegistry,
    pub services: ServiceRegistry,
    /// Permanent cluster trust store, seeded by the cluster-join path.
    permanent_trust: RwLock<HashMap<String, Certificate>>,
}

impl AppState {
    pub fn new(
        name: String,
        address: String,
        port: u16,
        identity: Identity,
        sessions: SessionRegistry,
        services: ServiceRegistry,
    ) -> Self {
        Self {
            name,
            address,
            port,
            identity,
            sessions,
            services,
            permanent_trust: RwLock::new(HashMap::new()),
        }
    }

    /// Add a member certificate to the permanent trust store.
    pub fn trust(&self, name: &str, cert: Certificate) {
        self.permanent_trust
            .write()
            .unwrap()
            .insert(name.to_string(), cert);
    }

    /// Whether any of the presented certificates matches the permanent
    /// store or the active session's temporary store.
    pub fn is_trusted_peer(&self, presented: &[Certificate]) -> bool {
        if presented.is_empty() {
            return false;
        }

        {
            let permanent = self.permanent_trust.read().unwrap();
            if presented
                .iter()
                .any(|cert| permanent.values().any(|trusted| trusted == cert))
            {
                return true;
            }
        }

        // Fall back to the temporary store while the cluster is forming.
        if let Some(session) = self.sessions.active() {
            let temporary = session.trust_store();
            return presented
                .iter()
                .any(|cert| temporary.values().any(|trusted| trusted == cert));
        }

        false
    }
}
