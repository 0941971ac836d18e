//! microcloud-daemon library: Exposes internal modules for testing.
//!
//! The daemon itself is a thin `main.rs` over [`Daemon::spawn`]; the
//! integration tests build whole in-process daemons from the same parts.

pub mod api;
pub mod client;
pub mod context;
pub mod discovery;
pub mod engine;
pub mod gateway;
pub mod identity;
pub mod listen;
pub mod registry;
pub mod session;
pub mod state;
pub mod tls;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use microcloud_core::{HmacConf, ServiceType};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::identity::Identity;
use crate::registry::ServiceRegistry;
use crate::session::SessionRegistry;
use crate::state::AppState;

// Re-export key types for convenience
pub use crate::api::auth::ConnectionMeta;
pub use crate::context::SessionContext;
pub use crate::gateway::WebsocketGateway;
pub use crate::session::{Session, SessionError};

/// Default port of the cluster-facing TLS listener.
pub const DEFAULT_PORT: u16 = 9444;

/// Name of the control socket inside the state directory.
pub const CONTROL_SOCKET: &str = "control.socket";

/// Everything needed to bring a daemon up.
pub struct DaemonConfig {
    /// This node's name.
    pub name: String,
    /// Address advertised to peers (`host` or `host:port`).
    pub address: String,
    /// Bind address of the TLS listener.
    pub listen: String,
    /// TLS listener port; 0 picks an ephemeral one.
    pub port: u16,
    /// Where identity and the control socket live.
    pub state_dir: PathBuf,
    /// Control socket path; defaults to `<state_dir>/control.socket`.
    pub unix_socket: Option<PathBuf>,
    /// Services this member offers besides the core.
    pub services: Vec<ServiceType>,
    /// HMAC key-derivation parameters.
    pub hmac: HmacConf,
}

impl DaemonConfig {
    pub fn new(name: impl Into<String>, address: impl Into<String>, state_dir: PathBuf) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            listen: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            state_dir,
            unix_socket: None,
            services: Vec::new(),
            hmac: HmacConf::default(),
        }
    }
}

/// A running daemon: two listeners around the shared [`AppState`].
pub struct Daemon {
    pub state: Arc<AppState>,
    /// Bound address of the TLS listener.
    pub local_addr: SocketAddr,
    /// Path of the Unix control socket.
    pub unix_socket: PathBuf,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Bind the listeners and start serving.
    pub async fn spawn(config: DaemonConfig) -> Result<Daemon> {
        tls::install_crypto_provider();

        let identity = Identity::load_or_create(&config.state_dir, &config.name)?;

        let listener = TcpListener::bind((config.listen.as_str(), config.port))
            .await
            .with_context(|| format!("Failed to bind {}:{}", config.listen, config.port))?;
        let local_addr = listener.local_addr()?;

        let services = ServiceRegistry::new(&config.name, &config.address, config.services);
        let state = Arc::new(AppState::new(
            config.name,
            config.address,
            local_addr.port(),
            identity,
            SessionRegistry::new(config.hmac),
            services,
        ));

        let router = api::router(Arc::clone(&state));
        let tls_config = tls::server_config(&state.identity)?;

        let unix_socket = config
            .unix_socket
            .unwrap_or_else(|| config.state_dir.join(CONTROL_SOCKET));
        // A previous run may have left the socket file behind.
        let _ = std::fs::remove_file(&unix_socket);
        let unix_listener = UnixListener::bind(&unix_socket)
            .with_context(|| format!("Failed to bind control socket {unix_socket:?}"))?;

        info!(%local_addr, socket = ?unix_socket, "Daemon listening");

        let tls_router = router.clone();
        let tasks = vec![
            tokio::spawn(async move {
                if let Err(e) = listen::serve_tls(listener, tls_config, tls_router).await {
                    error!("TLS listener failed: {e:#}");
                }
            }),
            tokio::spawn(async move {
                if let Err(e) = listen::serve_unix(unix_listener, router).await {
                    error!("Unix listener failed: {e:#}");
                }
            }),
        ];

        Ok(Daemon {
            state,
            local_addr,
            unix_socket,
            tasks,
        })
    }

    /// Stop serving and release the listeners.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.unix_socket);
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
