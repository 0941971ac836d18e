//! Trust-establishment session state.
//!
//! At most one session exists per daemon. The session owns the passphrase,
//! the derived HMAC key, the temporary trust store, the intent dedup set
//! and the channels crossing the HTTP/websocket boundary. Endpoints never
//! hold a session directly; they look up the active one through the
//! [`SessionRegistry`] at request time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use microcloud_core::{passphrase, Certificate, HmacConf, HmacKey, JoinIntent, ServerInfo};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::discovery::{self, Broadcast};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("There already is an active session")]
    Active,
    #[error("Fingerprint already exists")]
    DuplicateIntent,
    #[error("No active consumer for join intent")]
    NoActiveConsumer,
    #[error(transparent)]
    Passphrase(#[from] microcloud_core::PassphraseError),
    #[error(transparent)]
    Auth(#[from] microcloud_core::AuthError),
}

/// Mutable session state guarded by the session lock.
#[derive(Default)]
struct State {
    trust_store: HashMap<String, Certificate>,
    intent_fingerprints: HashSet<String>,
    broadcaster: Option<Broadcast>,
}

/// One trust-establishment session.
pub struct Session {
    passphrase: String,
    hmac: HmacKey,
    state: RwLock<State>,
    intent_tx: Mutex<Option<mpsc::Sender<JoinIntent>>>,
    intent_rx: Mutex<Option<mpsc::Receiver<JoinIntent>>>,
    consumers: Arc<AtomicUsize>,
    exit_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl Session {
    fn new(passphrase: String, hmac: HmacKey) -> Self {
        // Capacity 1 is the closest tokio rendering of an unbuffered
        // channel: producers must use try_send and a dead consumer makes
        // the send fail instead of parking the HTTP handler.
        let (intent_tx, intent_rx) = mpsc::channel(1);
        let (exit_tx, _) = watch::channel(false);

        Self {
            passphrase,
            hmac,
            state: RwLock::new(State::default()),
            intent_tx: Mutex::new(Some(intent_tx)),
            intent_rx: Mutex::new(Some(intent_rx)),
            consumers: Arc::new(AtomicUsize::new(0)),
            exit_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// The session passphrase; immutable for the session's life.
    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }

    /// The HMAC key derived from the passphrase, cached per session.
    pub fn hmac_key(&self) -> &HmacKey {
        &self.hmac
    }

    /// Grant access via the temporary trust store to the given certificate.
    pub fn allow(&self, name: &str, cert: Certificate) {
        let mut state = self.state.write().unwrap();
        state.trust_store.insert(name.to_string(), cert);
    }

    /// A copy of the temporary trust store.
    pub fn trust_store(&self) -> HashMap<String, Certificate> {
        self.state.read().unwrap().trust_store.clone()
    }

    /// Record that the given certificate fingerprint registered a join
    /// intent. Replays are rejected.
    pub fn register_intent(&self, fingerprint: &str) -> Result<(), SessionError> {
        let mut state = self.state.write().unwrap();
        if !state.intent_fingerprints.insert(fingerprint.to_string()) {
            return Err(SessionError::DuplicateIntent);
        }

        Ok(())
    }

    /// Non-blocking offer of a join intent to the consuming engine.
    ///
    /// Fails when nothing is consuming (the owning websocket died) so the
    /// HTTP handler never parks indefinitely.
    pub fn offer_intent(&self, intent: JoinIntent) -> Result<(), SessionError> {
        if self.consumers.load(Ordering::Acquire) == 0 {
            return Err(SessionError::NoActiveConsumer);
        }

        let tx = self.intent_tx.lock().unwrap();
        tx.as_ref()
            .ok_or(SessionError::NoActiveConsumer)?
            .try_send(intent)
            .map_err(|_| SessionError::NoActiveConsumer)
    }

    /// Take the consuming end of the intent channel. Only the first caller
    /// gets it; the engine takes it when the session starts.
    pub fn consume_intents(&self) -> Option<IntentConsumer> {
        let rx = self.intent_rx.lock().unwrap().take()?;
        self.consumers.fetch_add(1, Ordering::Release);

        Some(IntentConsumer {
            rx,
            consumers: Arc::clone(&self.consumers),
        })
    }

    /// Resolves once the session has been stopped.
    pub async fn exited(&self) {
        let mut rx = self.exit_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Start broadcasting this node under the cluster mDNS service.
    pub async fn broadcast(
        &self,
        name: &str,
        address: &str,
        iface: &str,
        port: u16,
    ) -> anyhow::Result<()> {
        let info = ServerInfo::new(name, address);
        let broadcast = discovery::broadcast(name, address, iface, port, info.to_txt()).await?;

        let mut state = self.state.write().unwrap();
        state.broadcaster = Some(broadcast);

        Ok(())
    }

    /// Stop the session: shut the broadcaster down, clear the trust store
    /// and wake everything blocked on the session.
    ///
    /// Called exactly once by the owning engine; later calls are no-ops.
    fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.state.write().unwrap();
        if let Some(broadcaster) = state.broadcaster.take() {
            broadcaster.shutdown();
        }
        state.trust_store.clear();
        state.intent_fingerprints.clear();
        drop(state);

        // Tear the intent channel down from both ends: dropping the sender
        // wakes a consuming engine with `None`, dropping an untaken
        // receiver makes pending offers fail fast.
        self.intent_tx.lock().unwrap().take();
        self.intent_rx.lock().unwrap().take();

        self.exit_tx.send_replace(true);
    }
}

/// Exclusive consumer handle for the session's intent channel.
///
/// Its existence is what makes [`Session::offer_intent`] succeed; dropping
/// it (the engine going away) turns further offers into
/// [`SessionError::NoActiveConsumer`].
pub struct IntentConsumer {
    rx: mpsc::Receiver<JoinIntent>,
    consumers: Arc<AtomicUsize>,
}

impl IntentConsumer {
    /// Receive the next join intent; `None` once the session stopped.
    pub async fn recv(&mut self) -> Option<JoinIntent> {
        self.rx.recv().await
    }
}

impl Drop for IntentConsumer {
    fn drop(&mut self) {
        self.consumers.fetch_sub(1, Ordering::Release);
    }
}

/// Process-wide holder of the at-most-one active session.
#[derive(Clone)]
pub struct SessionRegistry {
    active: Arc<RwLock<Option<Arc<Session>>>>,
    conf: HmacConf,
}

impl SessionRegistry {
    pub fn new(conf: HmacConf) -> Self {
        Self {
            active: Arc::new(RwLock::new(None)),
            conf,
        }
    }

    /// Start a new session with the given passphrase, generating one when
    /// it is empty. Fails if a session is already active.
    pub async fn start(&self, passphrase: String) -> Result<Arc<Session>, SessionError> {
        // Fail fast before paying for the key derivation.
        if self.active.read().unwrap().is_some() {
            return Err(SessionError::Active);
        }

        let passphrase = if passphrase.is_empty() {
            passphrase::generate()?
        } else {
            passphrase
        };

        // Argon2 is deliberately expensive; keep it off the async workers.
        let conf = self.conf.clone();
        let derive_passphrase = passphrase.clone();
        let hmac = tokio::task::spawn_blocking(move || HmacKey::derive(&derive_passphrase, &conf))
            .await
            .expect("key derivation task panicked")?;

        let session = Arc::new(Session::new(passphrase, hmac));

        let mut active = self.active.write().unwrap();
        if active.is_some() {
            return Err(SessionError::Active);
        }
        *active = Some(Arc::clone(&session));

        Ok(session)
    }

    /// The active session, if any.
    pub fn active(&self) -> Option<Arc<Session>> {
        self.active.read().unwrap().clone()
    }

    /// Stop and clear the active session. Safe to call when none is active.
    pub fn stop(&self) {
        let session = self.active.write().unwrap().take();
        if let Some(session) = session {
            session.stop();
        }
    }
}

/// Stops the registry's active session on drop.
///
/// The engine holds one of these so every exit path, including panics,
/// tears the session down.
pub struct SessionStopGuard {
    registry: SessionRegistry,
}

impl SessionStopGuard {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }
}

impl Drop for SessionStopGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            warn!("Stopping session after engine panic");
        }
        self.registry.stop();
    }
}
