//! End-to-end tests for the trust-establishment session.
//!
//! Each test brings up one or two full in-process daemons and drives them
//! the way the interactive front-end would: over websockets on the Unix
//! control socket. Peer traffic runs over real TLS between the daemons.
//!
//! Discovery is exercised separately (see `discovery` unit tests); the
//! session tests pass `initiatorAddress` explicitly so they do not depend
//! on multicast routing in the sandbox.

use std::path::Path;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use microcloud_core::{HmacConf, HmacKey, JoinIntent, ServiceType, SessionFrame, PROTOCOL_VERSION};
use microcloud_daemon::identity::Identity;
use microcloud_daemon::tls::ServerVerify;
use microcloud_daemon::{client, Daemon, DaemonConfig, SessionContext};
use tempfile::TempDir;
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Cheap Argon2 parameters so tests don't spend seconds in the KDF.
fn test_hmac_conf() -> HmacConf {
    HmacConf {
        memory: 8 * 1024,
        iterations: 1,
        parallelism: 1,
        ..HmacConf::default()
    }
}

async fn spawn_daemon(name: &str, services: Vec<ServiceType>) -> (Daemon, TempDir) {
    let dir = TempDir::new().expect("Failed to create state dir");

    let mut config = DaemonConfig::new(name, "127.0.0.1", dir.path().to_path_buf());
    config.listen = "127.0.0.1".to_string();
    config.port = 0;
    config.services = services;
    config.hmac = test_hmac_conf();

    let daemon = Daemon::spawn(config).await.expect("Failed to spawn daemon");
    (daemon, dir)
}

/// Front-end driver for one session websocket.
struct FrontEnd {
    ws: WebSocketStream<UnixStream>,
}

impl FrontEnd {
    /// Open the initiator websocket on the daemon's control socket.
    async fn initiating(daemon: &Daemon) -> Self {
        Self::connect(&daemon.unix_socket, "/1.0/session/initiating").await
    }

    /// Open the joiner websocket on the daemon's control socket.
    async fn joining(daemon: &Daemon) -> Self {
        Self::connect(&daemon.unix_socket, "/1.0/session/joining").await
    }

    async fn connect(socket: &Path, path: &str) -> Self {
        let stream = UnixStream::connect(socket)
            .await
            .expect("Failed to connect to control socket");
        let url = format!("ws://microcloud{path}");
        let (ws, _) = tokio_tungstenite::client_async(url, stream)
            .await
            .expect("Websocket handshake failed");

        Self { ws }
    }

    async fn send(&mut self, frame: SessionFrame) {
        let payload = String::from_utf8(frame.to_json()).unwrap();
        self.ws
            .send(Message::Text(payload.into()))
            .await
            .expect("Failed to send session frame");
    }

    /// Receive the next session frame; panics on close.
    async fn recv(&mut self) -> SessionFrame {
        loop {
            match timeout(Duration::from_secs(10), self.ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return SessionFrame::from_json(text.as_bytes()).expect("Invalid session frame")
                }
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(Some(Ok(Message::Close(frame)))) => {
                    panic!("Websocket closed unexpectedly: {frame:?}")
                }
                Ok(other) => panic!("Unexpected websocket message: {other:?}"),
                Err(_) => panic!("Timed out waiting for session frame"),
            }
        }
    }

    /// Attempt to receive a frame within the given window.
    async fn try_recv(&mut self, window: Duration) -> Option<SessionFrame> {
        match timeout(window, self.ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                Some(SessionFrame::from_json(text.as_bytes()).expect("Invalid session frame"))
            }
            _ => None,
        }
    }

    /// Read until the close frame and return its reason.
    async fn recv_close(&mut self) -> String {
        loop {
            match timeout(Duration::from_secs(10), self.ws.next()).await {
                Ok(Some(Ok(Message::Close(frame)))) => {
                    return frame.map(|f| f.reason.to_string()).unwrap_or_default()
                }
                Ok(Some(Ok(_))) => continue,
                Ok(None) => panic!("Websocket stream ended without a close frame"),
                Ok(Some(Err(e))) => panic!("Websocket error while awaiting close: {e}"),
                Err(_) => panic!("Timed out waiting for close frame"),
            }
        }
    }

    async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// POST to the daemon's control socket, returning status and body.
async fn unix_post(socket: &Path, path: &str) -> (http::StatusCode, Vec<u8>) {
    use http_body_util::{BodyExt, Full};
    use hyper_util::rt::TokioIo;

    let stream = UnixStream::connect(socket)
        .await
        .expect("Failed to connect to control socket");
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .expect("HTTP handshake failed");
    tokio::spawn(async move {
        let _ = connection.await;
    });

    let request = http::Request::builder()
        .method(http::Method::POST)
        .uri(path)
        .header(http::header::HOST, "microcloud")
        .body(Full::new(bytes::Bytes::new()))
        .unwrap();

    let response = sender.send_request(request).await.expect("Request failed");
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

fn initiator_config(daemon: &Daemon, passphrase: &str) -> SessionFrame {
    SessionFrame {
        passphrase: Some(passphrase.to_string()),
        address: Some(format!("127.0.0.1:{}", daemon.local_addr.port())),
        interface: Some("lo".to_string()),
        services: Some(vec![ServiceType::Core]),
        ..Default::default()
    }
}

fn joiner_config(daemon: &Daemon, initiator: &Daemon, passphrase: &str) -> SessionFrame {
    SessionFrame {
        passphrase: Some(passphrase.to_string()),
        address: Some(format!("127.0.0.1:{}", daemon.local_addr.port())),
        interface: Some("lo".to_string()),
        services: Some(vec![ServiceType::Core]),
        initiator_address: Some(format!("127.0.0.1:{}", initiator.local_addr.port())),
        lookup_timeout: Some("5s".to_string()),
        ..Default::default()
    }
}

/// Wait until `check` passes or the deadline expires.
async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Condition did not hold within the deadline");
}

// ============================================================================
// Happy path
// ============================================================================

#[tokio::test]
async fn test_two_node_happy_path() {
    let (initiator, _dir_i) = spawn_daemon("node-i", vec![]).await;
    let (joiner, _dir_j) = spawn_daemon("node-j", vec![]).await;

    let mut fe_i = FrontEnd::initiating(&initiator).await;
    fe_i.send(initiator_config(&initiator, "")).await;

    // The generated passphrase comes back for the human to transfer.
    let frame = fe_i.recv().await;
    let passphrase = frame.passphrase.expect("Expected passphrase frame");
    assert_eq!(passphrase.split(' ').count(), 4);

    let mut fe_j = FrontEnd::joining(&joiner).await;
    fe_j.send(joiner_config(&joiner, &initiator, &passphrase))
        .await;

    // The joiner reports the initiator's identity for comparison.
    let frame = fe_j.recv().await;
    assert_eq!(frame.initiator_name.as_deref(), Some("node-i"));
    assert_eq!(
        frame.initiator_address.as_deref(),
        Some(format!("127.0.0.1:{}", initiator.local_addr.port()).as_str())
    );
    assert_eq!(
        frame.initiator_fingerprint.as_deref(),
        Some(initiator.state.identity.fingerprint().as_str())
    );

    // The initiator's front-end observes the joiner's intent.
    let frame = fe_i.recv().await;
    let intent = frame.intent.expect("Expected intent frame");
    assert_eq!(intent.name, "node-j");
    assert_eq!(intent.services, vec![ServiceType::Core]);

    // The initiator's temporary trust store only lives until its engine
    // returns, so watch it concurrently while the fan-out runs.
    let initiator_session = initiator.state.sessions.active().unwrap();
    let joiner_trusted = tokio::spawn(async move {
        for _ in 0..1000 {
            if initiator_session.trust_store().contains_key("node-j") {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        false
    });

    // Human approves; the engine fans the confirmation out.
    fe_i.send(SessionFrame {
        confirmed_intents: Some(vec![intent]),
        ..Default::default()
    })
    .await;

    // The joiner sees the initiator's confirmed intent.
    let frame = fe_j.recv().await;
    let confirmed = frame.intent.expect("Expected confirmed intent frame");
    assert_eq!(confirmed.name, "node-i");

    // Both temporary trust stores held the other side's certificate.
    assert!(joiner_trusted.await.unwrap());
    let joiner_state = joiner.state.clone();
    eventually(move || {
        joiner_state
            .sessions
            .active()
            .is_some_and(|s| s.trust_store().contains_key("node-i"))
    })
    .await;

    let frame = fe_i.recv().await;
    assert_eq!(frame.accepted, Some(true));

    // The joiner's front-end is done with the session; stopping it
    // resolves the final wait with a clean exit.
    let (status, _) = unix_post(&joiner.unix_socket, "/1.0/session/stop").await;
    assert_eq!(status, http::StatusCode::OK);

    let frame = fe_j.recv().await;
    assert_eq!(frame.error.as_deref(), Some(""));

    fe_i.close().await;
    fe_j.close().await;
}

// ============================================================================
// Auth failures
// ============================================================================

#[tokio::test]
async fn test_wrong_passphrase_rejected() {
    let (initiator, _dir_i) = spawn_daemon("node-i", vec![]).await;
    let (joiner, _dir_j) = spawn_daemon("node-j", vec![]).await;

    let mut fe_i = FrontEnd::initiating(&initiator).await;
    fe_i.send(initiator_config(&initiator, "")).await;
    let frame = fe_i.recv().await;
    assert!(frame.passphrase.is_some());

    // The human mistypes the passphrase.
    let mut fe_j = FrontEnd::joining(&joiner).await;
    fe_j.send(joiner_config(&joiner, &initiator, "foo bar baz qux"))
        .await;

    let reason = fe_j.recv_close().await;
    assert!(
        reason.contains("Failed to request join intent"),
        "unexpected close reason: {reason}"
    );
    assert!(reason.contains("HMAC"), "unexpected close reason: {reason}");

    // The initiator never observed an intent.
    assert!(fe_i.try_recv(Duration::from_millis(300)).await.is_none());

    fe_i.close().await;
}

#[tokio::test]
async fn test_service_mismatch_rejected() {
    // The initiator requires storage on every peer.
    let (initiator, _dir_i) = spawn_daemon("node-i", vec![ServiceType::Storage]).await;
    let (joiner, _dir_j) = spawn_daemon("node-j", vec![]).await;

    let mut fe_i = FrontEnd::initiating(&initiator).await;
    let mut config = initiator_config(&initiator, "");
    config.services = Some(vec![ServiceType::Core, ServiceType::Storage]);
    fe_i.send(config).await;
    let passphrase = fe_i.recv().await.passphrase.unwrap();

    // The joiner only offers the core service.
    let mut fe_j = FrontEnd::joining(&joiner).await;
    fe_j.send(joiner_config(&joiner, &initiator, &passphrase))
        .await;

    let reason = fe_j.recv_close().await;
    assert!(
        reason.contains("missing services"),
        "unexpected close reason: {reason}"
    );

    // The intent never reached the initiator's collection loop.
    assert!(fe_i.try_recv(Duration::from_millis(300)).await.is_none());

    fe_i.close().await;
}

// ============================================================================
// Timeouts
// ============================================================================

#[tokio::test]
async fn test_lookup_timeout_cause_reaches_front_end() {
    let (joiner, _dir_j) = spawn_daemon("node-j", vec![]).await;

    // Nobody is broadcasting; discovery must give up after 50ms.
    let mut fe_j = FrontEnd::joining(&joiner).await;
    fe_j.send(SessionFrame {
        passphrase: Some("olive branch cement toast".to_string()),
        address: Some(format!("127.0.0.1:{}", joiner.local_addr.port())),
        interface: Some("lo".to_string()),
        services: Some(vec![ServiceType::Core]),
        lookup_timeout: Some("50ms".to_string()),
        ..Default::default()
    })
    .await;

    let reason = fe_j.recv_close().await;
    assert!(
        reason.contains("Session timeout exceeded"),
        "unexpected close reason: {reason}"
    );
}

#[tokio::test]
async fn test_session_timeout_cause_reaches_front_end() {
    let (initiator, _dir_i) = spawn_daemon("node-i", vec![]).await;

    let stream = UnixStream::connect(&initiator.unix_socket).await.unwrap();
    let (ws, _) = tokio_tungstenite::client_async(
        "ws://microcloud/1.0/session/initiating?timeout=200ms",
        stream,
    )
    .await
    .expect("Websocket handshake failed");
    let mut fe_i = FrontEnd { ws };

    fe_i.send(initiator_config(&initiator, "")).await;
    let frame = fe_i.recv().await;
    assert!(frame.passphrase.is_some());

    // Never confirm anything; the session context must fire.
    let reason = fe_i.recv_close().await;
    assert!(
        reason.contains("Session timeout exceeded"),
        "unexpected close reason: {reason}"
    );
}

// ============================================================================
// Single session
// ============================================================================

#[tokio::test]
async fn test_second_session_is_rejected() {
    let (initiator, _dir_i) = spawn_daemon("node-i", vec![]).await;

    let mut fe_i = FrontEnd::initiating(&initiator).await;
    fe_i.send(initiator_config(&initiator, "")).await;
    assert!(fe_i.recv().await.passphrase.is_some());

    // A second upgrade attempt is refused before the upgrade happens.
    let stream = UnixStream::connect(&initiator.unix_socket).await.unwrap();
    let result =
        tokio_tungstenite::client_async("ws://microcloud/1.0/session/initiating", stream).await;
    assert!(result.is_err(), "second session should be rejected");

    fe_i.close().await;
}

// ============================================================================
// Intent endpoint edge cases
// ============================================================================

/// A bare-hands joiner: its own identity and signed intent, no daemon.
struct ManualJoiner {
    identity: Identity,
    hmac: HmacKey,
}

impl ManualJoiner {
    fn new(name: &str, passphrase: &str) -> Self {
        Self {
            identity: Identity::generate(name).unwrap(),
            hmac: HmacKey::derive(passphrase, &test_hmac_conf()).unwrap(),
        }
    }

    fn intent(&self, name: &str) -> JoinIntent {
        JoinIntent {
            version: PROTOCOL_VERSION.to_string(),
            name: name.to_string(),
            address: "127.0.0.1:1".to_string(),
            certificate: self.identity.cert_pem(),
            services: vec![ServiceType::Core],
        }
    }

    async fn post_intent(&self, target: &Daemon, intent: &JoinIntent) -> anyhow::Result<()> {
        let ctx = SessionContext::new();
        client::request_join_intent(
            &ctx,
            &format!("127.0.0.1:{}", target.local_addr.port()),
            &self.identity,
            ServerVerify::Insecure,
            &self.hmac,
            intent,
        )
        .await
        .map(|_| ())
    }
}

#[tokio::test]
async fn test_duplicate_intent_rejected() {
    let (initiator, _dir_i) = spawn_daemon("node-i", vec![]).await;

    let mut fe_i = FrontEnd::initiating(&initiator).await;
    fe_i.send(initiator_config(&initiator, "")).await;
    let passphrase = fe_i.recv().await.passphrase.unwrap();

    let joiner = ManualJoiner::new("node-j", &passphrase);
    let intent = joiner.intent("node-j");

    joiner
        .post_intent(&initiator, &intent)
        .await
        .expect("first intent should be accepted");

    let err = joiner
        .post_intent(&initiator, &intent)
        .await
        .expect_err("replayed intent should be rejected");
    assert!(
        err.to_string().contains("Failed to register join intent"),
        "unexpected error: {err:#}"
    );

    // Exactly one intent reached the collection loop.
    assert!(fe_i.recv().await.intent.is_some());
    assert!(fe_i.try_recv(Duration::from_millis(300)).await.is_none());

    fe_i.close().await;
}

#[tokio::test]
async fn test_post_without_consumer_returns_error_not_deadlock() {
    let (daemon, _dir) = spawn_daemon("node-i", vec![]).await;

    // A session exists but no engine is consuming: the front-end's
    // websocket never showed up.
    let passphrase = "olive branch cement toast";
    daemon
        .state
        .sessions
        .start(passphrase.to_string())
        .await
        .unwrap();

    let joiner = ManualJoiner::new("node-j", passphrase);
    let intent = joiner.intent("node-j");

    let err = timeout(Duration::from_secs(5), joiner.post_intent(&daemon, &intent))
        .await
        .expect("the join endpoint must not park")
        .expect_err("offer without consumer should fail");
    assert!(
        err.to_string().contains("No active consumer"),
        "unexpected error: {err:#}"
    );

    daemon.state.sessions.stop();
}

#[tokio::test]
async fn test_front_end_drop_during_collection() {
    let (initiator, _dir_i) = spawn_daemon("node-i", vec![]).await;

    let mut fe_i = FrontEnd::initiating(&initiator).await;
    fe_i.send(initiator_config(&initiator, "")).await;
    let passphrase = fe_i.recv().await.passphrase.unwrap();

    // The front-end dies while the engine is collecting intents.
    fe_i.close().await;

    // Give the engine a moment to observe the closed socket.
    let state = initiator.state.clone();
    eventually(move || state.sessions.active().is_none()).await;

    // A late joiner gets an error instead of a parked request.
    let joiner = ManualJoiner::new("node-j", &passphrase);
    let intent = joiner.intent("node-j");
    let err = timeout(Duration::from_secs(5), joiner.post_intent(&initiator, &intent))
        .await
        .expect("the join endpoint must not park")
        .expect_err("post after front-end drop should fail");
    assert!(
        err.to_string().contains("No active"),
        "unexpected error: {err:#}"
    );
}
