//! The session protocol engine.
//!
//! Both roles enter through their websocket endpoint and share the same
//! preamble: read one configuration frame, start the session, and arm a
//! stop guard so every exit path tears the session down. From there the
//! initiator broadcasts and collects intents until its human confirms a
//! subset, then fans the confirmation out to every confirmed joiner in
//! parallel; the joiner announces itself to the initiator and waits for
//! the confirmation to come back through its own join endpoint.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use microcloud_core::{Certificate, JoinIntent, ServiceType, SessionFrame, PROTOCOL_VERSION};
use tokio::task::JoinSet;
use tracing::info;

use crate::client;
use crate::context::TIMEOUT_CAUSE;
use crate::discovery;
use crate::gateway::WebsocketGateway;
use crate::session::{IntentConsumer, Session, SessionStopGuard};
use crate::state::AppState;
use crate::tls::ServerVerify;

/// Fallback for a joiner frame without a `lookupTimeout`.
const DEFAULT_LOOKUP_TIMEOUT: &str = "1m";

/// Run the initiator role over the given gateway.
pub async fn initiating(state: &Arc<AppState>, gw: &WebsocketGateway) -> Result<()> {
    let ctx = gw.context();

    let frame = gw
        .receive_with_context(ctx)
        .await
        .context("Failed to read session start message")?;

    let (session, mut consumer) = start_session(state, &frame).await?;
    let _stop = SessionStopGuard::new(state.sessions.clone());

    // Hand the passphrase to the human before anything else happens.
    gw.write(&SessionFrame {
        passphrase: Some(session.passphrase().to_string()),
        ..Default::default()
    })
    .await
    .context("Failed to send session details")?;

    let address = required(&frame.address, "address")?;
    let iface = required(&frame.interface, "interface")?;
    session
        .broadcast(&state.name, &address, &iface, state.port)
        .await
        .context("Failed to start broadcast")?;

    let confirmed = confirmed_intents(&mut consumer, gw).await?;
    info!(count = confirmed.len(), "Confirming join intents");

    let services = frame
        .services
        .clone()
        .unwrap_or_else(|| state.services.types());

    let mut fanout = JoinSet::new();
    for intent in confirmed {
        let peer_cert = Certificate::from_pem(&intent.certificate)
            .context("Failed to parse certificate of confirmed intent")?;

        // Let the joiner's subsequent mTLS calls through our gate.
        session.allow(&intent.name, peer_cert.clone());

        let own_intent = own_intent(state, &address, services.clone());
        let hmac = session.hmac_key().clone();
        let identity = state.identity.clone();
        let ctx = ctx.clone();

        // This call polls: the peer answers once its side of the session
        // is ready to take the confirmation.
        fanout.spawn(async move {
            client::request_join_intent(
                &ctx,
                &intent.address,
                &identity,
                ServerVerify::Pinned(peer_cert),
                &hmac,
                &own_intent,
            )
            .await
            .with_context(|| format!("Peer {:?}", intent.name))
            .map(|_| ())
        });
    }

    // No partial acceptance: one failed peer fails the whole session.
    while let Some(joined) = fanout.join_next().await {
        joined
            .context("Fan-out task failed")?
            .context("Failed to confirm join intents")?;
    }

    gw.write(&SessionFrame {
        accepted: Some(true),
        ..Default::default()
    })
    .await
    .context("Failed to send confirmation")?;

    Ok(())
}

/// Run the joiner role over the given gateway.
pub async fn joining(state: &Arc<AppState>, gw: &WebsocketGateway) -> Result<()> {
    let ctx = gw.context();

    let frame = gw
        .receive_with_context(ctx)
        .await
        .context("Failed to read session start message")?;

    let (session, mut consumer) = start_session(state, &frame).await?;
    let _stop = SessionStopGuard::new(state.sessions.clone());

    let address = required(&frame.address, "address")?;
    let services = frame
        .services
        .clone()
        .unwrap_or_else(|| state.services.types());

    // No initiator given: discover one on the local segment.
    let initiator_address = match frame.initiator_address.clone().filter(|a| !a.is_empty()) {
        Some(initiator_address) => initiator_address,
        None => {
            let iface = required(&frame.interface, "interface")?;
            let timeout = frame
                .lookup_timeout
                .as_deref()
                .unwrap_or(DEFAULT_LOOKUP_TIMEOUT);
            let timeout = microcloud_core::parse_duration(timeout)
                .map_err(|e| anyhow!("Failed to parse lookup timeout: {e}"))?;

            let lookup_ctx = ctx.child_with_timeout(
                timeout,
                format!("{TIMEOUT_CAUSE}: no eligible peer discovered"),
            );
            let peer = discovery::lookup_peer(&lookup_ctx, &iface, PROTOCOL_VERSION).await?;
            peer.address
        }
    };

    // First contact: the initiator's certificate is unknown, so TLS
    // verification is skipped for this single call and the certificate is
    // captured from the handshake instead.
    let own_intent = own_intent(state, &address, services);
    let initiator_cert = client::request_join_intent(
        ctx,
        &initiator_address,
        &state.identity,
        ServerVerify::Insecure,
        session.hmac_key(),
        &own_intent,
    )
    .await
    .context("Failed to request join intent")?;
    let initiator_fingerprint = initiator_cert.fingerprint();

    let peer_status = client::remote_status(ctx, &initiator_address, &state.identity, &initiator_cert)
        .await
        .context("Failed to retrieve cluster status")?;

    // Give the human the material to compare fingerprints.
    gw.write(&SessionFrame {
        initiator_name: Some(peer_status.name),
        initiator_address: Some(initiator_address),
        initiator_fingerprint: Some(initiator_fingerprint),
        ..Default::default()
    })
    .await
    .context("Failed to send the initiator details")?;

    // Wait for the initiator's confirmed intent, pushed through our own
    // join endpoint.
    let confirmed = tokio::select! {
        intent = consumer.recv() => intent.ok_or_else(|| anyhow!("Join intent channel closed"))?,
        cause = ctx.done() => bail!("Exit waiting for join confirmation: {cause}"),
    };

    gw.write(&SessionFrame {
        intent: Some(confirmed.clone()),
        ..Default::default()
    })
    .await
    .context("Failed to forward join confirmation")?;

    let initiator_cert = Certificate::from_pem(&confirmed.certificate)
        .context("Failed to parse certificate")?;
    session.allow(&confirmed.name, initiator_cert);

    // Hold the session open until it is stopped or the context fires.
    let error = tokio::select! {
        () = session.exited() => String::new(),
        cause = ctx.done() => format!("Exit waiting for session to end: {cause}"),
    };

    gw.write(&SessionFrame {
        error: Some(error),
        ..Default::default()
    })
    .await
    .context("Failed to signal final message")?;

    Ok(())
}

/// Common preamble: start the session from the configuration frame and
/// take the intent consumer.
async fn start_session(
    state: &Arc<AppState>,
    frame: &SessionFrame,
) -> Result<(Arc<Session>, IntentConsumer)> {
    let passphrase = frame.passphrase.clone().unwrap_or_default();
    let session = state
        .sessions
        .start(passphrase)
        .await
        .context("Failed to start session")?;

    let consumer = session
        .consume_intents()
        .ok_or_else(|| anyhow!("Join intent channel already consumed"))?;

    Ok((session, consumer))
}

/// The intent-collection loop: forward inbound intents to the front-end
/// until it answers with the confirmed subset.
async fn confirmed_intents(
    consumer: &mut IntentConsumer,
    gw: &WebsocketGateway,
) -> Result<Vec<JoinIntent>> {
    loop {
        tokio::select! {
            intent = consumer.recv() => {
                let intent = intent.ok_or_else(|| anyhow!("Join intent channel closed"))?;
                gw.write(&SessionFrame {
                    intent: Some(intent),
                    ..Default::default()
                })
                .await
                .context("Failed to forward join intent")?;
            }
            message = gw.receive() => {
                let data = message.ok_or_else(|| anyhow!("websocket connection closed"))?;
                let frame = SessionFrame::from_json(&data)
                    .ok_or_else(|| anyhow!("Failed to read confirmed intents"))?;
                return Ok(frame.confirmed_intents.unwrap_or_default());
            }
            cause = gw.context().done() => bail!("Exit waiting for intents: {cause}"),
        }
    }
}

/// This node's own join intent, carrying its server certificate.
fn own_intent(state: &AppState, address: &str, services: Vec<ServiceType>) -> JoinIntent {
    JoinIntent {
        version: PROTOCOL_VERSION.to_string(),
        name: state.name.clone(),
        address: address.to_string(),
        certificate: state.identity.cert_pem(),
        services,
    }
}

fn required(field: &Option<String>, name: &str) -> Result<String> {
    field
        .clone()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("Session frame is missing the {name}"))
}
