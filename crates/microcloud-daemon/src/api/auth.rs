//! Per-request authentication gates.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use microcloud_core::Certificate;
use tracing::debug;

use crate::api::ApiError;
use crate::session::Session;
use crate::state::AppState;

/// What the listener learned about a connection before HTTP started.
///
/// Injected as a request extension by the accept loops.
#[derive(Clone, Default)]
pub struct ConnectionMeta {
    /// Connection arrived over the local Unix socket.
    pub unix_socket: bool,
    /// Client certificates presented during the TLS handshake.
    pub peer_certificates: Vec<Certificate>,
}

impl ConnectionMeta {
    pub fn unix() -> Self {
        Self {
            unix_socket: true,
            peer_certificates: Vec::new(),
        }
    }

    pub fn tls(peer_certificates: Vec<Certificate>) -> Self {
        Self {
            unix_socket: false,
            peer_certificates,
        }
    }
}

/// mTLS gate: Unix-socket callers pass, otherwise a presented certificate
/// must match the permanent trust store or the active session's temporary
/// one.
pub fn authorize_mtls(state: &AppState, meta: &ConnectionMeta) -> Result<(), ApiError> {
    if meta.unix_socket {
        debug!("Allowing unauthenticated request through unix socket");
        return Ok(());
    }

    if state.is_trusted_peer(&meta.peer_certificates) {
        return Ok(());
    }

    Err(ApiError::forbidden("Failed to authenticate using mTLS"))
}

/// HMAC gate: requires an active session and a valid `Authorization`
/// header over the exact body bytes. Returns the session on success.
pub fn authorize_hmac(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Arc<Session>, ApiError> {
    let session = state
        .sessions
        .active()
        .ok_or_else(|| ApiError::bad_request("No active session"))?;

    let header = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing or malformed Authorization header"))?;

    session
        .hmac_key()
        .verify_header(header, body)
        .map_err(|e| ApiError::unauthorized(e.to_string()))?;

    Ok(session)
}
