//! `POST /1.0/session/join`: receive a join intent from a candidate peer.
//!
//! This endpoint is the polling rendezvous of the protocol: both roles
//! learn about the other side's intent through it. It is HMAC-gated, so
//! only holders of the session passphrase get this far.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use bytes::Bytes;
use http::HeaderMap;
use microcloud_core::{Certificate, JoinIntent, PROTOCOL_VERSION};
use serde_json::{json, Value};
use tracing::info;

use crate::api::{auth, ApiError};
use crate::state::AppState;

pub async fn post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let session = auth::authorize_hmac(&state, &headers, &body)?;

    let intent: JoinIntent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::bad_request(format!("Failed to parse join intent: {e}")))?;

    if intent.version != PROTOCOL_VERSION {
        return Err(ApiError::bad_request(format!(
            "Unsupported join intent version {:?}",
            intent.version
        )));
    }

    // Reject peers that are missing any of our services.
    let missing = state.services.missing_from(&intent.services);
    if !missing.is_empty() {
        let missing = missing
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        return Err(ApiError::bad_request(format!(
            "Rejecting peer {:?} due to missing services ({missing})",
            intent.name
        )));
    }

    let cert = Certificate::from_pem(&intent.certificate)
        .map_err(|e| ApiError::bad_request(format!("Failed to get fingerprint: {e}")))?;

    session
        .register_intent(&cert.fingerprint())
        .map_err(|e| ApiError::bad_request(format!("Failed to register join intent: {e}")))?;

    // Non-blocking handoff; if the engine is gone the HTTP handler must
    // not park here waiting for a consumer that will never come back.
    session
        .offer_intent(intent.clone())
        .map_err(|e| ApiError::internal(e.to_string()))?;

    info!(peer = %intent.name, "Registered join intent");
    Ok(Json(json!({})))
}
