//! Session endpoints: the two websocket upgrades and the stop trigger.
//!
//! The websocket endpoints hijack the HTTP connection; from the upgrade
//! onwards every error has to be reported through the websocket close
//! frame, since writing to the original response would be an error.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocket;
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use microcloud_core::parse_duration;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::error;

use crate::api::auth::{self, ConnectionMeta};
use crate::api::ApiError;
use crate::context::SessionContext;
use crate::engine;
use crate::gateway::WebsocketGateway;
use crate::state::AppState;

const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy)]
enum SessionRole {
    Initiating,
    Joining,
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    timeout: Option<String>,
}

/// `GET /1.0/session/initiating`: upgrade and run the initiator engine.
pub async fn initiating(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    Extension(meta): Extension<ConnectionMeta>,
    ws: WebSocketUpgrade,
) -> Response {
    session_ws(state, query, meta, ws, SessionRole::Initiating)
}

/// `GET /1.0/session/joining`: upgrade and run the joiner engine.
pub async fn joining(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    Extension(meta): Extension<ConnectionMeta>,
    ws: WebSocketUpgrade,
) -> Response {
    session_ws(state, query, meta, ws, SessionRole::Joining)
}

fn session_ws(
    state: Arc<AppState>,
    query: SessionQuery,
    meta: ConnectionMeta,
    ws: WebSocketUpgrade,
    role: SessionRole,
) -> Response {
    if let Err(e) = auth::authorize_mtls(&state, &meta) {
        return e.into_response();
    }

    if state.sessions.active().is_some() {
        return ApiError::bad_request("There already is an active session").into_response();
    }

    let timeout = match query.timeout.as_deref() {
        None | Some("") => DEFAULT_SESSION_TIMEOUT,
        Some(raw) => match parse_duration(raw) {
            Ok(timeout) => timeout,
            Err(e) => {
                return ApiError::bad_request(format!("Failed to parse timeout: {e}"))
                    .into_response()
            }
        },
    };

    ws.on_upgrade(move |socket| run_session(state, socket, role, timeout))
}

async fn run_session(
    state: Arc<AppState>,
    socket: WebSocket,
    role: SessionRole,
    timeout: Duration,
) {
    let ctx = SessionContext::with_timeout(timeout);
    let gateway = WebsocketGateway::new(socket, ctx);

    let result = match role {
        SessionRole::Initiating => engine::initiating(&state, &gateway).await,
        SessionRole::Joining => engine::joining(&state, &gateway).await,
    };

    // The connection is hijacked; errors can only travel through the
    // websocket close frame at this point.
    if let Err(e) = result {
        if let Err(control_err) = gateway.write_close(&format!("{e:#}")).await {
            error!("Failed to write close control message: {control_err:#}");
        }
    }
}

/// `POST /1.0/session/stop`: end the active session.
///
/// Driven by the front-end once it is done with the session; for a joiner
/// that is what resolves the final wait with a clean exit.
pub async fn stop(
    State(state): State<Arc<AppState>>,
    Extension(meta): Extension<ConnectionMeta>,
) -> Result<Json<Value>, ApiError> {
    auth::authorize_mtls(&state, &meta)?;

    if state.sessions.active().is_none() {
        return Err(ApiError::bad_request("No active session"));
    }

    state.sessions.stop();
    Ok(Json(json!({})))
}
