//! HTTP API of the daemon.
//!
//! All routes live under the versioned `/1.0` base path. The websocket
//! endpoints and `session/stop` are mTLS-gated (Unix-socket callers are
//! trusted), `session/join` is HMAC-gated, and `status` is reachable by
//! any TLS client so a joiner can resolve the initiator's name before any
//! trust exists.

pub mod auth;
pub mod session;
pub mod session_join;
pub mod status;

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Build the daemon router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/1.0/session/initiating", get(session::initiating))
        .route("/1.0/session/joining", get(session::joining))
        .route("/1.0/session/stop", post(session::stop))
        .route("/1.0/session/join", post(session_join::post))
        .route("/1.0/status", get(status::get))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error payload returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// An HTTP error with a JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}
