//! `GET /1.0/status`: this node's name, address and services.
//!
//! Served to any TLS client: a joiner resolves the initiator's
//! human-readable name through this endpoint before either side trusts
//! the other, authenticating the initiator by certificate pinning alone.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use microcloud_core::NodeStatus;

use crate::state::AppState;

pub async fn get(State(state): State<Arc<AppState>>) -> Json<NodeStatus> {
    Json(NodeStatus {
        name: state.name.clone(),
        address: state.address.clone(),
        services: state.services.types(),
    })
}
