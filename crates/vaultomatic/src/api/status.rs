//! Unsealer Status Endpoint

use super::state::AppState;
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// Key material is available
    pub keystore: bool,
    /// Every discovered instance is unsealed
    pub monitor: bool,
    pub instances: usize,
    pub unhealthy: usize,
}

/// GET /status
#[tracing::instrument(skip(state))]
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let fleet = state.fleet.current();
    Json(StatusResponse {
        keystore: state.keys.read().await.is_some(),
        monitor: fleet.healthy,
        instances: fleet.instances,
        unhealthy: fleet.unhealthy,
    })
}
