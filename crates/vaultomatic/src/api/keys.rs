//! Key Material Endpoints
//!
//! Accepts the output of `vault operator init` and reports whether material
//! is held. Key strings are never echoed back.

use super::state::AppState;
use crate::keys::UnsealKeys;
use axum::{body::Bytes, extract::State, http::StatusCode, response::Json};
use serde::Serialize;

/// Redacted view of the cached key material.
#[derive(Debug, Default, Serialize)]
pub struct KeysSummary {
    pub has_keys: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_count: Option<usize>,
}

impl From<&UnsealKeys> for KeysSummary {
    fn from(keys: &UnsealKeys) -> Self {
        Self {
            has_keys: true,
            shares: Some(keys.unseal_shares),
            threshold: Some(keys.unseal_threshold),
            key_count: Some(keys.unseal_keys_hex.len()),
        }
    }
}

/// POST /keys - store new key material
#[tracing::instrument(skip_all)]
pub async fn put_keys(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<KeysSummary>, (StatusCode, String)> {
    let keys = UnsealKeys::from_json(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected key material");
        (StatusCode::UNPROCESSABLE_ENTITY, e.to_string())
    })?;

    let summary = KeysSummary::from(&keys);
    state.keys.write(keys).await;
    Ok(Json(summary))
}

/// GET /keys - summary of the current key material
#[tracing::instrument(skip(state))]
pub async fn get_keys(State(state): State<AppState>) -> Json<KeysSummary> {
    let summary = state
        .keys
        .read()
        .await
        .map(|keys| KeysSummary::from(keys.as_ref()))
        .unwrap_or_default();
    Json(summary)
}
