//! HTTP API Module
//!
//! Ingress for key material and read-only status.
//!
//! This module contains:
//! - `state`: Shared application state
//! - `keys`: Key material upload and redacted summary
//! - `status`: Key store and fleet health
//! - `health`: Liveness probe
//! - `metrics`: Prometheus metrics endpoint

mod health;
mod keys;
mod metrics;
mod state;
mod status;

pub use state::AppState;

use axum::{routing::get, Router};

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/keys", get(keys::get_keys).post(keys::put_keys))
        .route("/status", get(status::get_status))
        // Health checks
        .route("/health", get(health::health_check))
        // Observability
        .route("/metrics", get(metrics::get_metrics))
        .with_state(state)
}
