//! Application State
//!
//! Shared state passed to all API handlers.

use crate::discovery::FleetStatusHandle;
use crate::keys::KeyCache;
use crate::observability::MetricsState;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub keys: KeyCache,
    pub fleet: FleetStatusHandle,
    pub metrics_state: Option<MetricsState>,
}
