//! Structured Events
//!
//! Structured event logging with consistent fields across the application.
//! Each event type has a dedicated function so field names stay stable.
//!
//! Event types:
//! - `instance_added` - Vault pod discovered, supervisor started
//! - `instance_removed` - Vault pod gone, supervisor cancelled
//! - `seal_state_changed` - Supervisor observed a different seal state
//! - `fleet_health_changed` - Aggregate health flipped
//! - `keys_stored` - New unseal key material accepted
//! - `keys_persisted` - Key material reached the durable store
//! - `watch_restarted` - Pod watch resubscribed

use tracing::{info, warn};

/// Emit an instance added event
pub fn instance_added(address: &str, namespace: &str) {
    info!(
        event_type = "instance_added",
        address = %address,
        namespace = %namespace,
        "Vault instance added"
    );
}

/// Emit an instance removed event
pub fn instance_removed(address: &str, namespace: &str) {
    info!(
        event_type = "instance_removed",
        address = %address,
        namespace = %namespace,
        "Vault instance removed"
    );
}

/// Emit a seal state changed event
pub fn seal_state_changed(address: &str, previous_state: &str, new_state: &str) {
    info!(
        event_type = "seal_state_changed",
        address = %address,
        previous_state = %previous_state,
        new_state = %new_state,
        "Seal state changed"
    );
}

/// Emit a fleet health changed event
pub fn fleet_health_changed(healthy: bool, instances: usize, unhealthy: usize) {
    if healthy {
        info!(
            event_type = "fleet_health_changed",
            healthy = healthy,
            instances = instances,
            "All {} vaults are healthy",
            instances
        );
    } else {
        warn!(
            event_type = "fleet_health_changed",
            healthy = healthy,
            instances = instances,
            unhealthy = unhealthy,
            "{} of {} vaults are unhealthy",
            unhealthy,
            instances
        );
    }
}

/// Emit a keys stored event
pub fn keys_stored(shares: u32, threshold: u32) {
    info!(
        event_type = "keys_stored",
        shares = shares,
        threshold = threshold,
        "Storing new unseal keys"
    );
}

/// Emit a keys persisted event
pub fn keys_persisted(attempts: u32) {
    info!(
        event_type = "keys_persisted",
        attempts = attempts,
        "Unseal keys persisted"
    );
}

/// Emit a watch restarted event
pub fn watch_restarted(reason: &str, namespace: &str) {
    warn!(
        event_type = "watch_restarted",
        reason = %reason,
        namespace = %namespace,
        "Pod watch restarted"
    );
}
