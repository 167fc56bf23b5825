//! Prometheus Metrics
//!
//! Metrics tracked:
//! - `vaultomatic_instances` - gauge of supervised Vault instances
//! - `vaultomatic_fleet_healthy` - 1 when every instance is unsealed
//! - `vaultomatic_unseal_submissions_total` - unseal submissions by outcome
//! - `vaultomatic_key_persist_attempts_total` - durable writes by outcome
//! - `vaultomatic_watch_restarts_total` - pod watch resubscriptions by reason

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// State containing the Prometheus handle for metrics export
#[derive(Clone)]
pub struct MetricsState {
    pub prometheus_handle: PrometheusHandle,
}

/// Install the Prometheus recorder and register metric descriptions.
pub fn init_metrics() -> Result<MetricsState, Box<dyn std::error::Error + Send + Sync>> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_metric_descriptions();

    Ok(MetricsState {
        prometheus_handle: handle,
    })
}

fn register_metric_descriptions() {
    describe_gauge!(
        "vaultomatic_instances",
        "Number of Vault instances being supervised"
    );
    describe_gauge!(
        "vaultomatic_fleet_healthy",
        "1 when every supervised Vault instance is unsealed"
    );
    describe_counter!(
        "vaultomatic_unseal_submissions_total",
        "Unseal key submissions by outcome"
    );
    describe_counter!(
        "vaultomatic_key_persist_attempts_total",
        "Attempts to persist unseal keys by outcome"
    );
    describe_counter!(
        "vaultomatic_watch_restarts_total",
        "Pod watch resubscriptions by reason"
    );
}

/// Update the fleet gauges after a discovery iteration
pub fn set_fleet_status(instances: usize, healthy: bool) {
    gauge!("vaultomatic_instances").set(instances as f64);
    gauge!("vaultomatic_fleet_healthy").set(if healthy { 1.0 } else { 0.0 });
}

/// Record an unseal submission
pub fn record_unseal_submission(outcome: &str) {
    counter!(
        "vaultomatic_unseal_submissions_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a persist attempt against the durable key store
pub fn record_persist_attempt(outcome: &str) {
    counter!(
        "vaultomatic_key_persist_attempts_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a pod watch resubscription
pub fn record_watch_restart(reason: &str) {
    counter!(
        "vaultomatic_watch_restarts_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}
