//! Liveness probe.

/// The process answers as long as the runtime is alive; fleet health is
/// reported separately under `/status`.
#[tracing::instrument]
pub async fn health_check() -> &'static str {
    "OK"
}
