//! Observability Module
//!
//! - `events`: Structured event logging with consistent fields
//! - `metrics`: Prometheus metrics for the fleet, unseals and persistence
//! - `tracing`: Log subscriber setup

pub mod events;
pub mod metrics;
pub mod tracing;

pub use self::metrics::{init_metrics, MetricsState};
pub use self::tracing::{init_tracing, TracingConfig};
