//! Vault Instances
//!
//! HTTP client for the seal endpoints and the per-instance supervisor.

mod client;
mod supervisor;

pub use client::{
    HttpVaultClient, HttpVaultConnector, SealStatus, VaultApi, VaultConnector, VaultError,
};
pub use supervisor::{InstanceSupervisor, SealState, SupervisorStatus};
