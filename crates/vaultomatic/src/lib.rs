//! Vaultomatic
//!
//! Keeps a fleet of Vault server pods unsealed. Unseal keys are accepted over
//! HTTP, cached in memory and persisted to etcd; a pod watch starts one
//! supervisor per Vault instance which submits a random quorum of shares
//! whenever the instance reports itself sealed.

pub mod api;
pub mod config;
pub mod discovery;
pub mod keys;
pub mod observability;
pub mod vault;

#[cfg(test)]
mod testing;
