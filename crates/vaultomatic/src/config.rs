//! Configuration
//!
//! Command-line / environment settings for the binary, plus the tuning
//! constants for each subsystem with sensible defaults.

use clap::Args;
use std::time::Duration;

/// Settings for the `run` subcommand (env prefix `VOM_`).
#[derive(Debug, Clone, Args)]
pub struct Settings {
    /// etcd endpoints (comma-separated)
    #[arg(
        long,
        env = "VOM_ETCD_ENDPOINTS",
        default_value = "http://127.0.0.1:2379",
        value_delimiter = ','
    )]
    pub etcd_endpoints: Vec<String>,

    /// etcd key holding the unseal key document
    #[arg(long, env = "VOM_KEYS_KEY", default_value = "/vaultomatic/vault_keys")]
    pub keys_key: String,

    /// Namespace the Vault pods run in
    #[arg(long, env = "VOM_VAULT_NAMESPACE", default_value = "vault")]
    pub namespace: String,

    /// Label selector matching the Vault server pods
    #[arg(
        long,
        env = "VOM_VAULT_SELECTOR",
        default_value = "app.kubernetes.io/name=vault,component=server"
    )]
    pub selector: String,

    /// Headless service giving each Vault pod a stable DNS name
    #[arg(long, env = "VOM_VAULT_SERVICE", default_value = "vault-internal")]
    pub headless_service: String,

    /// Vault API port
    #[arg(long, env = "VOM_VAULT_PORT", default_value_t = 8200)]
    pub vault_port: u16,

    /// Address the HTTP API binds to
    #[arg(long, env = "VOM_BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: String,
}

impl Settings {
    pub fn etcd(&self) -> EtcdConfig {
        EtcdConfig {
            endpoints: self.etcd_endpoints.clone(),
            keys_key: self.keys_key.clone(),
            ..Default::default()
        }
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            namespace: self.namespace.clone(),
            selector: self.selector.clone(),
            headless_service: self.headless_service.clone(),
            vault_port: self.vault_port,
            ..Default::default()
        }
    }
}

/// Durable key store connection.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    pub endpoints: Vec<String>,

    /// Single key the unseal document lives under
    pub keys_key: String,

    /// Initial interval for connection retry
    pub backoff_initial: Duration,

    /// Maximum interval for connection retry
    pub backoff_max: Duration,

    /// Give up connecting after this long
    pub backoff_max_elapsed: Duration,

    pub backoff_multiplier: f64,
}

impl Default for EtcdConfig {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            keys_key: "/vaultomatic/vault_keys".to_string(),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            backoff_max_elapsed: Duration::from_secs(60),
            backoff_multiplier: 2.0,
        }
    }
}

/// Key cache persistence.
#[derive(Debug, Clone)]
pub struct KeyCacheConfig {
    /// Fixed delay between failed persist attempts
    pub persist_retry_delay: Duration,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self {
            persist_retry_delay: Duration::from_secs(2),
        }
    }
}

/// Per-instance polling.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Poll interval while the instance is unsealed
    pub healthy_interval: Duration,

    /// Base (seconds) of the exponential backoff while unhealthy
    pub backoff_base: f64,

    /// Cap on the backoff exponent
    pub max_backoff_exponent: u32,

    /// Timeout for every request to a Vault instance
    pub request_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            healthy_interval: Duration::from_secs(10),
            backoff_base: 1.5,
            max_backoff_exponent: 10,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    /// Delay before the next poll of an instance that is not unsealed.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.min(self.max_backoff_exponent);
        Duration::from_secs_f64(self.backoff_base.powi(exponent as i32))
    }
}

/// Pod discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub namespace: String,
    pub selector: String,
    pub headless_service: String,
    pub vault_port: u16,

    /// Server-side long-poll timeout of each watch request (seconds)
    pub watch_timeout_secs: u32,

    /// Delay before resubscribing after a non-expiry API error
    pub api_error_delay: Duration,

    pub supervisor: SupervisorConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            namespace: "vault".to_string(),
            selector: "app.kubernetes.io/name=vault,component=server".to_string(),
            headless_service: "vault-internal".to_string(),
            vault_port: 8200,
            watch_timeout_secs: 5,
            api_error_delay: Duration::from_secs(5),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Vault API address of a pod, reached through the headless service.
    pub fn instance_address(&self, pod_name: &str) -> String {
        format!(
            "http://{}.{}:{}",
            pod_name, self.headless_service, self.vault_port
        )
    }
}
