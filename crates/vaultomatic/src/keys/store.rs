//! Durable Key Store
//!
//! The key cache persists its single document through [`KeyStore`]. The
//! production implementation keeps it under one etcd key.

use crate::config::EtcdConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use etcd_client::Client;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("key store unavailable: {0}")]
    Unavailable(String),
}

/// Whole-document storage for the unseal key material.
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    /// Fetch the raw stored document, `None` if nothing is stored.
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the stored document.
    async fn save(&self, document: Vec<u8>) -> Result<(), StoreError>;
}

/// etcd-backed key store.
#[derive(Clone)]
pub struct EtcdKeyStore {
    client: Client,
    key: String,
}

impl EtcdKeyStore {
    /// Connect to etcd with exponential backoff.
    pub async fn connect(config: &EtcdConfig) -> Result<Self> {
        let backoff = ExponentialBackoff {
            initial_interval: config.backoff_initial,
            max_interval: config.backoff_max,
            max_elapsed_time: Some(config.backoff_max_elapsed),
            multiplier: config.backoff_multiplier,
            ..Default::default()
        };

        let endpoints = config.endpoints.clone();
        let client = retry(backoff, || async {
            match Client::connect(&endpoints, None).await {
                Ok(client) => {
                    debug!("Connected to etcd");
                    Ok(client)
                }
                Err(e) => {
                    warn!(error = %e, "etcd connection failed, retrying");
                    Err(backoff::Error::transient(e))
                }
            }
        })
        .await
        .map_err(|e| anyhow!("Failed to connect to etcd after retries: {:?}", e))?;

        Ok(Self::with_client(client, config.keys_key.clone()))
    }

    pub fn with_client(client: Client, key: String) -> Self {
        Self { client, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl KeyStore for EtcdKeyStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        // The client is a cheap handle over a shared channel.
        let mut client = self.client.clone();
        let resp = client.get(self.key.as_str(), None).await?;
        Ok(resp.kvs().first().map(|kv| kv.value().to_vec()))
    }

    async fn save(&self, document: Vec<u8>) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        client.put(self.key.as_str(), document, None).await?;
        Ok(())
    }
}
