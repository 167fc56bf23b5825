//! Vault HTTP Client
//!
//! The two `sys` endpoints the supervisor needs: seal status and unseal.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("request to {address} failed: {source}")]
    Http {
        address: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{address} returned {status}: {body}")]
    Status {
        address: String,
        status: u16,
        body: String,
    },
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Subset of `GET /v1/sys/seal-status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    pub initialized: bool,
    pub sealed: bool,
    /// Shares required to unseal
    #[serde(default, rename = "t")]
    pub threshold: u32,
    /// Shares submitted towards the current unseal
    #[serde(default)]
    pub progress: u32,
}

#[derive(Serialize)]
struct UnsealRequest<'a> {
    key: &'a str,
}

/// Operations the supervisor performs against one Vault instance.
#[async_trait]
pub trait VaultApi: Send + Sync {
    async fn seal_status(&self) -> Result<SealStatus, VaultError>;

    /// Submit unseal shares one by one, stopping once the instance unseals.
    async fn submit_unseal_keys(&self, keys: &[String]) -> Result<SealStatus, VaultError>;
}

/// Builds a client for a discovered instance address.
pub trait VaultConnector: Send + Sync + 'static {
    fn connect(&self, address: &str) -> Arc<dyn VaultApi>;
}

/// Connector sharing one connection pool across all instances.
#[derive(Clone)]
pub struct HttpVaultConnector {
    http: Client,
}

impl HttpVaultConnector {
    pub fn new(timeout: Duration) -> Result<Self, VaultError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(VaultError::Client)?;
        Ok(Self { http })
    }
}

impl VaultConnector for HttpVaultConnector {
    fn connect(&self, address: &str) -> Arc<dyn VaultApi> {
        Arc::new(HttpVaultClient {
            address: address.trim_end_matches('/').to_string(),
            http: self.http.clone(),
        })
    }
}

pub struct HttpVaultClient {
    address: String,
    http: Client,
}

impl HttpVaultClient {
    fn http_error(&self, source: reqwest::Error) -> VaultError {
        VaultError::Http {
            address: self.address.clone(),
            source,
        }
    }

    async fn decode(&self, resp: reqwest::Response) -> Result<SealStatus, VaultError> {
        let status = resp.status();
        if status.is_success() {
            resp.json::<SealStatus>()
                .await
                .map_err(|e| self.http_error(e))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(VaultError::Status {
                address: self.address.clone(),
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl VaultApi for HttpVaultClient {
    async fn seal_status(&self) -> Result<SealStatus, VaultError> {
        let url = format!("{}/v1/sys/seal-status", self.address);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| self.http_error(e))?;
        self.decode(resp).await
    }

    async fn submit_unseal_keys(&self, keys: &[String]) -> Result<SealStatus, VaultError> {
        let url = format!("{}/v1/sys/unseal", self.address);
        let mut status = None;

        for key in keys {
            let resp = self
                .http
                .put(&url)
                .json(&UnsealRequest { key })
                .send()
                .await
                .map_err(|e| self.http_error(e))?;
            let current = self.decode(resp).await?;
            let sealed = current.sealed;
            status = Some(current);
            if !sealed {
                break;
            }
        }

        match status {
            Some(status) => Ok(status),
            None => self.seal_status().await,
        }
    }
}
