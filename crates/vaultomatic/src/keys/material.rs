//! Unseal Key Material
//!
//! The document produced by `vault operator init` and stored verbatim in the
//! durable key store.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Material rejected before it reaches the cache or after it is loaded.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("malformed key document: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unseal threshold must be at least 1")]
    ZeroThreshold,
    #[error("unseal threshold {threshold} exceeds share count {shares}")]
    ThresholdExceedsShares { threshold: u32, shares: u32 },
}

/// Unseal key shares and the quorum needed to use them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsealKeys {
    #[serde(default)]
    pub unseal_keys_b64: Vec<String>,
    #[serde(default)]
    pub unseal_keys_hex: Vec<String>,
    pub unseal_shares: u32,
    pub unseal_threshold: u32,
}

impl UnsealKeys {
    /// Parse and validate a stored JSON document.
    pub fn from_json(bytes: &[u8]) -> Result<Self, KeyError> {
        let keys: Self = serde_json::from_slice(bytes)?;
        keys.validate()?;
        Ok(keys)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn validate(&self) -> Result<(), KeyError> {
        if self.unseal_threshold == 0 {
            return Err(KeyError::ZeroThreshold);
        }
        if self.unseal_threshold > self.unseal_shares {
            return Err(KeyError::ThresholdExceedsShares {
                threshold: self.unseal_threshold,
                shares: self.unseal_shares,
            });
        }
        Ok(())
    }

    /// Draw `unseal_threshold` distinct hex shares uniformly at random.
    ///
    /// Returns `None` when fewer hex shares are present than the threshold.
    /// Every call samples independently, so two calls may return disjoint sets.
    pub fn sample_hex(&self) -> Option<Vec<String>> {
        let threshold = self.unseal_threshold as usize;
        if threshold > self.unseal_keys_hex.len() {
            return None;
        }

        let mut rng = rand::thread_rng();
        Some(
            self.unseal_keys_hex
                .choose_multiple(&mut rng, threshold)
                .cloned()
                .collect(),
        )
    }
}

// Key strings never reach the logs.
impl fmt::Debug for UnsealKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsealKeys")
            .field("unseal_shares", &self.unseal_shares)
            .field("unseal_threshold", &self.unseal_threshold)
            .field("unseal_keys_b64", &self.unseal_keys_b64.len())
            .field("unseal_keys_hex", &self.unseal_keys_hex.len())
            .finish()
    }
}
