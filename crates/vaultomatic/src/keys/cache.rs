//! Key Cache
//!
//! In-memory copy of the unseal key material backed by a [`KeyStore`].
//!
//! Writes land in memory first and are persisted by a background task. At most
//! one persist task runs at a time; writes arriving while it runs are picked up
//! by that task, so a burst of writes ends with the last one stored.

use super::material::UnsealKeys;
use super::store::KeyStore;
use crate::config::KeyCacheConfig;
use crate::observability::{events, metrics};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Cached material plus write bookkeeping.
///
/// `generation` counts local writes, `persisted` is the newest generation known
/// to be durable. They differ while a write is waiting for the store.
#[derive(Default)]
struct Slot {
    keys: Option<Arc<UnsealKeys>>,
    generation: u64,
    persisted: u64,
}

impl Slot {
    fn is_durable(&self) -> bool {
        self.generation == self.persisted
    }
}

struct Inner {
    store: Arc<dyn KeyStore>,
    slot: RwLock<Slot>,
    /// Single-flight guard for the persist task
    persisting: AtomicBool,
    config: KeyCacheConfig,
}

/// Shared handle to the key cache.
#[derive(Clone)]
pub struct KeyCache {
    inner: Arc<Inner>,
}

impl KeyCache {
    pub fn new(store: Arc<dyn KeyStore>, config: KeyCacheConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                slot: RwLock::new(Slot::default()),
                persisting: AtomicBool::new(false),
                config,
            }),
        }
    }

    /// Current key material, refreshed from the durable store.
    ///
    /// Store failures fall back to the in-memory copy. A stored document that
    /// fails validation counts as no keys. While a local write has not been
    /// persisted yet the in-memory copy wins over whatever the store returns.
    pub async fn read(&self) -> Option<Arc<UnsealKeys>> {
        let (generation, was_durable) = {
            let slot = self.inner.slot.read().await;
            (slot.generation, slot.is_durable())
        };

        let loaded = self.inner.store.load().await;

        let mut slot = self.inner.slot.write().await;
        if !was_durable || slot.generation != generation {
            return slot.keys.clone();
        }

        match loaded {
            Ok(Some(document)) => match UnsealKeys::from_json(&document) {
                Ok(keys) => {
                    if slot.keys.as_deref() != Some(&keys) {
                        slot.keys = Some(Arc::new(keys));
                    }
                }
                Err(e) => {
                    error!(error = %e, "Invalid keys in keystore");
                    slot.keys = None;
                }
            },
            Ok(None) => slot.keys = None,
            Err(e) => {
                error!(error = %e, "Failed to fetch keys from keystore");
            }
        }

        slot.keys.clone()
    }

    /// Replace the key material and schedule persistence.
    pub async fn write(&self, keys: UnsealKeys) {
        events::keys_stored(keys.unseal_shares, keys.unseal_threshold);

        {
            let mut slot = self.inner.slot.write().await;
            slot.keys = Some(Arc::new(keys));
            slot.generation += 1;
        }

        if self.try_claim_persist() {
            let cache = self.clone();
            tokio::spawn(async move { cache.persist_latest().await });
        } else {
            debug!("Persist task already active");
        }
    }

    /// `unseal_threshold` randomly chosen hex shares from the cached material.
    ///
    /// Uses the in-memory copy only; callers that need fresh material call
    /// [`read`](Self::read) first.
    pub async fn sample_unseal_subset(&self) -> Option<Vec<String>> {
        let slot = self.inner.slot.read().await;
        slot.keys.as_ref()?.sample_hex()
    }

    /// Whether every local write has reached the durable store.
    pub async fn is_durable(&self) -> bool {
        self.inner.slot.read().await.is_durable()
    }

    pub fn is_persisting(&self) -> bool {
        self.inner.persisting.load(Ordering::SeqCst)
    }

    fn try_claim_persist(&self) -> bool {
        self.inner
            .persisting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Persist the newest material until the store holds the latest write.
    async fn persist_latest(self) {
        let mut attempts = 0u32;
        loop {
            let (keys, generation) = {
                let slot = self.inner.slot.read().await;
                (slot.keys.clone(), slot.generation)
            };

            let Some(keys) = keys else {
                self.inner.persisting.store(false, Ordering::SeqCst);
                return;
            };

            let document = match keys.to_json() {
                Ok(document) => document,
                Err(e) => {
                    error!(error = %e, "Failed to serialize keys");
                    self.inner.persisting.store(false, Ordering::SeqCst);
                    return;
                }
            };

            attempts += 1;
            debug!(generation = generation, attempt = attempts, "Sending keys to keystore");

            if let Err(e) = self.inner.store.save(document).await {
                error!(error = %e, attempt = attempts, "Failed to store keys (retrying)");
                metrics::record_persist_attempt("failure");
                tokio::time::sleep(self.inner.config.persist_retry_delay).await;
                continue;
            }
            metrics::record_persist_attempt("success");

            let latest = {
                let mut slot = self.inner.slot.write().await;
                slot.persisted = slot.persisted.max(generation);
                slot.generation
            };

            if latest != generation {
                // Newer write arrived while saving; it found the guard taken.
                continue;
            }

            events::keys_persisted(attempts);
            self.inner.persisting.store(false, Ordering::SeqCst);

            // A writer may have bumped the generation after the check above and
            // still seen the guard held.
            let latest = self.inner.slot.read().await.generation;
            if latest == generation || !self.try_claim_persist() {
                return;
            }
            attempts = 0;
        }
    }
}
