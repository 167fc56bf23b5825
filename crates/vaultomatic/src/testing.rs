//! In-memory fakes shared by the unit tests.

use crate::config::KeyCacheConfig;
use crate::discovery::{InstanceEvent, InstanceEventStream, InstanceWatcher, WatchError};
use crate::keys::{KeyCache, KeyStore, StoreError, UnsealKeys};
use crate::vault::{SealStatus, VaultApi, VaultConnector, VaultError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub fn five_of_three() -> UnsealKeys {
    UnsealKeys {
        unseal_keys_b64: ["YQ==", "Yg==", "Yw==", "ZA==", "ZQ=="]
            .map(String::from)
            .to_vec(),
        unseal_keys_hex: ["a", "b", "c", "d", "e"].map(String::from).to_vec(),
        unseal_shares: 5,
        unseal_threshold: 3,
    }
}

pub fn empty_cache() -> KeyCache {
    KeyCache::new(Arc::new(MemoryKeyStore::new()), KeyCacheConfig::default())
}

pub fn cache_with_keys() -> KeyCache {
    let store = MemoryKeyStore::with_document(five_of_three().to_json().unwrap());
    KeyCache::new(Arc::new(store), KeyCacheConfig::default())
}

/// Key store holding one document in memory.
#[derive(Default)]
pub struct MemoryKeyStore {
    document: Mutex<Option<Vec<u8>>>,
    save_delay: Mutex<Duration>,
    fail_loads: AtomicBool,
    fail_saves: AtomicU32,
    save_attempts: AtomicUsize,
    saves: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: Vec<u8>) -> Self {
        let store = Self::default();
        store.put_document(document);
        store
    }

    /// Replace the stored document without going through `save`.
    pub fn put_document(&self, document: Vec<u8>) {
        *self.document.lock().unwrap() = Some(document);
    }

    pub fn document(&self) -> Option<Vec<u8>> {
        self.document.lock().unwrap().clone()
    }

    pub fn set_save_delay(&self, delay: Duration) {
        *self.save_delay.lock().unwrap() = delay;
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_saves(&self, count: u32) {
        self.fail_saves.store(count, Ordering::SeqCst);
    }

    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }

    /// Successful saves.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_saves(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("load failure injected".to_string()));
        }
        Ok(self.document())
    }

    async fn save(&self, document: Vec<u8>) -> Result<(), StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let delay = *self.save_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = if self
            .fail_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            Err(StoreError::Unavailable("save failure injected".to_string()))
        } else {
            self.put_document(document);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

/// Scripted Vault instance.
pub struct FakeVault {
    /// `None` answers every request with 503
    status: Mutex<Option<SealStatus>>,
    unseal_on_submit: AtomicBool,
    submissions: Mutex<Vec<Vec<String>>>,
    status_calls: AtomicUsize,
}

impl FakeVault {
    fn with_status(status: Option<SealStatus>) -> Self {
        Self {
            status: Mutex::new(status),
            unseal_on_submit: AtomicBool::new(false),
            submissions: Mutex::new(Vec::new()),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn not_initialized() -> Self {
        Self::with_status(Some(SealStatus {
            initialized: false,
            sealed: true,
            threshold: 0,
            progress: 0,
        }))
    }

    pub fn sealed() -> Self {
        Self::with_status(Some(SealStatus {
            initialized: true,
            sealed: true,
            threshold: 3,
            progress: 0,
        }))
    }

    pub fn unsealed() -> Self {
        Self::with_status(Some(SealStatus {
            initialized: true,
            sealed: false,
            threshold: 3,
            progress: 0,
        }))
    }

    pub fn unreachable() -> Self {
        Self::with_status(None)
    }

    fn unavailable() -> VaultError {
        VaultError::Status {
            address: "http://vault-0.vault-internal:8200".to_string(),
            status: 503,
            body: "Vault is unavailable".to_string(),
        }
    }

    pub fn set_status(&self, status: Option<SealStatus>) {
        *self.status.lock().unwrap() = status;
    }

    pub fn unseal_on_submit(&self, unseal: bool) {
        self.unseal_on_submit.store(unseal, Ordering::SeqCst);
    }

    pub fn submissions(&self) -> Vec<Vec<String>> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VaultApi for FakeVault {
    async fn seal_status(&self) -> Result<SealStatus, VaultError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(Self::unavailable)
    }

    async fn submit_unseal_keys(&self, keys: &[String]) -> Result<SealStatus, VaultError> {
        self.submissions.lock().unwrap().push(keys.to_vec());

        let mut status = self.status.lock().unwrap();
        let current = status.as_mut().ok_or_else(Self::unavailable)?;
        if self.unseal_on_submit.load(Ordering::SeqCst) {
            current.sealed = false;
        }
        Ok(current.clone())
    }
}

/// Connector handing out one unsealed [`FakeVault`] per address.
#[derive(Default)]
pub struct FakeConnector {
    vaults: Mutex<HashMap<String, Arc<FakeVault>>>,
    connected: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connected(&self) -> Vec<String> {
        self.connected.lock().unwrap().clone()
    }

    pub fn vault(&self, address: &str) -> Arc<FakeVault> {
        self.vaults
            .lock()
            .unwrap()
            .entry(address.to_string())
            .or_insert_with(|| Arc::new(FakeVault::unsealed()))
            .clone()
    }
}

impl VaultConnector for FakeConnector {
    fn connect(&self, address: &str) -> Arc<dyn VaultApi> {
        self.connected.lock().unwrap().push(address.to_string());
        self.vault(address)
    }
}

pub type Subscription = Result<Vec<Result<InstanceEvent, WatchError>>, WatchError>;

/// Replays scripted subscriptions, then idles like an empty long poll.
pub struct FakeWatcher {
    script: VecDeque<Subscription>,
    idle_poll: Duration,
    subscriptions: watch::Sender<Vec<Instant>>,
}

impl FakeWatcher {
    pub fn new(script: Vec<Subscription>) -> Self {
        Self {
            script: script.into(),
            idle_poll: Duration::from_secs(5),
            subscriptions: watch::channel(Vec::new()).0,
        }
    }

    /// Times at which `subscribe` was called.
    pub fn subscriptions(&self) -> watch::Receiver<Vec<Instant>> {
        self.subscriptions.subscribe()
    }
}

#[async_trait]
impl InstanceWatcher for FakeWatcher {
    async fn subscribe<'a>(&'a mut self) -> Result<InstanceEventStream<'a>, WatchError> {
        let now = Instant::now();
        self.subscriptions.send_modify(|times| times.push(now));

        match self.script.pop_front() {
            Some(Ok(events)) => Ok(stream::iter(events).boxed()),
            Some(Err(e)) => Err(e),
            None => {
                tokio::time::sleep(self.idle_poll).await;
                Ok(stream::empty().boxed())
            }
        }
    }
}
