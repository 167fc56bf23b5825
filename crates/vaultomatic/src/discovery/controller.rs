//! Discovery Controller
//!
//! Runs the pod watch, keeps one supervisor per Vault pod and aggregates their
//! health into fleet health.

use super::watcher::{InstanceEvent, InstanceWatcher, WatchError};
use crate::config::DiscoveryConfig;
use crate::keys::KeyCache;
use crate::observability::{events, metrics};
use crate::vault::{InstanceSupervisor, VaultConnector};
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Aggregate health published after every watch iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FleetStatus {
    /// True when every supervised instance is healthy
    pub healthy: bool,
    pub instances: usize,
    pub unhealthy: usize,
}

/// Read-only view of the fleet status.
#[derive(Clone)]
pub struct FleetStatusHandle {
    rx: watch::Receiver<FleetStatus>,
}

impl FleetStatusHandle {
    pub(crate) fn new(rx: watch::Receiver<FleetStatus>) -> Self {
        Self { rx }
    }

    pub fn healthy(&self) -> bool {
        self.rx.borrow().healthy
    }

    pub fn current(&self) -> FleetStatus {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<FleetStatus> {
        self.rx.clone()
    }
}

/// Handle to the running discovery loop.
pub struct Discovery {
    status: FleetStatusHandle,
    shutdown_tx: mpsc::UnboundedSender<()>,
    task: JoinHandle<()>,
}

impl Discovery {
    /// Start watching for Vault instances.
    pub fn spawn<W: InstanceWatcher>(
        watcher: W,
        keys: KeyCache,
        connector: Arc<dyn VaultConnector>,
        config: DiscoveryConfig,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(FleetStatus::default());
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();

        let fleet = Fleet {
            instances: HashMap::new(),
            retired: Vec::new(),
            healthy: false,
            keys,
            connector,
            config,
            status_tx,
        };
        let task = tokio::spawn(run_discovery(watcher, fleet, shutdown_rx));

        Self {
            status: FleetStatusHandle::new(status_rx),
            shutdown_tx,
            task,
        }
    }

    pub fn healthy(&self) -> bool {
        self.status.healthy()
    }

    pub fn status(&self) -> FleetStatus {
        self.status.current()
    }

    pub fn status_handle(&self) -> FleetStatusHandle {
        self.status.clone()
    }

    /// Stop the loop and wait until every supervisor has exited.
    pub async fn stop(self) {
        // Err means the loop already exited
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            error!(error = %e, "Discovery task failed");
        }
    }
}

/// Discovery state, owned by the discovery task alone.
struct Fleet {
    instances: HashMap<String, InstanceSupervisor>,
    /// Cancelled supervisors that may still be finishing a request
    retired: Vec<InstanceSupervisor>,
    healthy: bool,
    keys: KeyCache,
    connector: Arc<dyn VaultConnector>,
    config: DiscoveryConfig,
    status_tx: watch::Sender<FleetStatus>,
}

impl Fleet {
    fn apply(&mut self, event: InstanceEvent) {
        match event {
            InstanceEvent::Added(pod) => {
                let address = self.config.instance_address(&pod);
                if self.instances.contains_key(&address) {
                    debug!(address = %address, "Vault already monitored");
                    return;
                }

                events::instance_added(&address, &self.config.namespace);
                let vault = self.connector.connect(&address);
                let supervisor = InstanceSupervisor::spawn(
                    address.clone(),
                    vault,
                    self.keys.clone(),
                    self.config.supervisor.clone(),
                );
                self.instances.insert(address, supervisor);
            }
            InstanceEvent::Removed(pod) => {
                let address = self.config.instance_address(&pod);
                if let Some(supervisor) = self.instances.remove(&address) {
                    events::instance_removed(&address, &self.config.namespace);
                    supervisor.cancel();
                    self.retired.push(supervisor);
                }
            }
            InstanceEvent::Other(kind) => {
                debug!(kind = kind, "Ignoring event");
            }
        }
    }

    /// Recompute fleet health and publish it. Returns whether the aggregate
    /// flipped; only flips are logged as events.
    fn refresh_health(&mut self) -> bool {
        self.retired.retain(|supervisor| !supervisor.is_finished());

        let instances = self.instances.len();
        let unhealthy = self
            .instances
            .values()
            .filter(|supervisor| !supervisor.healthy())
            .count();
        let healthy = unhealthy == 0;

        let changed = healthy != self.healthy;
        if changed {
            self.healthy = healthy;
            events::fleet_health_changed(healthy, instances, unhealthy);
        }

        metrics::set_fleet_status(instances, healthy);
        self.status_tx.send_replace(FleetStatus {
            healthy,
            instances,
            unhealthy,
        });
        changed
    }

    async fn shutdown(self) {
        let supervisors: Vec<InstanceSupervisor> = self
            .instances
            .into_values()
            .chain(self.retired)
            .collect();

        for supervisor in &supervisors {
            supervisor.cancel();
        }
        futures::future::join_all(supervisors.into_iter().map(InstanceSupervisor::join)).await;
    }
}

/// Consume one watch iteration, applying events as they arrive.
async fn watch_once<W: InstanceWatcher>(
    watcher: &mut W,
    fleet: &mut Fleet,
) -> Result<(), WatchError> {
    let mut events = watcher.subscribe().await?;
    while let Some(event) = events.next().await {
        fleet.apply(event?);
    }
    Ok(())
}

async fn run_discovery<W: InstanceWatcher>(
    mut watcher: W,
    mut fleet: Fleet,
    mut shutdown_rx: mpsc::UnboundedReceiver<()>,
) {
    info!(
        namespace = %fleet.config.namespace,
        selector = %fleet.config.selector,
        "Starting vault discovery"
    );

    loop {
        let outcome = tokio::select! {
            _ = shutdown_rx.recv() => break,
            outcome = watch_once(&mut watcher, &mut fleet) => outcome,
        };

        fleet.refresh_health();

        match outcome {
            Ok(()) => {}
            Err(WatchError::Expired) => {
                events::watch_restarted("expired", &fleet.config.namespace);
                metrics::record_watch_restart("expired");
            }
            Err(e) => {
                warn!(error = %e, "Unexpected API error in discovery");
                metrics::record_watch_restart("error");
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(fleet.config.api_error_delay) => {}
                }
            }
        }
    }

    warn!("Stopping vault discovery");
    fleet.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cache_with_keys, FakeConnector, FakeWatcher};
    use crate::vault::SealStatus;
    use std::time::Duration;

    fn added(pod: &str) -> Result<InstanceEvent, WatchError> {
        Ok(InstanceEvent::Added(pod.to_string()))
    }

    fn removed(pod: &str) -> Result<InstanceEvent, WatchError> {
        Ok(InstanceEvent::Removed(pod.to_string()))
    }

    fn api_error() -> WatchError {
        WatchError::Api {
            code: 500,
            message: "etcdserver: request timed out".to_string(),
        }
    }

    fn spawn(watcher: FakeWatcher, connector: &Arc<FakeConnector>) -> Discovery {
        Discovery::spawn(
            watcher,
            cache_with_keys(),
            connector.clone(),
            DiscoveryConfig::default(),
        )
    }

    async fn wait_for_status(discovery: &Discovery, f: impl Fn(&FleetStatus) -> bool) {
        let mut rx = discovery.status_handle().subscribe();
        rx.wait_for(|status| f(status)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_added_creates_one_supervisor() {
        let watcher = FakeWatcher::new(vec![Ok(vec![added("vault-0"), added("vault-0")])]);
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        wait_for_status(&discovery, |s| s.instances == 1).await;

        assert_eq!(
            connector.connected(),
            vec!["http://vault-0.vault-internal:8200".to_string()]
        );
        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_unknown_is_noop() {
        let watcher = FakeWatcher::new(vec![Ok(vec![
            removed("vault-9"),
            Ok(InstanceEvent::Other("BOOKMARK")),
        ])]);
        let mut subscriptions = watcher.subscriptions();
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        subscriptions.wait_for(|times| times.len() >= 2).await.unwrap();

        assert_eq!(discovery.status().instances, 0);
        assert!(discovery.healthy());
        assert!(connector.connected().is_empty());
        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_cancels_supervisor() {
        let watcher = FakeWatcher::new(vec![
            Ok(vec![added("vault-0"), added("vault-1")]),
            Ok(vec![removed("vault-0")]),
        ]);
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        wait_for_status(&discovery, |s| s.instances == 1).await;

        let vault = connector.vault("http://vault-0.vault-internal:8200");
        let calls = vault.status_calls();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(vault.status_calls(), calls);

        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fleet_health_follows_instances() {
        let watcher = FakeWatcher::new(vec![Ok(vec![added("vault-0"), added("vault-1")])]);
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        wait_for_status(&discovery, |s| s.instances == 2 && s.healthy).await;

        connector
            .vault("http://vault-1.vault-internal:8200")
            .set_status(Some(SealStatus {
                initialized: true,
                sealed: true,
                threshold: 3,
                progress: 0,
            }));

        wait_for_status(&discovery, |s| !s.healthy).await;
        assert_eq!(discovery.status().unhealthy, 1);
        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_transitions_reported_once() {
        let connector = Arc::new(FakeConnector::new());
        let (status_tx, _status_rx) = watch::channel(FleetStatus::default());
        let mut fleet = Fleet {
            instances: HashMap::new(),
            retired: Vec::new(),
            healthy: false,
            keys: cache_with_keys(),
            connector: connector.clone(),
            config: DiscoveryConfig::default(),
            status_tx,
        };
        let address = "http://vault-0.vault-internal:8200";

        // Empty fleet turns healthy once, then stays quiet
        assert!(fleet.refresh_health());
        assert!(!fleet.refresh_health());

        fleet.apply(added("vault-0").unwrap());
        let mut supervisor = fleet.instances[address].subscribe();
        supervisor.wait_for(|status| status.healthy).await.unwrap();
        let flips: Vec<bool> = (0..3).map(|_| fleet.refresh_health()).collect();
        assert_eq!(flips, vec![false, false, false]);

        connector.vault(address).set_status(Some(SealStatus {
            initialized: true,
            sealed: true,
            threshold: 3,
            progress: 0,
        }));
        supervisor.wait_for(|status| !status.healthy).await.unwrap();
        let flips: Vec<bool> = (0..3).map(|_| fleet.refresh_health()).collect();
        assert_eq!(flips, vec![true, false, false]);
        assert!(!fleet.status_tx.borrow().healthy);

        fleet.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_resubscribes_immediately() {
        let watcher = FakeWatcher::new(vec![Ok(vec![
            added("vault-0"),
            Err(WatchError::Expired),
        ])]);
        let mut subscriptions = watcher.subscriptions();
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        let times = subscriptions
            .wait_for(|times| times.len() >= 2)
            .await
            .unwrap()
            .clone();

        assert_eq!(times[1] - times[0], Duration::ZERO);
        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_error_waits_before_resubscribing() {
        let watcher = FakeWatcher::new(vec![Ok(vec![Err(api_error())])]);
        let mut subscriptions = watcher.subscriptions();
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        let times = subscriptions
            .wait_for(|times| times.len() >= 2)
            .await
            .unwrap()
            .clone();

        assert_eq!(times[1] - times[0], DiscoveryConfig::default().api_error_delay);
        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_error_waits_before_resubscribing() {
        let watcher = FakeWatcher::new(vec![Err(api_error()), Err(WatchError::Expired)]);
        let mut subscriptions = watcher.subscriptions();
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        let times = subscriptions
            .wait_for(|times| times.len() >= 3)
            .await
            .unwrap()
            .clone();

        assert_eq!(times[1] - times[0], DiscoveryConfig::default().api_error_delay);
        assert_eq!(times[2] - times[1], Duration::ZERO);
        discovery.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_joins_all_supervisors() {
        let watcher = FakeWatcher::new(vec![Ok(vec![
            added("vault-0"),
            added("vault-1"),
            added("vault-2"),
        ])]);
        let connector = Arc::new(FakeConnector::new());
        let discovery = spawn(watcher, &connector);

        wait_for_status(&discovery, |s| s.instances == 3).await;
        discovery.stop().await;

        let vaults: Vec<_> = connector
            .connected()
            .iter()
            .map(|address| connector.vault(address))
            .collect();
        let calls: Vec<usize> = vaults.iter().map(|vault| vault.status_calls()).collect();

        tokio::time::sleep(Duration::from_secs(120)).await;
        let after: Vec<usize> = vaults.iter().map(|vault| vault.status_calls()).collect();
        assert_eq!(calls, after);
    }
}
