//! Instance Supervisor
//!
//! Each supervisor owns a polling task for a single Vault instance. The task
//! checks the seal status, submits unseal shares while the instance is sealed
//! and backs off exponentially while it is unhealthy.
//!
//! Discovery only sees the narrow handle: health, state, cancel and join.

use super::client::VaultApi;
use crate::config::SupervisorConfig;
use crate::keys::KeyCache;
use crate::observability::{events, metrics};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use strum::Display;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Last observed condition of a Vault instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SealState {
    /// No unseal keys available yet, instance not contacted
    AwaitingKeys,
    /// `vault operator init` has not been run
    NotInitialized,
    /// Initialized but sealed, shares are being submitted
    Sealed,
    /// Initialized and unsealed
    Healthy,
    /// Seal status request failed
    Unreachable,
}

/// Snapshot published after every completed poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub state: SealState,
    pub healthy: bool,
    pub consecutive_failures: u32,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            state: SealState::AwaitingKeys,
            healthy: false,
            consecutive_failures: 0,
        }
    }
}

/// Handle to a running supervisor task.
pub struct InstanceSupervisor {
    address: String,
    status: watch::Receiver<SupervisorStatus>,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl InstanceSupervisor {
    /// Start supervising the instance at `address`.
    pub fn spawn(
        address: String,
        vault: Arc<dyn VaultApi>,
        keys: KeyCache,
        config: SupervisorConfig,
    ) -> Self {
        let (status_tx, status_rx) = watch::channel(SupervisorStatus::default());
        let cancelled = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());

        let poll_loop = PollLoop {
            address: address.clone(),
            vault,
            keys,
            config,
            status: status_tx,
            cancelled: cancelled.clone(),
            wake: wake.clone(),
        };
        let task = tokio::spawn(poll_loop.run());

        Self {
            address,
            status: status_rx,
            cancelled,
            wake,
            task,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Health as of the last completed poll cycle.
    pub fn healthy(&self) -> bool {
        self.status.borrow().healthy
    }

    pub fn state(&self) -> SealState {
        self.status.borrow().state
    }

    pub fn status(&self) -> SupervisorStatus {
        *self.status.borrow()
    }

    /// Receiver notified after every poll cycle.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    /// Ask the polling task to stop.
    ///
    /// Takes effect at the next cycle boundary; an in-flight request to the
    /// instance is allowed to finish. A pending sleep is cut short.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether the polling task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the polling task to exit.
    pub async fn join(self) {
        self.cancel();
        if let Err(e) = self.task.await {
            error!(address = %self.address, error = %e, "Supervisor task failed");
        }
    }
}

struct PollLoop {
    address: String,
    vault: Arc<dyn VaultApi>,
    keys: KeyCache,
    config: SupervisorConfig,
    status: watch::Sender<SupervisorStatus>,
    cancelled: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollLoop {
    async fn run(self) {
        info!(address = %self.address, "Start monitoring vault");

        while !self.cancelled.load(Ordering::Acquire) {
            let previous = *self.status.borrow();
            let next = self.poll(previous).await;
            self.status.send_replace(next);

            if next.state != previous.state {
                events::seal_state_changed(
                    &self.address,
                    &previous.state.to_string(),
                    &next.state.to_string(),
                );
            }

            let interval = self.interval(&next);
            debug!(
                address = %self.address,
                state = %next.state,
                consecutive_failures = next.consecutive_failures,
                interval_secs = interval.as_secs_f64(),
                "Next check scheduled"
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => {}
            }
        }

        info!(address = %self.address, "No longer monitoring vault");
    }

    /// One poll cycle.
    async fn poll(&self, previous: SupervisorStatus) -> SupervisorStatus {
        let failures = previous.consecutive_failures.saturating_add(1);
        let unhealthy = |state| SupervisorStatus {
            state,
            healthy: false,
            consecutive_failures: failures,
        };

        if self.keys.read().await.is_none() {
            warn!(address = %self.address, "Waiting for keys");
            // The instance was not contacted, so its health is unknown
            return SupervisorStatus {
                state: SealState::AwaitingKeys,
                healthy: previous.healthy,
                consecutive_failures: failures,
            };
        }

        match self.vault.seal_status().await {
            Err(e) => {
                warn!(address = %self.address, error = %e, "Failed to communicate with vault");
                unhealthy(SealState::Unreachable)
            }
            Ok(status) if !status.initialized => {
                info!(address = %self.address, "Vault is not initialized");
                unhealthy(SealState::NotInitialized)
            }
            Ok(status) if status.sealed => {
                info!(address = %self.address, "Vault is sealed");
                self.unseal().await;
                unhealthy(SealState::Sealed)
            }
            Ok(_) => {
                if !previous.healthy {
                    info!(address = %self.address, "Vault is unsealed");
                }
                SupervisorStatus {
                    state: SealState::Healthy,
                    healthy: true,
                    consecutive_failures: 0,
                }
            }
        }
    }

    /// Submit a fresh random quorum of shares. Failures wait for the next poll.
    async fn unseal(&self) {
        let Some(shares) = self.keys.sample_unseal_subset().await else {
            warn!(address = %self.address, "Not enough hex keys to reach the unseal threshold");
            metrics::record_unseal_submission("insufficient_keys");
            return;
        };

        match self.vault.submit_unseal_keys(&shares).await {
            Ok(status) => {
                debug!(
                    address = %self.address,
                    sealed = status.sealed,
                    progress = status.progress,
                    "Submitted unseal keys"
                );
                metrics::record_unseal_submission("success");
            }
            Err(e) => {
                warn!(address = %self.address, error = %e, "Failed to submit unseal keys");
                metrics::record_unseal_submission("failure");
            }
        }
    }

    fn interval(&self, status: &SupervisorStatus) -> Duration {
        if status.state == SealState::Healthy {
            self.config.healthy_interval
        } else {
            self.config.backoff(status.consecutive_failures)
        }
    }
}
