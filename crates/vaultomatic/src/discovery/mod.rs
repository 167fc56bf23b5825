//! Vault Discovery
//!
//! Watches Vault server pods and keeps one [`InstanceSupervisor`] per pod:
//! 1. Subscribe to the pod watch for the namespace and selector
//! 2. Start a supervisor for every new pod, cancel it when the pod goes away
//! 3. Recompute fleet health after every watch iteration
//! 4. Resubscribe: immediately on expiry, after a fixed delay on errors
//!
//! [`InstanceSupervisor`]: crate::vault::InstanceSupervisor

mod controller;
mod watcher;

pub use controller::{Discovery, FleetStatus, FleetStatusHandle};
pub use watcher::{
    InstanceEvent, InstanceEventStream, InstanceWatcher, KubePodWatcher, WatchError,
};
