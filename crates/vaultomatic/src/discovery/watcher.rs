//! Pod Watch
//!
//! Translates the Kubernetes pod watch into instance add/remove events. A
//! subscription is one long-poll request; the stream ends when the server-side
//! timeout elapses and the caller subscribes again.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

/// HTTP status the API server uses for an expired resource version.
const GONE: u16 = 410;

/// Lifecycle event for a pod matching the selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceEvent {
    Added(String),
    Removed(String),
    /// Any other notification, by kind
    Other(&'static str),
}

#[derive(Debug, Error)]
pub enum WatchError {
    /// Resource version expired, resubscribe from a fresh list
    #[error("watch expired")]
    Expired,
    #[error("kubernetes error: {0}")]
    Kube(#[source] kube::Error),
    #[error("watch error {code}: {message}")]
    Api { code: u16, message: String },
}

impl From<kube::Error> for WatchError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(resp) if resp.code == GONE => WatchError::Expired,
            e => WatchError::Kube(e),
        }
    }
}

pub type InstanceEventStream<'a> = BoxStream<'a, Result<InstanceEvent, WatchError>>;

/// Source of instance lifecycle events.
#[async_trait]
pub trait InstanceWatcher: Send + 'static {
    /// Open one watch iteration.
    async fn subscribe<'a>(&'a mut self) -> Result<InstanceEventStream<'a>, WatchError>;
}

/// Watches Vault server pods in one namespace.
///
/// The first subscription, and the first one after an expiry, lists the pods
/// and replays them as `Added`. Pods announced earlier but missing from the
/// list are replayed as `Removed`. Later subscriptions resume from the last
/// seen resource version.
pub struct KubePodWatcher {
    api: Api<Pod>,
    selector: String,
    timeout_secs: u32,
    resource_version: Option<String>,
    announced: HashSet<String>,
}

impl KubePodWatcher {
    pub fn new(client: Client, namespace: &str, selector: &str, timeout_secs: u32) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            selector: selector.to_string(),
            timeout_secs,
            resource_version: None,
            announced: HashSet::new(),
        }
    }

    /// List the pods and diff them against what was announced so far.
    ///
    /// Nothing is committed here; the listing only takes effect once a watch
    /// from its resource version has been opened.
    async fn relist(&self) -> Result<Listing, WatchError> {
        let pods = self
            .api
            .list(&ListParams::default().labels(&self.selector))
            .await?;

        let current: HashSet<String> = pods.items.iter().map(|pod| pod.name_any()).collect();
        let mut events: Vec<InstanceEvent> = self
            .announced
            .difference(&current)
            .cloned()
            .map(InstanceEvent::Removed)
            .collect();
        events.extend(pods.items.iter().map(|pod| InstanceEvent::Added(pod.name_any())));

        debug!(
            pods = current.len(),
            resource_version = ?pods.metadata.resource_version,
            "Listed vault pods"
        );

        Ok(Listing {
            events,
            announced: current,
            resource_version: pods.metadata.resource_version,
        })
    }
}

/// Result of a relist, pending until the following watch is open.
struct Listing {
    events: Vec<InstanceEvent>,
    announced: HashSet<String>,
    resource_version: Option<String>,
}

#[async_trait]
impl InstanceWatcher for KubePodWatcher {
    async fn subscribe<'a>(&'a mut self) -> Result<InstanceEventStream<'a>, WatchError> {
        let listing = match self.resource_version {
            Some(_) => None,
            None => Some(self.relist().await?),
        };

        let version = match &listing {
            Some(listing) => listing.resource_version.as_deref(),
            None => self.resource_version.as_deref(),
        }
        .unwrap_or("0")
        .to_string();
        let params = WatchParams::default()
            .labels(&self.selector)
            .timeout(self.timeout_secs);

        // On failure the listing is dropped uncommitted, so the next
        // subscription lists again and replays it.
        let watch = match self.api.watch(&params, &version).await {
            Ok(watch) => watch,
            Err(e) => {
                let e = WatchError::from(e);
                if matches!(e, WatchError::Expired) {
                    self.resource_version = None;
                }
                return Err(e);
            }
        };

        let replay = match listing {
            Some(listing) => {
                self.announced = listing.announced;
                self.resource_version = listing.resource_version;
                listing.events
            }
            None => Vec::new(),
        };

        let resource_version = &mut self.resource_version;
        let announced = &mut self.announced;
        let events = watch.map(move |event| translate(event, resource_version, announced));

        Ok(stream::iter(replay.into_iter().map(Ok))
            .chain(events)
            .boxed())
    }
}

fn translate(
    event: kube::Result<WatchEvent<Pod>>,
    resource_version: &mut Option<String>,
    announced: &mut HashSet<String>,
) -> Result<InstanceEvent, WatchError> {
    let event = match event {
        Ok(event) => event,
        Err(e) => {
            let e = WatchError::from(e);
            if matches!(e, WatchError::Expired) {
                *resource_version = None;
            }
            return Err(e);
        }
    };

    match event {
        WatchEvent::Added(pod) => {
            remember_version(resource_version, &pod);
            let name = pod.name_any();
            announced.insert(name.clone());
            Ok(InstanceEvent::Added(name))
        }
        WatchEvent::Deleted(pod) => {
            remember_version(resource_version, &pod);
            let name = pod.name_any();
            announced.remove(&name);
            Ok(InstanceEvent::Removed(name))
        }
        WatchEvent::Modified(pod) => {
            remember_version(resource_version, &pod);
            Ok(InstanceEvent::Other("MODIFIED"))
        }
        WatchEvent::Bookmark(bookmark) => {
            *resource_version = Some(bookmark.metadata.resource_version);
            Ok(InstanceEvent::Other("BOOKMARK"))
        }
        WatchEvent::Error(e) if e.code == GONE => {
            *resource_version = None;
            Err(WatchError::Expired)
        }
        WatchEvent::Error(e) => Err(WatchError::Api {
            code: e.code,
            message: e.message,
        }),
    }
}

fn remember_version(resource_version: &mut Option<String>, pod: &Pod) {
    if let Some(version) = &pod.metadata.resource_version {
        *resource_version = Some(version.clone());
    }
}
