//! Membership sources
//!
//! Sources list the EndpointSlices of a service, fold them into one peer
//! snapshot and publish `{previous, current}` events through a
//! [`MembershipFeed`]. The feed holds only the newest event; a consumer
//! that falls behind sees the latest membership, never a backlog.

pub mod file;
pub mod kube;

pub use file::FileLister;
pub use kube::KubeLister;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::SyncResult;
use crate::shutdown::Shutdown;
use crate::types::{MembershipEvent, RawPeer};

/// Object metadata, reduced to what is needed here
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

/// Reference to the object behind an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// One endpoint of a slice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<TargetRef>,
}

impl Endpoint {
    /// Identity is the target object's name, else the endpoint hostname
    pub fn identity(&self) -> Option<&str> {
        self.target_ref
            .as_ref()
            .map(|r| r.name.as_str())
            .filter(|name| !name.is_empty())
            .or_else(|| self.hostname.as_deref().filter(|h| !h.is_empty()))
    }

    pub fn to_raw_peer(&self) -> RawPeer {
        RawPeer {
            identity: self.identity().map(str::to_string),
            addresses: self.addresses.clone(),
        }
    }
}

/// `discovery.k8s.io/v1` EndpointSlice
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSlice {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_type: Option<String>,
    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl EndpointSlice {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// A list response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSliceList {
    #[serde(default)]
    pub items: Vec<EndpointSlice>,
}

/// Change to a single slice
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliceEvent {
    Added(EndpointSlice),
    Updated(EndpointSlice),
    Deleted(String),
}

impl SliceEvent {
    pub fn slice_name(&self) -> &str {
        match self {
            SliceEvent::Added(s) | SliceEvent::Updated(s) => s.name(),
            SliceEvent::Deleted(name) => name,
        }
    }
}

/// Current slices of a service, folded from add/update/delete events
#[derive(Debug, Clone, Default)]
pub struct SliceCache {
    slices: BTreeMap<String, EndpointSlice>,
}

impl SliceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn apply(&mut self, event: SliceEvent) {
        match event {
            SliceEvent::Added(slice) | SliceEvent::Updated(slice) => {
                self.slices.insert(slice.name().to_string(), slice);
            }
            SliceEvent::Deleted(name) => {
                self.slices.remove(&name);
            }
        }
    }

    /// Replace the cache with a full listing and return what changed
    pub fn replace_all(&mut self, listed: Vec<EndpointSlice>) -> Vec<SliceEvent> {
        let mut events = Vec::new();
        let mut seen = BTreeSet::new();
        for slice in listed {
            seen.insert(slice.name().to_string());
            match self.slices.get(slice.name()) {
                None => events.push(SliceEvent::Added(slice)),
                Some(cached) if *cached != slice => events.push(SliceEvent::Updated(slice)),
                Some(_) => {}
            }
        }
        for name in self.slices.keys() {
            if !seen.contains(name) {
                events.push(SliceEvent::Deleted(name.clone()));
            }
        }
        for event in &events {
            self.apply(event.clone());
        }
        events
    }

    /// Every endpoint of every slice, slices in name order
    pub fn snapshot(&self) -> Vec<RawPeer> {
        self.slices
            .values()
            .flat_map(|s| s.endpoints.iter().map(Endpoint::to_raw_peer))
            .collect()
    }
}

/// Publishing half of the latest-value membership channel
#[derive(Debug)]
pub struct MembershipFeed {
    tx: watch::Sender<Option<MembershipEvent>>,
    last: Option<Vec<RawPeer>>,
}

impl MembershipFeed {
    pub fn channel() -> (Self, watch::Receiver<Option<MembershipEvent>>) {
        let (tx, rx) = watch::channel(None);
        (Self { tx, last: None }, rx)
    }

    /// Publish `current` unless it equals the last published snapshot
    pub fn publish(&mut self, current: Vec<RawPeer>) -> bool {
        if self.last.as_ref() == Some(&current) {
            return false;
        }
        let previous = self.last.replace(current.clone()).unwrap_or_default();
        self.tx.send_replace(Some(MembershipEvent { previous, current }));
        true
    }
}

/// Lists the current EndpointSlices of a service
#[async_trait]
pub trait SliceLister: Send + Sync {
    async fn list(&self) -> SyncResult<Vec<EndpointSlice>>;

    /// Human-readable origin for logs
    fn describe(&self) -> String;
}

/// Poll `lister` every `interval` and publish membership changes until
/// shutdown
pub async fn poll_slices<L: SliceLister + ?Sized>(
    lister: &L,
    mut feed: MembershipFeed,
    interval: Duration,
    shutdown: Shutdown,
) {
    let mut cache = SliceCache::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(source = %lister.describe(), interval = ?interval, "watching endpoint slices");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let listed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            listed = lister.list() => listed,
        };
        let slices = match listed {
            Ok(slices) => slices,
            Err(err) => {
                warn!(error = %err, "listing endpoint slices failed");
                continue;
            }
        };

        let events = cache.replace_all(slices);
        for event in &events {
            match event {
                SliceEvent::Added(_) => info!(slice = event.slice_name(), "endpoint slice added"),
                SliceEvent::Updated(_) => {
                    info!(slice = event.slice_name(), "endpoint slice updated")
                }
                SliceEvent::Deleted(_) => {
                    info!(slice = event.slice_name(), "endpoint slice deleted")
                }
            }
        }
        if !events.is_empty() && feed.publish(cache.snapshot()) {
            debug!(slices = cache.len(), "membership snapshot published");
        }
    }
    debug!("endpoint slice polling stopped");
}
