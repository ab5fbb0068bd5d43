//! Snapshot differ
//!
//! Computes which peers must be added and removed to move the external
//! configuration from one peer set to another. Identity alone decides
//! membership: a peer present in both sets is left alone even if its
//! addresses changed.

use crate::types::{LocalPeer, Peer, PeerSet};

/// Additions and removals between two peer sets
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerDiff {
    /// Peers in the desired set but not the previous one
    pub to_add: Vec<Peer>,
    /// Peers in the previous set but not the desired one
    pub to_remove: Vec<Peer>,
}

impl PeerDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// Drop every change that designates the local process
    pub fn without_local(mut self, local: &LocalPeer) -> Self {
        self.to_add.retain(|p| !local.is_self(p));
        self.to_remove.retain(|p| !local.is_self(p));
        self
    }
}

/// Compute `desired \ previous` and `previous \ desired` by identity.
///
/// Output is in identity order.
pub fn diff(previous: &PeerSet, desired: &PeerSet) -> PeerDiff {
    let to_add = desired
        .iter()
        .filter(|p| !previous.contains(p.identity()))
        .cloned()
        .collect();
    let to_remove = previous
        .iter()
        .filter(|p| !desired.contains(p.identity()))
        .cloned()
        .collect();
    PeerDiff { to_add, to_remove }
}
