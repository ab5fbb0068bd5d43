//! Core types for peer reconciliation
//!
//! A [`Peer`] is a validated cluster member: a stable identity plus a
//! non-empty, ordered list of addresses. Raw member reports from a
//! membership source arrive as [`RawPeer`] and are validated on the way in.

use std::collections::BTreeMap;
use std::fmt;
use serde::{Deserialize, Serialize};

use crate::error::InputError;

/// A cluster member as reported by a membership source, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPeer {
    /// Stable identity (pod name, hostname); absent when the source has none
    #[serde(default)]
    pub identity: Option<String>,
    /// Reported addresses, primary first
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl RawPeer {
    pub fn new(identity: impl Into<String>, addresses: Vec<String>) -> Self {
        Self {
            identity: Some(identity.into()),
            addresses,
        }
    }
}

/// Two successive membership snapshots, as delivered by a source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    pub previous: Vec<RawPeer>,
    pub current: Vec<RawPeer>,
}

/// A validated cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPeer", into = "RawPeer")]
pub struct Peer {
    identity: String,
    addresses: Vec<String>,
}

impl Peer {
    /// Create a peer, rejecting empty identities and empty address lists
    pub fn new(identity: impl Into<String>, addresses: Vec<String>) -> Result<Self, InputError> {
        let identity = identity.into();
        if identity.is_empty() {
            return Err(InputError::MissingIdentity { addresses });
        }
        if addresses.is_empty() {
            return Err(InputError::NoAddresses { identity });
        }
        Ok(Self { identity, addresses })
    }

    /// Create a peer with a single address
    pub fn single(
        identity: impl Into<String>,
        address: impl Into<String>,
    ) -> Result<Self, InputError> {
        Self::new(identity, vec![address.into()])
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    /// Address used for the peer entry and for self comparison
    pub fn primary_address(&self) -> &str {
        // Construction guarantees at least one address.
        &self.addresses[0]
    }
}

impl TryFrom<RawPeer> for Peer {
    type Error = InputError;

    fn try_from(raw: RawPeer) -> Result<Self, Self::Error> {
        match raw.identity {
            Some(identity) => Peer::new(identity, raw.addresses),
            None => Err(InputError::MissingIdentity {
                addresses: raw.addresses,
            }),
        }
    }
}

impl From<Peer> for RawPeer {
    fn from(peer: Peer) -> Self {
        RawPeer {
            identity: Some(peer.identity),
            addresses: peer.addresses,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.primary_address())
    }
}

/// This process's own identity and primary address, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPeer {
    identity: String,
    address: String,
}

impl LocalPeer {
    pub fn new(identity: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            address: address.into(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether `peer` designates this process
    pub fn is_self(&self, peer: &Peer) -> bool {
        peer.primary_address() == self.address || peer.identity() == self.identity
    }

    pub fn as_peer(&self) -> Peer {
        Peer {
            identity: self.identity.clone(),
            addresses: vec![self.address.clone()],
        }
    }
}

impl fmt::Display for LocalPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.address)
    }
}

/// Peers keyed by identity.
///
/// Built fresh for every reconciliation and replaced wholesale; there is no
/// in-place mutation once a set has been built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSet {
    peers: BTreeMap<String, Peer>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from validated peers; later duplicates of an identity are
    /// reported and dropped.
    pub fn from_peers<I>(peers: I) -> (Self, Vec<InputError>)
    where
        I: IntoIterator<Item = Peer>,
    {
        let mut builder = PeerSetBuilder::default();
        for peer in peers {
            builder.push(peer);
        }
        builder.finish()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.peers.contains_key(identity)
    }

    pub fn get(&self, identity: &str) -> Option<&Peer> {
        self.peers.get(identity)
    }

    /// Peers in identity order
    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }
}

impl FromIterator<Peer> for PeerSet {
    /// Collect peers, keeping the first occurrence of each identity
    fn from_iter<I: IntoIterator<Item = Peer>>(iter: I) -> Self {
        PeerSet::from_peers(iter).0
    }
}

/// Accumulates one snapshot's peers while it is being built
#[derive(Debug, Default)]
pub(crate) struct PeerSetBuilder {
    peers: BTreeMap<String, Peer>,
    rejected: Vec<InputError>,
}

impl PeerSetBuilder {
    pub(crate) fn push(&mut self, peer: Peer) {
        if self.peers.contains_key(peer.identity()) {
            self.rejected.push(InputError::DuplicateIdentity {
                identity: peer.identity,
            });
            return;
        }
        self.peers.insert(peer.identity.clone(), peer);
    }

    pub(crate) fn reject(&mut self, error: InputError) {
        self.rejected.push(error);
    }

    pub(crate) fn finish(self) -> (PeerSet, Vec<InputError>) {
        (PeerSet { peers: self.peers }, self.rejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_requires_addresses() {
        let err = Peer::new("web-0", vec![]).unwrap_err();
        assert_eq!(
            err,
            InputError::NoAddresses {
                identity: "web-0".to_string()
            }
        );
    }

    #[test]
    fn test_peer_requires_identity() {
        let raw = RawPeer {
            identity: None,
            addresses: vec!["10.0.0.2".to_string()],
        };
        assert!(matches!(
            Peer::try_from(raw),
            Err(InputError::MissingIdentity { .. })
        ));
        assert!(Peer::new("", vec!["10.0.0.2".to_string()]).is_err());
    }

    #[test]
    fn test_primary_address_is_first() {
        let peer = Peer::new(
            "web-1",
            vec!["10.0.0.3".to_string(), "fd00::3".to_string()],
        )
        .unwrap();
        assert_eq!(peer.primary_address(), "10.0.0.3");
        assert_eq!(peer.to_string(), "web-1@10.0.0.3");
    }

    #[test]
    fn test_peer_set_drops_duplicate_identity() {
        let (set, rejected) = PeerSet::from_peers(vec![
            Peer::single("web-0", "10.0.0.2").unwrap(),
            Peer::single("web-0", "10.0.0.9").unwrap(),
        ]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("web-0").unwrap().primary_address(), "10.0.0.2");
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn test_local_peer_matches_by_address_or_identity() {
        let local = LocalPeer::new("lb-0", "10.0.0.1");
        assert!(local.is_self(&Peer::single("other-name", "10.0.0.1").unwrap()));
        assert!(local.is_self(&Peer::single("lb-0", "10.9.9.9").unwrap()));
        assert!(!local.is_self(&Peer::single("lb-1", "10.0.0.2").unwrap()));
        assert_eq!(local.as_peer().primary_address(), "10.0.0.1");
    }

    #[test]
    fn test_peer_deserialize_validates() {
        let ok: Peer =
            serde_json::from_str(r#"{"identity":"a","addresses":["10.0.0.2"]}"#).unwrap();
        assert_eq!(ok.identity(), "a");
        let bad = serde_json::from_str::<Peer>(r#"{"identity":"a","addresses":[]}"#);
        assert!(bad.is_err());
    }
}
