//! Membership tracking for one room
//!
//! Holds the set of currently reachable peers. Each PeerId is treated as a
//! distinct peer: a reconnect that yields a new ID is a departure plus an
//! arrival.

use std::collections::BTreeSet;

use crate::models::PeerId;

#[derive(Debug, Default, Clone)]
pub struct MembershipTracker {
    peers: BTreeSet<PeerId>,
}

impl MembershipTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an arrival. Returns true if the peer was not tracked yet.
    pub fn arrive(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer)
    }

    /// Record a departure. Returns true if the peer was tracked.
    pub fn depart(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerId> {
        self.peers.iter()
    }

    /// Sorted list of active peers
    pub fn peers(&self) -> Vec<PeerId> {
        self.peers.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
