//! Room membership

use dashmap::DashSet;
use muxroom_proto::PeerId;
use muxroom_rpc::AccessPolicy;
use tracing::info;

/// Peers allowed into restricted rooms and to announce in community rooms
///
/// The room's own identity always counts as a member.
pub struct Members {
    room_id: PeerId,
    peers: DashSet<PeerId>,
}

impl Members {
    pub fn new(room_id: PeerId, initial: impl IntoIterator<Item = PeerId>) -> Self {
        Self {
            room_id,
            peers: initial.into_iter().collect(),
        }
    }

    /// Returns `false` if the peer already was a member.
    pub fn add(&self, peer: PeerId) -> bool {
        info!(peer = %peer, "Adding member");
        self.peers.insert(peer)
    }

    /// Returns `false` if the peer was not a member.
    pub fn remove(&self, peer: &PeerId) -> bool {
        info!(peer = %peer, "Removing member");
        self.peers.remove(peer).is_some()
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        *peer == self.room_id || self.peers.contains(peer)
    }

    /// Sorted member list, without the room itself
    pub fn list(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.peers.iter().map(|peer| peer.key().clone()).collect();
        peers.sort();
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl AccessPolicy for Members {
    fn is_member(&self, peer: &PeerId) -> bool {
        self.contains(peer)
    }
}
