//! Argument and result shapes of the room methods

use crate::peer::PeerId;
use serde::{Deserialize, Serialize};

/// Argument of `tunnel.connect`
///
/// A requester sends `{portal, target}` to the room; the room adds `origin`
/// when it forwards the request to the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConnectArgs {
    pub portal: PeerId,
    pub target: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PeerId>,
}

/// Result of `room.metadata`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub name: String,
    pub membership: bool,
    pub features: Vec<String>,
}

/// Change to the set of peers announced in a room
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointEvent {
    Joined(PeerId),
    Left(PeerId),
}

impl EndpointEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            EndpointEvent::Joined(peer) | EndpointEvent::Left(peer) => peer,
        }
    }
}
