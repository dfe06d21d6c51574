//! Peer side of the room tunnel protocol
//!
//! [`RoomClient`] talks to a room over an open connection; [`PeerServices`]
//! adds the methods a room expects its peers to serve.

pub mod endpoints;
pub mod room;
pub mod services;

pub use endpoints::EndpointStream;
pub use room::RoomClient;
pub use services::{AcceptAll, IncomingTunnel, PeerServices, TunnelPolicy};
