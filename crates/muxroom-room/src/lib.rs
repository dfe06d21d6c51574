//! Room tunnel service
//!
//! A room is the peer everybody can reach. Peers announce themselves in the
//! [`TunnelRegistry`]; the [`TunnelRelay`] splices a requester's
//! `tunnel.connect` stream onto one opened towards the announced target.

pub mod config;
pub mod error;
pub mod members;
pub mod registry;
pub mod relay;
pub mod server;

pub use config::{PrivacyMode, RelayConfig, RoomConfig};
pub use error::RoomError;
pub use members::Members;
pub use registry::{
    AnnounceOutcome, EndpointChange, EndpointDescriptor, EndpointFeed, EndpointUpdate,
    TunnelRegistry,
};
pub use relay::{RelaySession, TunnelRelay, CONNECT_METHOD};
pub use server::{
    RoomServer, ANNOUNCE_METHOD, ENDPOINTS_METHOD, IS_ROOM_METHOD, LEAVE_METHOD, METADATA_METHOD,
};
