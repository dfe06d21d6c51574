//! muxroom - multiplexed RPC and room tunnels
//!
//! This crate re-exports the workspace crates as one entry point:
//!
//! - **`muxroom-proto`**: wire types (frames, bodies, call kinds, peer ids, tunnel handles)
//! - **`muxroom-rpc`**: the muxrpc connection multiplexer, manifests and streams
//! - **`muxroom-room`**: tunnel registry, relay and room server
//! - **`muxroom-client`**: the peer side of the room protocol
//!
//! # Quick Start - Room
//!
//! ```ignore
//! use muxroom::{PeerId, RoomConfig, RoomServer};
//!
//! let room = RoomServer::new(RoomConfig::new("@room.ed25519"))?;
//! // `stream` is an authenticated duplex byte stream, `remote` its peer id
//! let connection = room.attach(stream, remote)?;
//! connection.closed().await;
//! ```
//!
//! # Quick Start - Peer
//!
//! ```ignore
//! use muxroom::{Connection, PeerServices, RoomClient};
//! use std::sync::Arc;
//!
//! let (manifest, mut incoming) = PeerServices::new().into_manifest()?;
//! let room = RoomClient::new(Connection::builder(room_id, Arc::new(manifest)).open(stream));
//! room.announce().await?;
//!
//! while let Some(tunnel) = incoming.recv().await {
//!     // tunnel.stream is AsyncRead + AsyncWrite
//! }
//! ```

pub use muxroom_client as client;
pub use muxroom_proto as proto;
pub use muxroom_room as room;
pub use muxroom_rpc as rpc;

// Re-export protocol types
pub use muxroom_proto::{
    Body, BodyType, CallKind, EndpointEvent, HandleError, MethodPath, PeerId, RawBody,
    RoomMetadata, TunnelHandle,
};

// Re-export connection types
pub use muxroom_rpc::{
    rpc_error, Access, AccessPolicy, CallContext, Connection, ConnectionConfig, Duplex, Manifest,
    RawItem, RpcError, Sink, Source, TunnelStream,
};

// Re-export room types (for running a room)
pub use muxroom_room::{PrivacyMode, RelayConfig, RoomConfig, RoomError, RoomServer};

// Re-export client types (for peers)
pub use muxroom_client::{EndpointStream, IncomingTunnel, PeerServices, RoomClient, TunnelPolicy};
