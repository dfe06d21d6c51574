//! Room Protocol Definitions
//!
//! This crate defines the wire-level types shared by the muxrpc transport and
//! the room tunnel service: the frame header and codec, request/response bodies,
//! call kinds, method paths, peer identities and tunnel handles.

pub mod body;
pub mod frame;
pub mod handle;
pub mod kind;
pub mod messages;
pub mod method;
pub mod peer;

pub use body::{Body, BodyError, ErrorBody, RawBody, RequestBody};
pub use frame::{BodyType, Flags, Frame, FrameCodec, FrameError};
pub use handle::{HandleError, TunnelHandle};
pub use kind::CallKind;
pub use messages::{EndpointEvent, RoomMetadata, TunnelConnectArgs};
pub use method::MethodPath;
pub use peer::PeerId;

/// Default maximum body size (8MB)
pub const MAX_FRAME_SIZE: u32 = 8 * 1024 * 1024;
