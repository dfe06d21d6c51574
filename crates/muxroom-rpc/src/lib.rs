//! muxrpc connections
//!
//! A [`Connection`] multiplexes many concurrent calls over one authenticated
//! duplex byte stream. Calls come in five kinds (sync, async, source, sink,
//! duplex); incoming calls are served from a [`Manifest`].

pub mod clock;
pub mod config;
pub mod connection;
mod dispatch;
pub mod error;
pub mod manifest;
pub mod stream;
pub mod tunnel;

pub use clock::{PingClock, PING_METHOD};
pub use config::ConnectionConfig;
pub use connection::{Connection, ConnectionBuilder, ConnectionId, WeakConnection};
pub use error::{rpc_error, RpcError};
pub use manifest::{
    Access, AccessPolicy, AllowAll, AsyncHandler, CallContext, DuplexHandler, DuplexTask, Handler,
    Manifest, ManifestError, MethodEntry, SinkHandler, SinkTask, SourceHandler, SyncHandler,
    MANIFEST_METHOD,
};
pub use stream::{Duplex, RawItem, Sink, Source, StreamItem};
pub use tunnel::TunnelStream;
