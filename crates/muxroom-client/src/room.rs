//! Peer-side view of a room connection

use crate::endpoints::EndpointStream;
use muxroom_proto::{PeerId, RoomMetadata, TunnelConnectArgs, TunnelHandle};
use muxroom_rpc::{Connection, RpcError, TunnelStream, PING_METHOD};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const IS_ROOM_METHOD: &str = "tunnel.isRoom";
const ANNOUNCE_METHOD: &str = "tunnel.announce";
const LEAVE_METHOD: &str = "tunnel.leave";
const ENDPOINTS_METHOD: &str = "tunnel.endpoints";
const CONNECT_METHOD: &str = "tunnel.connect";
const METADATA_METHOD: &str = "room.metadata";

/// Client for the tunnel methods of a room
///
/// Wraps an open connection to the room; every operation is a plain muxrpc
/// call on it.
#[derive(Debug, Clone)]
pub struct RoomClient {
    connection: Connection,
}

impl RoomClient {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Identity of the room, as authenticated by the transport
    pub fn room_id(&self) -> &PeerId {
        self.connection.remote_id()
    }

    /// `true` for rooms. Other peers don't expose the method, so asking them
    /// fails with [`RpcError::MethodNotFound`].
    pub async fn is_room(&self) -> Result<bool, RpcError> {
        self.connection.call_async(IS_ROOM_METHOD, Vec::new()).await
    }

    /// Become reachable through the room.
    pub async fn announce(&self) -> Result<(), RpcError> {
        self.connection
            .call_sync::<Value>(ANNOUNCE_METHOD, Vec::new())
            .await?;
        info!(room = %self.room_id(), "Announced");
        Ok(())
    }

    /// Stop being reachable through the room. Leaving twice is fine.
    pub async fn leave(&self) -> Result<(), RpcError> {
        self.connection
            .call_sync::<Value>(LEAVE_METHOD, Vec::new())
            .await?;
        info!(room = %self.room_id(), "Left");
        Ok(())
    }

    /// Follow peers joining and leaving the room.
    pub async fn endpoints(&self) -> Result<EndpointStream, RpcError> {
        let source = self.connection.source(ENDPOINTS_METHOD, Vec::new()).await?;
        Ok(EndpointStream::new(source))
    }

    /// The room's clock in milliseconds; never decreases between calls.
    pub async fn ping(&self) -> Result<i64, RpcError> {
        self.connection.call_sync(PING_METHOD, Vec::new()).await
    }

    pub async fn metadata(&self) -> Result<RoomMetadata, RpcError> {
        self.connection.call_async(METADATA_METHOD, Vec::new()).await
    }

    /// Open a tunnel to the peer named by `handle`.
    ///
    /// Refusals by the room or the target (for example
    /// [`RpcError::PeerNotFound`]) surface on the first read from the returned
    /// stream; [`muxroom_rpc::rpc_error`] recovers them from the `io::Error`.
    pub async fn connect(&self, handle: &TunnelHandle) -> Result<TunnelStream, RpcError> {
        if &handle.room != self.room_id() {
            return Err(RpcError::Protocol(format!(
                "handle is for room {}, connected to {}",
                handle.room,
                self.room_id()
            )));
        }
        self.connect_to(&handle.target).await
    }

    /// Like [`connect`](Self::connect), but waits up to `grace` for the room
    /// or the target to refuse, so refusals fail the call itself.
    ///
    /// A target that stays silent for `grace` is assumed to have accepted;
    /// anything it sent first is kept for the first read.
    pub async fn connect_checked(
        &self,
        handle: &TunnelHandle,
        grace: Duration,
    ) -> Result<TunnelStream, RpcError> {
        let mut stream = self.connect(handle).await?;
        match tokio::time::timeout(grace, stream.prefetch()).await {
            Ok(Err(err)) => {
                debug!(target = %handle.target, error = %err, "Tunnel refused");
                Err(err)
            }
            Ok(Ok(())) | Err(_) => Ok(stream),
        }
    }

    /// Open a tunnel to `target` through this room.
    pub async fn connect_to(&self, target: &PeerId) -> Result<TunnelStream, RpcError> {
        let args = TunnelConnectArgs {
            portal: self.room_id().clone(),
            target: target.clone(),
            origin: None,
        };
        let args = serde_json::to_value(&args)
            .map_err(|e| RpcError::Protocol(format!("unencodable connect arguments: {}", e)))?;

        debug!(room = %self.room_id(), target = %target, "Opening tunnel");
        let duplex = self.connection.duplex(CONNECT_METHOD, vec![args]).await?;
        Ok(TunnelStream::new(duplex))
    }
}
