//! Room server
//!
//! Owns the registry, relay and member list, builds the room manifest and
//! attaches authenticated connections to it.

use crate::config::{PrivacyMode, RoomConfig};
use crate::error::RoomError;
use crate::members::Members;
use crate::registry::{EndpointFeed, TunnelRegistry};
use crate::relay::{TunnelRelay, CONNECT_METHOD};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use muxroom_proto::{Body, PeerId, RoomMetadata};
use muxroom_rpc::{
    Access, AccessPolicy, AllowAll, CallContext, Connection, Manifest, PingClock, RpcError,
    SourceHandler, StreamItem, PING_METHOD,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub const IS_ROOM_METHOD: &str = "tunnel.isRoom";
pub const ANNOUNCE_METHOD: &str = "tunnel.announce";
pub const LEAVE_METHOD: &str = "tunnel.leave";
pub const ENDPOINTS_METHOD: &str = "tunnel.endpoints";
pub const METADATA_METHOD: &str = "room.metadata";

const FEATURES: &[&str] = &["tunnel", "room1"];

pub struct RoomServer {
    config: RoomConfig,
    registry: TunnelRegistry,
    relay: Arc<TunnelRelay>,
    members: Arc<Members>,
    manifest: Arc<Manifest>,
}

impl RoomServer {
    pub fn new(config: RoomConfig) -> Result<Self, RoomError> {
        let registry = TunnelRegistry::new();
        let members = Arc::new(Members::new(
            config.room_id.clone(),
            config.members.iter().cloned(),
        ));
        let relay = Arc::new(TunnelRelay::new(
            config.room_id.clone(),
            registry.clone(),
            config.relay.clone(),
        ));
        let manifest = Arc::new(room_manifest(&config, &registry, &relay, &members)?);

        info!(
            room = %config.room_id,
            name = %config.name,
            privacy_mode = ?config.privacy_mode,
            members = members.len(),
            "Room server ready"
        );

        Ok(Self {
            config,
            registry,
            relay,
            members,
            manifest,
        })
    }

    /// Serve an authenticated connection from `remote`.
    ///
    /// Restricted rooms refuse non-members; the stream is dropped unanswered.
    pub fn attach<S>(&self, stream: S, remote: PeerId) -> Result<Connection, RoomError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let is_member = self.members.contains(&remote);
        if self.config.privacy_mode == PrivacyMode::Restricted && !is_member {
            warn!(peer = %remote, "Refusing non-member in restricted room");
            return Err(RoomError::NotMember(remote));
        }

        let policy: Arc<dyn AccessPolicy> = match self.config.privacy_mode {
            PrivacyMode::Open => Arc::new(AllowAll),
            PrivacyMode::Community | PrivacyMode::Restricted => self.members.clone(),
        };

        let connection = Connection::builder(remote, self.manifest.clone())
            .policy(policy)
            .config(self.config.connection.clone())
            .open(stream);
        info!(
            peer = %connection.remote_id(),
            connection_id = connection.id(),
            member = is_member,
            "Peer attached"
        );

        let registry = self.registry.clone();
        let watched = connection.clone();
        tokio::spawn(async move {
            watched.closed().await;
            let gone = registry.connection_lost(watched.id());
            debug!(
                peer = %watched.remote_id(),
                connection_id = watched.id(),
                endpoints_removed = gone.len(),
                "Peer detached"
            );
        });

        Ok(connection)
    }

    pub fn metadata_for(&self, peer: &PeerId) -> RoomMetadata {
        metadata(&self.config.name, &self.members, peer)
    }

    pub fn config(&self) -> &RoomConfig {
        &self.config
    }

    pub fn registry(&self) -> &TunnelRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &TunnelRelay {
        &self.relay
    }

    pub fn members(&self) -> &Members {
        &self.members
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

fn metadata(name: &str, members: &Members, peer: &PeerId) -> RoomMetadata {
    RoomMetadata {
        name: name.to_string(),
        membership: members.contains(peer),
        features: FEATURES.iter().map(|f| f.to_string()).collect(),
    }
}

fn room_manifest(
    config: &RoomConfig,
    registry: &TunnelRegistry,
    relay: &Arc<TunnelRelay>,
    members: &Arc<Members>,
) -> Result<Manifest, RoomError> {
    let mut manifest = Manifest::new();

    manifest.register_async(IS_ROOM_METHOD, Access::Public, |_ctx, _args| async {
        Ok::<_, RpcError>(Value::Bool(true))
    })?;

    let announce_registry = registry.clone();
    manifest.register_sync(
        ANNOUNCE_METHOD,
        Access::Members,
        move |ctx: &CallContext, _args: Vec<Value>| {
            announce_registry.announce(ctx.connection(), ctx.remote().clone());
            Ok(Value::Bool(true))
        },
    )?;

    let leave_registry = registry.clone();
    manifest.register_sync(
        LEAVE_METHOD,
        Access::Public,
        move |ctx: &CallContext, _args: Vec<Value>| {
            leave_registry.leave(ctx.connection());
            Ok(Value::Bool(true))
        },
    )?;

    manifest.register_source(
        ENDPOINTS_METHOD,
        Access::Public,
        Arc::new(EndpointsSource {
            registry: registry.clone(),
        }),
    )?;

    manifest.register_duplex(CONNECT_METHOD, Access::Public, relay.clone())?;

    let clock = Arc::new(PingClock::new());
    manifest.register_sync(
        PING_METHOD,
        Access::Public,
        move |_ctx: &CallContext, _args: Vec<Value>| Ok(json!(clock.now_millis())),
    )?;

    let name = config.name.clone();
    let metadata_members = members.clone();
    manifest.register_async(METADATA_METHOD, Access::Public, move |ctx: CallContext, _args| {
        let result = metadata(&name, &metadata_members, ctx.remote());
        async move {
            serde_json::to_value(result)
                .map_err(|e| RpcError::Protocol(format!("unencodable metadata: {}", e)))
        }
    })?;

    Ok(manifest)
}

/// `tunnel.endpoints`: the list of announced peers, then the list again after every change
struct EndpointsSource {
    registry: TunnelRegistry,
}

#[async_trait]
impl SourceHandler for EndpointsSource {
    async fn open(
        &self,
        ctx: CallContext,
        _args: Vec<Value>,
    ) -> Result<BoxStream<'static, StreamItem>, RpcError> {
        debug!(peer = %ctx.remote(), "Endpoint subscriber joined");
        let feed: EndpointFeed = self.registry.subscribe();

        let updates = stream::unfold(feed, |mut feed| async move {
            let update = feed.recv().await?;
            let peers = json!(update.peers());
            Some((Ok(Body::Json(peers)), feed))
        });
        Ok(updates.boxed())
    }
}
