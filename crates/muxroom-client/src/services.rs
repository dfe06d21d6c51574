//! Methods a peer serves to its room
//!
//! A room forwards `tunnel.connect` to the target peer with the requester as
//! `origin`; the peer decides whether to take the tunnel. Accepted tunnels are
//! handed to the application as [`IncomingTunnel`]s.

use async_trait::async_trait;
use futures::FutureExt;
use muxroom_proto::{PeerId, TunnelConnectArgs};
use muxroom_rpc::{
    Access, CallContext, Duplex, DuplexHandler, DuplexTask, Manifest, ManifestError, PingClock,
    RpcError, TunnelStream, PING_METHOD,
};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

const CONNECT_METHOD: &str = "tunnel.connect";

/// Decides which peers may open tunnels to us
pub trait TunnelPolicy: Send + Sync + 'static {
    fn accept(&self, origin: &PeerId) -> bool;
}

impl<F> TunnelPolicy for F
where
    F: Fn(&PeerId) -> bool + Send + Sync + 'static,
{
    fn accept(&self, origin: &PeerId) -> bool {
        (self)(origin)
    }
}

/// Accepts every tunnel
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl TunnelPolicy for AcceptAll {
    fn accept(&self, _origin: &PeerId) -> bool {
        true
    }
}

/// A tunnel another peer opened to us
pub struct IncomingTunnel {
    /// Peer at the other end
    pub origin: PeerId,
    /// Room the tunnel runs through
    pub portal: PeerId,
    pub stream: TunnelStream,
}

impl fmt::Debug for IncomingTunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingTunnel")
            .field("origin", &self.origin)
            .field("portal", &self.portal)
            .finish()
    }
}

/// Builder for the peer-side manifest
pub struct PeerServices {
    policy: Arc<dyn TunnelPolicy>,
    queue: usize,
}

impl PeerServices {
    pub fn new() -> Self {
        Self {
            policy: Arc::new(AcceptAll),
            queue: 16,
        }
    }

    pub fn with_policy(mut self, policy: impl TunnelPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Accepted tunnels waiting to be picked up before new ones are refused
    pub fn with_queue(mut self, queue: usize) -> Self {
        self.queue = queue.max(1);
        self
    }

    /// Add `tunnel.ping` and `tunnel.connect` to `manifest`.
    pub fn register(
        self,
        manifest: &mut Manifest,
    ) -> Result<mpsc::Receiver<IncomingTunnel>, ManifestError> {
        let clock = Arc::new(PingClock::new());
        manifest.register_sync(
            PING_METHOD,
            Access::Public,
            move |_ctx: &CallContext, _args: Vec<Value>| Ok(json!(clock.now_millis())),
        )?;

        let (tx, rx) = mpsc::channel(self.queue);
        manifest.register_duplex(
            CONNECT_METHOD,
            Access::Public,
            Arc::new(TunnelAcceptor {
                policy: self.policy,
                tx,
            }),
        )?;
        Ok(rx)
    }

    /// A manifest with just the peer services.
    pub fn into_manifest(self) -> Result<(Manifest, mpsc::Receiver<IncomingTunnel>), ManifestError> {
        let mut manifest = Manifest::new();
        let incoming = self.register(&mut manifest)?;
        Ok((manifest, incoming))
    }
}

impl Default for PeerServices {
    fn default() -> Self {
        Self::new()
    }
}

struct TunnelAcceptor {
    policy: Arc<dyn TunnelPolicy>,
    tx: mpsc::Sender<IncomingTunnel>,
}

#[async_trait]
impl DuplexHandler for TunnelAcceptor {
    async fn open(&self, ctx: CallContext, args: Vec<Value>) -> Result<DuplexTask, RpcError> {
        let args: TunnelConnectArgs = args
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Protocol("tunnel.connect needs an argument".into()))
            .and_then(|arg| {
                serde_json::from_value(arg)
                    .map_err(|e| RpcError::Protocol(format!("invalid tunnel.connect argument: {}", e)))
            })?;

        // Direct connections carry no origin; the caller is the origin.
        let origin = args.origin.unwrap_or_else(|| ctx.remote().clone());
        if !self.policy.accept(&origin) {
            debug!(origin = %origin, "Refusing tunnel");
            return Err(RpcError::PermissionDenied(format!(
                "tunnel from {} refused",
                origin
            )));
        }

        let permit = self
            .tx
            .clone()
            .try_reserve_owned()
            .map_err(|_| RpcError::PermissionDenied("not accepting tunnels".into()))?;

        info!(origin = %origin, portal = %args.portal, "Accepted tunnel");
        let portal = args.portal;
        let task: DuplexTask = Box::new(move |duplex: Duplex| {
            async move {
                let _ = permit.send(IncomingTunnel {
                    origin,
                    portal,
                    stream: TunnelStream::new(duplex),
                });
            }
            .boxed()
        });
        Ok(task)
    }
}
