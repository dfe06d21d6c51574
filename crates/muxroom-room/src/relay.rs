//! Tunnel relay
//!
//! Serves `tunnel.connect`: looks up the target peer, opens a
//! `tunnel.connect` duplex on the target's connection and splices the two
//! streams. Bodies are forwarded verbatim in both directions; the relay never
//! looks inside them.

use crate::config::RelayConfig;
use crate::registry::TunnelRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use muxroom_proto::{PeerId, TunnelConnectArgs};
use muxroom_rpc::{CallContext, Duplex, DuplexHandler, DuplexTask, RpcError, Sink, Source};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Method path used both towards the room and from the room to the target
pub const CONNECT_METHOD: &str = "tunnel.connect";

/// A running splice between two peers
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub id: Uuid,
    pub origin: PeerId,
    pub target: PeerId,
    pub started_at: DateTime<Utc>,
}

type Sessions = Arc<Mutex<HashMap<Uuid, RelaySession>>>;

fn lock(sessions: &Sessions) -> MutexGuard<'_, HashMap<Uuid, RelaySession>> {
    sessions.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Removes the session when the splice finishes, however it finishes
struct SessionGuard {
    sessions: Sessions,
    id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        lock(&self.sessions).remove(&self.id);
    }
}

pub struct TunnelRelay {
    room_id: PeerId,
    registry: TunnelRegistry,
    config: RelayConfig,
    sessions: Sessions,
}

impl TunnelRelay {
    pub fn new(room_id: PeerId, registry: TunnelRegistry, config: RelayConfig) -> Self {
        Self {
            room_id,
            registry,
            config,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn active_sessions(&self) -> Vec<RelaySession> {
        lock(&self.sessions).values().cloned().collect()
    }

    /// Ask `target` to accept a tunnel from `origin`.
    ///
    /// The target's answer arrives on the returned duplex: data once it
    /// accepted, or an error end if it refused.
    pub async fn connect(&self, origin: &PeerId, target: &PeerId) -> Result<Duplex, RpcError> {
        let Some(connection) = self.registry.lookup(target) else {
            debug!(origin = %origin, target = %target, "Tunnel target not announced");
            return Err(RpcError::PeerNotFound(target.to_string()));
        };

        let args = TunnelConnectArgs {
            portal: self.room_id.clone(),
            target: target.clone(),
            origin: Some(origin.clone()),
        };
        let args = serde_json::to_value(&args)
            .map_err(|e| RpcError::Protocol(format!("unencodable connect arguments: {}", e)))?;

        connection.duplex(CONNECT_METHOD, vec![args]).await
    }
}

#[async_trait]
impl DuplexHandler for TunnelRelay {
    async fn open(&self, ctx: CallContext, args: Vec<Value>) -> Result<DuplexTask, RpcError> {
        let args: TunnelConnectArgs = args
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Protocol("tunnel.connect needs an argument".into()))
            .and_then(|arg| {
                serde_json::from_value(arg)
                    .map_err(|e| RpcError::Protocol(format!("invalid tunnel.connect argument: {}", e)))
            })?;

        if args.portal != self.room_id {
            return Err(RpcError::Protocol(format!(
                "portal {} is not this room",
                args.portal
            )));
        }

        let origin = ctx.remote().clone();
        let toward_target = self.connect(&origin, &args.target).await?;

        let session = RelaySession {
            id: Uuid::new_v4(),
            origin,
            target: args.target,
            started_at: Utc::now(),
        };
        info!(
            session_id = %session.id,
            origin = %session.origin,
            target = %session.target,
            "Tunnel opened"
        );
        lock(&self.sessions).insert(session.id, session.clone());

        let guard = SessionGuard {
            sessions: self.sessions.clone(),
            id: session.id,
        };
        let idle_timeout = self.config.idle_timeout;
        let task: DuplexTask = Box::new(move |requester: Duplex| {
            async move {
                splice(&session, requester, toward_target, idle_timeout).await;
                drop(guard);
            }
            .boxed()
        });
        Ok(task)
    }
}

#[derive(Debug)]
enum Terminal {
    End,
    Error(RpcError),
    /// The side being written to went away
    Closed,
}

#[derive(Debug, Clone, Copy)]
enum Side {
    Origin,
    Target,
}

/// Last time either direction moved a frame
struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.start.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    async fn idle(&self, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return futures::future::pending().await;
        };
        loop {
            let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
            let deadline = self.start + last + timeout;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

async fn splice(
    session: &RelaySession,
    origin: Duplex,
    target: Duplex,
    idle_timeout: Option<Duration>,
) {
    let (mut from_origin, mut to_origin) = origin.split();
    let (mut from_target, mut to_target) = target.split();
    let activity = Activity::new();

    let (side, terminal) = tokio::select! {
        terminal = pump(&mut from_origin, &mut to_target, &activity) => (Some(Side::Origin), terminal),
        terminal = pump(&mut from_target, &mut to_origin, &activity) => (Some(Side::Target), terminal),
        _ = activity.idle(idle_timeout) => (None, Terminal::Closed),
    };

    // The pump already passed the terminal event on; close the way back too.
    let _ = match (side, &terminal) {
        (Some(Side::Origin), Terminal::Closed) => to_origin.error(RpcError::ConnectionClosed).await,
        (Some(Side::Origin), _) => to_origin.end().await,
        (Some(Side::Target), Terminal::Closed) => to_target.error(RpcError::ConnectionClosed).await,
        (Some(Side::Target), _) => to_target.end().await,
        (None, _) => {
            warn!(session_id = %session.id, "Tunnel idle, closing");
            let idle = RpcError::Transport("tunnel idle timeout".into());
            let _ = to_target.error(idle.clone()).await;
            to_origin.error(idle).await
        }
    };

    info!(
        session_id = %session.id,
        origin = %session.origin,
        target = %session.target,
        closed_by = ?side,
        terminal = ?terminal,
        duration_ms = (Utc::now() - session.started_at).num_milliseconds(),
        "Tunnel closed"
    );
}

/// Forward one direction until it ends. Elements pass through undecoded.
async fn pump(from: &mut Source, to: &mut Sink, activity: &Activity) -> Terminal {
    loop {
        match from.recv_raw().await {
            Some(Ok(raw)) => {
                activity.touch();
                if to.send_raw(raw).await.is_err() {
                    return Terminal::Closed;
                }
            }
            Some(Err(err)) => {
                let _ = to.error(err.clone()).await;
                return Terminal::Error(err);
            }
            None => {
                let _ = to.end().await;
                return Terminal::End;
            }
        }
    }
}
