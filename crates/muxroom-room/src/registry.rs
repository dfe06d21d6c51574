//! Tunnel endpoint registry
//!
//! Tracks which connected peers announced themselves as reachable through
//! the room. Every mutation is applied and broadcast under one lock, so
//! subscribers see changes in the order they happened and a fresh subscriber
//! never misses or double-counts a change relative to its initial snapshot.

use chrono::{DateTime, Utc};
use muxroom_proto::{EndpointEvent, PeerId};
use muxroom_rpc::{Connection, ConnectionId, WeakConnection};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Changes buffered per subscriber before it is resynchronised
const FEED_CAPACITY: usize = 256;

/// An announced endpoint
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub peer_id: PeerId,
    pub connection: WeakConnection,
    pub announced_at: DateTime<Utc>,
}

impl EndpointDescriptor {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }
}

/// One registry change and the announced peers right after it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointChange {
    pub event: EndpointEvent,
    pub snapshot: Vec<PeerId>,
}

/// What an endpoint feed yields
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointUpdate {
    /// Full list of announced peers; sent first and after falling behind
    Snapshot(Vec<PeerId>),
    Change(EndpointChange),
}

impl EndpointUpdate {
    /// Announced peers after this update
    pub fn peers(&self) -> &[PeerId] {
        match self {
            EndpointUpdate::Snapshot(peers) => peers,
            EndpointUpdate::Change(change) => &change.snapshot,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    Added,
    /// The peer was announced from another connection; the newer one wins
    Replaced,
    /// Repeated announce from the same connection
    Unchanged,
}

#[derive(Default)]
struct Inner {
    endpoints: BTreeMap<PeerId, EndpointDescriptor>,
}

impl Inner {
    fn snapshot(&self) -> Vec<PeerId> {
        self.endpoints.keys().cloned().collect()
    }
}

/// Shared, cheaply clonable endpoint registry
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<Mutex<Inner>>,
    changes: broadcast::Sender<EndpointChange>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            changes,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock(&self.inner)
    }

    /// Record `peer_id` as reachable over `connection`.
    pub fn announce(&self, connection: &Connection, peer_id: PeerId) -> AnnounceOutcome {
        let mut inner = self.lock();

        let outcome = match inner.endpoints.get(&peer_id) {
            Some(existing) if existing.connection_id() == connection.id() => {
                debug!(peer = %peer_id, connection_id = connection.id(), "Duplicate announce");
                return AnnounceOutcome::Unchanged;
            }
            Some(existing) => {
                info!(
                    peer = %peer_id,
                    old_connection_id = existing.connection_id(),
                    connection_id = connection.id(),
                    "Replacing endpoint announced from another connection"
                );
                AnnounceOutcome::Replaced
            }
            None => {
                info!(peer = %peer_id, connection_id = connection.id(), "Endpoint announced");
                AnnounceOutcome::Added
            }
        };

        inner.endpoints.insert(
            peer_id.clone(),
            EndpointDescriptor {
                peer_id: peer_id.clone(),
                connection: connection.downgrade(),
                announced_at: Utc::now(),
            },
        );

        if outcome == AnnounceOutcome::Added {
            self.publish(&inner, EndpointEvent::Joined(peer_id));
        }
        outcome
    }

    /// Withdraw everything announced over `connection`. Returns whether anything was removed.
    pub fn leave(&self, connection: &Connection) -> bool {
        !self.remove_connection(connection.id()).is_empty()
    }

    /// Same as [`leave`](Self::leave), for a connection that is already gone.
    pub fn connection_lost(&self, connection_id: ConnectionId) -> Vec<PeerId> {
        self.remove_connection(connection_id)
    }

    fn remove_connection(&self, connection_id: ConnectionId) -> Vec<PeerId> {
        let mut inner = self.lock();
        let gone: Vec<PeerId> = inner
            .endpoints
            .values()
            .filter(|descriptor| descriptor.connection_id() == connection_id)
            .map(|descriptor| descriptor.peer_id.clone())
            .collect();

        for peer_id in &gone {
            inner.endpoints.remove(peer_id);
            info!(peer = %peer_id, connection_id, "Endpoint left");
            self.publish(&inner, EndpointEvent::Left(peer_id.clone()));
        }
        gone
    }

    fn publish(&self, inner: &Inner, event: EndpointEvent) {
        let change = EndpointChange {
            event,
            snapshot: inner.snapshot(),
        };
        // No subscribers is fine
        let _ = self.changes.send(change);
    }

    /// Live connection of an announced peer
    pub fn lookup(&self, peer_id: &PeerId) -> Option<Connection> {
        let inner = self.lock();
        inner
            .endpoints
            .get(peer_id)
            .and_then(|descriptor| descriptor.connection.upgrade())
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<EndpointDescriptor> {
        self.lock().endpoints.get(peer_id).cloned()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.lock().endpoints.contains_key(peer_id)
    }

    /// Announced peers, sorted
    pub fn peers(&self) -> Vec<PeerId> {
        self.lock().snapshot()
    }

    pub fn endpoints(&self) -> Vec<EndpointDescriptor> {
        self.lock().endpoints.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().endpoints.is_empty()
    }

    /// Follow the registry, starting from the current snapshot.
    pub fn subscribe(&self) -> EndpointFeed {
        let inner = self.lock();
        EndpointFeed {
            initial: Some(inner.snapshot()),
            changes: self.changes.subscribe(),
            inner: self.inner.clone(),
        }
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered stream of registry updates for one subscriber
pub struct EndpointFeed {
    initial: Option<Vec<PeerId>>,
    changes: broadcast::Receiver<EndpointChange>,
    inner: Arc<Mutex<Inner>>,
}

impl EndpointFeed {
    /// Next update, or `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<EndpointUpdate> {
        if let Some(snapshot) = self.initial.take() {
            return Some(EndpointUpdate::Snapshot(snapshot));
        }

        match self.changes.recv().await {
            Ok(change) => Some(EndpointUpdate::Change(change)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Endpoint subscriber fell behind, resending snapshot");
                let inner = lock(&self.inner);
                self.changes = self.changes.resubscribe();
                Some(EndpointUpdate::Snapshot(inner.snapshot()))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}
