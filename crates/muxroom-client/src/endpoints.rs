use muxroom_proto::{EndpointEvent, PeerId};
use muxroom_rpc::{RpcError, Source};
use std::collections::{BTreeSet, VecDeque};
use tracing::{debug, warn};

/// Live feed of peers joining and leaving a room
///
/// Rooms send the full list of announced peers, first on subscription and
/// again after every change; consecutive lists are turned into events.
pub struct EndpointStream {
    source: Source,
    known: BTreeSet<PeerId>,
    pending: VecDeque<EndpointEvent>,
}

impl EndpointStream {
    pub(crate) fn new(source: Source) -> Self {
        Self {
            source,
            known: BTreeSet::new(),
            pending: VecDeque::new(),
        }
    }

    /// Peers announced as of the last received update
    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.known.iter()
    }

    /// Next change, `None` when the room ends the feed.
    pub async fn recv(&mut self) -> Option<Result<EndpointEvent, RpcError>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }

            let body = match self.source.recv().await? {
                Ok(body) => body,
                Err(err) => return Some(Err(err)),
            };
            match body.into_json::<Vec<PeerId>>() {
                Ok(peers) => self.apply(peers.into_iter().collect()),
                Err(e) => warn!(error = %e, "Ignoring malformed endpoint list"),
            }
        }
    }

    fn apply(&mut self, current: BTreeSet<PeerId>) {
        for gone in self.known.difference(&current) {
            self.pending.push_back(EndpointEvent::Left(gone.clone()));
        }
        for joined in current.difference(&self.known) {
            self.pending.push_back(EndpointEvent::Joined(joined.clone()));
        }
        debug!(
            peers = current.len(),
            changes = self.pending.len(),
            "Endpoint list updated"
        );
        self.known = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muxroom_proto::{Body, RawBody};
    use serde_json::json;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_lists_become_events() {
        let (tx, rx) = mpsc::channel(8);
        let mut stream = EndpointStream::new(Source::new(rx));

        for list in [
            json!(["@a.ed25519"]),
            json!(["@a.ed25519", "@b.ed25519"]),
            json!(["@b.ed25519"]),
        ] {
            tx.send(Ok(RawBody::from(Body::Json(list)))).await.unwrap();
        }
        drop(tx);

        let a = PeerId::from("@a.ed25519");
        let b = PeerId::from("@b.ed25519");
        assert_eq!(stream.recv().await, Some(Ok(EndpointEvent::Joined(a.clone()))));
        assert_eq!(stream.recv().await, Some(Ok(EndpointEvent::Joined(b.clone()))));
        assert_eq!(stream.recv().await, Some(Ok(EndpointEvent::Left(a))));
        assert_eq!(stream.recv().await, None);
        assert_eq!(stream.peers().collect::<Vec<_>>(), vec![&b]);
    }
}
