//! Stream halves handed to callers and handlers
//!
//! A [`Source`] is pulled by its consumer; the connection reader waits when
//! the consumer falls behind, so a slow reader stalls the producer instead of
//! buffering without bound. A [`Sink`] writes through the connection's bounded
//! writer queue and ends the stream when dropped.
//!
//! Elements travel as [`RawBody`] and are only decoded when read through the
//! typed API, so relays can forward them byte for byte.

use crate::connection::{data_frame, end_frame, error_frame, Shared, StreamKey};
use crate::error::RpcError;
use futures::Stream;
use muxroom_proto::{Body, Frame, RawBody};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::trace;

/// One element of a stream: a body, or the error that terminated it
pub type StreamItem = Result<Body, RpcError>;

/// One undecoded element of a stream
pub type RawItem = Result<RawBody, RpcError>;

/// Ties a source to its connection, so losing the connection is reported even
/// when the error could not be queued behind buffered elements.
struct Watch {
    shared: Arc<Shared>,
    clean_end: Arc<AtomicBool>,
}

impl Watch {
    fn lost(&self) -> Option<RpcError> {
        if self.clean_end.load(Ordering::Acquire) {
            return None;
        }
        self.shared.close_reason_if_closed()
    }
}

/// Receiving half of a stream
///
/// Yields `None` once the remote side has ended the stream cleanly. A stream
/// cut short by the connection closing yields the close reason last.
pub struct Source {
    rx: mpsc::Receiver<RawItem>,
    watch: Option<Watch>,
    finished: bool,
    // Set for plain source calls: dropping the source aborts the call.
    abort: Option<Sink>,
}

impl Source {
    /// Wrap a channel of stream items, e.g. to feed a local producer to a consumer of sources.
    pub fn new(rx: mpsc::Receiver<RawItem>) -> Self {
        Self {
            rx,
            watch: None,
            finished: false,
            abort: None,
        }
    }

    pub(crate) fn watched(
        rx: mpsc::Receiver<RawItem>,
        shared: Arc<Shared>,
        clean_end: Arc<AtomicBool>,
    ) -> Self {
        let mut source = Self::new(rx);
        source.watch = Some(Watch { shared, clean_end });
        source
    }

    pub(crate) fn with_abort(mut self, sink: Sink) -> Self {
        self.abort = Some(sink);
        self
    }

    /// Next element, decoded.
    pub async fn recv(&mut self) -> Option<StreamItem> {
        futures::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// Next element exactly as it arrived.
    pub async fn recv_raw(&mut self) -> Option<RawItem> {
        futures::future::poll_fn(|cx| self.poll_recv_raw(cx)).await
    }

    pub fn poll_recv_raw(&mut self, cx: &mut Context<'_>) -> Poll<Option<RawItem>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match ready!(self.rx.poll_recv(cx)) {
            Some(Ok(raw)) => Poll::Ready(Some(Ok(raw))),
            Some(Err(err)) => {
                self.finished = true;
                Poll::Ready(Some(Err(err)))
            }
            None => {
                self.finished = true;
                Poll::Ready(self.watch.as_ref().and_then(Watch::lost).map(Err))
            }
        }
    }

    /// Stop reading and tell the remote side to stop producing.
    pub async fn abort(mut self) -> Result<(), RpcError> {
        match self.abort.take() {
            Some(mut sink) => sink.end().await,
            None => Ok(()),
        }
    }
}

impl Stream for Source {
    type Item = StreamItem;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamItem>> {
        let item = ready!(self.get_mut().poll_recv_raw(cx));
        Poll::Ready(item.map(|item| {
            item.and_then(|raw| {
                raw.decode().map_err(|e| {
                    RpcError::Protocol(format!("undecodable stream element: {}", e))
                })
            })
        }))
    }
}

/// Sending half of a stream
pub struct Sink {
    shared: Arc<Shared>,
    key: StreamKey,
    ended: Arc<AtomicBool>,
}

impl Sink {
    pub(crate) fn new(shared: Arc<Shared>, key: StreamKey, ended: Arc<AtomicBool>) -> Self {
        Self { shared, key, ended }
    }

    /// Request number used on the wire for this side of the stream.
    pub fn req(&self) -> i32 {
        self.key.wire_req()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Write one element, waiting for room in the connection's writer queue.
    pub async fn send(&mut self, body: impl Into<Body>) -> Result<(), RpcError> {
        self.send_raw(RawBody::from(body.into())).await
    }

    /// Write one element without re-encoding it.
    pub async fn send_raw(&mut self, raw: RawBody) -> Result<(), RpcError> {
        if self.is_ended() {
            return Err(RpcError::Protocol(format!(
                "stream {} already ended",
                self.req()
            )));
        }
        let frame = data_frame(self.req(), raw);
        if frame.body.len() > self.shared.config.max_frame_size as usize {
            return Err(RpcError::Protocol(format!(
                "body of {} bytes exceeds the frame limit",
                frame.body.len()
            )));
        }
        self.shared.send_frame(frame).await
    }

    pub async fn end(&mut self) -> Result<(), RpcError> {
        let frame = end_frame(self.req());
        self.finish(frame).await
    }

    /// End the stream with an error the remote side will see as the last element.
    pub async fn error(&mut self, err: RpcError) -> Result<(), RpcError> {
        let frame = error_frame(self.req(), true, &err);
        self.finish(frame).await
    }

    async fn finish(&mut self, frame: Frame) -> Result<(), RpcError> {
        if self.ended.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.shared.send_frame(frame).await;
        self.shared.local_ended(self.key);
        result
    }

    /// Claim the end of the stream without sending it; the caller writes the frame.
    pub(crate) fn take_end(&self) -> Option<Frame> {
        if self.ended.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(end_frame(self.req()))
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn key(&self) -> StreamKey {
        self.key
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        let Some(frame) = self.take_end() else {
            return;
        };

        match self.shared.outgoing.try_send(frame) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let outgoing = self.shared.outgoing.clone();
                    handle.spawn(async move {
                        let _ = outgoing.send(frame).await;
                    });
                } else {
                    trace!(req = self.req(), "No runtime to send stream end from drop");
                }
            }
        }
        self.shared.local_ended(self.key);
    }
}

/// Both halves of a duplex (or sink) call
pub struct Duplex {
    pub source: Source,
    pub sink: Sink,
}

impl Duplex {
    pub fn split(self) -> (Source, Sink) {
        (self.source, self.sink)
    }
}
