//! Multiplexed muxrpc connection
//!
//! One reader task decodes frames and routes them to pending calls and open
//! streams; one writer task owns the write half and drains a bounded frame
//! queue, so frames are never interleaved mid-write. Calls opened locally use
//! positive request numbers from a counter; frames with a positive request
//! number on the way in belong to calls the peer opened.

use crate::config::ConnectionConfig;
use crate::error::RpcError;
use crate::manifest::{AccessPolicy, AllowAll, Manifest};
use crate::stream::{Duplex, RawItem, Sink, Source};
use futures::{SinkExt, StreamExt};
use muxroom_proto::{
    Body, BodyType, CallKind, ErrorBody, Flags, Frame, FrameCodec, MethodPath, PeerId,
    RawBody, RequestBody,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Process-unique connection identifier
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Which request-number space a stream lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StreamKey {
    /// Opened by us; we write `+id`
    Local(i32),
    /// Opened by the peer; we write `-id`
    Served(i32),
}

impl StreamKey {
    pub(crate) fn wire_req(self) -> i32 {
        match self {
            StreamKey::Local(id) => id,
            StreamKey::Served(id) => -id,
        }
    }
}

pub(crate) struct StreamSlot {
    kind: CallKind,
    inbound: Option<mpsc::Sender<RawItem>>,
    remote_ended: bool,
    /// Set when the remote side ended without an error
    clean_end: Arc<AtomicBool>,
    local_end: Arc<AtomicBool>,
    producer: Option<AbortHandle>,
}

impl StreamSlot {
    fn new(kind: CallKind, inbound: Option<mpsc::Sender<RawItem>>) -> Self {
        Self {
            kind,
            inbound,
            remote_ended: false,
            clean_end: Arc::new(AtomicBool::new(false)),
            local_end: Arc::new(AtomicBool::new(false)),
            producer: None,
        }
    }

    fn fail(self, reason: &RpcError) {
        self.local_end.store(true, Ordering::Release);
        if let Some(producer) = self.producer {
            producer.abort();
        }
        if let Some(inbound) = self.inbound {
            // With a full queue the source reports the close reason once drained.
            let _ = inbound.try_send(Err(reason.clone()));
        }
    }
}

enum Outgoing {
    Async(oneshot::Sender<Result<Body, RpcError>>),
    /// Fire-and-forget call; the response is read and discarded
    Detached,
    Stream(StreamSlot),
}

#[derive(Default)]
struct State {
    calls: HashMap<i32, Outgoing>,
    served: HashMap<i32, StreamSlot>,
    close_reason: Option<RpcError>,
}

impl State {
    fn slot_mut(&mut self, key: StreamKey) -> Option<&mut StreamSlot> {
        match key {
            StreamKey::Local(id) => match self.calls.get_mut(&id) {
                Some(Outgoing::Stream(slot)) => Some(slot),
                _ => None,
            },
            StreamKey::Served(id) => self.served.get_mut(&id),
        }
    }

    fn remove_slot(&mut self, key: StreamKey) {
        match key {
            StreamKey::Local(id) => {
                self.calls.remove(&id);
            }
            StreamKey::Served(id) => {
                self.served.remove(&id);
            }
        }
    }
}

/// What the reader does with a stream frame once the state lock is released
enum Delivery {
    Drop(&'static str),
    Data(mpsc::Sender<RawItem>, RawItem),
    End {
        inbound: Option<mpsc::Sender<RawItem>>,
        error: Option<RpcError>,
        reply_end: Option<i32>,
    },
}

pub(crate) struct Shared {
    pub(crate) id: ConnectionId,
    pub(crate) remote: PeerId,
    pub(crate) outgoing: mpsc::Sender<Frame>,
    pub(crate) manifest: Arc<Manifest>,
    pub(crate) policy: Arc<dyn AccessPolicy>,
    pub(crate) config: ConnectionConfig,
    state: Mutex<State>,
    next_req: AtomicI32,
    closed: CancellationToken,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<(), RpcError> {
        match self.outgoing.send(frame).await {
            Ok(()) => Ok(()),
            Err(_) => Err(self.close_reason()),
        }
    }

    fn close_reason(&self) -> RpcError {
        self.close_reason_if_closed()
            .unwrap_or(RpcError::ConnectionClosed)
    }

    pub(crate) fn close_reason_if_closed(&self) -> Option<RpcError> {
        self.state().close_reason.clone()
    }

    fn register_call(&self, call: Outgoing) -> Result<i32, RpcError> {
        let mut state = self.state();
        if let Some(reason) = &state.close_reason {
            return Err(reason.clone());
        }

        loop {
            let id = self.next_req.fetch_add(1, Ordering::Relaxed);
            if id <= 0 {
                // Wrapped around
                self.next_req.store(1, Ordering::Relaxed);
                continue;
            }
            if !state.calls.contains_key(&id) {
                state.calls.insert(id, call);
                return Ok(id);
            }
        }
    }

    fn forget_call(&self, id: i32) {
        self.state().calls.remove(&id);
    }

    pub(crate) fn register_served(&self, req: i32, slot: StreamSlot) -> bool {
        let mut state = self.state();
        if state.close_reason.is_some() {
            return false;
        }
        state.served.insert(req, slot);
        true
    }

    pub(crate) fn set_producer(&self, req: i32, producer: AbortHandle) {
        match self.state().served.get_mut(&req) {
            Some(slot) if !slot.remote_ended => slot.producer = Some(producer),
            _ => producer.abort(),
        }
    }

    /// Called once our side of a stream has sent its end.
    pub(crate) fn local_ended(&self, key: StreamKey) {
        let mut state = self.state();
        let finished = state.slot_mut(key).is_some_and(|slot| slot.remote_ended);
        if finished {
            state.remove_slot(key);
            trace!(peer = %self.remote, req = key.wire_req(), "Stream finished");
        }
    }

    /// Fail everything pending and stop both tasks. Idempotent.
    pub(crate) fn shutdown(&self, reason: RpcError) {
        let (calls, served) = {
            let mut state = self.state();
            if state.close_reason.is_some() {
                return;
            }
            state.close_reason = Some(reason.clone());
            (
                std::mem::take(&mut state.calls),
                std::mem::take(&mut state.served),
            )
        };
        self.closed.cancel();

        info!(
            peer = %self.remote,
            connection_id = self.id,
            pending_calls = calls.len(),
            open_streams = served.len(),
            reason = %reason,
            "Connection closed"
        );

        for call in calls.into_values() {
            match call {
                Outgoing::Async(tx) => {
                    let _ = tx.send(Err(reason.clone()));
                }
                Outgoing::Detached => {}
                Outgoing::Stream(slot) => slot.fail(&reason),
            }
        }
        for slot in served.into_values() {
            slot.fail(&reason);
        }
    }

    async fn route(self: &Arc<Self>, frame: Frame) {
        if frame.req > 0 {
            self.route_served(frame.req, frame).await;
            return;
        }

        match frame.req.checked_neg() {
            Some(id) => self.route_response(id, frame).await,
            None => warn!(peer = %self.remote, req = frame.req, "Dropping frame with invalid request number"),
        }
    }

    async fn route_response(&self, id: i32, frame: Frame) {
        let raw = frame.raw_body();
        let is_stream = frame.flags.is_stream();
        let end = frame.flags.is_end();

        let delivery = {
            let mut state = self.state();
            let is_stream_call = match state.calls.get(&id) {
                None => {
                    debug!(peer = %self.remote, req = frame.req, "Dropping frame for unknown call");
                    return;
                }
                Some(Outgoing::Stream(_)) => true,
                Some(_) => false,
            };

            if is_stream_call != is_stream {
                warn!(
                    peer = %self.remote,
                    req = frame.req,
                    "Dropping frame whose stream flag does not match the call"
                );
                return;
            }

            if is_stream_call {
                stream_frame(&mut state, StreamKey::Local(id), end, raw)
            } else {
                match state.calls.remove(&id) {
                    Some(Outgoing::Async(tx)) => {
                        let result = match raw.decode() {
                            Ok(body) if end => Err(response_error(body)),
                            Ok(body) => Ok(body),
                            Err(e) => Err(RpcError::Protocol(format!(
                                "undecodable response: {}",
                                e
                            ))),
                        };
                        let _ = tx.send(result);
                    }
                    _ => trace!(peer = %self.remote, req = frame.req, "Discarding response to notification"),
                }
                return;
            }
        };

        self.deliver(frame.req, delivery).await;
    }

    async fn route_served(self: &Arc<Self>, req: i32, frame: Frame) {
        let known = self.state().served.contains_key(&req);
        if !known {
            if frame.flags.is_stream() && frame.flags.is_end() {
                debug!(peer = %self.remote, req, "Dropping end for finished stream");
                return;
            }
            self.dispatch(req, frame).await;
            return;
        }

        if !frame.flags.is_stream() {
            warn!(peer = %self.remote, req, "Dropping non-stream frame for open stream");
            return;
        }

        let delivery = stream_frame(
            &mut self.state(),
            StreamKey::Served(req),
            frame.flags.is_end(),
            frame.raw_body(),
        );
        self.deliver(req, delivery).await;
    }

    async fn deliver(&self, req: i32, delivery: Delivery) {
        match delivery {
            Delivery::Drop(reason) => {
                debug!(peer = %self.remote, req, reason, "Dropping stream frame");
            }
            Delivery::Data(tx, item) => self.push(tx, item).await,
            Delivery::End {
                inbound,
                error,
                reply_end,
            } => {
                match (inbound, error) {
                    (Some(tx), Some(err)) => self.push(tx, Err(err)).await,
                    (None, Some(err)) => {
                        debug!(peer = %self.remote, req, error = %err, "Stream ended with error nobody reads");
                    }
                    // Dropping the sender ends the reader's stream
                    _ => {}
                }
                if let Some(wire_req) = reply_end {
                    let _ = self.send_frame(end_frame(wire_req)).await;
                }
            }
        }
    }

    /// Hand an element to a stream reader, waiting while its queue is full.
    async fn push(&self, tx: mpsc::Sender<RawItem>, item: RawItem) {
        tokio::select! {
            result = tx.send(item) => {
                if result.is_err() {
                    trace!(peer = %self.remote, "Stream reader gone, discarding element");
                }
            }
            _ = self.closed.cancelled() => {}
        }
    }

    pub(crate) async fn respond(&self, req: i32, result: Result<Value, RpcError>) {
        let frame = match result {
            Ok(value) => Frame::new(
                -req,
                Flags::new(BodyType::Json),
                Body::Json(value).to_bytes(),
            ),
            Err(err) => {
                debug!(peer = %self.remote, req, error = %err, "Call failed");
                error_frame(-req, false, &err)
            }
        };
        if self.send_frame(frame).await.is_err() {
            debug!(peer = %self.remote, req, "Connection closed before response was sent");
        }
    }

    pub(crate) async fn respond_error(&self, req: i32, stream: bool, err: RpcError) {
        debug!(peer = %self.remote, req, error = %err, "Rejecting call");
        let _ = self.send_frame(error_frame(-req, stream, &err)).await;
    }
}

/// Apply a stream frame to its slot. Runs under the state lock.
fn stream_frame(state: &mut State, key: StreamKey, end: bool, raw: RawBody) -> Delivery {
    let Some(slot) = state.slot_mut(key) else {
        return Delivery::Drop("unknown stream");
    };

    if !end {
        return match &slot.inbound {
            Some(tx) => Delivery::Data(tx.clone(), Ok(raw)),
            None => Delivery::Drop("stream is not readable"),
        };
    }

    if slot.remote_ended {
        return Delivery::Drop("duplicate end");
    }
    slot.remote_ended = true;

    let inbound = slot.inbound.take();
    if let Some(producer) = slot.producer.take() {
        producer.abort();
    }

    // Nothing flows from our side of a source, so answer the end right away.
    let reply_end = (slot.kind == CallKind::Source
        && !slot.local_end.swap(true, Ordering::AcqRel))
    .then(|| key.wire_req());

    let error = end_error(raw);
    if error.is_none() {
        slot.clean_end.store(true, Ordering::Release);
    }

    if slot.local_end.load(Ordering::Acquire) {
        state.remove_slot(key);
    }

    Delivery::End {
        inbound,
        error,
        reply_end,
    }
}

/// A stream end carries `true`, or an error object.
fn end_error(raw: RawBody) -> Option<RpcError> {
    match raw.decode() {
        Ok(Body::Json(value @ Value::Object(_))) => serde_json::from_value::<ErrorBody>(value)
            .ok()
            .map(RpcError::from_error_body),
        Ok(_) => None,
        Err(e) => Some(RpcError::Protocol(format!("undecodable stream end: {}", e))),
    }
}

fn response_error(body: Body) -> RpcError {
    match body.into_json::<ErrorBody>() {
        Ok(err) => RpcError::from_error_body(err),
        Err(e) => RpcError::Protocol(format!("undecodable error response: {}", e)),
    }
}

pub(crate) fn data_frame(req: i32, raw: RawBody) -> Frame {
    Frame::new(
        req,
        Flags::from_body_bits(raw.body_bits()).with_stream(),
        raw.into_bytes(),
    )
}

pub(crate) fn end_frame(req: i32) -> Frame {
    Frame::new(
        req,
        Flags::new(BodyType::Json).with_stream().with_end(),
        Body::Json(Value::Bool(true)).to_bytes(),
    )
}

pub(crate) fn error_frame(req: i32, stream: bool, err: &RpcError) -> Frame {
    let mut flags = Flags::new(BodyType::Json).with_end();
    if stream {
        flags = flags.with_stream();
    }
    let body = serde_json::to_value(err.to_error_body()).unwrap_or(Value::Null);
    Frame::new(req, flags, Body::Json(body).to_bytes())
}

fn request_frame(req: i32, request: &RequestBody) -> Result<Frame, RpcError> {
    let body = serde_json::to_value(request)
        .map_err(|e| RpcError::Protocol(format!("unencodable request: {}", e)))?;
    let mut flags = Flags::new(BodyType::Json);
    if request.kind().is_stream() {
        flags = flags.with_stream();
    }
    Ok(Frame::new(req, flags, Body::Json(body).to_bytes()))
}

async fn read_loop<R>(shared: Arc<Shared>, mut frames: FramedRead<ReadHalf<R>, FrameCodec>)
where
    R: AsyncRead + Send + 'static,
{
    let reason = loop {
        let next = tokio::select! {
            _ = shared.closed.cancelled() => break None,
            next = frames.next() => next,
        };

        match next {
            None => {
                debug!(peer = %shared.remote, "Transport closed");
                break Some(RpcError::ConnectionClosed);
            }
            Some(Err(e)) => {
                warn!(peer = %shared.remote, error = %e, "Failed to read frame");
                break Some(RpcError::Transport(e.to_string()));
            }
            Some(Ok(frame)) if frame.is_goodbye() => {
                debug!(peer = %shared.remote, "Received goodbye");
                let _ = shared.outgoing.try_send(Frame::goodbye());
                break Some(RpcError::ConnectionClosed);
            }
            Some(Ok(frame)) => {
                trace!(
                    peer = %shared.remote,
                    req = frame.req,
                    flags = frame.flags.as_u8(),
                    size = frame.body.len(),
                    "Received frame"
                );
                shared.route(frame).await;
            }
        }
    };

    if let Some(reason) = reason {
        shared.shutdown(reason);
    }
}

async fn write_loop<W>(
    mut frames: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut rx: mpsc::Receiver<Frame>,
    shared: Weak<Shared>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Send + 'static,
{
    loop {
        // Queued frames (a goodbye in particular) are written before shutting down.
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => frame,
            _ = closed.cancelled() => None,
        };
        let Some(frame) = frame else {
            break;
        };

        let goodbye = frame.is_goodbye();
        if let Err(e) = frames.send(frame).await {
            warn!(error = %e, "Failed to write frame");
            if let Some(shared) = shared.upgrade() {
                shared.shutdown(RpcError::Transport(e.to_string()));
            }
            break;
        }
        if goodbye {
            break;
        }
    }

    let _ = frames.close().await;
}

/// Builder for [`Connection`]
pub struct ConnectionBuilder {
    remote: PeerId,
    manifest: Arc<Manifest>,
    policy: Arc<dyn AccessPolicy>,
    config: ConnectionConfig,
}

impl ConnectionBuilder {
    pub fn policy(mut self, policy: Arc<dyn AccessPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Start serving `stream`, an authenticated duplex byte stream to `remote`.
    pub fn open<S>(self, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (outgoing, outgoing_rx) = mpsc::channel(self.config.outgoing_queue.max(1));
        let codec = FrameCodec::new(self.config.max_frame_size);

        let shared = Arc::new(Shared {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote: self.remote,
            outgoing,
            manifest: self.manifest,
            policy: self.policy,
            config: self.config,
            state: Mutex::new(State::default()),
            next_req: AtomicI32::new(1),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            FramedWrite::new(write_half, codec.clone()),
            outgoing_rx,
            Arc::downgrade(&shared),
            shared.closed.clone(),
        ));
        tokio::spawn(read_loop(shared.clone(), FramedRead::new(read_half, codec)));

        info!(peer = %shared.remote, connection_id = shared.id, "Connection opened");
        Connection { shared }
    }
}

/// One multiplexed muxrpc connection
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    pub fn builder(remote: PeerId, manifest: Arc<Manifest>) -> ConnectionBuilder {
        ConnectionBuilder {
            remote,
            manifest,
            policy: Arc::new(AllowAll),
            config: ConnectionConfig::default(),
        }
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// Identity the transport authenticated for the other side
    pub fn remote_id(&self) -> &PeerId {
        &self.shared.remote
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Resolves once the connection has shut down.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    pub fn close_reason(&self) -> Option<RpcError> {
        self.shared.state().close_reason.clone()
    }

    /// Say goodbye and shut down, failing everything still pending.
    pub async fn close(&self) {
        if self.is_closed() {
            return;
        }
        let _ = self.shared.outgoing.send(Frame::goodbye()).await;
        self.shared.shutdown(RpcError::ConnectionClosed);
    }

    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            id: self.shared.id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Call an async (or sync) method and wait for its single response.
    pub async fn request(
        &self,
        method: impl Into<MethodPath>,
        args: Vec<Value>,
    ) -> Result<Body, RpcError> {
        let (tx, rx) = oneshot::channel();
        let req = self.shared.register_call(Outgoing::Async(tx))?;
        let frame = request_frame(
            req,
            &RequestBody {
                name: method.into(),
                args,
                kind: Some(CallKind::Async),
            },
        )?;

        if let Err(err) = self.shared.send_frame(frame).await {
            self.shared.forget_call(req);
            return Err(err);
        }

        rx.await.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    /// Like [`request`](Self::request), decoding the JSON result.
    pub async fn call_async<T: DeserializeOwned>(
        &self,
        method: impl Into<MethodPath>,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        self.request(method, args)
            .await?
            .into_json()
            .map_err(|e| RpcError::Protocol(format!("unexpected response: {}", e)))
    }

    /// Call a sync method. Sync calls travel as async requests on the wire.
    pub async fn call_sync<T: DeserializeOwned>(
        &self,
        method: impl Into<MethodPath>,
        args: Vec<Value>,
    ) -> Result<T, RpcError> {
        self.call_async(method, args).await
    }

    /// Fire-and-forget call; returns once the request is queued for writing.
    pub async fn notify(
        &self,
        method: impl Into<MethodPath>,
        args: Vec<Value>,
    ) -> Result<(), RpcError> {
        let req = self.shared.register_call(Outgoing::Detached)?;
        let frame = request_frame(
            req,
            &RequestBody {
                name: method.into(),
                args,
                kind: Some(CallKind::Async),
            },
        )?;

        let result = self.shared.send_frame(frame).await;
        if result.is_err() {
            self.shared.forget_call(req);
        }
        result
    }

    /// Open a source call. Dropping the returned source aborts it.
    pub async fn source(
        &self,
        method: impl Into<MethodPath>,
        args: Vec<Value>,
    ) -> Result<Source, RpcError> {
        let (source, sink) = self
            .open_stream(CallKind::Source, method.into(), args)
            .await?
            .split();
        Ok(source.with_abort(sink))
    }

    /// Open a sink call. The source half only yields the callee's final error, if any.
    pub async fn sink(
        &self,
        method: impl Into<MethodPath>,
        args: Vec<Value>,
    ) -> Result<Duplex, RpcError> {
        self.open_stream(CallKind::Sink, method.into(), args).await
    }

    pub async fn duplex(
        &self,
        method: impl Into<MethodPath>,
        args: Vec<Value>,
    ) -> Result<Duplex, RpcError> {
        self.open_stream(CallKind::Duplex, method.into(), args).await
    }

    /// Ask the peer for its manifest.
    pub async fn remote_manifest(&self) -> Result<Value, RpcError> {
        self.call_async(crate::manifest::MANIFEST_METHOD, Vec::new())
            .await
    }

    async fn open_stream(
        &self,
        kind: CallKind,
        method: MethodPath,
        args: Vec<Value>,
    ) -> Result<Duplex, RpcError> {
        let (tx, rx) = mpsc::channel(self.shared.config.stream_queue.max(1));
        let slot = StreamSlot::new(kind, Some(tx));
        let local_end = slot.local_end.clone();
        let clean_end = slot.clean_end.clone();
        let req = self.shared.register_call(Outgoing::Stream(slot))?;

        debug!(peer = %self.shared.remote, req, method = %method, kind = %kind, "Opening stream");
        let frame = request_frame(
            req,
            &RequestBody {
                name: method,
                args,
                kind: Some(kind),
            },
        )?;
        if let Err(err) = self.shared.send_frame(frame).await {
            self.shared.forget_call(req);
            return Err(err);
        }

        Ok(Duplex {
            source: Source::watched(rx, self.shared.clone(), clean_end),
            sink: Sink::new(self.shared.clone(), StreamKey::Local(req), local_end),
        })
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("remote", &self.shared.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Lookup-only reference to a connection
#[derive(Clone)]
pub struct WeakConnection {
    id: ConnectionId,
    shared: Weak<Shared>,
}

impl WeakConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The connection, if it is still open.
    pub fn upgrade(&self) -> Option<Connection> {
        self.shared
            .upgrade()
            .filter(|shared| !shared.closed.is_cancelled())
            .map(Connection::from_shared)
    }
}

impl fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakConnection").field("id", &self.id).finish()
    }
}

/// A slot for a stream the peer opened, with the flags its halves share:
/// our local end, and the peer's clean end.
pub(crate) fn served_slot(
    kind: CallKind,
    inbound: Option<mpsc::Sender<RawItem>>,
) -> (StreamSlot, Arc<AtomicBool>, Arc<AtomicBool>) {
    let slot = StreamSlot::new(kind, inbound);
    let local_end = slot.local_end.clone();
    let clean_end = slot.clean_end.clone();
    (slot, local_end, clean_end)
}
