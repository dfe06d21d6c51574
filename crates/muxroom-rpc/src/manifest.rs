//! Method registry and handler descriptors
//!
//! A [`Manifest`] maps method paths to handlers. Each handler is a tagged
//! union carrying its call kind, so a request declaring the wrong kind is
//! rejected before any handler code runs.

use crate::connection::Connection;
use crate::error::RpcError;
use crate::stream::{Duplex, Source, StreamItem};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use muxroom_proto::{CallKind, MethodPath, PeerId};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Path of the built-in method describing a manifest
pub const MANIFEST_METHOD: &str = "manifest";

/// Manifest registration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("Method already registered: {0}")]
    Duplicate(String),

    #[error("Method path is empty")]
    EmptyPath,

    #[error("Method name is reserved: {0}")]
    Reserved(String),
}

/// Context of one incoming call
#[derive(Clone)]
pub struct CallContext {
    connection: Connection,
    method: MethodPath,
    req: i32,
}

impl CallContext {
    pub(crate) fn new(connection: Connection, method: MethodPath, req: i32) -> Self {
        Self {
            connection,
            method,
            req,
        }
    }

    /// Connection the call arrived on
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Authenticated identity of the caller
    pub fn remote(&self) -> &PeerId {
        self.connection.remote_id()
    }

    pub fn method(&self) -> &MethodPath {
        &self.method
    }

    pub fn req(&self) -> i32 {
        self.req
    }
}

/// Handler answering immediately
pub trait SyncHandler: Send + Sync + 'static {
    fn call(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, RpcError>;
}

impl<F> SyncHandler for F
where
    F: Fn(&CallContext, Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
{
    fn call(&self, ctx: &CallContext, args: Vec<Value>) -> Result<Value, RpcError> {
        (self)(ctx, args)
    }
}

/// Handler producing a single value
#[async_trait]
pub trait AsyncHandler: Send + Sync + 'static {
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, RpcError>;
}

#[async_trait]
impl<F, Fut> AsyncHandler for F
where
    F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, args: Vec<Value>) -> Result<Value, RpcError> {
        (self)(ctx, args).await
    }
}

/// Handler producing a stream of values
///
/// The returned stream is pulled one element at a time as the connection
/// can take them.
#[async_trait]
pub trait SourceHandler: Send + Sync + 'static {
    async fn open(
        &self,
        ctx: CallContext,
        args: Vec<Value>,
    ) -> Result<BoxStream<'static, StreamItem>, RpcError>;
}

/// Work run on an accepted sink call; its result ends the stream.
pub type SinkTask = Box<dyn FnOnce(Source) -> BoxFuture<'static, Result<(), RpcError>> + Send>;

/// Handler consuming a stream from the caller
#[async_trait]
pub trait SinkHandler: Send + Sync + 'static {
    /// Accept the call, or reject it with the error sent back to the caller.
    async fn open(&self, ctx: CallContext, args: Vec<Value>) -> Result<SinkTask, RpcError>;
}

/// Work run on an accepted duplex call
pub type DuplexTask = Box<dyn FnOnce(Duplex) -> BoxFuture<'static, ()> + Send>;

/// Handler exchanging streams with the caller
#[async_trait]
pub trait DuplexHandler: Send + Sync + 'static {
    /// Accept the call, or reject it with the error sent back to the caller.
    async fn open(&self, ctx: CallContext, args: Vec<Value>) -> Result<DuplexTask, RpcError>;
}

/// Handler descriptor tagged with its call kind
#[derive(Clone)]
pub enum Handler {
    Sync(Arc<dyn SyncHandler>),
    Async(Arc<dyn AsyncHandler>),
    Source(Arc<dyn SourceHandler>),
    Sink(Arc<dyn SinkHandler>),
    Duplex(Arc<dyn DuplexHandler>),
}

impl Handler {
    pub fn kind(&self) -> CallKind {
        match self {
            Handler::Sync(_) => CallKind::Sync,
            Handler::Async(_) => CallKind::Async,
            Handler::Source(_) => CallKind::Source,
            Handler::Sink(_) => CallKind::Sink,
            Handler::Duplex(_) => CallKind::Duplex,
        }
    }
}

/// Who may call a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Members,
}

/// Decides which remote peers count as members on a connection
pub trait AccessPolicy: Send + Sync + 'static {
    fn is_member(&self, peer: &PeerId) -> bool;
}

/// Treats every peer as a member
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn is_member(&self, _peer: &PeerId) -> bool {
        true
    }
}

/// A registered method
#[derive(Clone)]
pub struct MethodEntry {
    handler: Handler,
    access: Access,
}

impl MethodEntry {
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn kind(&self) -> CallKind {
        self.handler.kind()
    }

    pub fn access(&self) -> Access {
        self.access
    }
}

/// Methods exposed on a connection
#[derive(Clone, Default)]
pub struct Manifest {
    methods: HashMap<MethodPath, MethodEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        method: impl Into<MethodPath>,
        handler: Handler,
        access: Access,
    ) -> Result<(), ManifestError> {
        let method = method.into();
        if method.is_empty() {
            return Err(ManifestError::EmptyPath);
        }
        if method.segments() == [MANIFEST_METHOD] {
            return Err(ManifestError::Reserved(method.to_string()));
        }
        if self.methods.contains_key(&method) {
            return Err(ManifestError::Duplicate(method.to_string()));
        }

        self.methods.insert(method, MethodEntry { handler, access });
        Ok(())
    }

    pub fn register_sync<F>(
        &mut self,
        method: impl Into<MethodPath>,
        access: Access,
        handler: F,
    ) -> Result<(), ManifestError>
    where
        F: Fn(&CallContext, Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        self.register(method, Handler::Sync(Arc::new(handler)), access)
    }

    pub fn register_async<F, Fut>(
        &mut self,
        method: impl Into<MethodPath>,
        access: Access,
        handler: F,
    ) -> Result<(), ManifestError>
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.register(method, Handler::Async(Arc::new(handler)), access)
    }

    pub fn register_source(
        &mut self,
        method: impl Into<MethodPath>,
        access: Access,
        handler: Arc<dyn SourceHandler>,
    ) -> Result<(), ManifestError> {
        self.register(method, Handler::Source(handler), access)
    }

    pub fn register_sink(
        &mut self,
        method: impl Into<MethodPath>,
        access: Access,
        handler: Arc<dyn SinkHandler>,
    ) -> Result<(), ManifestError> {
        self.register(method, Handler::Sink(handler), access)
    }

    pub fn register_duplex(
        &mut self,
        method: impl Into<MethodPath>,
        access: Access,
        handler: Arc<dyn DuplexHandler>,
    ) -> Result<(), ManifestError> {
        self.register(method, Handler::Duplex(handler), access)
    }

    pub fn get(&self, method: &MethodPath) -> Option<&MethodEntry> {
        self.methods.get(method)
    }

    pub fn contains(&self, method: &MethodPath) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Nested `{namespace: {method: kind}}` object answered by the built-in
    /// `manifest` method.
    pub fn describe(&self) -> Value {
        let mut root = Map::new();
        root.insert(
            MANIFEST_METHOD.to_string(),
            Value::from(CallKind::Sync.as_str()),
        );

        'methods: for (method, entry) in &self.methods {
            let Some((last, parents)) = method.segments().split_last() else {
                continue;
            };

            let mut node = &mut root;
            for segment in parents {
                let child = node
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
                node = match child {
                    Value::Object(map) => map,
                    _ => continue 'methods,
                };
            }
            node.insert(last.clone(), Value::from(entry.kind().as_str()));
        }

        Value::Object(root)
    }
}
