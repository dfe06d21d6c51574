//! Integration tests for muxrpc connections
//!
//! Both ends run over an in-memory duplex pipe; raw-frame tests drive one end
//! with the bare codec to check what actually goes over the wire.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{FutureExt, SinkExt, StreamExt};
use muxroom_proto::{Body, BodyType, Flags, Frame, FrameCodec, PeerId};
use muxroom_rpc::{
    Access, AccessPolicy, CallContext, Connection, ConnectionConfig, Duplex, DuplexHandler,
    DuplexTask, Manifest, RpcError, SinkHandler, SinkTask, Source, SourceHandler, StreamItem,
    TunnelStream,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::info;

const CLIENT: &str = "@client.ed25519";
const SERVER: &str = "@server.ed25519";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Connect a client with an empty manifest to a server serving `manifest`.
fn connect(manifest: Manifest) -> (Connection, Connection) {
    connect_with(manifest, ConnectionConfig::default())
}

fn connect_with(manifest: Manifest, config: ConnectionConfig) -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = Connection::builder(PeerId::from(CLIENT), Arc::new(manifest))
        .config(config.clone())
        .open(a);
    let client = Connection::builder(PeerId::from(SERVER), Arc::new(Manifest::new()))
        .config(config)
        .open(b);
    (client, server)
}

struct Counter;

#[async_trait]
impl SourceHandler for Counter {
    async fn open(
        &self,
        _ctx: CallContext,
        args: Vec<Value>,
    ) -> Result<BoxStream<'static, StreamItem>, RpcError> {
        let n = args.first().and_then(Value::as_u64).unwrap_or(0);
        Ok(futures::stream::iter((1..=n).map(|i| Ok(Body::Json(json!(i))))).boxed())
    }
}

struct Forever;

#[async_trait]
impl SourceHandler for Forever {
    async fn open(
        &self,
        _ctx: CallContext,
        _args: Vec<Value>,
    ) -> Result<BoxStream<'static, StreamItem>, RpcError> {
        Ok(futures::stream::pending().boxed())
    }
}

struct Echo;

#[async_trait]
impl DuplexHandler for Echo {
    async fn open(&self, _ctx: CallContext, _args: Vec<Value>) -> Result<DuplexTask, RpcError> {
        let task: DuplexTask = Box::new(|duplex: Duplex| {
            async move {
                let (mut source, mut sink) = duplex.split();
                while let Some(Ok(body)) = source.recv().await {
                    if sink.send(body).await.is_err() {
                        break;
                    }
                }
                let _ = sink.end().await;
            }
            .boxed()
        });
        Ok(task)
    }
}

struct Collect {
    tx: mpsc::Sender<Vec<Body>>,
}

#[async_trait]
impl SinkHandler for Collect {
    async fn open(&self, _ctx: CallContext, args: Vec<Value>) -> Result<SinkTask, RpcError> {
        if args.first() == Some(&json!("reject")) {
            return Err(RpcError::PermissionDenied("not today".into()));
        }
        let tx = self.tx.clone();
        let task: SinkTask = Box::new(move |mut source: Source| {
            async move {
                let mut bodies = Vec::new();
                while let Some(item) = source.recv().await {
                    bodies.push(item?);
                }
                let _ = tx.send(bodies).await;
                Ok::<(), RpcError>(())
            }
            .boxed()
        });
        Ok(task)
    }
}

struct NoMembers;

impl AccessPolicy for NoMembers {
    fn is_member(&self, _peer: &PeerId) -> bool {
        false
    }
}

fn test_manifest() -> Manifest {
    let mut manifest = Manifest::new();
    manifest
        .register_sync("text.len", Access::Public, |_ctx: &CallContext, args: Vec<Value>| {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.len()))
        })
        .unwrap();
    manifest
        .register_async("text.upper", Access::Public, |_ctx, args: Vec<Value>| async move {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok::<_, RpcError>(json!(text.to_uppercase()))
        })
        .unwrap();
    manifest
        .register_async("slow.wait", Access::Public, |_ctx, args: Vec<Value>| async move {
            let millis = args.first().and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            Ok::<_, RpcError>(json!(millis))
        })
        .unwrap();
    manifest
        .register_async("who.am.i", Access::Public, |ctx: CallContext, _args| async move {
            Ok::<_, RpcError>(json!(ctx.remote().as_str()))
        })
        .unwrap();
    manifest
        .register_async("secret.read", Access::Members, |_ctx, _args| async move {
            Ok::<_, RpcError>(json!("hidden"))
        })
        .unwrap();
    manifest
        .register_source("count.to", Access::Public, Arc::new(Counter))
        .unwrap();
    manifest
        .register_source("count.forever", Access::Public, Arc::new(Forever))
        .unwrap();
    manifest
        .register_duplex("bytes.echo", Access::Public, Arc::new(Echo))
        .unwrap();
    manifest
}

#[tokio::test]
async fn test_sync_and_async_calls() {
    init_tracing();
    let (client, _server) = connect(test_manifest());

    let len: u64 = client.call_sync("text.len", vec![json!("hello")]).await.unwrap();
    assert_eq!(len, 5);

    let upper: String = client
        .call_async("text.upper", vec![json!("hello")])
        .await
        .unwrap();
    assert_eq!(upper, "HELLO");

    let me: String = client.call_async("who.am.i", vec![]).await.unwrap();
    assert_eq!(me, CLIENT);
}

#[tokio::test]
async fn test_interleaved_calls_get_their_own_responses() {
    init_tracing();
    let (client, _server) = connect(test_manifest());

    let slow = client.call_async::<u64>("slow.wait", vec![json!(200)]);
    let fast = client.call_async::<u64>("slow.wait", vec![json!(10)]);
    let (slow, fast) = tokio::join!(slow, fast);

    assert_eq!(slow.unwrap(), 200);
    assert_eq!(fast.unwrap(), 10);
}

#[tokio::test]
async fn test_unknown_method_leaves_connection_usable() {
    init_tracing();
    let (client, _server) = connect(test_manifest());

    let err = client
        .call_async::<Value>("tunnel.isRoom", vec![])
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::MethodNotFound("tunnel.isRoom".into()));

    let upper: String = client
        .call_async("text.upper", vec![json!("still here")])
        .await
        .unwrap();
    assert_eq!(upper, "STILL HERE");
}

#[tokio::test]
async fn test_kind_mismatch_ends_stream_with_error() {
    init_tracing();
    let (client, _server) = connect(test_manifest());

    let mut source = client.source("text.len", vec![json!("x")]).await.unwrap();
    let first = timeout(Duration::from_secs(5), source.recv())
        .await
        .expect("Timeout waiting for error end");
    assert!(matches!(first, Some(Err(RpcError::KindMismatch(_)))));

    let len: u64 = client.call_sync("text.len", vec![json!("abc")]).await.unwrap();
    assert_eq!(len, 3);
}

#[tokio::test]
async fn test_members_only_method_denied() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let _server = Connection::builder(PeerId::from(CLIENT), Arc::new(test_manifest()))
        .policy(Arc::new(NoMembers))
        .open(a);
    let client = Connection::builder(PeerId::from(SERVER), Arc::new(Manifest::new())).open(b);

    let err = client
        .call_async::<String>("secret.read", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::PermissionDenied(_)));

    let upper: String = client
        .call_async("text.upper", vec![json!("ok")])
        .await
        .unwrap();
    assert_eq!(upper, "OK");
}

#[tokio::test]
async fn test_source_yields_values_then_ends() {
    init_tracing();
    let (client, _server) = connect(test_manifest());

    let source = client.source("count.to", vec![json!(3)]).await.unwrap();
    let items: Vec<StreamItem> = timeout(Duration::from_secs(5), source.collect())
        .await
        .expect("Timeout collecting source");

    let values: Vec<Value> = items
        .into_iter()
        .map(|item| match item.unwrap() {
            Body::Json(value) => value,
            other => panic!("Expected JSON body, got {:?}", other),
        })
        .collect();
    assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn test_duplex_echo_through_tunnel_stream() {
    init_tracing();
    let (client, _server) = connect(test_manifest());

    let duplex = client.duplex("bytes.echo", vec![]).await.unwrap();
    let mut stream = TunnelStream::new(duplex);

    stream.write_all(b"hello through the pipe").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut echoed))
        .await
        .expect("Timeout reading echo")
        .unwrap();
    assert_eq!(echoed, b"hello through the pipe");
}

#[tokio::test]
async fn test_tunnel_writes_fit_small_frame_limit() {
    init_tracing();
    let config = ConnectionConfig {
        max_frame_size: 1024,
        ..ConnectionConfig::default()
    };
    let (client, server) = connect_with(test_manifest(), config);

    let duplex = client.duplex("bytes.echo", vec![]).await.unwrap();
    let mut stream = TunnelStream::new(duplex);
    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();

    stream.write_all(&payload).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut echoed))
        .await
        .expect("Timeout reading echo")
        .unwrap();
    assert_eq!(echoed, payload);
    assert!(!client.is_closed());
    assert!(!server.is_closed());
}

#[tokio::test]
async fn test_close_reported_after_buffered_elements() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let _server = Connection::builder(PeerId::from(CLIENT), Arc::new(test_manifest())).open(a);
    let client = Connection::builder(PeerId::from(SERVER), Arc::new(Manifest::new()))
        .config(ConnectionConfig {
            stream_queue: 1,
            ..ConnectionConfig::default()
        })
        .open(b);

    let mut source = client.source("count.to", vec![json!(3)]).await.unwrap();
    // Nobody reads, so the queue fills and the reader stalls on the next element
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close().await;

    let mut items = Vec::new();
    while let Some(item) = timeout(Duration::from_secs(5), source.recv())
        .await
        .expect("Timeout draining source")
    {
        items.push(item);
    }

    let (last, elements) = items.split_last().expect("Source yielded nothing");
    assert_eq!(last, &Err(RpcError::ConnectionClosed));
    assert!(!elements.is_empty());
    assert!(elements.iter().all(Result::is_ok));
}

#[tokio::test]
async fn test_sink_accept_and_reject() {
    init_tracing();
    let (tx, mut rx) = mpsc::channel(1);
    let mut manifest = Manifest::new();
    manifest
        .register_sink("log.append", Access::Public, Arc::new(Collect { tx }))
        .unwrap();
    let (client, _server) = connect(manifest);

    let Duplex { mut sink, .. } = client.sink("log.append", vec![]).await.unwrap();
    sink.send(json!("one")).await.unwrap();
    sink.send(Bytes::from_static(b"two")).await.unwrap();
    sink.end().await.unwrap();

    let bodies = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timeout waiting for sink")
        .unwrap();
    assert_eq!(
        bodies,
        vec![Body::Json(json!("one")), Body::Binary(Bytes::from_static(b"two"))]
    );

    let mut rejected = client
        .sink("log.append", vec![json!("reject")])
        .await
        .unwrap();
    let end = timeout(Duration::from_secs(5), rejected.source.recv())
        .await
        .expect("Timeout waiting for rejection");
    assert_eq!(
        end,
        Some(Err(RpcError::PermissionDenied("not today".into())))
    );
}

#[tokio::test]
async fn test_notify_does_not_wait_for_response() {
    init_tracing();
    let (tx, mut rx) = mpsc::channel(1);
    let mut manifest = Manifest::new();
    manifest
        .register_async("event.fire", Access::Public, move |_ctx, args: Vec<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(args).await;
                Ok::<_, RpcError>(Value::Null)
            }
        })
        .unwrap();
    let (client, _server) = connect(manifest);

    client.notify("event.fire", vec![json!("bang")]).await.unwrap();

    let args = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timeout waiting for notification")
        .unwrap();
    assert_eq!(args, vec![json!("bang")]);
}

#[tokio::test]
async fn test_remote_manifest() {
    init_tracing();
    let (client, _server) = connect(test_manifest());

    let manifest = client.remote_manifest().await.unwrap();
    assert_eq!(manifest["manifest"], json!("sync"));
    assert_eq!(manifest["text"]["upper"], json!("async"));
    assert_eq!(manifest["count"]["to"], json!("source"));
    assert_eq!(manifest["bytes"]["echo"], json!("duplex"));
}

#[tokio::test]
async fn test_close_fails_open_streams_and_later_calls() {
    init_tracing();
    let (client, server) = connect(test_manifest());

    let mut source = client.source("count.forever", vec![]).await.unwrap();
    // Let the call reach the server before closing
    let _: u64 = client.call_sync("text.len", vec![json!("")]).await.unwrap();

    info!("Closing server side");
    server.close().await;

    let end = timeout(Duration::from_secs(5), source.recv())
        .await
        .expect("Timeout waiting for stream failure");
    assert_eq!(end, Some(Err(RpcError::ConnectionClosed)));

    timeout(Duration::from_secs(5), client.closed())
        .await
        .expect("Client never observed the close");
    assert!(client.is_closed());

    let err = client
        .call_async::<String>("text.upper", vec![json!("late")])
        .await
        .unwrap_err();
    assert_eq!(err, RpcError::ConnectionClosed);
}

#[tokio::test]
async fn test_unknown_response_ids_are_dropped() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let server = Connection::builder(PeerId::from(CLIENT), Arc::new(test_manifest())).open(a);

    let (read_half, write_half) = tokio::io::split(b);
    let mut reader = FramedRead::new(read_half, FrameCodec::default());
    let mut writer = FramedWrite::new(write_half, FrameCodec::default());

    // Response to a call the server never made
    writer
        .send(Frame::new(
            -42,
            Flags::new(BodyType::Json),
            Bytes::from_static(b"\"stray\""),
        ))
        .await
        .unwrap();

    let request = json!({"name": ["text", "upper"], "args": ["raw"], "type": "async"});
    writer
        .send(Frame::new(
            1,
            Flags::new(BodyType::Json),
            Bytes::from(request.to_string()),
        ))
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(5), reader.next())
        .await
        .expect("Timeout waiting for response")
        .unwrap()
        .unwrap();
    assert_eq!(response.req, -1);
    assert!(!response.flags.is_stream());
    assert!(!response.flags.is_end());
    assert_eq!(response.body, Bytes::from_static(b"\"RAW\""));
    assert!(!server.is_closed());
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let config = ConnectionConfig {
        max_frame_size: 16,
        ..ConnectionConfig::default()
    };
    let server = Connection::builder(PeerId::from(CLIENT), Arc::new(test_manifest()))
        .config(config)
        .open(a);

    let (_read_half, write_half) = tokio::io::split(b);
    let mut writer = FramedWrite::new(write_half, FrameCodec::default());
    writer
        .send(Frame::new(
            1,
            Flags::new(BodyType::Binary),
            Bytes::from(vec![0u8; 64]),
        ))
        .await
        .unwrap();

    timeout(Duration::from_secs(5), server.closed())
        .await
        .expect("Oversized frame did not close the connection");
    assert!(matches!(server.close_reason(), Some(RpcError::Transport(_))));
}

#[tokio::test]
async fn test_malformed_request_gets_protocol_error() {
    init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let _server = Connection::builder(PeerId::from(CLIENT), Arc::new(test_manifest())).open(a);

    let (read_half, write_half) = tokio::io::split(b);
    let mut reader = FramedRead::new(read_half, FrameCodec::default());
    let mut writer = FramedWrite::new(write_half, FrameCodec::default());

    writer
        .send(Frame::new(
            7,
            Flags::new(BodyType::Json),
            Bytes::from_static(b"{\"args\": []}"),
        ))
        .await
        .unwrap();

    let response = timeout(Duration::from_secs(5), reader.next())
        .await
        .expect("Timeout waiting for error")
        .unwrap()
        .unwrap();
    assert_eq!(response.req, -7);
    assert!(response.flags.is_end());

    let body: Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["name"], json!("ProtocolError"));
}
