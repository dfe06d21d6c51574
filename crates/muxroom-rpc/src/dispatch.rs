//! Serving calls opened by the remote peer

use crate::connection::{served_slot, Connection, Shared, StreamKey};
use crate::error::RpcError;
use crate::manifest::{Access, CallContext, Handler, MANIFEST_METHOD};
use crate::stream::{Duplex, Sink, Source};
use futures::StreamExt;
use muxroom_proto::{CallKind, Frame, RequestBody};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

impl Shared {
    /// Handle the opening frame of a call the peer made.
    pub(crate) async fn dispatch(self: &Arc<Self>, req: i32, frame: Frame) {
        let stream = frame.flags.is_stream();

        let request = match frame
            .raw_body()
            .decode()
            .and_then(|body| body.into_json::<RequestBody>())
        {
            Ok(request) => request,
            Err(e) if stream => {
                warn!(peer = %self.remote, req, error = %e, "Dropping malformed stream request");
                return;
            }
            Err(e) => {
                let err = RpcError::Protocol(format!("malformed request: {}", e));
                self.respond_error(req, false, err).await;
                return;
            }
        };

        let requested = request.kind();
        let name = request.name.to_string();
        if requested.is_stream() != stream {
            let err = RpcError::Protocol(format!(
                "{} called as {} with stream flag {}",
                name, requested, stream
            ));
            self.respond_error(req, stream, err).await;
            return;
        }

        if request.name.segments() == [MANIFEST_METHOD] {
            if requested == CallKind::Async {
                self.respond(req, Ok(self.manifest.describe())).await;
            } else {
                let err =
                    RpcError::KindMismatch(format!("{} is sync, called as {}", name, requested));
                self.respond_error(req, stream, err).await;
            }
            return;
        }

        let Some(entry) = self.manifest.get(&request.name).cloned() else {
            self.respond_error(req, stream, RpcError::MethodNotFound(name))
                .await;
            return;
        };

        if !entry.kind().accepts(requested) {
            let err = RpcError::KindMismatch(format!(
                "{} is {}, called as {}",
                name,
                entry.kind(),
                requested
            ));
            self.respond_error(req, stream, err).await;
            return;
        }

        if entry.access() == Access::Members && !self.policy.is_member(&self.remote) {
            let err = RpcError::PermissionDenied(format!("{} is restricted to members", name));
            self.respond_error(req, stream, err).await;
            return;
        }

        debug!(peer = %self.remote, req, method = %name, kind = %requested, "Serving call");
        let ctx = CallContext::new(
            Connection::from_shared(self.clone()),
            request.name,
            req,
        );
        let args = request.args;

        match entry.handler().clone() {
            Handler::Sync(handler) => {
                let result = handler.call(&ctx, args);
                self.respond(req, result).await;
            }
            Handler::Async(handler) => {
                let shared = self.clone();
                tokio::spawn(async move {
                    let result = handler.call(ctx, args).await;
                    shared.respond(req, result).await;
                });
            }
            Handler::Source(handler) => {
                let Some((mut sink, _)) = self.serve_stream(req, CallKind::Source) else {
                    return;
                };
                let producer = tokio::spawn(async move {
                    let mut items = match handler.open(ctx, args).await {
                        Ok(items) => items,
                        Err(err) => {
                            let _ = sink.error(err).await;
                            return;
                        }
                    };
                    while let Some(item) = items.next().await {
                        let sent = match item {
                            Ok(body) => sink.send(body).await,
                            Err(err) => {
                                let _ = sink.error(err).await;
                                return;
                            }
                        };
                        if sent.is_err() {
                            return;
                        }
                    }
                    let _ = sink.end().await;
                });
                self.set_producer(req, producer.abort_handle());
            }
            Handler::Sink(handler) => {
                let Some((mut sink, Some(source))) = self.serve_stream(req, CallKind::Sink) else {
                    return;
                };
                tokio::spawn(async move {
                    let result = match handler.open(ctx, args).await {
                        Ok(task) => task(source).await,
                        Err(err) => Err(err),
                    };
                    let _ = match result {
                        Ok(()) => sink.end().await,
                        Err(err) => sink.error(err).await,
                    };
                });
            }
            Handler::Duplex(handler) => {
                let Some((mut sink, Some(source))) = self.serve_stream(req, CallKind::Duplex) else {
                    return;
                };
                tokio::spawn(async move {
                    match handler.open(ctx, args).await {
                        Ok(task) => task(Duplex { source, sink }).await,
                        Err(err) => {
                            let _ = sink.error(err).await;
                        }
                    }
                });
            }
        }
    }

    /// Register a served stream and return our halves of it. Only sinks and
    /// duplexes get a reading half.
    fn serve_stream(self: &Arc<Self>, req: i32, kind: CallKind) -> Option<(Sink, Option<Source>)> {
        let (inbound, rx) = if kind == CallKind::Source {
            (None, None)
        } else {
            let (tx, rx) = mpsc::channel(self.config.stream_queue.max(1));
            (Some(tx), Some(rx))
        };
        let (slot, local_end, clean_end) = served_slot(kind, inbound);
        if !self.register_served(req, slot) {
            debug!(peer = %self.remote, req, "Connection closed before stream was served");
            return None;
        }
        let source = rx.map(|rx| Source::watched(rx, self.clone(), clean_end));
        Some((
            Sink::new(self.clone(), StreamKey::Served(req), local_end),
            source,
        ))
    }
}
