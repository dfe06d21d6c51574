//! Byte-stream view of a duplex call
//!
//! Tunnels carry opaque bytes as binary stream frames. [`TunnelStream`]
//! exposes such a duplex as `AsyncRead + AsyncWrite`, which is enough to run
//! a nested [`Connection`](crate::Connection) end to end through a room.

use crate::connection::data_frame;
use crate::error::RpcError;
use crate::stream::{Duplex, Sink, Source};
use bytes::{Buf, Bytes};
use muxroom_proto::{BodyType, Frame, RawBody};
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::PollSender;

/// Largest payload written in one frame, unless the connection allows less
const MAX_CHUNK: usize = 64 * 1024;

pub struct TunnelStream {
    source: Source,
    chunk: usize,
    read_buf: Bytes,
    read_done: bool,
    // Error seen by `prefetch`, returned by the next read
    read_error: Option<RpcError>,
    writer: Sink,
    sender: PollSender<Frame>,
    pending_end: Option<Frame>,
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").finish_non_exhaustive()
    }
}

impl TunnelStream {
    pub fn new(duplex: Duplex) -> Self {
        let (source, writer) = duplex.split();
        let sender = PollSender::new(writer.shared().outgoing.clone());
        let limit = writer.shared().config.max_frame_size as usize;
        Self {
            source,
            chunk: MAX_CHUNK.min(limit).max(1),
            read_buf: Bytes::new(),
            read_done: false,
            read_error: None,
            writer,
            sender,
            pending_end: None,
        }
    }

    /// Wait for the first element from the remote side and keep it for the
    /// next read. Returns the error the stream ended with, if that came first.
    ///
    /// Cancel safe: nothing is lost when the wait is dropped.
    pub async fn prefetch(&mut self) -> Result<(), RpcError> {
        while self.read_buf.is_empty() && !self.read_done {
            if let Some(err) = &self.read_error {
                return Err(err.clone());
            }
            match self.source.recv_raw().await {
                Some(Ok(raw)) => self.read_buf = raw.into_bytes(),
                Some(Err(err)) => {
                    self.read_error = Some(err.clone());
                    return Err(err);
                }
                None => self.read_done = true,
            }
        }
        Ok(())
    }

    fn closed() -> io::Error {
        io::Error::new(io::ErrorKind::BrokenPipe, "tunnel closed")
    }
}

impl From<Duplex> for TunnelStream {
    fn from(duplex: Duplex) -> Self {
        Self::new(duplex)
    }
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            if let Some(err) = this.read_error.take() {
                this.read_done = true;
                return Poll::Ready(Err(io::Error::other(err)));
            }
            if this.read_done {
                return Poll::Ready(Ok(()));
            }

            match ready!(this.source.poll_recv_raw(cx)) {
                Some(Ok(raw)) => this.read_buf = raw.into_bytes(),
                Some(Err(err)) => {
                    this.read_done = true;
                    return Poll::Ready(Err(io::Error::other(err)));
                }
                None => this.read_done = true,
            }
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.writer.is_ended() {
            return Poll::Ready(Err(Self::closed()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        ready!(this.sender.poll_reserve(cx)).map_err(|_| Self::closed())?;
        let n = buf.len().min(this.chunk);
        let raw = RawBody::new(BodyType::Binary, Bytes::copy_from_slice(&buf[..n]));
        this.sender
            .send_item(data_frame(this.writer.req(), raw))
            .map_err(|_| Self::closed())?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are handed to the connection writer as they are written.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(frame) = this.writer.take_end() {
            this.pending_end = Some(frame);
        }
        let Some(frame) = this.pending_end.take() else {
            return Poll::Ready(Ok(()));
        };

        match this.sender.poll_reserve(cx) {
            Poll::Pending => {
                this.pending_end = Some(frame);
                Poll::Pending
            }
            Poll::Ready(Ok(())) => {
                let _ = this.sender.send_item(frame);
                this.writer.shared().local_ended(this.writer.key());
                Poll::Ready(Ok(()))
            }
            // Connection already gone; nothing left to end.
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if let Some(frame) = self.pending_end.take() {
            let _ = self.writer.shared().outgoing.try_send(frame);
            self.writer.shared().local_ended(self.writer.key());
        }
    }
}
