//! Local handles for a logical channel.
//!
//! A [`Channel`] is a bidirectional byte stream. It can be split into a
//! [`ChannelReader`] and a [`ChannelWriter`]; the channel is closed towards
//! the peer once both halves are dropped.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::bytes::{Buf, Bytes};
use tokio_util::sync::PollSemaphore;

use super::MuxShared;
use super::table::{Inbound, Registered};
use crate::bridge::frame::{ChannelId, ChannelRole, MAX_DATA_PAYLOAD};

struct ChannelShared {
    mux: Arc<MuxShared>,
    id: ChannelId,
    role: ChannelRole,
    generation: u64,
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        self.mux.table().close_local(self.id, self.generation);
    }
}

/// Bidirectional byte stream over one logical channel.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub(crate) fn new(mux: Arc<MuxShared>, registered: Registered) -> Self {
        let Registered {
            id,
            role,
            generation,
            rx,
            credit,
        } = registered;
        let shared = Arc::new(ChannelShared {
            mux,
            id,
            role,
            generation,
        });
        Self {
            reader: ChannelReader {
                shared: shared.clone(),
                rx,
                chunk: Bytes::new(),
                done: false,
            },
            writer: ChannelWriter {
                shared,
                credit: PollSemaphore::new(credit),
                eof_sent: false,
            },
        }
    }

    pub fn id(&self) -> ChannelId {
        self.reader.shared.id
    }

    pub fn role(&self) -> ChannelRole {
        self.reader.shared.role
    }

    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("role", &self.role())
            .finish()
    }
}

/// Receiving half. Yields EOF once the peer sent `Eof` or `Close`, and an
/// error if the peer failed the channel or the connection was lost.
pub struct ChannelReader {
    shared: Arc<ChannelShared>,
    rx: mpsc::UnboundedReceiver<Inbound>,
    chunk: Bytes,
    done: bool,
}

impl ChannelReader {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn role(&self) -> ChannelRole {
        self.shared.role
    }
}

impl AsyncRead for ChannelReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.chunk.is_empty() {
                let n = self.chunk.len().min(buf.remaining());
                buf.put_slice(&self.chunk[..n]);
                self.chunk.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.done {
                return Poll::Ready(Ok(()));
            }
            match ready!(self.rx.poll_recv(cx)) {
                Some(Inbound::Data(bytes)) => {
                    // Credit goes back as soon as the chunk leaves the queue.
                    let shared = &self.shared;
                    shared.mux.table().ack(shared.id, shared.generation, bytes.len());
                    self.chunk = bytes;
                }
                Some(Inbound::Error(message)) => {
                    self.done = true;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        message,
                    )));
                }
                None => {
                    self.done = true;
                }
            }
        }
    }
}

impl std::fmt::Debug for ChannelReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelReader")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .finish()
    }
}

/// Sending half. Shutting it down (or dropping it) sends `Eof`.
pub struct ChannelWriter {
    shared: Arc<ChannelShared>,
    credit: PollSemaphore,
    eof_sent: bool,
}

impl ChannelWriter {
    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    pub fn role(&self) -> ChannelRole {
        self.shared.role
    }

    fn send_eof(&mut self) {
        if !self.eof_sent {
            self.eof_sent = true;
            let shared = &self.shared;
            shared.mux.table().send_eof(shared.id, shared.generation);
        }
    }
}

fn broken_pipe(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, message)
}

impl AsyncWrite for ChannelWriter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if self.eof_sent {
            return Poll::Ready(Err(broken_pipe("write after shutdown")));
        }

        let want = buf.len().min(MAX_DATA_PAYLOAD);
        let Some(permit) = ready!(self.credit.poll_acquire_many(cx, want as u32)) else {
            return Poll::Ready(Err(broken_pipe("channel closed by peer")));
        };
        permit.forget();

        let payload = Bytes::copy_from_slice(&buf[..want]);
        let shared = &self.shared;
        if shared.mux.table().send_data(shared.id, shared.generation, payload) {
            Poll::Ready(Ok(want))
        } else {
            Poll::Ready(Err(broken_pipe("channel closed")))
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frames are queued for the writer task; nothing is buffered here.
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.send_eof();
        Poll::Ready(Ok(()))
    }
}

impl Drop for ChannelWriter {
    fn drop(&mut self) {
        self.send_eof();
    }
}

impl std::fmt::Debug for ChannelWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelWriter")
            .field("id", &self.shared.id)
            .field("role", &self.shared.role)
            .field("eof_sent", &self.eof_sent)
            .finish()
    }
}

impl AsyncRead for Channel {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for Channel {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.writer).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}
