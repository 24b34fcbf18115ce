//! Connection multiplexer.
//!
//! One physical duplex stream carries any number of logical channels. A single
//! reader task demultiplexes inbound frames into per-channel queues; a single
//! writer task owns the physical write half and serializes outbound frames.
//!
//! # Flow control
//!
//! Each channel direction has a credit window. Writers hold credit before
//! queueing `Data`; readers return it with `Ack` as the consumer pulls bytes.
//! A slow consumer therefore stalls only its own peer writer, never the
//! shared reader task.
//!
//! # Ids
//!
//! The controller mints odd ids and the worker even ids (≥ 2), so both sides
//! can open channels without coordination. Channel 0 is the control channel.

mod channel;
mod table;

pub use channel::{Channel, ChannelReader, ChannelWriter};

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::FrameCodec;
use crate::bridge::frame::{ChannelId, ChannelRole, Frame};
use table::ChannelTable;

/// Which end of the connection this multiplexer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Controller,
    Worker,
}

impl Side {
    fn first_id(self) -> u32 {
        match self {
            Self::Controller => 1,
            Self::Worker => 2,
        }
    }

    /// Whether ids of this parity are minted by this side.
    pub fn owns(self, id: ChannelId) -> bool {
        let raw = id.get();
        raw != 0 && raw % 2 == self.first_id() % 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Controller => "controller",
            Self::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum MuxError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("channel {channel} is {actual}, expected {expected}")]
    RoleMismatch {
        channel: ChannelId,
        expected: ChannelRole,
        actual: ChannelRole,
    },

    #[error("channel {0} already claimed")]
    AlreadyClaimed(ChannelId),

    #[error("channel ids exhausted")]
    IdsExhausted,
}

pub(crate) struct MuxShared {
    label: String,
    side: Side,
    table: StdMutex<ChannelTable>,
    shutdown: CancellationToken,
}

impl MuxShared {
    pub(crate) fn table(&self) -> MutexGuard<'_, ChannelTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fail_all(&self, reason: &str) {
        if self.table().fail_all(reason) {
            tracing::info!(label = %self.label, side = self.side.as_str(), %reason, "Connection closed");
        }
        self.shutdown.cancel();
    }
}

/// Handle to a running multiplexer. Cheap to clone.
#[derive(Clone)]
pub struct Multiplexer {
    shared: Arc<MuxShared>,
}

impl Multiplexer {
    /// Start reader and writer tasks over `reader`/`writer` and return the
    /// control channel. Must be called inside a tokio runtime.
    pub fn start<R, W>(reader: R, writer: W, side: Side, label: impl Into<String>) -> (Self, Channel)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut table = ChannelTable::new(side, outbound_tx);
        let control = table.register_control();

        let shared = Arc::new(MuxShared {
            label: label.into(),
            side,
            table: StdMutex::new(table),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(write_loop(
            shared.clone(),
            FramedWrite::new(writer, FrameCodec::new()),
            outbound_rx,
        ));
        tokio::spawn(read_loop(
            shared.clone(),
            FramedRead::new(reader, FrameCodec::new()),
        ));

        tracing::debug!(label = %shared.label, side = side.as_str(), "Multiplexer started");
        let control = Channel::new(shared.clone(), control);
        (Self { shared }, control)
    }

    /// Open a new channel; the peer learns about it before any later frame.
    pub fn open(&self, role: ChannelRole) -> Result<Channel, MuxError> {
        let registered = self.shared.table().open(role)?;
        Ok(Channel::new(self.shared.clone(), registered))
    }

    /// Take ownership of a channel the peer opened.
    pub fn claim(&self, id: ChannelId, role: ChannelRole) -> Result<Channel, MuxError> {
        let registered = self.shared.table().claim(id, role)?;
        Ok(Channel::new(self.shared.clone(), registered))
    }

    /// Tear the connection down. Every channel fails with "connection lost".
    pub fn shutdown(&self) {
        self.shared.fail_all("multiplexer shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled() || self.shared.table().closed_reason().is_some()
    }

    /// Resolves once the connection is gone, for whatever reason.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    pub fn close_reason(&self) -> Option<String> {
        self.shared.table().closed_reason().map(str::to_string)
    }

    /// Live table entries, including the control channel.
    pub fn open_channels(&self) -> usize {
        self.shared.table().len()
    }

    /// Most ids this side ever had minted at once.
    pub fn id_high_water(&self) -> usize {
        self.shared.table().id_high_water()
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn side(&self) -> Side {
        self.shared.side
    }
}

async fn read_loop<R>(shared: Arc<MuxShared>, mut frames: FramedRead<R, FrameCodec>)
where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        tokio::select! {
            _ = shared.shutdown.cancelled() => break "multiplexer shut down".to_string(),
            item = frames.next() => {
                let result = match item {
                    Some(Ok(Ok(frame))) => {
                        tracing::trace!(channel = %frame.channel(), ?frame, "Frame received");
                        shared.table().on_frame(frame)
                    }
                    Some(Ok(Err(malformed))) => shared.table().on_malformed(malformed),
                    Some(Err(e)) => Err(format!("read failed: {e}")),
                    None => Err("peer closed the connection".to_string()),
                };
                if let Err(reason) = result {
                    break reason;
                }
            }
        }
    };
    shared.fail_all(&reason);
}

async fn write_loop<W>(
    shared: Arc<MuxShared>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) where
    W: AsyncWrite + Unpin,
{
    let result: std::io::Result<()> = async {
        loop {
            let frame = tokio::select! {
                biased;
                frame = outbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shared.shutdown.cancelled() => break,
            };
            sink.feed(frame).await?;
            while let Ok(frame) = outbound.try_recv() {
                sink.feed(frame).await?;
            }
            sink.flush().await?;
        }

        // Whatever was queued before shutdown still goes out.
        while let Ok(frame) = outbound.try_recv() {
            sink.feed(frame).await?;
        }
        sink.close().await
    }
    .await;

    match result {
        Ok(()) => shared.fail_all("multiplexer shut down"),
        Err(e) => {
            tracing::warn!(label = %shared.label, error = %e, "Physical write failed");
            shared.fail_all(&format!("write failed: {e}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::bridge::frame::INITIAL_WINDOW;

    fn pair() -> ((Multiplexer, Channel), (Multiplexer, Channel)) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Multiplexer::start(ar, aw, Side::Controller, "test-controller"),
            Multiplexer::start(br, bw, Side::Worker, "test-worker"),
        )
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    async fn claim_when_open(mux: &Multiplexer, id: ChannelId, role: ChannelRole) -> Channel {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match mux.claim(id, role) {
                    Ok(channel) => return channel,
                    Err(MuxError::UnknownChannel(_)) => tokio::task::yield_now().await,
                    Err(e) => panic!("claim failed: {e}"),
                }
            }
        })
        .await
        .expect("channel never arrived")
    }

    #[test]
    fn side_parity() {
        assert!(Side::Controller.owns(ChannelId::new(3)));
        assert!(!Side::Controller.owns(ChannelId::new(4)));
        assert!(Side::Worker.owns(ChannelId::new(4)));
        assert!(!Side::Worker.owns(ChannelId::CONTROL));
    }

    #[tokio::test]
    async fn control_channel_carries_bytes_both_ways() {
        let ((_cm, mut cc), (_wm, mut wc)) = pair();

        cc.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        wc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        wc.write_all(b"pong").await.unwrap();
        cc.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn opened_channel_streams_until_eof() {
        let ((cm, _cc), (wm, _wc)) = pair();

        let mut out = wm.open(ChannelRole::ExecStdout).unwrap();
        let id = out.id();
        let payload = vec![7u8; 100_000];
        out.write_all(&payload).await.unwrap();
        out.shutdown().await.unwrap();

        let mut incoming = claim_when_open(&cm, id, ChannelRole::ExecStdout).await;
        let mut received = Vec::new();
        incoming.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn slow_channel_does_not_block_others() {
        let ((cm, _cc), (wm, _wc)) = pair();

        let mut stalled = cm.open(ChannelRole::SocketData).unwrap();
        let mut lively = cm.open(ChannelRole::SocketData).unwrap();
        let stalled_id = stalled.id();
        let lively_id = lively.id();

        // Fill the stalled channel past its window; nobody reads it yet.
        let total = INITIAL_WINDOW + 64 * 1024;
        let stalled_writer = tokio::spawn(async move {
            stalled.write_all(&vec![1u8; total]).await.unwrap();
            stalled.shutdown().await.unwrap();
            stalled
        });

        let mut worker_stalled = claim_when_open(&wm, stalled_id, ChannelRole::SocketData).await;
        let mut worker_lively = claim_when_open(&wm, lively_id, ChannelRole::SocketData).await;

        for round in 0..10u8 {
            lively.write_all(&[round; 1000]).await.unwrap();
            let mut buf = [0u8; 1000];
            worker_lively.read_exact(&mut buf).await.unwrap();
            assert!(buf.iter().all(|b| *b == round));
        }
        assert!(!stalled_writer.is_finished());

        let mut drained = Vec::new();
        worker_stalled.read_to_end(&mut drained).await.unwrap();
        assert_eq!(drained.len(), total);
        stalled_writer.await.unwrap();
    }

    #[tokio::test]
    async fn dropping_both_ends_frees_the_entry() {
        let ((cm, _cc), (wm, _wc)) = pair();

        for _ in 0..50 {
            let channel = cm.open(ChannelRole::FileData).unwrap();
            let id = channel.id();
            let peer = claim_when_open(&wm, id, ChannelRole::FileData).await;
            drop(channel);
            drop(peer);
            eventually(|| cm.open_channels() == 1 && wm.open_channels() == 1).await;
        }

        assert_eq!(cm.id_high_water(), 1);
    }

    #[tokio::test]
    async fn write_after_peer_close_is_broken_pipe() {
        let ((cm, _cc), (wm, _wc)) = pair();

        let mut channel = cm.open(ChannelRole::FileData).unwrap();
        let peer = claim_when_open(&wm, channel.id(), ChannelRole::FileData).await;
        drop(peer);

        let err = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Err(e) = channel.write_all(b"data").await {
                    return e;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn losing_the_stream_fails_every_channel() {
        let (a, b) = tokio::io::duplex(1024);
        let (ar, aw) = tokio::io::split(a);
        let (cm, _cc) = Multiplexer::start(ar, aw, Side::Controller, "lossy");

        let mut channel = cm.open(ChannelRole::ExecStdout).unwrap();
        drop(b);

        let mut buf = Vec::new();
        let err = channel.read_to_end(&mut buf).await.unwrap_err();
        assert!(err.to_string().starts_with("connection lost:"), "{err}");

        cm.closed().await;
        assert!(cm.is_closed());
        assert!(matches!(cm.open(ChannelRole::FileData), Err(MuxError::ConnectionLost(_))));
    }

    #[tokio::test]
    async fn shutdown_reaches_the_peer() {
        let ((cm, _cc), (wm, _wc)) = pair();
        cm.shutdown();
        tokio::time::timeout(Duration::from_secs(5), wm.closed())
            .await
            .unwrap();
        assert_eq!(wm.close_reason().as_deref(), Some("peer closed the connection"));
    }
}
