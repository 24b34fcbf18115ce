//! Channel table: id allocation and per-channel lifecycle.
//!
//! All state transitions happen under the multiplexer's table lock. Frames
//! produced by a transition are queued on the outbound sender while the lock
//! is held, so the peer observes them in the same order as the transitions.
//!
//! An entry is removed (and a locally minted id returned to the allocator)
//! only once a `Close`/`Error` has been both sent and received for it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio_util::bytes::Bytes;

use super::{MuxError, Side};
use crate::bridge::frame::{ChannelId, ChannelRole, Frame, INITIAL_WINDOW, MalformedFrame};

/// Item delivered to a channel's reader. End of stream is signalled by the
/// sender being dropped.
#[derive(Debug)]
pub(crate) enum Inbound {
    Data(Bytes),
    Error(String),
}

/// Hands out ids of one parity, lowest released id first.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    first: u32,
    /// Next never-used id; everything in `first..next` (step 2) is minted.
    next: u32,
    free: BTreeSet<u32>,
    high_water: usize,
}

impl IdAllocator {
    pub(crate) fn new(first: u32) -> Self {
        Self {
            first,
            next: first,
            free: BTreeSet::new(),
            high_water: 0,
        }
    }

    pub(crate) fn allocate(&mut self) -> Option<ChannelId> {
        let raw = match self.free.pop_first() {
            Some(raw) => raw,
            None => {
                let raw = self.next;
                self.next = self.next.checked_add(2)?;
                raw
            }
        };
        self.high_water = self.high_water.max(self.minted());
        Some(ChannelId::new(raw))
    }

    pub(crate) fn release(&mut self, id: ChannelId) {
        let raw = id.get();
        if raw < self.first || raw >= self.next || (raw - self.first) % 2 != 0 {
            return;
        }
        self.free.insert(raw);
        // Shrink the minted range so the free set stays small.
        while self.next > self.first && self.free.remove(&(self.next - 2)) {
            self.next -= 2;
        }
    }

    fn minted(&self) -> usize {
        ((self.next - self.first) / 2) as usize
    }

    pub(crate) fn in_use(&self) -> usize {
        self.minted() - self.free.len()
    }

    /// Largest number of ids that were ever minted at the same time.
    pub(crate) fn high_water(&self) -> usize {
        self.high_water
    }
}

struct ChannelEntry {
    role: ChannelRole,
    /// Distinguishes successive channels that reuse the same id.
    generation: u64,
    /// Id was minted by this side.
    local: bool,
    inbound: Option<mpsc::UnboundedSender<Inbound>>,
    /// Receiver for a peer-opened channel nobody has claimed yet.
    unclaimed: Option<mpsc::UnboundedReceiver<Inbound>>,
    /// Send credit granted by the peer.
    credit: Arc<Semaphore>,
    /// Bytes the peer may still send before we ack.
    recv_window: usize,
    local_eof: bool,
    remote_eof: bool,
    local_closed: bool,
    remote_closed: bool,
}

impl ChannelEntry {
    fn new(role: ChannelRole, generation: u64, local: bool) -> (Self, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let entry = Self {
            role,
            generation,
            local,
            inbound: Some(tx),
            unclaimed: None,
            credit: Arc::new(Semaphore::new(INITIAL_WINDOW)),
            recv_window: INITIAL_WINDOW,
            local_eof: false,
            remote_eof: false,
            local_closed: false,
            remote_closed: false,
        };
        (entry, rx)
    }
}

/// What a local handle needs to attach to a table entry.
pub(crate) struct Registered {
    pub(crate) id: ChannelId,
    pub(crate) role: ChannelRole,
    pub(crate) generation: u64,
    pub(crate) rx: mpsc::UnboundedReceiver<Inbound>,
    pub(crate) credit: Arc<Semaphore>,
}

pub(crate) struct ChannelTable {
    side: Side,
    entries: HashMap<ChannelId, ChannelEntry>,
    ids: IdAllocator,
    outbound: mpsc::UnboundedSender<Frame>,
    next_generation: u64,
    closed: Option<String>,
}

impl ChannelTable {
    pub(crate) fn new(side: Side, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            side,
            entries: HashMap::new(),
            ids: IdAllocator::new(side.first_id()),
            outbound,
            next_generation: 0,
            closed: None,
        }
    }

    fn send(&self, frame: Frame) {
        // A dead writer means the connection is already being torn down.
        let _ = self.outbound.send(frame);
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn ensure_open(&self) -> Result<(), MuxError> {
        match &self.closed {
            Some(reason) => Err(MuxError::ConnectionLost(reason.clone())),
            None => Ok(()),
        }
    }

    fn entry_mut(&mut self, id: ChannelId, generation: u64) -> Option<&mut ChannelEntry> {
        self.entries
            .get_mut(&id)
            .filter(|entry| entry.generation == generation)
    }

    /// Install channel 0. Both sides do this at construction, without an
    /// `Open` frame.
    pub(crate) fn register_control(&mut self) -> Registered {
        let generation = self.bump_generation();
        let (entry, rx) = ChannelEntry::new(ChannelRole::Control, generation, false);
        let credit = entry.credit.clone();
        self.entries.insert(ChannelId::CONTROL, entry);
        Registered {
            id: ChannelId::CONTROL,
            role: ChannelRole::Control,
            generation,
            rx,
            credit,
        }
    }

    pub(crate) fn open(&mut self, role: ChannelRole) -> Result<Registered, MuxError> {
        self.ensure_open()?;
        let id = self.ids.allocate().ok_or(MuxError::IdsExhausted)?;
        let generation = self.bump_generation();
        let (entry, rx) = ChannelEntry::new(role, generation, true);
        let credit = entry.credit.clone();
        self.entries.insert(id, entry);
        self.send(Frame::Open { channel: id, role });
        tracing::debug!(channel = %id, %role, "Opened channel");
        Ok(Registered {
            id,
            role,
            generation,
            rx,
            credit,
        })
    }

    pub(crate) fn claim(&mut self, id: ChannelId, role: ChannelRole) -> Result<Registered, MuxError> {
        self.ensure_open()?;
        let entry = self
            .entries
            .get_mut(&id)
            .ok_or(MuxError::UnknownChannel(id))?;
        if entry.role != role {
            return Err(MuxError::RoleMismatch {
                channel: id,
                expected: role,
                actual: entry.role,
            });
        }
        let rx = entry.unclaimed.take().ok_or(MuxError::AlreadyClaimed(id))?;
        Ok(Registered {
            id,
            role,
            generation: entry.generation,
            rx,
            credit: entry.credit.clone(),
        })
    }

    /// Apply an inbound frame. `Err` carries the reason the whole connection
    /// must be torn down.
    pub(crate) fn on_frame(&mut self, frame: Frame) -> Result<(), String> {
        match frame {
            Frame::Open { channel, role } => {
                if channel.is_control() || self.side.owns(channel) {
                    return Err(format!("peer opened {channel} outside its id range"));
                }
                if self.entries.contains_key(&channel) {
                    return Err(format!("peer reopened live channel {channel}"));
                }
                let generation = self.bump_generation();
                let (mut entry, rx) = ChannelEntry::new(role, generation, false);
                entry.unclaimed = Some(rx);
                self.entries.insert(channel, entry);
                tracing::debug!(%channel, %role, "Peer opened channel");
            }
            Frame::Data { channel, payload } => self.on_data(channel, payload),
            Frame::Ack { channel, bytes } => {
                let Some(entry) = self.entries.get_mut(&channel) else {
                    return Ok(());
                };
                if entry.remote_closed || entry.credit.is_closed() {
                    return Ok(());
                }
                if entry.credit.available_permits() + bytes as usize > INITIAL_WINDOW {
                    self.terminate(channel, "flow control credit overflow");
                } else {
                    entry.credit.add_permits(bytes as usize);
                }
            }
            Frame::Eof { channel } => {
                if let Some(entry) = self.entries.get_mut(&channel) {
                    entry.remote_eof = true;
                    entry.inbound = None;
                }
            }
            Frame::Close { channel } => self.on_remote_close(channel, None),
            Frame::Error { channel, message } => self.on_remote_close(channel, Some(message)),
        }
        Ok(())
    }

    fn on_data(&mut self, channel: ChannelId, payload: Bytes) {
        let Some(entry) = self.entries.get_mut(&channel) else {
            tracing::warn!(%channel, "Data for unknown channel");
            self.send(Frame::Error {
                channel,
                message: "unknown channel".to_string(),
            });
            return;
        };
        if entry.local_closed {
            return;
        }
        if entry.remote_eof {
            self.terminate(channel, "data after eof");
            return;
        }
        let len = payload.len();
        if len > entry.recv_window {
            tracing::warn!(%channel, len, window = entry.recv_window, "Peer overran flow control window");
            self.terminate(channel, "flow control window exceeded");
            return;
        }
        entry.recv_window -= len;

        let delivered = entry
            .inbound
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Data(payload)).is_ok());
        if !delivered && len > 0 {
            // Reader is gone; hand the credit straight back.
            entry.recv_window += len;
            self.send(Frame::Ack {
                channel,
                bytes: len as u32,
            });
        }
    }

    fn on_remote_close(&mut self, channel: ChannelId, error: Option<String>) {
        let Some(entry) = self.entries.get_mut(&channel) else {
            return;
        };
        if entry.remote_closed {
            return;
        }
        entry.remote_closed = true;
        entry.remote_eof = true;
        let inbound = entry.inbound.take();
        if let (Some(tx), Some(message)) = (inbound, error) {
            let _ = tx.send(Inbound::Error(message));
        }
        entry.credit.close();
        tracing::debug!(%channel, "Peer closed channel");
        self.maybe_free(channel);
    }

    pub(crate) fn on_malformed(&mut self, malformed: MalformedFrame) -> Result<(), String> {
        let MalformedFrame { channel, reason } = malformed;
        if channel.is_control() {
            return Err(format!("malformed frame on control channel: {reason}"));
        }
        tracing::warn!(%channel, %reason, "Malformed frame");
        if self.entries.contains_key(&channel) {
            self.terminate(channel, &reason);
        } else {
            self.send(Frame::Error {
                channel,
                message: reason,
            });
        }
        Ok(())
    }

    /// Fail one channel: the peer gets an `Error` frame, the local reader
    /// gets the reason, the local writer gets a broken pipe.
    fn terminate(&mut self, channel: ChannelId, reason: &str) {
        let Some(entry) = self.entries.get_mut(&channel) else {
            return;
        };
        if !entry.local_closed {
            entry.local_closed = true;
            let _ = self.outbound.send(Frame::Error {
                channel,
                message: reason.to_string(),
            });
        }
        if let Some(tx) = entry.inbound.take() {
            let _ = tx.send(Inbound::Error(reason.to_string()));
        }
        entry.credit.close();
        self.maybe_free(channel);
    }

    fn maybe_free(&mut self, channel: ChannelId) {
        let done = self
            .entries
            .get(&channel)
            .is_some_and(|entry| entry.local_closed && entry.remote_closed);
        if !done {
            return;
        }
        if self.entries.remove(&channel).is_some_and(|entry| entry.local) {
            self.ids.release(channel);
        }
        tracing::trace!(%channel, "Released channel");
    }

    /// Return `bytes` of receive credit to the peer.
    pub(crate) fn ack(&mut self, id: ChannelId, generation: u64, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let Some(entry) = self.entry_mut(id, generation) else {
            return;
        };
        if entry.local_closed {
            return;
        }
        entry.recv_window += bytes;
        self.send(Frame::Ack {
            channel: id,
            bytes: bytes as u32,
        });
    }

    /// Queue a data frame. Returns false when the channel can no longer carry
    /// data in this direction.
    pub(crate) fn send_data(&mut self, id: ChannelId, generation: u64, payload: Bytes) -> bool {
        let Some(entry) = self.entry_mut(id, generation) else {
            return false;
        };
        if entry.local_eof || entry.local_closed || entry.remote_closed {
            return false;
        }
        self.send(Frame::Data {
            channel: id,
            payload,
        });
        true
    }

    pub(crate) fn send_eof(&mut self, id: ChannelId, generation: u64) {
        let Some(entry) = self.entry_mut(id, generation) else {
            return;
        };
        if entry.local_eof || entry.local_closed {
            return;
        }
        entry.local_eof = true;
        self.send(Frame::Eof { channel: id });
    }

    /// Both local handles are gone.
    pub(crate) fn close_local(&mut self, id: ChannelId, generation: u64) {
        let Some(entry) = self.entry_mut(id, generation) else {
            return;
        };
        let send_close = !entry.local_closed;
        entry.local_closed = true;
        entry.inbound = None;
        entry.unclaimed = None;
        entry.credit.close();
        if send_close {
            self.send(Frame::Close { channel: id });
            tracing::debug!(channel = %id, "Closed channel");
        }
        self.maybe_free(id);
    }

    /// Fail every live channel. Returns false if the table was already closed.
    pub(crate) fn fail_all(&mut self, reason: &str) -> bool {
        if self.closed.is_some() {
            return false;
        }
        self.closed = Some(reason.to_string());
        let message = format!("connection lost: {reason}");
        for (_, entry) in self.entries.drain() {
            if let Some(tx) = entry.inbound {
                let _ = tx.send(Inbound::Error(message.clone()));
            }
            entry.credit.close();
        }
        true
    }

    pub(crate) fn closed_reason(&self) -> Option<&str> {
        self.closed.as_deref()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn ids_in_use(&self) -> usize {
        self.ids.in_use()
    }

    pub(crate) fn id_high_water(&self) -> usize {
        self.ids.high_water()
    }
}
