//! Frame types carried on the physical stream.
//!
//! Every frame addresses one logical channel. Channel 0 is the control
//! channel and exists on both sides from the start.

use serde::{Deserialize, Serialize};
use tokio_util::bytes::Bytes;

/// Largest `Data` payload a writer puts in a single frame.
pub const MAX_DATA_PAYLOAD: usize = 32 * 1024;

/// Initial per-direction flow-control window for every channel.
pub const INITIAL_WINDOW: usize = 256 * 1024;

/// Upper bound on a frame body (header + payload), enforced by the codec.
pub const MAX_FRAME_BODY: usize = 64 * 1024 + FRAME_HEADER_LEN;

/// `u32` channel id followed by a `u8` kind.
pub const FRAME_HEADER_LEN: usize = 5;

/// Identifier of a logical channel, unique among the channels open at one time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u32);

impl ChannelId {
    pub const CONTROL: ChannelId = ChannelId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    pub fn is_control(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// What a channel is used for. Carried in `Open` so both sides agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Control,
    ExecStdin,
    ExecStdout,
    ExecStderr,
    FileData,
    SocketData,
}

impl ChannelRole {
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::ExecStdin => 1,
            Self::ExecStdout => 2,
            Self::ExecStderr => 3,
            Self::FileData => 4,
            Self::SocketData => 5,
        }
    }

    pub fn from_wire(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Control,
            1 => Self::ExecStdin,
            2 => Self::ExecStdout,
            3 => Self::ExecStderr,
            4 => Self::FileData,
            5 => Self::SocketData,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Control => "control",
            Self::ExecStdin => "exec-stdin",
            Self::ExecStdout => "exec-stdout",
            Self::ExecStderr => "exec-stderr",
            Self::FileData => "file-data",
            Self::SocketData => "socket-data",
        }
    }
}

impl std::fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) mod kind {
    pub const OPEN: u8 = 1;
    pub const DATA: u8 = 2;
    pub const ACK: u8 = 3;
    pub const EOF: u8 = 4;
    pub const CLOSE: u8 = 5;
    pub const ERROR: u8 = 6;
}

/// A single unit on the physical stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Sender allocated `channel` for `role`.
    Open { channel: ChannelId, role: ChannelRole },
    Data { channel: ChannelId, payload: Bytes },
    /// Returns `bytes` of send credit to the peer.
    Ack { channel: ChannelId, bytes: u32 },
    /// Sender will write no more data on `channel`.
    Eof { channel: ChannelId },
    /// Sender released its half of `channel`.
    Close { channel: ChannelId },
    /// Sender released its half of `channel` because of an error.
    Error { channel: ChannelId, message: String },
}

impl Frame {
    pub fn channel(&self) -> ChannelId {
        match self {
            Self::Open { channel, .. }
            | Self::Data { channel, .. }
            | Self::Ack { channel, .. }
            | Self::Eof { channel }
            | Self::Close { channel }
            | Self::Error { channel, .. } => *channel,
        }
    }
}

/// A frame whose length prefix and header were intact but whose body was not.
///
/// Only the addressed channel is terminated; the connection survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedFrame {
    pub channel: ChannelId,
    pub reason: String,
}
