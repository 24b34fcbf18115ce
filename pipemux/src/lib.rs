//! pipemux: drive a worker process over one multiplexed duplex byte stream.
//!
//! A [`Controller`] runs processes, pushes files, and tunnels sockets through
//! a worker served by [`run_worker`]. Everything travels over a single
//! physical stream (child stdio, a TCP socket, an SSH-forwarded pipe) split
//! into logical channels by the [`Multiplexer`].

pub mod bridge;
pub mod controller;
pub mod env;
pub mod mux;
pub mod operation;
pub mod path;
mod version;
pub mod worker;

pub use bridge::frame::{ChannelId, ChannelRole};
pub use bridge::protocol::{PROTOCOL_VERSION, RequestId};
pub use controller::{Controller, ControllerConfig, ControllerError, WorkerInfo};
pub use env::{EnvDiff, EnvValue};
pub use mux::{Channel, ChannelReader, ChannelWriter, Multiplexer, MuxError, Side};
pub use operation::{
    ExecEvent, ExecOutput, ExecStreams, Operation, PushConfirmation, PushEvent, SocketConnection,
    SocketEvent, SocketTunnel,
};
pub use path::{PathError, PathResolver};
pub use version::{PIPEMUX_VERSION, VersionInfo};
pub use worker::{WorkerConfig, WorkerError, run_worker};
