//! Wire layer shared by controller and worker.
//!
//! # Architecture
//!
//! - **frame**: Multiplexer frames (Open/Data/Ack/Eof/Close/Error) and channel ids
//! - **codec**: Binary frame codec for the physical stream, JSON codec for control messages
//! - **protocol**: Control requests and events carried on channel 0

pub mod codec;
pub mod frame;
pub mod protocol;
