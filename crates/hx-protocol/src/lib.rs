//! hx-protocol: Wire protocol for the hepx tunnel control plane
//!
//! This crate defines the framed messages exchanged between clients and the
//! rendezvous server, and the dispatcher that drives one control stream.

pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{read_message, write_message, MessageCodec};
pub use dispatcher::{
    async_handler, Dispatcher, DispatcherHandle, Handler, FLUSH_TIMEOUT, SEND_QUEUE_CAPACITY,
};
pub use error::{DispatcherError, ProtocolError};
pub use frame::{FrameHeader, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use message::*;
