//! Serial Protocol Communication
//!
//! Line-delimited JSON protocol between the host and a companion panel.
//!
//! Every frame is one JSON object terminated by `\n` with an `event` field as
//! the dispatch key. Requests expecting a reply are answered with an event
//! named `<event>_return`; everything else the panel sends is fanned out to
//! the listeners registered for its event.

mod connection;
mod error;
pub mod framer;
pub mod listener;
mod message;
pub mod registry;
pub mod serial;
pub mod transport;

pub use connection::{
    Connection, ConnectionConfig, ConnectionState, CLOSED_EVENT, PROTOCOL_VERSION_EVENT,
    RETURN_SUFFIX,
};
pub use error::{ProtocolError, Result};
pub use listener::{EventStream, Listener, OneShotListener, QueueListener};
pub use message::{Message, EVENT_FIELD};
pub use registry::ListenerRegistry;
pub use serial::{list_ports, open_port, PortInfo};

/// Default baud rate for the panel link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default time the panel gets to answer the version handshake.
/// Kept short so probing ports that don't speak the protocol stays fast.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 250;

/// Default largest single transport write
pub const DEFAULT_WRITE_CHUNK_SIZE: usize = 128;
