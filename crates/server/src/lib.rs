//! Broadcast WebSocket server.
//!
//! Accepts raw TCP connections, performs the RFC 6455 upgrade itself, and
//! relays every text message a client sends to the registered clients.
//! Frame and handshake encoding live in `wsrelay-protocol`; this crate owns
//! the sockets, the per-connection tasks and the shared [`Registry`].

mod connection;
mod registry;
mod server;

pub use connection::{Connection, ConnectionId, ConnectionSettings, ConnectionState};
pub use registry::{Registry, SendError, Sender};
pub use server::{RelayServer, ServerConfig};

use wsrelay_protocol::{FrameError, HandshakeError};

/// Default capacity of each connection's outbound frame queue.
///
/// Broadcasts use `try_send`, so a client that stops reading loses
/// messages once this many frames are waiting for it.
pub const SEND_BUFFER_SIZE: usize = 256;

/// Broadcast after a client completes the upgrade.
pub const JOIN_NOTICE: &str = "New client connected.";

/// Broadcast after a client leaves.
pub const LEAVE_NOTICE: &str = "Client has disconnected.";

/// Errors produced by the relay server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("handshake timed out")]
    HandshakeTimeout,

    #[error("connection closed during handshake")]
    ClosedDuringHandshake,

    #[error("cancelled")]
    Cancelled,
}
