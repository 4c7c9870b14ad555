//! Wire layer of the wsrelay server.
//!
//! Everything here is pure: bytes in, bytes out. Sockets, tasks and the
//! connection registry live in `wsrelay-server`.
//!
//! # Wire format
//!
//! See [`frame`] for the RFC 6455 frame layout and [`handshake`] for the
//! HTTP upgrade exchange that precedes it.

pub mod error;
pub mod frame;
pub mod handshake;

pub use error::{FrameError, HandshakeError};
pub use frame::{
    Frame, FrameCodec, Opcode, apply_mask, decode_frame, encode_frame, encode_text,
    is_sendable_close_code,
};
pub use handshake::{UpgradeRequest, build_response, compute_accept_key, parse_request};

/// Default upper bound for a single frame payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
