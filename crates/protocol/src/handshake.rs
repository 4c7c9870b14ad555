//! HTTP upgrade handshake (RFC 6455 section 4).
//!
//! ```text
//! GET /chat HTTP/1.1
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//!
//! HTTP/1.1 101 Switching Protocols
//! Connection: Upgrade
//! Upgrade: websocket
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// Fixed GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Largest request head accepted before the upgrade is refused (8 KiB).
pub const MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

/// Written to a client whose upgrade request was refused, right before close.
pub const REJECT_RESPONSE: &str =
    "HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const KEY_HEADER: &str = "Sec-WebSocket-Key";

/// A parsed upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    /// Request target from the request line (`/` when absent).
    pub path: String,
    /// `Sec-WebSocket-Key` value, surrounding whitespace removed.
    pub key: String,
}

impl UpgradeRequest {
    pub fn accept_key(&self) -> String {
        compute_accept_key(&self.key)
    }
}

/// Computes `Sec-WebSocket-Accept`: Base64(SHA-1(key + GUID)).
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Returns `true` if `buf` starts with `GET` (any case).
pub fn looks_like_request(buf: &[u8]) -> bool {
    buf.len() >= 3 && buf[..3].eq_ignore_ascii_case(b"GET")
}

/// Returns `false` once the bytes seen so far can no longer begin a `GET`
/// request line, so a bad client is refused without waiting for the full
/// head.
pub fn could_be_request(buf: &[u8]) -> bool {
    let n = buf.len().min(3);
    buf[..n].eq_ignore_ascii_case(&b"GET"[..n])
}

/// Offset just past the blank line that ends the request head.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)
        .map(|pos| pos + HEADER_TERMINATOR.len())
}

/// Parses a complete request head (everything up to and including the
/// blank line).
pub fn parse_request(head: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    let text = std::str::from_utf8(head).map_err(|_| HandshakeError::InvalidEncoding)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or("");
    if !looks_like_request(request_line.as_bytes()) {
        return Err(HandshakeError::NotUpgradeRequest);
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let key = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case(KEY_HEADER))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(UpgradeRequest {
        path,
        key: key.to_string(),
    })
}

/// Builds the `101 Switching Protocols` response for `accept_key`.
pub fn build_response(accept_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
}
