//! Error types for the wire layer.

/// Errors produced while decoding or encoding frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: u64, max: usize },
}

/// Errors produced while negotiating the upgrade handshake.
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("not a GET upgrade request")]
    NotUpgradeRequest,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("request head exceeds {max} bytes")]
    HeaderTooLarge { max: usize },

    #[error("request head is not valid UTF-8")]
    InvalidEncoding,
}
