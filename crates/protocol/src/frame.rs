//! RFC 6455 frame codec.
//!
//! # Wire format
//!
//! ```text
//! byte 0:  FIN(1) RSV(3) OPCODE(4)
//! byte 1:  MASK(1) LEN7(7)
//!   LEN7 == 126:  [2 bytes BE: payload length]
//!   LEN7 == 127:  [8 bytes BE: payload length]
//!   MASK set:     [4 bytes: mask key]
//! payload:        [length bytes, XOR-ed with key[i % 4] when MASK is set]
//! ```
//!
//! Clients must mask every frame they send; the server never masks its own.
//! Decoding is lenient: unmasked frames and reserved opcodes
//! come back as ordinary [`Frame`] values and the connection handler decides
//! what to do with them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::error::FrameError;

const FIN_BIT: u8 = 0b1000_0000;
const MASK_BIT: u8 = 0b1000_0000;
const OPCODE_BITS: u8 = 0b0000_1111;
const LEN7_BITS: u8 = 0b0111_1111;

/// 7-bit length marker: a 2-byte big-endian length follows.
const LEN_U16: u8 = 126;

/// 7-bit length marker: an 8-byte big-endian length follows.
const LEN_U64: u8 = 127;

/// Frame opcode (low nibble of byte 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    /// Any value RFC 6455 leaves reserved (0x3-0x7, 0xB-0xF).
    Reserved(u8),
}

impl Opcode {
    /// Returns `true` for close, ping, pong and the reserved control range.
    pub fn is_control(self) -> bool {
        u8::from(self) & 0x08 != 0
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value & OPCODE_BITS {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        match opcode {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
            Opcode::Reserved(value) => value & OPCODE_BITS,
        }
    }
}

/// A single decoded WebSocket frame.
///
/// `payload` is always held in its unmasked form; `mask_key` records whether
/// the frame travelled masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask_key: Option<[u8; 4]>,
    pub payload: Bytes,
}

impl Frame {
    /// Creates a final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Creates a text frame from a UTF-8 string.
    pub fn text(text: &str) -> Self {
        Self::new(Opcode::Text, Bytes::copy_from_slice(text.as_bytes()))
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, payload)
    }

    pub fn ping(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Creates a close frame, optionally carrying a status code.
    pub fn close(code: Option<u16>) -> Self {
        let payload = match code {
            Some(code) => Bytes::copy_from_slice(&code.to_be_bytes()),
            None => Bytes::new(),
        };
        Self::new(Opcode::Close, payload)
    }

    /// Returns the same frame marked for masking with `key` (client form).
    pub fn with_mask(mut self, key: [u8; 4]) -> Self {
        self.mask_key = Some(key);
        self
    }

    pub fn masked(&self) -> bool {
        self.mask_key.is_some()
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Status code carried by a close frame, if any.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != Opcode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Returns `true` if `code` may appear in a close frame on the wire.
///
/// 1005, 1006 and 1015 are reserved for local reporting, and codes below
/// 1000 or in 1016-2999 are unassigned (RFC 6455 section 7.4).
pub fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

/// XORs `payload` in place with `key[i % 4]`. Applying it twice is a no-op.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Decodes one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when
/// `buf` does not yet hold the complete frame. Nothing is consumed; the
/// caller advances its buffer by the returned count.
pub fn decode_frame(
    buf: &[u8],
    max_payload: usize,
) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let fin = buf[0] & FIN_BIT != 0;
    let opcode = Opcode::from(buf[0]);
    let masked = buf[1] & MASK_BIT != 0;

    let (payload_len, mut offset) = match buf[1] & LEN7_BITS {
        LEN_U16 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        LEN_U64 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        len => (u64::from(len), 2),
    };

    if payload_len > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }
    let payload_len = payload_len as usize;

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset + payload_len;
    if buf.len() < end {
        return Ok(None);
    }

    let mut payload = BytesMut::from(&buf[offset..end]);
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin,
        opcode,
        mask_key,
        payload: payload.freeze(),
    };
    Ok(Some((frame, end)))
}

/// Appends the wire form of `frame` to `dst`.
///
/// The payload is masked on the wire only if the frame carries a mask key.
pub fn encode_frame(frame: &Frame, dst: &mut BytesMut) {
    let len = frame.payload.len();

    let mut first = u8::from(frame.opcode);
    if frame.fin {
        first |= FIN_BIT;
    }
    let mask_bit = if frame.masked() { MASK_BIT } else { 0 };

    dst.reserve(14 + len);
    dst.put_u8(first);

    if len < LEN_U16 as usize {
        dst.put_u8(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        dst.put_u8(mask_bit | LEN_U16);
        dst.put_u16(len as u16);
    } else {
        dst.put_u8(mask_bit | LEN_U64);
        dst.put_u64(len as u64);
    }

    match frame.mask_key {
        Some(key) => {
            dst.put_slice(&key);
            let start = dst.len();
            dst.put_slice(&frame.payload);
            apply_mask(&mut dst[start..], key);
        }
        None => dst.put_slice(&frame.payload),
    }
}

/// Encodes `text` as a final, unmasked text frame (`0x81`).
pub fn encode_text(text: &str) -> Bytes {
    let mut dst = BytesMut::new();
    encode_frame(&Frame::text(text), &mut dst);
    dst.freeze()
}

/// Streaming codec over a growable per-connection buffer.
///
/// `decode` yields a frame only once every byte of it has arrived, so
/// frames split across reads (or several frames in one read) are handled.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        match decode_frame(src, self.max_payload_size)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        encode_frame(&frame, dst);
        Ok(())
    }
}
