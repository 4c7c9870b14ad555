//! One client connection: upgrade handshake, frame loop and write pump.
//!
//! ```text
//! Handshaking --101 written--> Open --close / EOF / error--> Closing --> Closed
//!      \--bad request or timeout---------------------------------------^
//! ```
//!
//! A connection is in the [`Registry`] exactly while it is `Open`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use wsrelay_protocol::handshake::{self, MAX_HANDSHAKE_SIZE, REJECT_RESPONSE};
use wsrelay_protocol::{
    DEFAULT_MAX_PAYLOAD_SIZE, Frame, FrameCodec, FrameError, HandshakeError, Opcode,
    is_sendable_close_code,
};

use crate::registry::{Registry, Sender};
use crate::{JOIN_NOTICE, LEAVE_NOTICE, SEND_BUFFER_SIZE, ServerError};

/// Bytes reserved in the read buffer before each read.
const READ_CHUNK: usize = 8 * 1024;

/// How long the write pump may take to flush its queue after the
/// connection leaves the frame loop.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Close status: endpoint going away (server shutdown).
const CLOSE_GOING_AWAY: u16 = 1001;

/// Close status: message too big.
const CLOSE_TOO_BIG: u16 = 1009;

/// Unique connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Handshaking,
    Open,
    Closing,
    Closed,
}

/// Tunables applied to every connection.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Broadcast join/leave notices.
    pub announce_presence: bool,
    /// Largest accepted frame payload; bigger frames end the connection.
    pub max_payload_size: usize,
    /// Time allowed for the client to send a complete upgrade request.
    pub handshake_timeout: Duration,
    /// Capacity of the outbound frame queue.
    pub send_buffer_size: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            announce_presence: true,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            handshake_timeout: Duration::from_secs(10),
            send_buffer_size: SEND_BUFFER_SIZE,
        }
    }
}

/// An accepted stream that has not been upgraded yet.
///
/// Generic over the transport so the same handler runs on TCP streams and
/// in-memory pipes.
pub struct Connection<S> {
    id: ConnectionId,
    peer: String,
    stream: S,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: S, peer: impl Into<String>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer: peer.into(),
            stream,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Drives the connection until it closes.
    ///
    /// Returns `Ok` on a close frame, a clean EOF or server shutdown, and
    /// `Err` for handshake failures, I/O errors and oversized frames. The
    /// connection has left the registry by the time this returns.
    pub async fn run(
        mut self,
        registry: Arc<Registry>,
        settings: ConnectionSettings,
        cancel: CancellationToken,
    ) -> Result<(), ServerError> {
        info!(conn = %self.id, peer = %self.peer, "client connected");

        let handshake = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ServerError::Cancelled),
            result = tokio::time::timeout(settings.handshake_timeout, self.handshake()) => {
                result.unwrap_or(Err(ServerError::HandshakeTimeout))
            }
        };

        let leftover = match handshake {
            Ok(leftover) => leftover,
            Err(e) => {
                self.reject(&e).await;
                log_transition(self.id, ConnectionState::Handshaking, ConnectionState::Closed);
                return match e {
                    ServerError::Cancelled => Ok(()),
                    e => Err(e),
                };
            }
        };

        let (reader, writer) = tokio::io::split(self.stream);
        let (sender, rx) = Sender::channel(settings.send_buffer_size);
        let codec = FrameCodec::new(settings.max_payload_size);

        // Not a child of `cancel`: on shutdown the pump still has to flush
        // the going-away close frame.
        let pump_cancel = CancellationToken::new();
        let mut pump = tokio::spawn(write_pump(writer, rx, codec.clone(), pump_cancel.clone()));

        let mut session = Session {
            id: self.id,
            state: ConnectionState::Handshaking,
            registry,
            sender,
            announce_presence: settings.announce_presence,
        };
        session.open().await;

        let exit = session.read_loop(reader, leftover, codec, &cancel).await;

        session.leave().await;
        match &exit {
            // Codes that may not go on the wire are answered with an empty close.
            Ok(Exit::CloseFrame(code)) => {
                session.queue_close(code.filter(|c| is_sendable_close_code(*c)))
            }
            Ok(Exit::Shutdown) => session.queue_close(Some(CLOSE_GOING_AWAY)),
            Err(ServerError::Frame(FrameError::PayloadTooLarge { .. })) => {
                session.queue_close(Some(CLOSE_TOO_BIG))
            }
            Ok(Exit::Eof) | Err(_) => pump_cancel.cancel(),
        }

        // Dropping the last sender lets the pump finish once its queue drains.
        let id = session.id;
        drop(session);
        if tokio::time::timeout(WRITE_WAIT, &mut pump).await.is_err() {
            warn!(conn = %id, "write pump did not drain in time, aborting");
            pump.abort();
        }
        log_transition(id, ConnectionState::Closing, ConnectionState::Closed);
        info!(conn = %id, "client terminated");

        exit.map(|_| ())
    }

    /// Reads the request head, answers it, and returns any bytes the client
    /// sent after it.
    async fn handshake(&mut self) -> Result<BytesMut, ServerError> {
        let mut buf = BytesMut::with_capacity(1024);

        let head_len = loop {
            if let Some(end) = handshake::find_header_end(&buf) {
                break end;
            }
            if !handshake::could_be_request(&buf) {
                return Err(HandshakeError::NotUpgradeRequest.into());
            }
            if buf.len() > MAX_HANDSHAKE_SIZE {
                return Err(HandshakeError::HeaderTooLarge {
                    max: MAX_HANDSHAKE_SIZE,
                }
                .into());
            }
            buf.reserve(READ_CHUNK);
            if self.stream.read_buf(&mut buf).await? == 0 {
                return Err(ServerError::ClosedDuringHandshake);
            }
        };

        let head = buf.split_to(head_len);
        let request = handshake::parse_request(&head)?;
        let response = handshake::build_response(&request.accept_key());
        self.stream.write_all(response.as_bytes()).await?;
        self.stream.flush().await?;

        debug!(conn = %self.id, path = %request.path, "upgrade accepted");
        Ok(buf)
    }

    /// Refuses a failed upgrade and closes the stream. Best-effort.
    async fn reject(&mut self, err: &ServerError) {
        match err {
            ServerError::Cancelled => {}
            ServerError::Handshake(_) => {
                warn!(conn = %self.id, peer = %self.peer, "rejecting upgrade: {err}");
                let _ = self.stream.write_all(REJECT_RESPONSE.as_bytes()).await;
            }
            _ => warn!(conn = %self.id, peer = %self.peer, "handshake aborted: {err}"),
        }
        let _ = self.stream.shutdown().await;
    }
}

/// Why the frame loop ended.
#[derive(Debug)]
enum Exit {
    /// Client sent a close frame, with its status code if any.
    CloseFrame(Option<u16>),
    Eof,
    Shutdown,
}

/// Steady-state half of a connection, after the upgrade.
struct Session {
    id: ConnectionId,
    state: ConnectionState,
    registry: Arc<Registry>,
    sender: Sender,
    announce_presence: bool,
}

impl Session {
    fn transition(&mut self, next: ConnectionState) {
        log_transition(self.id, self.state, next);
        self.state = next;
    }

    async fn open(&mut self) {
        self.registry.add(self.id, self.sender.clone()).await;
        self.transition(ConnectionState::Open);
        if self.announce_presence {
            self.registry.broadcast(JOIN_NOTICE, Some(self.id)).await;
        }
    }

    async fn leave(&mut self) {
        self.transition(ConnectionState::Closing);
        if self.registry.remove(self.id).await && self.announce_presence {
            self.registry.broadcast(LEAVE_NOTICE, Some(self.id)).await;
        }
    }

    fn queue_close(&self, code: Option<u16>) {
        if self.sender.send_frame(Frame::close(code)).is_err() {
            debug!(conn = %self.id, "close frame not queued, pump already gone");
        }
    }

    /// Decodes and dispatches frames until the client closes, the stream
    /// ends, or the server shuts down.
    async fn read_loop<R>(
        &mut self,
        mut reader: R,
        mut buf: BytesMut,
        mut codec: FrameCodec,
        cancel: &CancellationToken,
    ) -> Result<Exit, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            loop {
                if handshake::looks_like_request(&buf) {
                    match handshake::find_header_end(&buf) {
                        Some(end) => {
                            warn!(conn = %self.id, "ignoring repeated upgrade request");
                            buf.advance(end);
                            continue;
                        }
                        None if buf.len() > MAX_HANDSHAKE_SIZE => {
                            warn!(conn = %self.id, "discarding oversized request head");
                            buf.clear();
                        }
                        None => {}
                    }
                    break;
                }

                match codec.decode(&mut buf)? {
                    Some(frame) => {
                        if let Some(code) = self.dispatch(frame).await {
                            return Ok(Exit::CloseFrame(code));
                        }
                    }
                    None => break,
                }
            }

            buf.reserve(READ_CHUNK);
            let n = tokio::select! {
                _ = cancel.cancelled() => return Ok(Exit::Shutdown),
                n = reader.read_buf(&mut buf) => n?,
            };
            if n == 0 {
                if !buf.is_empty() {
                    warn!(conn = %self.id, pending = buf.len(), "stream ended mid-frame");
                }
                return Ok(Exit::Eof);
            }
        }
    }

    /// Handles one frame. Returns `Some(code)` when the client asked to close.
    async fn dispatch(&mut self, frame: Frame) -> Option<Option<u16>> {
        debug!(
            conn = %self.id,
            fin = frame.fin,
            masked = frame.masked(),
            opcode = ?frame.opcode,
            len = frame.len(),
            "frame received"
        );

        match frame.opcode {
            Opcode::Close => {
                let code = frame.close_code();
                info!(conn = %self.id, ?code, "close frame received");
                return Some(code);
            }
            _ if !frame.masked() => {
                warn!(conn = %self.id, opcode = ?frame.opcode, "mask bit not set, frame ignored");
            }
            Opcode::Ping => {
                if self.sender.send_frame(Frame::pong(frame.payload)).is_err() {
                    warn!(conn = %self.id, "pong dropped: send buffer full or closed");
                }
            }
            Opcode::Pong => trace!(conn = %self.id, "pong received"),
            Opcode::Text if frame.is_empty() => debug!(conn = %self.id, "empty text frame"),
            Opcode::Text => {
                let text = String::from_utf8_lossy(&frame.payload);
                debug!(conn = %self.id, message = %text, "message received");
                self.registry.broadcast(&text, Some(self.id)).await;
            }
            Opcode::Binary => debug!(conn = %self.id, "binary frame ignored"),
            Opcode::Continuation => debug!(conn = %self.id, "continuation frame ignored"),
            Opcode::Reserved(raw) => {
                warn!(conn = %self.id, opcode = raw, "reserved opcode, frame ignored");
            }
        }
        None
    }
}

fn log_transition(id: ConnectionId, from: ConnectionState, to: ConnectionState) {
    debug!(conn = %id, ?from, ?to, "state change");
}

/// Write pump: encodes queued frames and writes each with one `write_all`.
///
/// Stops after writing a close frame, when every [`Sender`] is gone, or on
/// cancellation, then shuts the write half down.
async fn write_pump<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Frame>,
    mut codec: FrameCodec,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();

    loop {
        let frame = tokio::select! {
            biased;
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = cancel.cancelled() => break,
        };

        let closing = frame.opcode == Opcode::Close;
        buf.clear();
        if let Err(e) = codec.encode(frame, &mut buf) {
            error!("write pump encode error: {e}");
            break;
        }
        if let Err(e) = writer.write_all(&buf).await {
            warn!("write pump send error: {e}");
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("write pump flush error: {e}");
            break;
        }
        if closing {
            break;
        }
    }

    let _ = writer.shutdown().await;
}
