//! Registry of open connections and text fan-out.

use std::collections::HashMap;

use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use wsrelay_protocol::Frame;

use crate::connection::ConnectionId;

/// Handle for queueing frames on one connection's write pump.
///
/// Cloneable and cheap, wraps an `mpsc::Sender`.
#[derive(Debug, Clone)]
pub struct Sender {
    tx: mpsc::Sender<Frame>,
}

impl Sender {
    /// Creates a sender and the receiving end a write pump drains.
    ///
    /// Also useful for attaching an in-process listener to a [`Registry`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queues a frame without waiting.
    ///
    /// Returns `Err` if the queue is full or the pump has stopped.
    pub fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        self.tx.try_send(frame).map_err(|_| SendError)
    }

    /// Returns `true` while the receiving pump is alive.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Error returned when the send queue is full or closed.
#[derive(Debug, thiserror::Error)]
#[error("send failed: buffer full or connection closed")]
pub struct SendError;

/// The set of open, broadcast-eligible connections.
///
/// All access goes through one async mutex, so membership changes and
/// broadcast iteration never overlap.
#[derive(Debug)]
pub struct Registry {
    peers: Mutex<HashMap<ConnectionId, Sender>>,
    exclude_originator: bool,
}

impl Registry {
    /// Creates an empty registry.
    ///
    /// With `exclude_originator` unset, a client receives its own messages
    /// back along with everyone else.
    pub fn new(exclude_originator: bool) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            exclude_originator,
        }
    }

    pub fn exclude_originator(&self) -> bool {
        self.exclude_originator
    }

    /// Registers a connection. Re-adding an id replaces its sender.
    pub async fn add(&self, id: ConnectionId, sender: Sender) {
        let mut peers = self.peers.lock().await;
        if peers.insert(id, sender).is_some() {
            warn!(conn = %id, "connection registered twice, sender replaced");
        }
        debug!(conn = %id, peers = peers.len(), "connection registered");
    }

    /// Unregisters a connection. Returns `false` if it was not registered.
    pub async fn remove(&self, id: ConnectionId) -> bool {
        let mut peers = self.peers.lock().await;
        let removed = peers.remove(&id).is_some();
        if removed {
            info!(conn = %id, peers = peers.len(), "connection removed");
        }
        removed
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.peers.lock().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.lock().await.is_empty()
    }

    /// Queues `message` as a text frame on every registered connection.
    ///
    /// The payload is copied once; every peer's frame shares that buffer and
    /// each write pump only adds the frame header.
    ///
    /// `originator` is skipped only when the registry excludes originators.
    /// Delivery is best-effort: a peer whose queue is full or closed is
    /// logged and skipped. Returns the number of peers it was queued for.
    pub async fn broadcast(&self, message: &str, originator: Option<ConnectionId>) -> usize {
        let frame = Frame::text(message);
        let peers = self.peers.lock().await;

        let mut delivered = 0;
        for (id, sender) in peers.iter() {
            if self.exclude_originator && originator == Some(*id) {
                continue;
            }
            match sender.send_frame(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!(conn = %id, "dropping broadcast: {e}"),
            }
        }

        debug!(delivered, len = message.len(), "broadcast");
        delivered
    }
}
