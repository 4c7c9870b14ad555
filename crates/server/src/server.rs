//! TCP listener and accept loop.
//!
//! Binds the configured address and hands every accepted stream to its own
//! [`Connection`] task. Connections never share a task, so a slow or
//! misbehaving client cannot stall the others.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use wsrelay_protocol::DEFAULT_MAX_PAYLOAD_SIZE;

use crate::connection::{Connection, ConnectionSettings};
use crate::registry::Registry;
use crate::{SEND_BUFFER_SIZE, ServerError};

/// Pause after a failed `accept` (e.g. out of file descriptors).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,
    /// TCP port to listen on (0 = OS-assigned).
    pub port: u16,
    /// Skip the sender when relaying its own messages.
    pub exclude_originator: bool,
    /// Broadcast join/leave notices.
    pub announce_presence: bool,
    pub max_payload_size: usize,
    pub handshake_timeout: Duration,
    pub send_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 80,
            exclude_originator: false,
            announce_presence: true,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            handshake_timeout: Duration::from_secs(10),
            send_buffer_size: SEND_BUFFER_SIZE,
        }
    }
}

impl ServerConfig {
    /// Per-connection settings derived from this config.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            announce_presence: self.announce_presence,
            max_payload_size: self.max_payload_size,
            handshake_timeout: self.handshake_timeout,
            send_buffer_size: self.send_buffer_size,
        }
    }
}

/// The broadcast relay server.
///
/// Owns the shared [`Registry`]; every accepted connection gets a handle to
/// it and a clone of the shutdown token.
pub struct RelayServer {
    config: ServerConfig,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl RelayServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let registry = Arc::new(Registry::new(config.exclude_originator));
        Arc::new(Self {
            config,
            registry,
            cancel: CancellationToken::new(),
            local_addr: Mutex::new(None),
        })
    }

    /// Returns the local address the server is listening on.
    ///
    /// Only available after [`run`](Self::run) binds the socket.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Returns the listening port (0 if not yet bound).
    pub async fn port(&self) -> u16 {
        self.local_addr.lock().await.map(|a| a.port()).unwrap_or(0)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Stops accepting and tells every open connection to close.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Runs the accept loop until [`shutdown`](Self::shutdown).
    ///
    /// Fails only if the listening socket cannot be bound.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;

        let local_addr = listener.local_addr()?;
        *self.local_addr.lock().await = Some(local_addr);
        tracing::info!("relay listening on {local_addr}");

        let settings = self.config.connection_settings();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("server shutting down");
                    break Ok(());
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!(%peer_addr, "set_nodelay failed: {e}");
                            }
                            let conn = Connection::new(stream, peer_addr.to_string());
                            let registry = Arc::clone(&self.registry);
                            let settings = settings.clone();
                            let cancel = self.cancel.clone();
                            tokio::spawn(async move {
                                if let Err(e) = conn.run(registry, settings, cancel).await {
                                    tracing::warn!(%peer_addr, "connection error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("accept error: {e}");
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 0,
            announce_presence: false,
            ..ServerConfig::default()
        }
    }

    async fn start(config: ServerConfig) -> (Arc<RelayServer>, tokio::task::JoinHandle<()>) {
        let server = RelayServer::new(config);
        let server2 = Arc::clone(&server);
        let handle = tokio::spawn(async move {
            server2.run().await.unwrap();
        });

        // Wait for the server to bind.
        for _ in 0..100 {
            if server.port().await > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (server, handle)
    }

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 80);
        assert!(!config.exclude_originator);

        let settings = config.connection_settings();
        assert!(settings.announce_presence);
        assert_eq!(settings.max_payload_size, DEFAULT_MAX_PAYLOAD_SIZE);
        assert_eq!(settings.send_buffer_size, SEND_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn server_binds_dynamic_port() {
        let (server, handle) = start(test_config()).await;

        assert!(server.port().await > 0, "should have bound to a dynamic port");
        assert!(server.local_addr().await.is_some());
        assert!(server.registry().is_empty().await);

        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = RelayServer::new(ServerConfig {
            port,
            ..test_config()
        });
        assert!(matches!(server.run().await, Err(ServerError::Io(_))));
        assert_eq!(server.port().await, 0);
    }

    #[tokio::test]
    async fn client_is_registered_and_echoed() {
        let (server, handle) = start(test_config()).await;
        let url = format!("ws://127.0.0.1:{}/", server.port().await);

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.registry().len().await, 1);

        ws.send(Message::Text("ping from client".into())).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply, Message::Text("ping from client".into()));

        drop(ws);
        server.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_open_connections() {
        let (server, handle) = start(test_config()).await;
        let url = format!("ws://127.0.0.1:{}/", server.port().await);

        let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        server.shutdown();
        handle.await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .unwrap();
        match msg {
            Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1001),
            other => panic!("expected close frame, got {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.registry().is_empty().await);
    }
}
