//! WebSocket server: handshake routing, identity, and the per-connection loop.
//!
//! ```text
//! ws://host/chat/{channel_id}?user_id=..&name=..
//!            │
//!            ├── route (404) ── identity (401)
//!            ▼
//!        RoomHub::admit ── Connection ─┬─ inbound:  Session::handle_text
//!                                      └─ outbound: bounded queue → socket
//! ```
//!
//! Each accepted socket runs in its own task. The task ends when the client
//! closes, the transport fails, a write times out, or the hub evicts the
//! connection; every one of those paths evicts it from its room.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::connection::ConnectionHandle;
use crate::dispatch::Session;
use crate::error::EventError;
use crate::identity::{Credential, HandshakeIdentity, IdentityProvider, Principal};
use crate::protocol::ServerEvent;
use crate::registry::{HubConfig, RoomHub};
use crate::room::{RoomKey, RoomKind};
use crate::storage::{DocumentStore, MemoryStore, RocksStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub hub: HubConfig,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            hub: HubConfig::default(),
            storage_path: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Maps a handshake path onto a room. The editor id keeps everything after
/// `/editor/`, slashes included; other ids are a single path segment.
pub fn parse_route(path: &str) -> Option<RoomKey> {
    let rest = path.strip_prefix('/')?;
    let (segment, raw_id) = rest.split_once('/')?;
    let kind = RoomKind::from_segment(segment)?;
    let id = urlencoding::decode(raw_id).ok()?.into_owned();
    if id.is_empty() {
        return None;
    }
    if kind != RoomKind::EditorFile && id.contains('/') {
        return None;
    }
    Some(RoomKey::new(kind, id))
}

fn reject(status: StatusCode, reason: impl Into<String>) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.into()));
    *response.status_mut() = status;
    response
}

/// Stops the accept loop and drains the hub.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
    hub: RoomHub,
}

impl ShutdownHandle {
    pub async fn shutdown(&self) {
        self.tx.send_replace(true);
        self.hub.shutdown().await;
    }
}

pub struct RealtimeServer {
    config: ServerConfig,
    hub: RoomHub,
    identity: Arc<dyn IdentityProvider>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RealtimeServer {
    /// Opens RocksDB at `storage_path` when set, otherwise keeps documents
    /// in memory. Identity comes from the handshake query string.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store: Arc<dyn DocumentStore> = match &config.storage_path {
            Some(path) => {
                let store = RocksStore::open(StoreConfig::new(path.clone()))?;
                log::info!("Using RocksDB store at {}", path.display());
                Arc::new(store)
            }
            None => {
                log::info!("Using in-memory store");
                Arc::new(MemoryStore::new())
            }
        };
        Ok(Self::with_parts(config, store, Arc::new(HandshakeIdentity)))
    }

    pub fn with_parts(
        config: ServerConfig,
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let hub = RoomHub::new(config.hub.clone(), store);
        let (tx, _rx) = watch::channel(false);
        Self {
            config,
            hub,
            identity,
            shutdown: Arc::new(tx),
        }
    }

    pub fn hub(&self) -> &RoomHub {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
            hub: self.hub.clone(),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_addr.clone();
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })
    }

    /// Binds and serves until shut down.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shut down.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr()?;
        log::info!("Realtime server listening on {local}");
        let mut stop = self.shutdown.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let hub = self.hub.clone();
                    let identity = Arc::clone(&self.identity);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr, hub, identity).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = stop.wait_for(|stopped| *stopped) => break,
            }
        }

        log::info!("Realtime server on {local} stopped accepting");
        Ok(())
    }
}

// ─── Connection task ────────────────────────────────────────

type WsSender = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Evicts the connection if its task unwinds before the explicit eviction.
struct EvictGuard {
    hub: RoomHub,
    handle: Option<ConnectionHandle>,
}

impl EvictGuard {
    fn new(hub: RoomHub, handle: ConnectionHandle) -> Self {
        Self {
            hub,
            handle: Some(handle),
        }
    }

    async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            self.hub.evict(&handle).await;
        }
    }
}

impl Drop for EvictGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let hub = self.hub.clone();
                runtime.spawn(async move { hub.evict(&handle).await });
            }
            Err(_) => {
                handle.close();
            }
        }
    }
}

async fn send_frame(sender: &mut WsSender, message: Message, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, sender.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::debug!("Write failed: {e}");
            false
        }
        Err(_) => {
            log::warn!("Write timed out after {timeout:?}");
            false
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: RoomHub,
    identity: Arc<dyn IdentityProvider>,
) -> Result<(), ServerError> {
    let mut admitted: Option<(RoomKey, Principal)> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let path = request.uri().path();
        let Some(key) = parse_route(path) else {
            log::info!("Rejected handshake from {addr}: unknown path {path}");
            return Err(reject(StatusCode::NOT_FOUND, format!("unknown room path: {path}")));
        };
        let credential = Credential::from_query(request.uri().query().unwrap_or(""));
        match identity.verify(&credential) {
            Ok(principal) => {
                admitted = Some((key, principal));
                Ok(response)
            }
            Err(e) => {
                log::info!("Rejected handshake from {addr} for {key}: {e}");
                Err(reject(StatusCode::UNAUTHORIZED, e.to_string()))
            }
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("Handshake with {addr} failed: {e}");
            return Ok(());
        }
    };
    let Some((key, principal)) = admitted else {
        return Ok(());
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let send_timeout = hub.config().send_timeout;

    let mut connection = match hub.admit(key.clone(), &principal).await {
        Ok(connection) => connection,
        Err(e) => {
            log::info!("Refused {} for {key}: {e}", principal.user_id);
            if let Ok(frame) = ServerEvent::error(&e).encode() {
                send_frame(&mut ws_sender, frame.into_message(), send_timeout).await;
            }
            let _ = ws_sender.close().await;
            return Ok(());
        }
    };
    let handle = connection.handle().clone();
    let guard = EvictGuard::new(hub.clone(), handle.clone());
    let session = Session::new(Arc::clone(connection.room()), handle.clone(), principal);
    log::info!("WebSocket connection {} established from {addr} for {key}", handle.id());

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Failures are already reported to the client.
                        let _ = session.handle_text(text.as_str()).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        session
                            .reject(&EventError::Malformed("binary frames are not supported".into()))
                            .await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if !send_frame(&mut ws_sender, Message::Pong(data), send_timeout).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {} closed by {addr}", handle.id());
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            frame = connection.recv() => {
                match frame {
                    Some(frame) => {
                        if !send_frame(&mut ws_sender, frame.into_message(), send_timeout).await {
                            break;
                        }
                    }
                    None => {
                        log::debug!("Connection {} evicted from {key}", handle.id());
                        break;
                    }
                }
            }
        }
    }

    guard.release().await;
    let _ = ws_sender.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.hub.debounce_interval, Duration::from_secs(5));
        assert_eq!(config.hub.outbound_capacity, 256);
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_parse_route_kinds() {
        assert_eq!(parse_route("/chat/general"), Some(RoomKey::chat("general")));
        assert_eq!(parse_route("/dm/u1-u2"), Some(RoomKey::dm("u1-u2")));
        assert_eq!(parse_route("/call/call-1"), Some(RoomKey::call("call-1")));
        assert_eq!(
            parse_route("/editor/proj1:src/lib/main.py"),
            Some(RoomKey::editor("proj1", "src/lib/main.py"))
        );
    }

    #[test]
    fn test_parse_route_decodes_percent_escapes() {
        assert_eq!(
            parse_route("/editor/proj1%3Amy%20file.txt"),
            Some(RoomKey::editor("proj1", "my file.txt"))
        );
        assert_eq!(parse_route("/chat/a%20b"), Some(RoomKey::chat("a b")));
    }

    #[test]
    fn test_parse_route_rejects() {
        assert_eq!(parse_route("/"), None);
        assert_eq!(parse_route("/chat"), None);
        assert_eq!(parse_route("/chat/"), None);
        assert_eq!(parse_route("/voice/room"), None);
        assert_eq!(parse_route("/chat/a/b"), None);
        assert_eq!(parse_route("chat/general"), None);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = RealtimeServer::new(config).unwrap();
        assert_eq!(server.hub().room_count().await, 0);
    }

    #[tokio::test]
    async fn test_bind_error_names_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = listener.local_addr().unwrap().to_string();
        let config = ServerConfig {
            bind_addr: taken.clone(),
            ..ServerConfig::default()
        };
        let server = RealtimeServer::new(config).unwrap();
        match server.bind().await {
            Err(ServerError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind error, got {other:?}"),
        }
    }

    async fn rooms_drained(hub: &RoomHub) -> bool {
        for _ in 0..200 {
            if hub.room_count().await == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_dropped_guard_evicts_connection() {
        let hub = RoomHub::new(HubConfig::default(), Arc::new(MemoryStore::new()));
        let key = RoomKey::chat("r1");
        let mut stay = hub.admit(key.clone(), &Principal::new("a", "A")).await.unwrap();
        let leaving = hub.admit(key.clone(), &Principal::new("b", "B")).await.unwrap();

        // A connection task that unwinds without reaching `release`.
        drop(EvictGuard::new(hub.clone(), leaving.handle().clone()));

        let left = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match stay.recv().await.map(|f| f.decode().unwrap()) {
                    Some(ServerEvent::UserLeft { user_id, .. }) => return user_id,
                    Some(_) => continue,
                    None => panic!("remaining connection was evicted"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(left, "b");
        assert!(!leaving.handle().is_open());

        drop(EvictGuard::new(hub.clone(), stay.handle().clone()));
        assert!(rooms_drained(&hub).await);
    }

    #[tokio::test]
    async fn test_released_guard_evicts_before_returning() {
        let hub = RoomHub::new(HubConfig::default(), Arc::new(MemoryStore::new()));
        let conn = hub.admit(RoomKey::call("c1"), &Principal::new("a", "A")).await.unwrap();

        EvictGuard::new(hub.clone(), conn.handle().clone()).release().await;
        assert_eq!(hub.room_count().await, 0);
        assert!(!conn.handle().is_open());
    }

    #[test]
    fn test_guard_dropped_outside_runtime_closes_connection() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let hub = RoomHub::new(HubConfig::default(), Arc::new(MemoryStore::new()));
        let conn = runtime
            .block_on(hub.admit(RoomKey::chat("r1"), &Principal::new("a", "A")))
            .unwrap();

        drop(EvictGuard::new(hub.clone(), conn.handle().clone()));
        assert!(!conn.handle().is_open());
    }

    #[tokio::test]
    async fn test_shutdown_stops_accept_loop() {
        let server = RealtimeServer::new(ServerConfig::default()).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let handle = server.shutdown_handle();
        handle.shutdown().await;

        let served = tokio::time::timeout(Duration::from_secs(2), server.serve(listener)).await;
        assert!(matches!(served, Ok(Ok(()))));
        assert!(server.hub().is_shutting_down());
    }
}
