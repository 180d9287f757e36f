//! Client sync adapter used by the canvas editor.
//!
//! Provides:
//! - Lazy connection lifecycle (Disconnected → Connecting → Connected)
//! - Acknowledged snapshot save/load with request-id correlation
//! - Batch asset save/load with per-item results
//! - Room join/leave and edit broadcast
//! - Scope-filtered delivery of server-pushed snapshot updates
//!
//! There is no automatic reconnect: the next operation after a drop
//! performs a fresh handshake.

mod document;
mod pending;

pub use document::{DocumentState, RemoteDocument};

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    now_millis, AssetRecord, AssetUpload, ClientMessage, ConnectionId, ProtocolError, RequestId,
    ResponseKind, ServerMessage, DEFAULT_DOCUMENT_ID,
};
use pending::PendingRequests;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Handshake completed
    Connected { connection_id: ConnectionId },
    /// Connection lost or closed
    Disconnected,
    /// This connection is the only member of the room
    FirstInRoom { room_id: String },
    PeerJoined {
        room_id: String,
        connection_id: ConnectionId,
    },
    RoomMembership {
        room_id: String,
        members: Vec<ConnectionId>,
    },
    /// Edit relayed from a peer
    Broadcast { payload: Vec<u8>, iv: Vec<u8> },
    Pong,
}

/// Adapter errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Timed out waiting for the server")]
    Timeout,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Server could not complete the request: {0}")]
    Gateway(String),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("Invalid document payload: {0}")]
    Payload(String),
    #[error("Adapter is disabled")]
    Disabled,
}

/// Callback for scope-matching snapshot updates.
pub type UpdateCallback = Arc<dyn Fn(RemoteDocument) + Send + Sync>;

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// WebSocket endpoint, normalized by [`normalize_endpoint`]
    pub endpoint: String,
    /// A disabled adapter never connects
    pub enabled: bool,
    pub save_timeout: Duration,
    /// `None` waits for a load response indefinitely
    pub load_timeout: Option<Duration>,
    pub handshake_timeout: Duration,
    /// Capacity of the event channel; events beyond it are dropped
    pub event_capacity: usize,
}

impl AdapterConfig {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: normalize_endpoint(endpoint),
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            endpoint: "ws://127.0.0.1:5000".to_string(),
            enabled: true,
            save_timeout: Duration::from_secs(5),
            load_timeout: Some(Duration::from_secs(30)),
            handshake_timeout: Duration::from_secs(10),
            event_capacity: 256,
        }
    }
}

/// Turn a bare `host:port` or an `http(s)` URL into a WebSocket URL.
pub fn normalize_endpoint(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if raw.starts_with("ws://") || raw.starts_with("wss://") {
        raw.to_string()
    } else if let Some(rest) = raw.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = raw.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{raw}")
    }
}

/// Per-item result of an asset save.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetSaveOutcome {
    pub saved: Vec<String>,
    pub errored: Vec<String>,
}

/// Per-item result of an asset load.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetLoadOutcome {
    pub loaded: Vec<AssetRecord>,
    pub errored: Vec<String>,
}

/// State shared with the connection's reader task.
struct Shared {
    state: RwLock<ConnectionState>,
    connection_id: RwLock<Option<ConnectionId>>,
    scope: RwLock<String>,
    callback: RwLock<Option<UpdateCallback>>,
    server_version: AtomicI64,
    /// Bumped on every connect/disconnect so a stale reader cannot clobber
    /// a newer connection's state.
    generation: AtomicU64,
    pending: PendingRequests,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl Shared {
    fn emit(&self, event: SyncEvent) {
        if self.event_tx.try_send(event).is_err() {
            log::trace!("Event channel full or closed; event dropped");
        }
    }

    async fn route(&self, msg: ServerMessage) {
        if msg.request_id().is_some() {
            if !self.pending.resolve(msg) {
                log::debug!("Response arrived with no matching pending request");
            }
            return;
        }

        match msg {
            ServerMessage::SnapshotUpdate {
                document_id,
                payload,
                server_timestamp,
            } => {
                if *self.scope.read().await != document_id {
                    log::trace!("Ignoring update for document {document_id}");
                    return;
                }
                let callback = self.callback.read().await.clone();
                let Some(callback) = callback else {
                    return;
                };
                match RemoteDocument::decode(document_id, &payload, server_timestamp, true) {
                    Ok(remote) => callback(remote),
                    Err(e) => log::warn!("Discarding undecodable snapshot update: {e}"),
                }
            }
            ServerMessage::FirstInRoom { room_id } => self.emit(SyncEvent::FirstInRoom { room_id }),
            ServerMessage::PeerJoined {
                room_id,
                connection_id,
            } => self.emit(SyncEvent::PeerJoined {
                room_id,
                connection_id,
            }),
            ServerMessage::RoomMembership { room_id, members } => {
                self.emit(SyncEvent::RoomMembership { room_id, members })
            }
            ServerMessage::Broadcast { payload, iv } => {
                self.emit(SyncEvent::Broadcast { payload, iv })
            }
            ServerMessage::Pong => self.emit(SyncEvent::Pong),
            other => log::debug!("Unexpected server message: {other:?}"),
        }
    }

    /// Reset to disconnected if `generation` is still current.
    async fn closed(&self, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *self.state.write().await = ConnectionState::Disconnected;
        *self.connection_id.write().await = None;
        let abandoned = self.pending.abandon_all();
        if abandoned > 0 {
            log::warn!("Connection lost with {abandoned} requests outstanding");
        }
        self.emit(SyncEvent::Disconnected);
    }
}

/// A live connection: outbound channel plus the two I/O tasks.
struct Link {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.outgoing.is_closed() && !self.reader.is_finished()
    }

    /// Close the outbound side (the writer sends a close frame) and stop
    /// reading.
    fn shutdown(self) {
        drop(self.outgoing);
        self.reader.abort();
        drop(self.writer);
    }
}

/// The client sync adapter.
///
/// Every operation takes `&self`; share it behind an `Arc`.
pub struct SyncAdapter {
    config: AdapterConfig,
    shared: Arc<Shared>,
    /// Held across the handshake so concurrent connects collapse into one
    link: Mutex<Option<Link>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl SyncAdapter {
    pub fn new(config: AdapterConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            config,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                connection_id: RwLock::new(None),
                scope: RwLock::new(DEFAULT_DOCUMENT_ID.to_string()),
                callback: RwLock::new(None),
                server_version: AtomicI64::new(-1),
                generation: AtomicU64::new(0),
                pending: PendingRequests::new(),
                event_tx,
            }),
            link: Mutex::new(None),
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect if not already connected. Returns immediately when a live
    /// connection exists.
    pub async fn connect(&self) -> Result<(), SyncError> {
        if !self.config.enabled {
            return Err(SyncError::Disabled);
        }

        let mut link = self.link.lock().await;
        if let Some(current) = link.as_ref() {
            if current.is_alive() && *self.shared.state.read().await == ConnectionState::Connected {
                return Ok(());
            }
        }
        if let Some(stale) = link.take() {
            stale.shutdown();
            self.shared.pending.abandon_all();
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.shared.state.write().await = ConnectionState::Connecting;
        log::debug!("Connecting to {}", self.config.endpoint);

        let opened = tokio::time::timeout(self.config.handshake_timeout, self.open(generation)).await;
        match opened {
            Ok(Ok((new_link, connection_id))) => {
                *link = Some(new_link);
                *self.shared.connection_id.write().await = Some(connection_id);
                *self.shared.state.write().await = ConnectionState::Connected;
                self.shared.emit(SyncEvent::Connected { connection_id });
                log::info!("Connected to {} as {connection_id}", self.config.endpoint);
                Ok(())
            }
            Ok(Err(e)) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                log::warn!("Connection to {} failed: {e}", self.config.endpoint);
                Err(e)
            }
            Err(_) => {
                *self.shared.state.write().await = ConnectionState::Disconnected;
                log::warn!("Handshake with {} timed out", self.config.endpoint);
                Err(SyncError::Timeout)
            }
        }
    }

    /// Open the socket, wait for the welcome frame, and spawn the I/O tasks.
    async fn open(&self, generation: u64) -> Result<(Link, ConnectionId), SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.config.endpoint.as_str())
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let connection_id = loop {
            match ws_reader.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let bytes: Vec<u8> = data.into();
                    match ServerMessage::decode(&bytes)? {
                        ServerMessage::Welcome { connection_id } => break connection_id,
                        other => log::debug!("Ignoring {other:?} before welcome"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(SyncError::ConnectionClosed),
                Some(Err(e)) => return Err(SyncError::Transport(e.to_string())),
                Some(Ok(_)) => {}
            }
        };

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer = tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // Reader task: route responses, pushes and room events
        let shared = self.shared.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        match ServerMessage::decode(&bytes) {
                            Ok(server_msg) => shared.route(server_msg).await,
                            Err(e) => log::warn!("Failed to decode server message: {e}"),
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            shared.closed(generation).await;
        });

        Ok((
            Link {
                outgoing: out_tx,
                reader,
                writer,
            },
            connection_id,
        ))
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), SyncError> {
        let frame = msg.encode()?;
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => link
                .outgoing
                .send(frame)
                .map_err(|_| SyncError::ConnectionClosed),
            None => Err(SyncError::ConnectionClosed),
        }
    }

    /// Connect, send a request, and wait for the response with the same id.
    async fn request(
        &self,
        expected: ResponseKind,
        limit: Option<Duration>,
        build: impl FnOnce(RequestId) -> ClientMessage,
    ) -> Result<ServerMessage, SyncError> {
        self.connect().await?;
        let waiter = self
            .shared
            .pending
            .register(RequestId::new(), expected, limit);
        let request_id = waiter.request_id();
        if let Err(e) = self.send(&build(request_id)).await {
            self.shared.pending.cancel(request_id);
            return Err(e);
        }
        waiter.wait(&self.shared.pending).await
    }

    /// Save the document under the current scope. Returns whether the
    /// server acknowledged the write.
    pub async fn save_document(&self, state: &DocumentState, timestamp: i64) -> bool {
        if !self.config.enabled {
            return true;
        }
        let payload = match state.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                log::error!("Failed to encode document: {e}");
                return false;
            }
        };
        let scope = self.document_scope().await;

        let response = self
            .request(ResponseKind::SaveAck, Some(self.config.save_timeout), |request_id| {
                ClientMessage::SaveDocument {
                    request_id,
                    document_id: Some(scope),
                    payload,
                    client_timestamp: timestamp,
                }
            })
            .await;

        match response {
            Ok(ServerMessage::SaveAck {
                success: true,
                server_timestamp,
                ..
            }) => {
                let version = server_timestamp.unwrap_or_else(now_millis);
                self.shared.server_version.store(version, Ordering::SeqCst);
                true
            }
            Ok(ServerMessage::SaveAck { error, .. }) => {
                log::warn!("Save rejected: {}", error.unwrap_or_default());
                false
            }
            Ok(other) => {
                log::warn!("Unexpected save response: {other:?}");
                false
            }
            Err(e) => {
                log::warn!("Save failed: {e}");
                false
            }
        }
    }

    /// Load the document for the current scope. `Ok(None)` only when the
    /// adapter is disabled; a missing snapshot yields a default document
    /// with `found == false`.
    pub async fn load_document(&self) -> Result<Option<RemoteDocument>, SyncError> {
        if !self.config.enabled {
            return Ok(None);
        }
        let scope = self.document_scope().await;

        let response = self
            .request(ResponseKind::DocumentData, self.config.load_timeout, |request_id| {
                ClientMessage::LoadDocument {
                    request_id,
                    document_id: Some(scope),
                }
            })
            .await?;

        match response {
            ServerMessage::DocumentData {
                document_id,
                payload,
                server_timestamp,
                found,
                ..
            } => {
                let remote = RemoteDocument::decode(document_id, &payload, server_timestamp, found)
                    .map_err(|e| SyncError::Payload(e.to_string()))?;
                self.shared
                    .server_version
                    .store(server_timestamp, Ordering::SeqCst);
                log::debug!("Loaded {} elements", remote.state.elements.len());
                Ok(Some(remote))
            }
            ServerMessage::RequestFailed { message, .. } => Err(SyncError::Gateway(message)),
            other => Err(SyncError::Transport(format!("unexpected response {other:?}"))),
        }
    }

    /// Save a batch of assets. Each id lands in exactly one of the lists.
    pub async fn save_assets(&self, uploads: Vec<AssetUpload>) -> AssetSaveOutcome {
        let ids: Vec<String> = uploads.iter().map(|a| a.id.clone()).collect();
        if !self.config.enabled {
            return AssetSaveOutcome {
                saved: ids,
                errored: Vec::new(),
            };
        }
        if ids.is_empty() {
            return AssetSaveOutcome::default();
        }

        let response = self
            .request(ResponseKind::SaveAssetsAck, self.config.load_timeout, |request_id| {
                ClientMessage::SaveAssets {
                    request_id,
                    assets: uploads,
                    timestamp: now_millis(),
                }
            })
            .await;

        match response {
            Ok(ServerMessage::SaveAssetsAck {
                success: true,
                saved,
                errored,
                ..
            }) => AssetSaveOutcome {
                saved: saved.into_iter().filter(|id| ids.contains(id)).collect(),
                errored: errored.into_iter().filter(|id| ids.contains(id)).collect(),
            },
            Ok(_) => AssetSaveOutcome {
                saved: Vec::new(),
                errored: ids,
            },
            Err(e) => {
                log::warn!("Asset save failed: {e}");
                AssetSaveOutcome {
                    saved: Vec::new(),
                    errored: ids,
                }
            }
        }
    }

    /// Load a batch of assets. An empty id list never touches the network.
    pub async fn load_assets(&self, ids: &[String]) -> AssetLoadOutcome {
        if !self.config.enabled || ids.is_empty() {
            return AssetLoadOutcome::default();
        }

        let requested = ids.to_vec();
        let response = self
            .request(ResponseKind::AssetsData, self.config.load_timeout, |request_id| {
                ClientMessage::LoadAssets {
                    request_id,
                    ids: requested,
                }
            })
            .await;

        match response {
            Ok(ServerMessage::AssetsData {
                assets, missing, ..
            }) => AssetLoadOutcome {
                loaded: assets,
                errored: missing,
            },
            Ok(other) => {
                log::warn!("Asset load not served: {other:?}");
                AssetLoadOutcome {
                    loaded: Vec::new(),
                    errored: ids.to_vec(),
                }
            }
            Err(e) => {
                log::warn!("Asset load failed: {e}");
                AssetLoadOutcome {
                    loaded: Vec::new(),
                    errored: ids.to_vec(),
                }
            }
        }
    }

    pub async fn join_room(&self, room_id: &str) -> Result<(), SyncError> {
        self.connect().await?;
        self.send(&ClientMessage::JoinRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    pub async fn leave_room(&self, room_id: &str) -> Result<(), SyncError> {
        self.connect().await?;
        self.send(&ClientMessage::LeaveRoom {
            room_id: room_id.to_string(),
        })
        .await
    }

    /// Relay an edit to the room with guaranteed delivery.
    pub async fn broadcast(&self, room_id: &str, payload: Vec<u8>, iv: Vec<u8>) -> Result<(), SyncError> {
        self.send_broadcast(room_id, payload, iv, false).await
    }

    /// Relay an ephemeral edit (cursor, selection) that may be dropped.
    pub async fn broadcast_volatile(
        &self,
        room_id: &str,
        payload: Vec<u8>,
        iv: Vec<u8>,
    ) -> Result<(), SyncError> {
        self.send_broadcast(room_id, payload, iv, true).await
    }

    async fn send_broadcast(
        &self,
        room_id: &str,
        payload: Vec<u8>,
        iv: Vec<u8>,
        volatile: bool,
    ) -> Result<(), SyncError> {
        self.connect().await?;
        self.send(&ClientMessage::Broadcast {
            room_id: room_id.to_string(),
            payload,
            iv,
            volatile,
        })
        .await
    }

    /// Send a keepalive; the reply arrives as [`SyncEvent::Pong`].
    pub async fn ping(&self) -> Result<(), SyncError> {
        self.connect().await?;
        self.send(&ClientMessage::Ping).await
    }

    /// Register the update callback, replacing any previous one.
    pub async fn on_remote_update<F>(&self, callback: F)
    where
        F: Fn(RemoteDocument) + Send + Sync + 'static,
    {
        *self.shared.callback.write().await = Some(Arc::new(callback));
    }

    /// Switch the document addressed by later saves, loads and update
    /// filtering. In-flight requests keep their original scope.
    pub async fn set_document_scope(&self, document_id: impl Into<String>) {
        let document_id = document_id.into();
        log::info!("Switched document scope to {document_id}");
        *self.shared.scope.write().await = document_id;
    }

    pub async fn document_scope(&self) -> String {
        self.shared.scope.read().await.clone()
    }

    /// Tear down the connection. Outstanding requests fail with
    /// [`SyncError::ConnectionClosed`].
    pub async fn disconnect(&self) {
        let mut link = self.link.lock().await;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(current) = link.take() {
            current.shutdown();
            log::info!("Disconnected from {}", self.config.endpoint);
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
        *self.shared.connection_id.write().await = None;
        self.shared.pending.abandon_all();
        self.shared.emit(SyncEvent::Disconnected);
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Id assigned by the server, while connected.
    pub async fn connection_id(&self) -> Option<ConnectionId> {
        *self.shared.connection_id.read().await
    }

    /// Timestamp of the last acknowledged save or load; -1 before any.
    pub fn server_version(&self) -> i64 {
        self.shared.server_version.load(Ordering::SeqCst)
    }

    pub fn set_server_version(&self, version: i64) {
        self.shared.server_version.store(version, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    /// Requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }
}
