//! WebSocket sync server with room-based edit relay and snapshot persistence.
//!
//! Architecture:
//! ```text
//! Client A ──┐                ┌── RoomRegistry ── BroadcastRelay ──► peers in room
//!             ├── connection ─┤
//! Client B ──┘     task       └── SessionHandler ── Gateway (RocksDB | memory)
//!                                        │
//!                                        └── SnapshotUpdate ──► every other client
//! ```
//!
//! Each connection task owns its WebSocket and drains two outbound queues
//! registered in the [`RoomRegistry`]: a reliable queue that never drops and
//! a bounded volatile queue that drops under backpressure. Persistence
//! requests go to one session worker per connection, which handles them in
//! arrival order and answers through the reliable queue. A slow store call
//! never holds up relaying for the same connection.

use std::error::Error;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::http;
use crate::protocol::{ClientMessage, ConnectionId, ProtocolError, ServerMessage};
use crate::registry::{ConnectionHandle, ConnectionQueues, RoomRegistry};
use crate::relay::BroadcastRelay;
use crate::session::SessionHandler;
use crate::storage::{Gateway, GatewayError, MemoryGateway, RocksGateway, StoreConfig};

type BoxError = Box<dyn Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket address to bind to
    pub bind_addr: String,
    /// Address for the named-document REST surface (None = disabled)
    pub http_addr: Option<String>,
    /// Frames a connection's volatile queue holds before dropping
    pub volatile_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            http_addr: None,
            volatile_capacity: 64,
            storage_path: None,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// State shared by every connection task.
struct ServerContext {
    registry: Arc<RoomRegistry>,
    relay: Arc<BroadcastRelay>,
    sessions: Arc<SessionHandler>,
    stats: RwLock<ServerStats>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<dyn Gateway>,
    ctx: Arc<ServerContext>,
    local_addr: OnceLock<SocketAddr>,
}

impl SyncServer {
    /// Create a server, opening RocksDB storage if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, GatewayError> {
        let gateway: Arc<dyn Gateway> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(RocksGateway::open(store_config)?)
            }
            None => {
                log::warn!("No storage path configured; snapshots are kept in memory only");
                Arc::new(MemoryGateway::new())
            }
        };
        Ok(Self::with_gateway(config, gateway))
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::with_gateway(ServerConfig::default(), Arc::new(MemoryGateway::new()))
    }

    /// Create over an existing gateway.
    pub fn with_gateway(config: ServerConfig, gateway: Arc<dyn Gateway>) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.volatile_capacity));
        let relay = Arc::new(BroadcastRelay::new(registry.clone()));
        let sessions = Arc::new(SessionHandler::new(gateway.clone(), relay.clone()));
        Self {
            config,
            gateway,
            ctx: Arc::new(ServerContext {
                registry,
                relay,
                sessions,
                stats: RwLock::new(ServerStats::default()),
            }),
            local_addr: OnceLock::new(),
        }
    }

    /// Bind the configured addresses and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        if let Some(http_addr) = &self.config.http_addr {
            let listener = TcpListener::bind(http_addr).await?;
            log::info!("REST surface listening on http://{http_addr}");
            let app = http::router(self.gateway.clone(), self.ctx.registry.clone());
            tokio::spawn(async move {
                if let Err(e) = axum::serve(listener, app).await {
                    log::error!("REST surface stopped: {e}");
                }
            });
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on ws://{}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Accept WebSocket connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        if let Ok(addr) = listener.local_addr() {
            let _ = self.local_addr.set(addr);
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to cleanup.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: Arc<ServerContext>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let id = ConnectionId::new();
        let welcome = ServerMessage::Welcome { connection_id: id }.encode()?;
        let (handle, queues) = ctx.registry.register(id).await;
        log::info!("WebSocket connection {id} established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Ends once the loop drops its sender and the backlog is drained.
        let (requests, backlog) = mpsc::unbounded_channel();
        tokio::spawn(Self::session_worker(ctx.sessions.clone(), handle.clone(), backlog));

        let result = match ws_sender.send(Message::Binary(welcome.into())).await {
            Ok(()) => {
                Self::connection_loop(&ctx, &handle, requests, ws_sender, ws_receiver, queues).await
            }
            Err(e) => Err(e.into()),
        };

        // Cleanup runs whatever ended the loop.
        let changes = ctx.registry.unregister(id).await;
        for change in changes {
            if change.members.is_empty() {
                continue;
            }
            let msg = ServerMessage::RoomMembership {
                room_id: change.room_id.clone(),
                members: change.members,
            };
            if let Err(e) = ctx.relay.notify_room(&change.room_id, None, &msg).await {
                log::warn!("Failed to announce departure of {id}: {e}");
            }
        }

        {
            let room_count = ctx.registry.room_count().await;
            let mut s = ctx.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = room_count;
        }
        log::info!("Connection {id} from {addr} closed");

        result
    }

    /// Handle one connection's persistence requests strictly one at a time,
    /// so a save is never overtaken by a later save from the same client.
    async fn session_worker(
        sessions: Arc<SessionHandler>,
        handle: ConnectionHandle,
        mut backlog: mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        while let Some(request) = backlog.recv().await {
            if let Err(e) = sessions.handle(&handle, request).await {
                log::error!("Persistence request from {} failed: {e}", handle.id());
            }
        }
    }

    async fn connection_loop(
        ctx: &Arc<ServerContext>,
        handle: &ConnectionHandle,
        requests: mpsc::UnboundedSender<ClientMessage>,
        mut ws_sender: WsSink,
        mut ws_receiver: WsSource,
        mut queues: ConnectionQueues,
    ) -> Result<(), BoxError> {
        let id = handle.id();
        loop {
            tokio::select! {
                biased;

                // Reliable frames go out before anything else.
                Some(frame) = queues.reliable.recv() => {
                    ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            {
                                let mut s = ctx.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += bytes.len() as u64;
                            }
                            match ClientMessage::decode(&bytes) {
                                Ok(client_msg) => {
                                    let handled =
                                        Self::dispatch(ctx, handle, &requests, client_msg).await;
                                    if let Err(e) = handled {
                                        log::warn!("Failed to handle message from {id}: {e}");
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {id}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error on {id}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                Some(frame) = queues.volatile.recv() => {
                    ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        ctx: &Arc<ServerContext>,
        handle: &ConnectionHandle,
        requests: &mpsc::UnboundedSender<ClientMessage>,
        msg: ClientMessage,
    ) -> Result<(), ProtocolError> {
        let id = handle.id();
        match msg {
            ClientMessage::JoinRoom { room_id } => {
                let outcome = match ctx.registry.join(id, &room_id).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        log::warn!("Join of {room_id} rejected: {e}");
                        return Ok(());
                    }
                };

                if outcome.is_first() {
                    let first = ServerMessage::FirstInRoom {
                        room_id: room_id.clone(),
                    };
                    handle.send_reliable(Arc::new(first.encode()?));
                } else if outcome.newly_joined {
                    let joined = ServerMessage::PeerJoined {
                        room_id: room_id.clone(),
                        connection_id: id,
                    };
                    ctx.relay.notify_room(&room_id, Some(id), &joined).await?;
                }

                let membership = ServerMessage::RoomMembership {
                    room_id: room_id.clone(),
                    members: outcome.members,
                };
                ctx.relay.notify_room(&room_id, None, &membership).await?;

                ctx.stats.write().await.active_rooms = ctx.registry.room_count().await;
                log::info!("Connection {id} joined room {room_id}");
            }

            ClientMessage::LeaveRoom { room_id } => {
                if let Some(change) = ctx.registry.leave(id, &room_id).await {
                    if !change.members.is_empty() {
                        let membership = ServerMessage::RoomMembership {
                            room_id: change.room_id.clone(),
                            members: change.members,
                        };
                        ctx.relay.notify_room(&change.room_id, None, &membership).await?;
                    }
                    log::info!("Connection {id} left room {room_id}");
                }
            }

            ClientMessage::Broadcast {
                room_id,
                payload,
                iv,
                volatile,
            } => {
                let relayed = ServerMessage::Broadcast { payload, iv };
                if volatile {
                    ctx.relay.relay_volatile(id, &room_id, &relayed).await?;
                } else {
                    ctx.relay.relay_reliable(id, &room_id, &relayed).await?;
                }
            }

            ClientMessage::Ping => {
                handle.send_reliable(Arc::new(ServerMessage::Pong.encode()?));
            }

            request @ (ClientMessage::SaveDocument { .. }
            | ClientMessage::LoadDocument { .. }
            | ClientMessage::SaveAssets { .. }
            | ClientMessage::LoadAssets { .. }) => {
                if requests.send(request).is_err() {
                    log::warn!("Session worker for {id} is gone; request dropped");
                }
            }
        }
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.ctx.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Address actually bound, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.ctx.registry
    }

    pub fn relay(&self) -> &Arc<BroadcastRelay> {
        &self.ctx.relay
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }
}
