//! # easel-sync: Real-time state sync relay for a collaborative canvas
//!
//! Relays edit events between clients editing the same canvas and persists
//! the latest document snapshot and embedded assets.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket       ┌──────────────┐
//! │ SyncAdapter │ ◄─────────────────► │ SyncServer   │
//! │ (per editor)│     Binary Proto    │ (central)    │
//! └─────────────┘                     └──────┬───────┘
//!                                            │
//!                       ┌────────────────────┼────────────────────┐
//!                       ▼                    ▼                    ▼
//!               ┌──────────────┐    ┌────────────────┐    ┌──────────────┐
//!               │ RoomRegistry │◄───│ BroadcastRelay │◄───│SessionHandler│
//!               │ (membership) │    │ (fan-out)      │    │ (save/load)  │
//!               └──────────────┘    └────────────────┘    └──────┬───────┘
//!                                                                ▼
//!                                                         ┌──────────────┐
//!                                                         │ Gateway      │
//!                                                         │ RocksDB/mem  │
//!                                                         └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded client/server messages)
//! - [`registry`]: Connection and room membership
//! - [`relay`]: Reliable and volatile fan-out to room peers
//! - [`storage`]: Persistence gateway over snapshots and assets
//! - [`session`]: Save/load request handling
//! - [`server`]: WebSocket sync server
//! - [`client`]: Client sync adapter with request correlation
//! - [`http`]: Named-document REST surface

pub mod protocol;
pub mod registry;
pub mod relay;
pub mod storage;
pub mod session;
pub mod server;
pub mod client;
pub mod http;

// Re-exports for convenience
pub use protocol::{
    AssetRecord, AssetUpload, ClientMessage, ConnectionId, ProtocolError, RequestId,
    ServerMessage, DEFAULT_DOCUMENT_ID,
};
pub use registry::{ConnectionHandle, JoinOutcome, MembershipChange, RegistryError, RoomRegistry};
pub use relay::{BroadcastRelay, RelayStats};
pub use session::{AssetSaveReport, LoadedSnapshot, SavedSnapshot, SessionHandler};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use client::{
    AdapterConfig, AssetLoadOutcome, AssetSaveOutcome, ConnectionState, DocumentState,
    RemoteDocument, SyncAdapter, SyncError, SyncEvent,
};
pub use storage::{
    AssetLookup, Gateway, GatewayError, MemoryGateway, PayloadPatch, RocksGateway, SnapshotRecord,
    StoreConfig,
};
