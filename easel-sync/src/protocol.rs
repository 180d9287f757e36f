//! Binary wire protocol between canvas clients and the sync server.
//!
//! Every WebSocket binary frame carries exactly one bincode-encoded message:
//! ```text
//! client ──► server   ClientMessage  (join, leave, broadcast, save/load requests)
//! server ──► client   ServerMessage  (room events, relayed edits, acks, data, pushes)
//! ```
//!
//! Request/response pairs are correlated by [`RequestId`], never by arrival
//! order. Document and edit payloads are opaque byte blobs at this layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Document id used when a request does not name one.
pub const DEFAULT_DOCUMENT_ID: &str = "singleton";

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Transport-level identity of one client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

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
        write!(f, "{}", self.0)
    }
}

/// Caller-generated id correlating a request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An asset as uploaded by a client. Missing timestamps and version are
/// filled in by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetUpload {
    pub id: String,
    /// `data:<mime>;base64,<body>` URL
    pub data_url: String,
    pub mime_type: String,
    pub created: Option<i64>,
    pub last_retrieved: Option<i64>,
    pub version: Option<u32>,
}

impl AssetUpload {
    pub fn new(id: impl Into<String>, data_url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data_url: data_url.into(),
            mime_type: mime_type.into(),
            created: None,
            last_retrieved: None,
            version: None,
        }
    }

    /// Materialize into a stored record, defaulting absent fields.
    pub fn into_record(self, now: i64) -> AssetRecord {
        AssetRecord {
            id: self.id,
            data_url: self.data_url,
            mime_type: self.mime_type,
            created: self.created.unwrap_or(now),
            last_retrieved: self.last_retrieved.unwrap_or(now),
            version: self.version.unwrap_or(1),
        }
    }
}

/// A fully materialized asset as stored and returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub data_url: String,
    pub mime_type: String,
    pub created: i64,
    pub last_retrieved: i64,
    pub version: u32,
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
    /// Edit event relayed to the other members of `room_id`.
    /// `volatile` events may be dropped under backpressure.
    Broadcast {
        room_id: String,
        payload: Vec<u8>,
        iv: Vec<u8>,
        volatile: bool,
    },
    SaveDocument {
        request_id: RequestId,
        document_id: Option<String>,
        payload: Vec<u8>,
        client_timestamp: i64,
    },
    LoadDocument {
        request_id: RequestId,
        document_id: Option<String>,
    },
    SaveAssets {
        request_id: RequestId,
        assets: Vec<AssetUpload>,
        timestamp: i64,
    },
    LoadAssets {
        request_id: RequestId,
        ids: Vec<String>,
    },
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// First frame on every connection.
    Welcome {
        connection_id: ConnectionId,
    },
    /// The receiver is the only member of `room_id`.
    FirstInRoom {
        room_id: String,
    },
    PeerJoined {
        room_id: String,
        connection_id: ConnectionId,
    },
    /// Full membership of `room_id` after a join or leave.
    RoomMembership {
        room_id: String,
        members: Vec<ConnectionId>,
    },
    /// A relayed edit event.
    Broadcast {
        payload: Vec<u8>,
        iv: Vec<u8>,
    },
    SaveAck {
        request_id: RequestId,
        success: bool,
        server_timestamp: Option<i64>,
        error: Option<String>,
    },
    /// `found == false` means no snapshot exists yet and `payload` is empty.
    DocumentData {
        request_id: RequestId,
        document_id: String,
        payload: Vec<u8>,
        server_timestamp: i64,
        found: bool,
    },
    SaveAssetsAck {
        request_id: RequestId,
        success: bool,
        saved: Vec<String>,
        errored: Vec<String>,
    },
    AssetsData {
        request_id: RequestId,
        assets: Vec<AssetRecord>,
        missing: Vec<String>,
    },
    /// Pushed to other connections after a successful save.
    SnapshotUpdate {
        document_id: String,
        payload: Vec<u8>,
        server_timestamp: i64,
    },
    RequestFailed {
        request_id: RequestId,
        message: String,
    },
    Pong,
}

/// The kind of response a pending request is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    SaveAck,
    DocumentData,
    SaveAssetsAck,
    AssetsData,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        encode_frame(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode_frame(bytes)
    }

    /// Request id for response messages, `None` for pushes and room events.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Self::SaveAck { request_id, .. }
            | Self::DocumentData { request_id, .. }
            | Self::SaveAssetsAck { request_id, .. }
            | Self::AssetsData { request_id, .. }
            | Self::RequestFailed { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    /// Response kind, `None` for `RequestFailed` (which answers any kind)
    /// and for non-response messages.
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            Self::SaveAck { .. } => Some(ResponseKind::SaveAck),
            Self::DocumentData { .. } => Some(ResponseKind::DocumentData),
            Self::SaveAssetsAck { .. } => Some(ResponseKind::SaveAssetsAck),
            Self::AssetsData { .. } => Some(ResponseKind::AssetsData),
            _ => None,
        }
    }
}

fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_frame<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(msg)
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
