//! Persistence gateway: key-value upsert/find over two collections.
//!
//! ```text
//! ┌────────────────┐   upsert/find    ┌──────────────────────────────┐
//! │ SessionHandler │ ───────────────► │ Gateway                      │
//! │ REST surface   │                  │  snapshots   (by doc id)     │
//! └────────────────┘                  │  assets      (by asset id)   │
//!                                     │  asset_index (by asset id)   │
//!                                     └──────┬───────────────┬───────┘
//!                                            ▼               ▼
//!                                     RocksGateway     MemoryGateway
//! ```
//!
//! Every operation is independent per key. Snapshot writes replace the
//! whole record (last write by arrival wins); asset writes overwrite
//! unconditionally.

pub mod memory;
pub mod rocks;

pub use memory::MemoryGateway;
pub use rocks::{AssetIndexEntry, RocksGateway, StoreConfig};

use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

use crate::protocol::AssetRecord;

/// A persisted document snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub document_id: String,
    /// Display name, set through the named-document surface
    pub name: Option<String>,
    /// Opaque editor state
    pub payload: Vec<u8>,
    /// Logical timestamp supplied by the last writer
    pub client_timestamp: i64,
    /// Wall clock at the gateway when the last write was received
    pub server_timestamp: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SnapshotRecord {
    pub fn new(document_id: impl Into<String>, payload: Vec<u8>, now: i64) -> Self {
        Self {
            document_id: document_id.into(),
            name: None,
            payload,
            client_timestamp: now,
            server_timestamp: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of a batch asset lookup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetLookup {
    pub found: Vec<AssetRecord>,
    /// Requested ids with no stored record
    pub missing: Vec<String>,
}

/// Gateway errors.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Invalid asset '{id}': {reason}")]
    InvalidAsset { id: String, reason: String },
    #[error("Document already exists: {0}")]
    Conflict(String),
    #[error("Store task failed: {0}")]
    TaskFailed(String),
}

impl From<rocksdb::Error> for GatewayError {
    fn from(e: rocksdb::Error) -> Self {
        GatewayError::Database(e.to_string())
    }
}

/// Rewrites a stored payload. Runs while the document is locked, so no other
/// write to the same id lands between the read and the write.
pub type PayloadPatch = Box<dyn FnOnce(&[u8]) -> Vec<u8> + Send>;

/// Key-value contract over snapshots and assets.
pub trait Gateway: Send + Sync {
    /// Replace the snapshot for `document_id`, keeping its name and creation
    /// time. Returns the receipt timestamp.
    fn upsert_snapshot(
        &self,
        document_id: &str,
        payload: &[u8],
        client_timestamp: i64,
    ) -> Result<i64, GatewayError>;

    fn get_snapshot(&self, document_id: &str) -> Result<Option<SnapshotRecord>, GatewayError>;

    /// All snapshots, most recently updated first.
    fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, GatewayError>;

    /// Insert a new snapshot. Fails with [`GatewayError::Conflict`] if the id is taken.
    fn create_snapshot(&self, record: &SnapshotRecord) -> Result<(), GatewayError>;

    /// Rename and/or rewrite the payload through `patch`, which sees the
    /// current payload. Returns `false` if the snapshot does not exist.
    fn update_snapshot(
        &self,
        document_id: &str,
        name: Option<String>,
        patch: Option<PayloadPatch>,
    ) -> Result<bool, GatewayError>;

    /// Returns `false` if the snapshot did not exist.
    fn delete_snapshot(&self, document_id: &str) -> Result<bool, GatewayError>;

    /// Store one asset along with the client timestamp of the batch it came
    /// in. Failures concern this record only.
    fn upsert_asset(&self, asset: &AssetRecord, batch_timestamp: i64) -> Result<(), GatewayError>;

    /// Fetch a batch of assets. `missing` is exactly the requested ids that
    /// were not found.
    fn get_assets(&self, ids: &[String]) -> Result<AssetLookup, GatewayError>;
}

/// Run a gateway call on the blocking pool so store latency never stalls
/// the async workers.
pub async fn run_blocking<T, F>(gateway: &Arc<dyn Gateway>, f: F) -> Result<T, GatewayError>
where
    T: Send + 'static,
    F: FnOnce(&dyn Gateway) -> Result<T, GatewayError> + Send + 'static,
{
    let gateway = gateway.clone();
    tokio::task::spawn_blocking(move || f(gateway.as_ref()))
        .await
        .map_err(|e| GatewayError::TaskFailed(e.to_string()))?
}

/// Reject assets that cannot be stored as-is.
pub fn validate_asset(asset: &AssetRecord) -> Result<(), GatewayError> {
    let invalid = |reason: &str| GatewayError::InvalidAsset {
        id: asset.id.clone(),
        reason: reason.to_string(),
    };

    if asset.id.trim().is_empty() {
        return Err(invalid("empty id"));
    }
    if asset.mime_type.trim().is_empty() {
        return Err(invalid("empty MIME type"));
    }
    let rest = asset
        .data_url
        .strip_prefix("data:")
        .ok_or_else(|| invalid("not a data URL"))?;
    let (header, body) = rest
        .split_once(',')
        .ok_or_else(|| invalid("data URL has no body"))?;
    if header.ends_with(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| invalid(&format!("bad base64 body: {e}")))?;
    }
    Ok(())
}

/// Distinct requested ids in request order.
pub(crate) fn distinct_ids(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asset(id: &str, data_url: &str) -> AssetRecord {
        AssetRecord {
            id: id.into(),
            data_url: data_url.into(),
            mime_type: "image/png".into(),
            created: 1,
            last_retrieved: 1,
            version: 1,
        }
    }

    #[test]
    fn test_validate_accepts_base64_data_url() {
        assert!(validate_asset(&asset("a", "data:image/png;base64,iVBORw0KGgo=")).is_ok());
        assert!(validate_asset(&asset("b", "data:text/plain,hello")).is_ok());
    }

    #[test]
    fn test_validate_rejects_malformed() {
        assert!(validate_asset(&asset("", "data:image/png;base64,AAAA")).is_err());
        assert!(validate_asset(&asset("a", "http://example.com/x.png")).is_err());
        assert!(validate_asset(&asset("a", "data:image/png;base64")).is_err());
        assert!(validate_asset(&asset("a", "data:image/png;base64,@@not-base64@@")).is_err());

        let mut no_mime = asset("a", "data:image/png;base64,AAAA");
        no_mime.mime_type = String::new();
        assert!(matches!(
            validate_asset(&no_mime),
            Err(GatewayError::InvalidAsset { .. })
        ));
    }

    #[test]
    fn test_distinct_ids_keeps_order() {
        let ids = vec!["b".to_string(), "a".into(), "b".into(), "c".into(), "a".into()];
        assert_eq!(distinct_ids(&ids), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_gateway_error_display() {
        let err = GatewayError::Conflict("tab".into());
        assert!(err.to_string().contains("already exists"));
        let err = GatewayError::Database("test".into());
        assert!(err.to_string().contains("Database error"));
    }
}
