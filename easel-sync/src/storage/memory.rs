//! In-memory gateway, used when no storage path is configured.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{
    distinct_ids, validate_asset, AssetLookup, Gateway, GatewayError, PayloadPatch, SnapshotRecord,
};
use crate::protocol::{now_millis, AssetRecord};

/// Volatile gateway backed by two hash maps.
#[derive(Default)]
pub struct MemoryGateway {
    snapshots: RwLock<HashMap<String, SnapshotRecord>>,
    assets: RwLock<HashMap<String, StoredAsset>>,
}

struct StoredAsset {
    record: AssetRecord,
    batch_timestamp: i64,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot_count(&self) -> usize {
        read(&self.snapshots).len()
    }

    pub fn asset_count(&self) -> usize {
        read(&self.assets).len()
    }

    /// Client timestamp of the batch that last wrote asset `id`.
    pub fn asset_batch_timestamp(&self, id: &str) -> Option<i64> {
        read(&self.assets).get(id).map(|stored| stored.batch_timestamp)
    }
}

// A poisoned map is still structurally valid: every write below replaces
// whole entries.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl Gateway for MemoryGateway {
    fn upsert_snapshot(
        &self,
        document_id: &str,
        payload: &[u8],
        client_timestamp: i64,
    ) -> Result<i64, GatewayError> {
        let now = now_millis();
        let mut snapshots = write(&self.snapshots);
        let record = snapshots
            .entry(document_id.to_string())
            .or_insert_with(|| SnapshotRecord::new(document_id, Vec::new(), now));
        record.payload = payload.to_vec();
        record.client_timestamp = client_timestamp;
        record.server_timestamp = now;
        record.updated_at = now;
        Ok(now)
    }

    fn get_snapshot(&self, document_id: &str) -> Result<Option<SnapshotRecord>, GatewayError> {
        Ok(read(&self.snapshots).get(document_id).cloned())
    }

    fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, GatewayError> {
        let mut all: Vec<SnapshotRecord> = read(&self.snapshots).values().cloned().collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    fn create_snapshot(&self, record: &SnapshotRecord) -> Result<(), GatewayError> {
        let mut snapshots = write(&self.snapshots);
        if snapshots.contains_key(&record.document_id) {
            return Err(GatewayError::Conflict(record.document_id.clone()));
        }
        snapshots.insert(record.document_id.clone(), record.clone());
        Ok(())
    }

    fn update_snapshot(
        &self,
        document_id: &str,
        name: Option<String>,
        patch: Option<PayloadPatch>,
    ) -> Result<bool, GatewayError> {
        let mut snapshots = write(&self.snapshots);
        let Some(record) = snapshots.get_mut(document_id) else {
            return Ok(false);
        };
        if let Some(name) = name {
            record.name = Some(name);
        }
        if let Some(patch) = patch {
            record.payload = patch(&record.payload);
        }
        record.updated_at = now_millis();
        Ok(true)
    }

    fn delete_snapshot(&self, document_id: &str) -> Result<bool, GatewayError> {
        Ok(write(&self.snapshots).remove(document_id).is_some())
    }

    fn upsert_asset(&self, asset: &AssetRecord, batch_timestamp: i64) -> Result<(), GatewayError> {
        validate_asset(asset)?;
        let stored = StoredAsset {
            record: asset.clone(),
            batch_timestamp,
        };
        write(&self.assets).insert(asset.id.clone(), stored);
        Ok(())
    }

    fn get_assets(&self, ids: &[String]) -> Result<AssetLookup, GatewayError> {
        let assets = read(&self.assets);
        let mut lookup = AssetLookup::default();
        for id in distinct_ids(ids) {
            match assets.get(&id) {
                Some(stored) => lookup.found.push(stored.record.clone()),
                None => lookup.missing.push(id),
            }
        }
        Ok(lookup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn png(id: &str) -> AssetRecord {
        AssetRecord {
            id: id.into(),
            data_url: "data:image/png;base64,iVBORw0KGgo=".into(),
            mime_type: "image/png".into(),
            created: 1,
            last_retrieved: 2,
            version: 1,
        }
    }

    #[test]
    fn test_upsert_replaces_snapshot() {
        let gw = MemoryGateway::new();
        gw.upsert_snapshot("doc", b"first", 1).unwrap();
        gw.upsert_snapshot("doc", b"second", 2).unwrap();

        let record = gw.get_snapshot("doc").unwrap().unwrap();
        assert_eq!(record.payload, b"second");
        assert_eq!(record.client_timestamp, 2);
        assert_eq!(gw.snapshot_count(), 1);
    }

    #[test]
    fn test_older_write_arriving_later_wins() {
        let gw = MemoryGateway::new();
        gw.upsert_snapshot("doc", b"newer", 2000).unwrap();
        gw.upsert_snapshot("doc", b"older", 1000).unwrap();
        assert_eq!(gw.get_snapshot("doc").unwrap().unwrap().payload, b"older");
    }

    #[test]
    fn test_upsert_keeps_name_and_created_at() {
        let gw = MemoryGateway::new();
        let mut record = SnapshotRecord::new("tab", b"{}".to_vec(), 10);
        record.name = Some("Sketch".into());
        gw.create_snapshot(&record).unwrap();

        gw.upsert_snapshot("tab", b"{\"elements\":[]}", 99).unwrap();
        let stored = gw.get_snapshot("tab").unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Sketch"));
        assert_eq!(stored.created_at, 10);
        assert!(stored.server_timestamp >= 10);
    }

    #[test]
    fn test_create_conflict_update_delete() {
        let gw = MemoryGateway::new();
        let record = SnapshotRecord::new("tab", Vec::new(), 1);
        gw.create_snapshot(&record).unwrap();
        assert!(matches!(gw.create_snapshot(&record), Err(GatewayError::Conflict(_))));

        assert!(gw.update_snapshot("tab", Some("Renamed".into()), None).unwrap());
        assert_eq!(gw.get_snapshot("tab").unwrap().unwrap().payload, b"");
        assert!(!gw.update_snapshot("nope", Some("x".into()), None).unwrap());
        assert_eq!(gw.get_snapshot("tab").unwrap().unwrap().name.as_deref(), Some("Renamed"));

        assert!(gw.delete_snapshot("tab").unwrap());
        assert!(!gw.delete_snapshot("tab").unwrap());
    }

    #[test]
    fn test_patch_sees_current_payload() {
        let gw = MemoryGateway::new();
        gw.upsert_snapshot("tab", b"base", 1).unwrap();
        let patch: PayloadPatch = Box::new(|current: &[u8]| [current, &b"+tail"[..]].concat());
        assert!(gw.update_snapshot("tab", None, Some(patch)).unwrap());
        assert_eq!(gw.get_snapshot("tab").unwrap().unwrap().payload, b"base+tail");
    }

    #[test]
    fn test_save_during_patch_is_not_overwritten() {
        let gw = MemoryGateway::new();
        gw.upsert_snapshot("tab", b"base", 1).unwrap();

        let (patching_tx, patching_rx) = mpsc::channel();
        thread::scope(|s| {
            s.spawn(|| {
                let patch: PayloadPatch = Box::new(move |current: &[u8]| {
                    patching_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    [current, &b"+patch"[..]].concat()
                });
                assert!(gw.update_snapshot("tab", None, Some(patch)).unwrap());
            });
            patching_rx.recv().unwrap();
            // Waits for the patch, then replaces its result.
            gw.upsert_snapshot("tab", b"live save", 2).unwrap();
        });

        assert_eq!(gw.get_snapshot("tab").unwrap().unwrap().payload, b"live save");
    }

    #[test]
    fn test_asset_keeps_batch_timestamp() {
        let gw = MemoryGateway::new();
        gw.upsert_asset(&png("a"), 1234).unwrap();
        gw.upsert_asset(&png("a"), 5678).unwrap();
        assert_eq!(gw.asset_batch_timestamp("a"), Some(5678));
        assert_eq!(gw.asset_batch_timestamp("b"), None);
    }

    #[test]
    fn test_get_assets_splits_found_and_missing() {
        let gw = MemoryGateway::new();
        gw.upsert_asset(&png("a"), 1).unwrap();
        gw.upsert_asset(&png("b"), 1).unwrap();

        let ids = vec!["a".to_string(), "x".into(), "b".into(), "x".into()];
        let lookup = gw.get_assets(&ids).unwrap();
        let mut found: Vec<_> = lookup.found.iter().map(|a| a.id.as_str()).collect();
        found.sort();
        assert_eq!(found, vec!["a", "b"]);
        assert_eq!(lookup.missing, vec!["x"]);
    }

    #[test]
    fn test_invalid_asset_not_stored() {
        let gw = MemoryGateway::new();
        let mut bad = png("bad");
        bad.data_url = "not-a-data-url".into();
        assert!(gw.upsert_asset(&bad, 1).is_err());
        assert_eq!(gw.asset_count(), 0);
    }
}
