//! Request/response handling for snapshot and asset persistence.
//!
//! Saves are last-write-wins by arrival order at the gateway. A successful
//! snapshot save is acknowledged to the requester first and then pushed to
//! every other connection as a `SnapshotUpdate`. Asset batches succeed as a
//! whole and fail per item.

use std::sync::Arc;

use crate::protocol::{
    now_millis, AssetUpload, ClientMessage, ConnectionId, ProtocolError, ServerMessage,
    DEFAULT_DOCUMENT_ID,
};
use crate::registry::{ConnectionHandle, Delivery};
use crate::relay::BroadcastRelay;
use crate::storage::{run_blocking, AssetLookup, Gateway, GatewayError};

/// A snapshot that was written to the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedSnapshot {
    pub document_id: String,
    pub payload: Vec<u8>,
    pub server_timestamp: i64,
}

/// A snapshot read, or the empty default when none exists.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedSnapshot {
    pub document_id: String,
    pub payload: Vec<u8>,
    pub server_timestamp: i64,
    pub found: bool,
}

/// Per-item outcome of an asset batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetSaveReport {
    /// `false` only when the batch itself could not run
    pub success: bool,
    pub saved: Vec<String>,
    pub errored: Vec<String>,
}

/// Serves persistence requests on behalf of connections.
pub struct SessionHandler {
    gateway: Arc<dyn Gateway>,
    relay: Arc<BroadcastRelay>,
}

impl SessionHandler {
    pub fn new(gateway: Arc<dyn Gateway>, relay: Arc<BroadcastRelay>) -> Self {
        Self { gateway, relay }
    }

    pub fn gateway(&self) -> &Arc<dyn Gateway> {
        &self.gateway
    }

    /// Serve one persistence request from `origin`, replying on its reliable
    /// queue. Non-persistence messages are ignored.
    pub async fn handle(
        &self,
        origin: &ConnectionHandle,
        request: ClientMessage,
    ) -> Result<(), ProtocolError> {
        match request {
            ClientMessage::SaveDocument {
                request_id,
                document_id,
                payload,
                client_timestamp,
            } => match self.save_document(document_id, payload, client_timestamp).await {
                Ok(saved) => {
                    reply(
                        origin,
                        &ServerMessage::SaveAck {
                            request_id,
                            success: true,
                            server_timestamp: Some(saved.server_timestamp),
                            error: None,
                        },
                    )?;
                    self.publish_update(Some(origin.id()), saved).await?;
                }
                Err(e) => {
                    log::error!("Save {request_id} from {} failed: {e}", origin.id());
                    reply(
                        origin,
                        &ServerMessage::SaveAck {
                            request_id,
                            success: false,
                            server_timestamp: None,
                            error: Some(e.to_string()),
                        },
                    )?;
                }
            },

            ClientMessage::LoadDocument {
                request_id,
                document_id,
            } => {
                let response = match self.load_document(document_id).await {
                    Ok(loaded) => ServerMessage::DocumentData {
                        request_id,
                        document_id: loaded.document_id,
                        payload: loaded.payload,
                        server_timestamp: loaded.server_timestamp,
                        found: loaded.found,
                    },
                    Err(e) => {
                        log::error!("Load {request_id} from {} failed: {e}", origin.id());
                        ServerMessage::RequestFailed {
                            request_id,
                            message: e.to_string(),
                        }
                    }
                };
                reply(origin, &response)?;
            }

            ClientMessage::SaveAssets {
                request_id,
                assets,
                timestamp,
            } => {
                let report = self.save_assets(assets, timestamp).await;
                reply(
                    origin,
                    &ServerMessage::SaveAssetsAck {
                        request_id,
                        success: report.success,
                        saved: report.saved,
                        errored: report.errored,
                    },
                )?;
            }

            ClientMessage::LoadAssets { request_id, ids } => {
                let response = match self.load_assets(ids).await {
                    Ok(lookup) => ServerMessage::AssetsData {
                        request_id,
                        assets: lookup.found,
                        missing: lookup.missing,
                    },
                    Err(e) => {
                        log::error!("Asset load {request_id} from {} failed: {e}", origin.id());
                        ServerMessage::RequestFailed {
                            request_id,
                            message: e.to_string(),
                        }
                    }
                };
                reply(origin, &response)?;
            }

            other => {
                log::debug!("Session handler ignoring non-persistence message: {other:?}");
            }
        }
        Ok(())
    }

    /// Overwrite the snapshot for `document_id` (default: singleton).
    pub async fn save_document(
        &self,
        document_id: Option<String>,
        payload: Vec<u8>,
        client_timestamp: i64,
    ) -> Result<SavedSnapshot, GatewayError> {
        let document_id = document_id.unwrap_or_else(|| DEFAULT_DOCUMENT_ID.to_string());
        let saved = run_blocking(&self.gateway, move |gw| {
            let server_timestamp = gw.upsert_snapshot(&document_id, &payload, client_timestamp)?;
            Ok(SavedSnapshot {
                document_id,
                payload,
                server_timestamp,
            })
        })
        .await?;
        log::debug!(
            "Saved snapshot {} ({} bytes) at {}",
            saved.document_id,
            saved.payload.len(),
            saved.server_timestamp
        );
        Ok(saved)
    }

    /// Read the snapshot for `document_id`. Absence yields an empty payload
    /// stamped with the current time.
    pub async fn load_document(
        &self,
        document_id: Option<String>,
    ) -> Result<LoadedSnapshot, GatewayError> {
        let document_id = document_id.unwrap_or_else(|| DEFAULT_DOCUMENT_ID.to_string());
        let lookup_id = document_id.clone();
        let record = run_blocking(&self.gateway, move |gw| gw.get_snapshot(&lookup_id)).await?;
        Ok(match record {
            Some(record) => LoadedSnapshot {
                document_id,
                payload: record.payload,
                server_timestamp: record.server_timestamp,
                found: true,
            },
            None => LoadedSnapshot {
                document_id,
                payload: Vec::new(),
                server_timestamp: now_millis(),
                found: false,
            },
        })
    }

    /// Store each asset independently. One bad asset never blocks the rest.
    /// `batch_timestamp` is the client clock when the batch was sent.
    pub async fn save_assets(
        &self,
        uploads: Vec<AssetUpload>,
        batch_timestamp: i64,
    ) -> AssetSaveReport {
        let ids: Vec<String> = uploads.iter().map(|a| a.id.clone()).collect();
        let now = now_millis();

        let batch = run_blocking(&self.gateway, move |gw| {
            let mut report = AssetSaveReport {
                success: true,
                ..AssetSaveReport::default()
            };
            for upload in uploads {
                let record = upload.into_record(now);
                match gw.upsert_asset(&record, batch_timestamp) {
                    Ok(()) => report.saved.push(record.id),
                    Err(e) => {
                        log::warn!("Asset {} not saved: {e}", record.id);
                        report.errored.push(record.id);
                    }
                }
            }
            Ok(report)
        })
        .await;

        match batch {
            Ok(report) => report,
            Err(e) => {
                log::error!("Asset batch failed: {e}");
                AssetSaveReport {
                    success: false,
                    saved: Vec::new(),
                    errored: ids,
                }
            }
        }
    }

    /// Fetch a batch of assets; `missing` holds every requested id not found.
    pub async fn load_assets(&self, ids: Vec<String>) -> Result<AssetLookup, GatewayError> {
        if ids.is_empty() {
            return Ok(AssetLookup::default());
        }
        run_blocking(&self.gateway, move |gw| gw.get_assets(&ids)).await
    }

    async fn publish_update(
        &self,
        origin: Option<ConnectionId>,
        saved: SavedSnapshot,
    ) -> Result<usize, ProtocolError> {
        let update = ServerMessage::SnapshotUpdate {
            document_id: saved.document_id,
            payload: saved.payload,
            server_timestamp: saved.server_timestamp,
        };
        self.relay.relay_global_update(origin, &update).await
    }
}

fn reply(origin: &ConnectionHandle, msg: &ServerMessage) -> Result<(), ProtocolError> {
    if origin.send_reliable(Arc::new(msg.encode()?)) == Delivery::Closed {
        log::debug!("Requester {} left before its response", origin.id());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{AssetRecord, RequestId};
    use crate::registry::{ConnectionQueues, RoomRegistry};
    use crate::storage::{MemoryGateway, PayloadPatch, SnapshotRecord};

    /// Gateway whose store is unreachable.
    struct DownGateway;

    impl Gateway for DownGateway {
        fn upsert_snapshot(&self, _: &str, _: &[u8], _: i64) -> Result<i64, GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
        fn get_snapshot(&self, _: &str) -> Result<Option<SnapshotRecord>, GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
        fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
        fn create_snapshot(&self, _: &SnapshotRecord) -> Result<(), GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
        fn update_snapshot(
            &self,
            _: &str,
            _: Option<String>,
            _: Option<PayloadPatch>,
        ) -> Result<bool, GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
        fn delete_snapshot(&self, _: &str) -> Result<bool, GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
        fn upsert_asset(&self, _: &AssetRecord, _: i64) -> Result<(), GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
        fn get_assets(&self, _: &[String]) -> Result<AssetLookup, GatewayError> {
            Err(GatewayError::Database("store offline".into()))
        }
    }

    struct Fixture {
        registry: Arc<RoomRegistry>,
        handler: SessionHandler,
    }

    fn fixture(gateway: Arc<dyn Gateway>) -> Fixture {
        let registry = Arc::new(RoomRegistry::new(8));
        let relay = Arc::new(BroadcastRelay::new(registry.clone()));
        Fixture {
            registry,
            handler: SessionHandler::new(gateway, relay),
        }
    }

    async fn connect(registry: &RoomRegistry) -> (ConnectionHandle, ConnectionQueues) {
        registry.register(ConnectionId::new()).await
    }

    async fn next(queues: &mut ConnectionQueues) -> ServerMessage {
        let frame = queues.reliable.recv().await.unwrap();
        ServerMessage::decode(&frame).unwrap()
    }

    fn png(id: &str) -> AssetUpload {
        AssetUpload::new(id, "data:image/png;base64,iVBORw0KGgo=", "image/png")
    }

    #[tokio::test]
    async fn test_save_then_load_roundtrips_payload() {
        let f = fixture(Arc::new(MemoryGateway::new()));
        let payload = br#"{"elements":[{"id":"1","type":"rectangle"}]}"#.to_vec();

        let saved = f.handler.save_document(None, payload.clone(), 1000).await.unwrap();
        assert_eq!(saved.document_id, DEFAULT_DOCUMENT_ID);

        let loaded = f.handler.load_document(None).await.unwrap();
        assert!(loaded.found);
        assert_eq!(loaded.payload, payload);
        assert_eq!(loaded.server_timestamp, saved.server_timestamp);
    }

    #[tokio::test]
    async fn test_load_other_scope_returns_default() {
        let f = fixture(Arc::new(MemoryGateway::new()));
        f.handler.save_document(None, b"singleton data".to_vec(), 1).await.unwrap();

        let before = now_millis();
        let loaded = f.handler.load_document(Some("other".into())).await.unwrap();
        assert!(!loaded.found);
        assert!(loaded.payload.is_empty());
        assert_eq!(loaded.document_id, "other");
        assert!(loaded.server_timestamp >= before);
    }

    #[tokio::test]
    async fn test_identical_save_twice_is_idempotent() {
        let gateway = Arc::new(MemoryGateway::new());
        let f = fixture(gateway.clone());
        f.handler.save_document(Some("d".into()), b"same".to_vec(), 7).await.unwrap();
        f.handler.save_document(Some("d".into()), b"same".to_vec(), 7).await.unwrap();

        assert_eq!(gateway.snapshot_count(), 1);
        let loaded = f.handler.load_document(Some("d".into())).await.unwrap();
        assert_eq!(loaded.payload, b"same");
    }

    #[tokio::test]
    async fn test_save_acks_origin_then_pushes_to_others() {
        let f = fixture(Arc::new(MemoryGateway::new()));
        let (origin, mut origin_q) = connect(&f.registry).await;
        let (_other, mut other_q) = connect(&f.registry).await;

        let request_id = RequestId::new();
        f.handler
            .handle(
                &origin,
                ClientMessage::SaveDocument {
                    request_id,
                    document_id: None,
                    payload: b"state".to_vec(),
                    client_timestamp: 1,
                },
            )
            .await
            .unwrap();

        match next(&mut origin_q).await {
            ServerMessage::SaveAck {
                request_id: id,
                success,
                server_timestamp,
                error,
            } => {
                assert_eq!(id, request_id);
                assert!(success);
                assert!(server_timestamp.is_some());
                assert!(error.is_none());
            }
            other => panic!("expected SaveAck, got {other:?}"),
        }
        // The origin never receives its own update.
        assert!(origin_q.reliable.try_recv().is_err());

        match next(&mut other_q).await {
            ServerMessage::SnapshotUpdate {
                document_id,
                payload,
                ..
            } => {
                assert_eq!(document_id, DEFAULT_DOCUMENT_ID);
                assert_eq!(payload, b"state");
            }
            other => panic!("expected SnapshotUpdate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_gateway_failure_yields_error_ack_and_no_push() {
        let f = fixture(Arc::new(DownGateway));
        let (origin, mut origin_q) = connect(&f.registry).await;
        let (_other, mut other_q) = connect(&f.registry).await;

        f.handler
            .handle(
                &origin,
                ClientMessage::SaveDocument {
                    request_id: RequestId::new(),
                    document_id: Some("d".into()),
                    payload: b"x".to_vec(),
                    client_timestamp: 1,
                },
            )
            .await
            .unwrap();

        match next(&mut origin_q).await {
            ServerMessage::SaveAck { success, error, .. } => {
                assert!(!success);
                assert!(error.unwrap().contains("store offline"));
            }
            other => panic!("expected SaveAck, got {other:?}"),
        }
        assert!(other_q.reliable.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_load_failure_yields_request_failed() {
        let f = fixture(Arc::new(DownGateway));
        let (origin, mut origin_q) = connect(&f.registry).await;
        let request_id = RequestId::new();

        f.handler
            .handle(&origin, ClientMessage::LoadDocument { request_id, document_id: None })
            .await
            .unwrap();

        match next(&mut origin_q).await {
            ServerMessage::RequestFailed { request_id: id, .. } => assert_eq!(id, request_id),
            other => panic!("expected RequestFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mixed_asset_batch_reports_per_item() {
        let f = fixture(Arc::new(MemoryGateway::new()));
        let mut bad = png("file_bad");
        bad.data_url = "https://example.com/not-inline.png".into();

        let report = f
            .handler
            .save_assets(vec![png("file_1"), bad, png("file_2")], 1)
            .await;
        assert!(report.success);
        assert_eq!(report.saved, vec!["file_1", "file_2"]);
        assert_eq!(report.errored, vec!["file_bad"]);
    }

    #[tokio::test]
    async fn test_asset_batch_timestamp_is_stored() {
        let gateway = Arc::new(MemoryGateway::new());
        let f = fixture(gateway.clone());
        let (origin, mut origin_q) = connect(&f.registry).await;

        f.handler
            .handle(
                &origin,
                ClientMessage::SaveAssets {
                    request_id: RequestId::new(),
                    assets: vec![png("file_1")],
                    timestamp: 1_700_000_000_123,
                },
            )
            .await
            .unwrap();

        match next(&mut origin_q).await {
            ServerMessage::SaveAssetsAck { saved, .. } => assert_eq!(saved, vec!["file_1"]),
            other => panic!("expected SaveAssetsAck, got {other:?}"),
        }
        assert_eq!(gateway.asset_batch_timestamp("file_1"), Some(1_700_000_000_123));
    }

    #[tokio::test]
    async fn test_asset_batch_infrastructure_fault_still_per_item() {
        // Every item fails, but the batch itself ran.
        let f = fixture(Arc::new(DownGateway));
        let report = f.handler.save_assets(vec![png("a"), png("b")], 1).await;
        assert!(report.success);
        assert!(report.saved.is_empty());
        assert_eq!(report.errored, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_load_assets_found_and_missing_partition_request() {
        let f = fixture(Arc::new(MemoryGateway::new()));
        f.handler.save_assets(vec![png("file_1")], 1).await;

        let ids = vec!["file_1".to_string(), "nonexistent".into(), "file_1".into()];
        let lookup = f.handler.load_assets(ids).await.unwrap();
        assert_eq!(lookup.found.len(), 1);
        let asset = &lookup.found[0];
        assert_eq!(asset.id, "file_1");
        assert_eq!(asset.mime_type, "image/png");
        assert_eq!(asset.version, 1);
        assert_eq!(lookup.missing, vec!["nonexistent"]);
    }

    #[tokio::test]
    async fn test_load_assets_empty_request() {
        let f = fixture(Arc::new(DownGateway));
        let lookup = f.handler.load_assets(Vec::new()).await.unwrap();
        assert!(lookup.found.is_empty());
        assert!(lookup.missing.is_empty());
    }

    #[tokio::test]
    async fn test_non_persistence_message_ignored() {
        let f = fixture(Arc::new(MemoryGateway::new()));
        let (origin, mut origin_q) = connect(&f.registry).await;
        f.handler.handle(&origin, ClientMessage::Ping).await.unwrap();
        assert!(origin_q.reliable.try_recv().is_err());
    }
}
