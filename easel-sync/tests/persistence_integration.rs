//! Persistence integration tests.
//!
//! Verifies:
//! - Snapshot save/load through the full server stack on RocksDB
//! - Restart durability: close the store, reopen, data survives
//! - Asset batches with per-item failures survive a reopen
//! - Last write by arrival wins regardless of client timestamps
//! - Large documents round-trip through compression

use easel_sync::client::{AdapterConfig, DocumentState, SyncAdapter};
use easel_sync::protocol::{AssetUpload, DEFAULT_DOCUMENT_ID};
use easel_sync::registry::RoomRegistry;
use easel_sync::relay::BroadcastRelay;
use easel_sync::server::{ServerConfig, SyncServer};
use easel_sync::session::SessionHandler;
use easel_sync::storage::{Gateway, RocksGateway, StoreConfig};

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::net::TcpListener;

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn open_handler(path: &Path) -> (SessionHandler, Arc<RocksGateway>) {
    let gateway = Arc::new(RocksGateway::open(StoreConfig::for_testing(path)).unwrap());
    let relay = Arc::new(BroadcastRelay::new(Arc::new(RoomRegistry::new(8))));
    (SessionHandler::new(gateway.clone(), relay), gateway)
}

/// Start a RocksDB-backed server on a free port.
async fn start_persistent_server(path: &Path) -> (u16, Arc<dyn Gateway>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        storage_path: Some(path.to_path_buf()),
        ..ServerConfig::default()
    };
    let server = SyncServer::new(config).unwrap();
    let gateway = server.gateway().clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (port, gateway)
}

/// Text that compresses well but is large.
fn repetitive_text(approx_bytes: usize) -> String {
    "The quick brown fox jumps over the lazy dog. ".repeat(approx_bytes / 45 + 1)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_document_roundtrip_via_server_storage() {
    let dir = tempdir().unwrap();
    let (port, gateway) = start_persistent_server(&dir.path().join("db")).await;
    let client = SyncAdapter::new(AdapterConfig::new(&format!("127.0.0.1:{port}")));

    let doc = DocumentState::new(vec![json!({ "id": "1", "type": "rectangle" })]);
    assert!(client.save_document(&doc, 1000).await);

    let stored = gateway.get_snapshot(DEFAULT_DOCUMENT_ID).unwrap().unwrap();
    assert_eq!(stored.client_timestamp, 1000);
    assert_eq!(stored.payload, doc.to_payload().unwrap());

    let remote = client.load_document().await.unwrap().unwrap();
    assert_eq!(remote.state.elements, doc.elements);
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let payload = br#"{"elements":[{"id":"persisted"}],"appState":{}}"#.to_vec();

    {
        let (handler, gateway) = open_handler(&db_path);
        handler
            .save_document(Some("tab-1".into()), payload.clone(), 42)
            .await
            .unwrap();
        gateway.sync().unwrap();
    }

    let (handler, _gateway) = open_handler(&db_path);
    let loaded = handler.load_document(Some("tab-1".into())).await.unwrap();
    assert!(loaded.found);
    assert_eq!(loaded.payload, payload);

    let missing = handler.load_document(None).await.unwrap();
    assert!(!missing.found);
}

#[tokio::test]
async fn test_asset_batch_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");

    {
        let (handler, _gateway) = open_handler(&db_path);
        let mut versioned = AssetUpload::new("img-2", "data:image/jpeg;base64,/9j/4AAQ", "image/jpeg");
        versioned.version = Some(3);
        versioned.created = Some(1_000);
        let broken = AssetUpload::new("img-bad", "blob:http://x/123", "image/png");

        let batch = vec![
            AssetUpload::new("img-1", "data:image/png;base64,iVBORw0KGgo=", "image/png"),
            broken,
            versioned,
        ];
        let report = handler.save_assets(batch, 1_700_000_000_000).await;
        assert!(report.success);
        assert_eq!(report.saved, vec!["img-1", "img-2"]);
        assert_eq!(report.errored, vec!["img-bad"]);
    }

    let (handler, gateway) = open_handler(&db_path);
    let ids: Vec<String> = ["img-1", "img-2", "img-bad"].iter().map(|s| s.to_string()).collect();
    let lookup = handler.load_assets(ids).await.unwrap();

    let mut found: Vec<_> = lookup.found.iter().map(|a| a.id.clone()).collect();
    found.sort();
    assert_eq!(found, vec!["img-1", "img-2"]);
    assert_eq!(lookup.missing, vec!["img-bad"]);

    let img2 = lookup.found.iter().find(|a| a.id == "img-2").unwrap();
    assert_eq!(img2.version, 3);
    assert_eq!(img2.created, 1_000);

    let meta = gateway.asset_metadata("img-2").unwrap().unwrap();
    assert_eq!(meta.mime_type, "image/jpeg");
    assert_eq!(meta.version, 3);
    assert_eq!(meta.batch_timestamp, 1_700_000_000_000);
}

#[tokio::test]
async fn test_last_arrival_wins_over_newer_client_timestamp() {
    let dir = tempdir().unwrap();
    let (handler, _gateway) = open_handler(&dir.path().join("db"));

    handler.save_document(None, b"newer".to_vec(), 2_000).await.unwrap();
    handler.save_document(None, b"older".to_vec(), 1_000).await.unwrap();

    let loaded = handler.load_document(None).await.unwrap();
    assert_eq!(loaded.payload, b"older");
}

#[tokio::test]
async fn test_identical_saves_leave_single_snapshot() {
    let dir = tempdir().unwrap();
    let (handler, gateway) = open_handler(&dir.path().join("db"));

    handler.save_document(None, b"same".to_vec(), 5).await.unwrap();
    handler.save_document(None, b"same".to_vec(), 5).await.unwrap();

    let all = gateway.list_snapshots().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].payload, b"same");
}

#[tokio::test]
async fn test_large_document_persistence() {
    let dir = tempdir().unwrap();
    let (port, _gateway) = start_persistent_server(&dir.path().join("db")).await;
    let client = SyncAdapter::new(AdapterConfig::new(&format!("127.0.0.1:{port}")));

    let text = repetitive_text(1024 * 1024);
    let doc = DocumentState::new(vec![json!({ "id": "t", "type": "text", "text": text })]);
    assert!(client.save_document(&doc, 1).await);

    let remote = client.load_document().await.unwrap().unwrap();
    assert_eq!(remote.state.elements[0]["text"].as_str().unwrap().len(), text.len());
}
