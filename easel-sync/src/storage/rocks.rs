//! RocksDB-backed persistence gateway.
//!
//! Column families:
//! - `snapshots`:   document snapshots keyed by document id (bincode, LZ4)
//! - `assets`:      asset records keyed by asset id (bincode, LZ4)
//! - `asset_index`: small per-asset metadata keyed by asset id (bincode)
//!
//! Snapshot upserts and patches are read-modify-write (name and creation time
//! survive), so writers to the same key are serialized through a striped lock
//! table.
//! Writers to different keys only contend when their stripes collide.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::{
    distinct_ids, validate_asset, AssetLookup, Gateway, GatewayError, PayloadPatch, SnapshotRecord,
};
use crate::protocol::{now_millis, AssetRecord};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_ASSETS: &str = "assets";
const CF_ASSET_INDEX: &str = "asset_index";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_ASSETS, CF_ASSET_INDEX];

const LOCK_STRIPES: usize = 64;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 128MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("easel_data"),
            block_cache_size: 128 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Secondary index entry for an asset; lets lookups skip absent ids
/// without touching the payload column family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetIndexEntry {
    pub mime_type: String,
    pub version: u32,
    /// Length of the data URL in bytes
    pub size: u64,
    pub updated_at: i64,
    /// Client timestamp of the upload batch that wrote this version
    pub batch_timestamp: i64,
}

/// RocksDB gateway.
pub struct RocksGateway {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    locks: Vec<Mutex<()>>,
}

impl RocksGateway {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> Result<Self, GatewayError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened snapshot store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            // values are already LZ4 framed
            CF_SNAPSHOTS | CF_ASSETS => {
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_ASSET_INDEX => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    /// Index entry for one asset, if stored.
    pub fn asset_metadata(&self, asset_id: &str) -> Result<Option<AssetIndexEntry>, GatewayError> {
        let cf = self.cf(CF_ASSET_INDEX)?;
        match self.db.get_cf(cf, asset_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), GatewayError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn read_snapshot(&self, document_id: &str) -> Result<Option<SnapshotRecord>, GatewayError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(cf, document_id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_compressed(&bytes)?)),
            None => Ok(None),
        }
    }

    fn write_snapshot(&self, record: &SnapshotRecord) -> Result<(), GatewayError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let value = encode_compressed(record)?;
        self.db
            .put_cf_opt(cf, record.document_id.as_bytes(), value, &self.write_options())?;
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    fn key_lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.locks.len();
        self.locks[stripe].lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, GatewayError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| GatewayError::Database(format!("Column family '{name}' not found")))
    }
}

impl Gateway for RocksGateway {
    fn upsert_snapshot(
        &self,
        document_id: &str,
        payload: &[u8],
        client_timestamp: i64,
    ) -> Result<i64, GatewayError> {
        let _guard = self.key_lock(document_id);
        let now = now_millis();
        let mut record = self
            .read_snapshot(document_id)?
            .unwrap_or_else(|| SnapshotRecord::new(document_id, Vec::new(), now));
        record.payload = payload.to_vec();
        record.client_timestamp = client_timestamp;
        record.server_timestamp = now;
        record.updated_at = now;
        self.write_snapshot(&record)?;
        Ok(now)
    }

    fn get_snapshot(&self, document_id: &str) -> Result<Option<SnapshotRecord>, GatewayError> {
        self.read_snapshot(document_id)
    }

    fn list_snapshots(&self) -> Result<Vec<SnapshotRecord>, GatewayError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut all = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            all.push(decode_compressed::<SnapshotRecord>(&value)?);
        }
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(all)
    }

    fn create_snapshot(&self, record: &SnapshotRecord) -> Result<(), GatewayError> {
        let _guard = self.key_lock(&record.document_id);
        if self.read_snapshot(&record.document_id)?.is_some() {
            return Err(GatewayError::Conflict(record.document_id.clone()));
        }
        self.write_snapshot(record)
    }

    fn update_snapshot(
        &self,
        document_id: &str,
        name: Option<String>,
        patch: Option<PayloadPatch>,
    ) -> Result<bool, GatewayError> {
        let _guard = self.key_lock(document_id);
        let Some(mut record) = self.read_snapshot(document_id)? else {
            return Ok(false);
        };
        if let Some(name) = name {
            record.name = Some(name);
        }
        if let Some(patch) = patch {
            record.payload = patch(&record.payload);
        }
        record.updated_at = now_millis();
        self.write_snapshot(&record)?;
        Ok(true)
    }

    fn delete_snapshot(&self, document_id: &str) -> Result<bool, GatewayError> {
        let _guard = self.key_lock(document_id);
        let cf = self.cf(CF_SNAPSHOTS)?;
        if self.db.get_cf(cf, document_id.as_bytes())?.is_none() {
            return Ok(false);
        }
        self.db
            .delete_cf_opt(cf, document_id.as_bytes(), &self.write_options())?;
        Ok(true)
    }

    fn upsert_asset(&self, asset: &AssetRecord, batch_timestamp: i64) -> Result<(), GatewayError> {
        validate_asset(asset)?;
        let cf_assets = self.cf(CF_ASSETS)?;
        let cf_index = self.cf(CF_ASSET_INDEX)?;

        let index = AssetIndexEntry {
            mime_type: asset.mime_type.clone(),
            version: asset.version,
            size: asset.data_url.len() as u64,
            updated_at: now_millis(),
            batch_timestamp,
        };

        // record + index land together or not at all
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_assets, asset.id.as_bytes(), encode_compressed(asset)?);
        batch.put_cf(cf_index, asset.id.as_bytes(), encode(&index)?);
        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    fn get_assets(&self, ids: &[String]) -> Result<AssetLookup, GatewayError> {
        let cf_assets = self.cf(CF_ASSETS)?;
        let cf_index = self.cf(CF_ASSET_INDEX)?;

        let mut lookup = AssetLookup::default();
        for id in distinct_ids(ids) {
            if self.db.get_cf(cf_index, id.as_bytes())?.is_none() {
                lookup.missing.push(id);
                continue;
            }
            match self.db.get_cf(cf_assets, id.as_bytes())? {
                Some(bytes) => lookup.found.push(decode_compressed(&bytes)?),
                None => {
                    log::warn!("Asset index entry without record: {id}");
                    lookup.missing.push(id);
                }
            }
        }
        Ok(lookup)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, GatewayError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| GatewayError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GatewayError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| GatewayError::Deserialization(e.to_string()))?;
    Ok(value)
}

fn encode_compressed<T: Serialize>(value: &T) -> Result<Vec<u8>, GatewayError> {
    Ok(lz4_flex::compress_prepend_size(&encode(value)?))
}

fn decode_compressed<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, GatewayError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| GatewayError::Compression(e.to_string()))?;
    decode(&raw)
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
