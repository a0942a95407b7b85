//! RocksDB-backed document store.
//!
//! One column family, `documents`. Keys are `<collection>\0<id>`; values are
//! JSON documents compressed with LZ4 (size-prepended, `lz4_flex`).
//!
//! Reads are point lookups, so the column family carries bloom filters and
//! a block cache.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use serde_json::Value;

use super::{assign_id, merge, DocumentStore, StoreError};

const CF_DOCUMENTS: &str = "documents";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("prico_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Small caches for tests.
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

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serialises read-modify-write in `update`.
    update_lock: Mutex<()>,
}

impl RocksStore {
    /// Opens (or creates) the database at `config.path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors = vec![ColumnFamilyDescriptor::new(
            CF_DOCUMENTS,
            Self::cf_options(&config),
        )];
        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            descriptors,
        )?;

        log::info!("Opened document store at {}", config.path.display());
        Ok(Self {
            db,
            config,
            update_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 frames.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flushes memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        self.db.flush_cf(&cf)?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn key(collection: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(collection.len() + id.len() + 1);
        key.extend_from_slice(collection.as_bytes());
        key.push(0);
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn read(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let Some(compressed) = self.db.get_cf(&cf, Self::key(collection, id))? else {
            return Ok(None);
        };
        let bytes = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn write(&self, collection: &str, id: &str, document: &Value) -> Result<(), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let bytes = serde_json::to_vec(document).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&bytes);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(&cf, Self::key(collection, id), compressed, &write_opts)?;
        Ok(())
    }
}

impl DocumentStore for RocksStore {
    fn save(&self, collection: &str, mut document: Value) -> Result<String, StoreError> {
        let id = assign_id(&mut document)?;
        self.write(collection, &id, &document)?;
        Ok(id)
    }

    fn update(&self, collection: &str, id: &str, partial: Value) -> Result<(), StoreError> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut document = self
            .read(collection, id)?
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        merge(&mut document, partial)?;
        self.write(collection, id, &document)
    }

    fn find(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        self.read(collection, id)
    }

    fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let cf = self.cf(CF_DOCUMENTS)?;
        let key = Self::key(collection, id);
        if self.db.get_cf(&cf, &key)?.is_none() {
            return Ok(false);
        }
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.delete_cf_opt(&cf, &key, &write_opts)?;
        Ok(true)
    }
}

/// Get the number of available CPUs for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
