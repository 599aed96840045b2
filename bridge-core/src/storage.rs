//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `transfers` - Transfer records (key: source_tx)
//! - `roots` - Root registrations (key: target_ledger || root)
//! - `indices` - Secondary indices (status, nonce, source ledger, leaf digest, row id)
//! - `checkpoints` - Last observed block per ledger (key: ledger_id)
//!
//! Every record write goes through one `WriteBatch` together with its index
//! maintenance, so indices never disagree with records.

use crate::{
    error::{Error, Result},
    types::{Digest, LedgerId, RootRegistration, StatusCounts, Transfer, TransferStatus, TxHash},
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use std::sync::Arc;
use uuid::Uuid;

/// Column family names
const CF_TRANSFERS: &str = "transfers";
const CF_ROOTS: &str = "roots";
const CF_INDICES: &str = "indices";
const CF_CHECKPOINTS: &str = "checkpoints";

/// Index key prefixes
const IDX_STATUS: u8 = b's';
const IDX_NONCE: u8 = b'n';
const IDX_SOURCE: u8 = b'l';
const IDX_LEAF: u8 = b'd';
const IDX_ID: u8 = b'i';

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .field("sync_writes", &self.sync_writes)
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        // Tuning from config
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_TRANSFERS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_ROOTS, Self::cf_options_records()),
            ColumnFamilyDescriptor::new(CF_INDICES, Self::cf_options_indices()),
            ColumnFamilyDescriptor::new(CF_CHECKPOINTS, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(path = ?path, "Opened transfer store");

        Ok(Self {
            db: Arc::new(db),
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    // Column family options

    fn cf_options_records() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_indices() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        // Indices benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    // Helper: get column family handle

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn write(&self, batch: WriteBatch) -> Result<()> {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.sync_writes);
        self.db.write_opt(batch, &opts)?;
        Ok(())
    }

    // Transfer operations

    /// Insert a transfer unless its source tx is already stored
    ///
    /// Returns `false` for a duplicate. Callers serialize inserts through the
    /// writer actor, so check-then-write is race free.
    pub fn insert_transfer(&self, transfer: &Transfer) -> Result<bool> {
        let cf = self.cf_handle(CF_TRANSFERS)?;
        let key = transfer.source_tx.as_bytes();

        if self.db.get_pinned_cf(cf, key)?.is_some() {
            return Ok(false);
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, key, bincode::serialize(transfer)?);

        let cf_indices = self.cf_handle(CF_INDICES)?;
        batch.put_cf(cf_indices, Self::index_key_status(transfer.status, transfer), b"");
        batch.put_cf(
            cf_indices,
            Self::index_key_nonce(transfer.source_ledger(), transfer.nonce()),
            key,
        );
        batch.put_cf(
            cf_indices,
            Self::index_key_source(transfer.source_ledger(), &transfer.source_tx),
            b"",
        );
        batch.put_cf(cf_indices, Self::index_key_leaf(&transfer.leaf_digest), key);
        batch.put_cf(cf_indices, Self::index_key_id(&transfer.id), key);

        self.write(batch)?;

        tracing::debug!(
            source_tx = %transfer.source_tx,
            nonce = transfer.nonce(),
            "Transfer stored"
        );

        Ok(true)
    }

    /// Overwrite a stored transfer, moving its status index
    pub fn update_transfer(&self, previous: TransferStatus, transfer: &Transfer) -> Result<()> {
        let cf = self.cf_handle(CF_TRANSFERS)?;
        let cf_indices = self.cf_handle(CF_INDICES)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(cf, transfer.source_tx.as_bytes(), bincode::serialize(transfer)?);
        if previous != transfer.status {
            batch.delete_cf(cf_indices, Self::index_key_status(previous, transfer));
            batch.put_cf(cf_indices, Self::index_key_status(transfer.status, transfer), b"");
        }

        self.write(batch)
    }

    /// Get transfer by source tx
    pub fn get_transfer(&self, source_tx: &TxHash) -> Result<Option<Transfer>> {
        let cf = self.cf_handle(CF_TRANSFERS)?;
        match self.db.get_pinned_cf(cf, source_tx.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    /// Get transfer by source tx, failing if absent
    pub fn require_transfer(&self, source_tx: &TxHash) -> Result<Transfer> {
        self.get_transfer(source_tx)?
            .ok_or(Error::TransferNotFound(*source_tx))
    }

    /// Get transfer by local row id
    pub fn get_transfer_by_id(&self, id: &Uuid) -> Result<Option<Transfer>> {
        self.lookup_via_index(&Self::index_key_id(id))
    }

    /// Find transfer by (source ledger, nonce)
    pub fn find_by_nonce(&self, source: LedgerId, nonce: u64) -> Result<Option<Transfer>> {
        self.lookup_via_index(&Self::index_key_nonce(source, nonce))
    }

    /// Find transfer by leaf digest
    pub fn find_by_leaf(&self, leaf: &Digest) -> Result<Option<Transfer>> {
        self.lookup_via_index(&Self::index_key_leaf(leaf))
    }

    fn lookup_via_index(&self, index_key: &[u8]) -> Result<Option<Transfer>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let Some(tx_bytes) = self.db.get_pinned_cf(cf_indices, index_key)? else {
            return Ok(None);
        };
        let tx = Self::digest_from_slice(&tx_bytes)?;
        self.get_transfer(&tx)
    }

    /// Transfers with `status` in (source ledger, nonce) order, at most `limit`
    pub fn list_by_status(&self, status: TransferStatus, limit: usize) -> Result<Vec<Transfer>> {
        let prefix = [IDX_STATUS, status as u8];
        let keys = self.scan_index_suffixes(&prefix, limit)?;
        let mut transfers = Vec::with_capacity(keys.len());
        for tx in keys {
            if let Some(transfer) = self.get_transfer(&tx)? {
                transfers.push(transfer);
            }
        }
        Ok(transfers)
    }

    /// Source tx hashes of every transfer from `source`
    pub fn list_by_source(&self, source: LedgerId) -> Result<Vec<TxHash>> {
        let mut prefix = vec![IDX_SOURCE];
        prefix.extend_from_slice(&source.to_be_bytes());
        self.scan_index_suffixes(&prefix, usize::MAX)
    }

    fn scan_index_suffixes(&self, prefix: &[u8], limit: usize) -> Result<Vec<TxHash>> {
        let cf_indices = self.cf_handle(CF_INDICES)?;
        let iter = self
            .db
            .iterator_cf(cf_indices, IteratorMode::From(prefix, Direction::Forward));

        let mut out = Vec::new();
        for item in iter {
            if out.len() >= limit {
                break;
            }
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            // Every scanned index ends in the source tx
            let tail = key.len().saturating_sub(32).max(prefix.len());
            out.push(Self::digest_from_slice(&key[tail..])?);
        }
        Ok(out)
    }

    /// Aggregate counts from the status index
    pub fn counts(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for status in TransferStatus::ALL {
            let n = self.scan_index_suffixes(&[IDX_STATUS, status as u8], usize::MAX)?.len() as u64;
            match status {
                TransferStatus::Pending => counts.pending = n,
                TransferStatus::ProofBuilding => counts.processing = n,
                TransferStatus::Completed => counts.completed = n,
                TransferStatus::Failed => counts.failed = n,
            }
            counts.total += n;
        }
        Ok(counts)
    }

    // Root registration operations

    /// Put root registration
    pub fn put_root(&self, registration: &RootRegistration) -> Result<()> {
        let cf = self.cf_handle(CF_ROOTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf,
            Self::root_key(registration.target_ledger, &registration.root),
            bincode::serialize(registration)?,
        );
        self.write(batch)
    }

    /// Get root registration
    pub fn get_root(&self, target: LedgerId, root: &Digest) -> Result<Option<RootRegistration>> {
        let cf = self.cf_handle(CF_ROOTS)?;
        match self.db.get_pinned_cf(cf, Self::root_key(target, root))? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Checkpoint operations

    /// Last observed block for a ledger
    pub fn get_checkpoint(&self, ledger: LedgerId) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_CHECKPOINTS)?;
        match self.db.get_pinned_cf(cf, ledger.to_be_bytes())? {
            Some(value) => {
                let bytes: [u8; 8] = value
                    .as_ref()
                    .try_into()
                    .map_err(|_| Error::Storage("corrupt checkpoint".to_string()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }

    /// Store last observed block for a ledger
    pub fn put_checkpoint(&self, ledger: LedgerId, block: u64) -> Result<()> {
        let cf = self.cf_handle(CF_CHECKPOINTS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(cf, ledger.to_be_bytes(), block.to_be_bytes());
        self.write(batch)
    }

    // Key helpers

    fn index_key_status(status: TransferStatus, transfer: &Transfer) -> Vec<u8> {
        let mut key = vec![IDX_STATUS, status as u8];
        key.extend_from_slice(&transfer.source_ledger().to_be_bytes());
        key.extend_from_slice(&transfer.nonce().to_be_bytes());
        key.extend_from_slice(transfer.source_tx.as_bytes());
        key
    }

    fn index_key_nonce(source: LedgerId, nonce: u64) -> Vec<u8> {
        let mut key = vec![IDX_NONCE];
        key.extend_from_slice(&source.to_be_bytes());
        key.extend_from_slice(&nonce.to_be_bytes());
        key
    }

    fn index_key_source(source: LedgerId, source_tx: &TxHash) -> Vec<u8> {
        let mut key = vec![IDX_SOURCE];
        key.extend_from_slice(&source.to_be_bytes());
        key.extend_from_slice(source_tx.as_bytes());
        key
    }

    fn index_key_leaf(leaf: &Digest) -> Vec<u8> {
        let mut key = vec![IDX_LEAF];
        key.extend_from_slice(leaf.as_bytes());
        key
    }

    fn index_key_id(id: &Uuid) -> Vec<u8> {
        let mut key = vec![IDX_ID];
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn root_key(target: LedgerId, root: &Digest) -> Vec<u8> {
        let mut key = target.to_be_bytes().to_vec();
        key.extend_from_slice(root.as_bytes());
        key
    }

    fn digest_from_slice(bytes: &[u8]) -> Result<Digest> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Storage(format!("corrupt index entry ({} bytes)", bytes.len())))?;
        Ok(Digest(arr))
    }

    /// Flush memtables to disk (graceful shutdown)
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        tracing::info!("Transfer store flushed");
        Ok(())
    }
}
