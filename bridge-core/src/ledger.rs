//! Transfer ledger facade
//!
//! Ties storage and the writer actor into the durable record the relay
//! works from. Writes go through the actor, reads go straight to RocksDB.
//!
//! # Example
//!
//! ```no_run
//! use bridge_core::{Config, TransferLedger, TransferStatus};
//!
//! #[tokio::main]
//! async fn main() -> bridge_core::Result<()> {
//!     let ledger = TransferLedger::open(Config::default())?;
//!
//!     let pending = ledger.list_by_status(TransferStatus::Pending, 100)?;
//!     println!("{} pending transfers", pending.len());
//!
//!     ledger.shutdown().await
//! }
//! ```

use crate::{
    actor::{spawn_store_actor, StoreHandle},
    types::{Digest, LedgerId, RootRegistration, StatusCounts, Transfer, TransferStatus, TxHash},
    Config, Error, Result, Storage,
};
use std::sync::Arc;
use uuid::Uuid;

/// Durable record of cross-ledger transfers
#[derive(Debug)]
pub struct TransferLedger {
    /// Actor handle for writes
    handle: StoreHandle,

    /// Direct storage access (for reads)
    storage: Arc<Storage>,
}

impl TransferLedger {
    /// Open ledger with configuration
    ///
    /// Must be called inside a Tokio runtime (spawns the writer).
    pub fn open(config: Config) -> Result<Self> {
        let storage = Arc::new(Storage::open(&config)?);
        let handle = spawn_store_actor(storage.clone(), config.writer.mailbox_capacity);

        Ok(Self { handle, storage })
    }

    /// Record a newly observed transfer
    ///
    /// Returns `false` when a transfer with the same source tx already
    /// exists; the stored row is left as it was.
    pub async fn record_observed(&self, transfer: Transfer) -> Result<bool> {
        if transfer.status != TransferStatus::Pending {
            return Err(Error::InvalidInput(format!(
                "observed transfer {} must be pending, got {}",
                transfer.source_tx, transfer.status
            )));
        }
        if transfer.leaf_digest != transfer.fields.digest() {
            return Err(Error::InvalidInput(format!(
                "leaf digest of {} does not match its fields",
                transfer.source_tx
            )));
        }
        self.handle.record_observed(transfer).await
    }

    /// Get transfer by source tx
    pub fn get(&self, source_tx: &TxHash) -> Result<Option<Transfer>> {
        self.storage.get_transfer(source_tx)
    }

    /// Get transfer by local row id
    pub fn get_by_id(&self, id: &Uuid) -> Result<Option<Transfer>> {
        self.storage.get_transfer_by_id(id)
    }

    /// Find transfer by leaf digest
    pub fn find_by_leaf(&self, leaf: &Digest) -> Result<Option<Transfer>> {
        self.storage.find_by_leaf(leaf)
    }

    /// Find transfer by (source ledger, nonce)
    pub fn find_by_nonce(&self, source: LedgerId, nonce: u64) -> Result<Option<Transfer>> {
        self.storage.find_by_nonce(source, nonce)
    }

    /// Transfers in `status`, in source nonce order
    pub fn list_by_status(&self, status: TransferStatus, limit: usize) -> Result<Vec<Transfer>> {
        self.storage.list_by_status(status, limit)
    }

    /// Pending -> ProofBuilding with the proof the settlement will carry
    pub async fn begin_proof(
        &self,
        source_tx: TxHash,
        proof: Vec<Digest>,
        root: Digest,
    ) -> Result<Transfer> {
        self.handle.begin_proof(source_tx, proof, root).await
    }

    /// Recovery: attach a rebuilt proof to a ProofBuilding row that has none
    pub async fn restore_proof(
        &self,
        source_tx: TxHash,
        proof: Vec<Digest>,
        root: Digest,
    ) -> Result<Transfer> {
        self.handle.restore_proof(source_tx, proof, root).await
    }

    /// Remember the destination tx before its outcome is known
    pub async fn record_submission(&self, source_tx: TxHash, dest_ref: TxHash) -> Result<Transfer> {
        self.handle.record_submission(source_tx, dest_ref).await
    }

    /// Mark settled on the destination
    pub async fn complete(&self, source_tx: TxHash, dest_ref: TxHash) -> Result<Transfer> {
        self.handle.complete(source_tx, dest_ref).await
    }

    /// Mark failed, keeping the reason verbatim
    pub async fn fail(&self, source_tx: TxHash, reason: impl Into<String>) -> Result<Transfer> {
        self.handle.fail(source_tx, reason.into()).await
    }

    /// Aggregate counts by status
    pub fn counts(&self) -> Result<StatusCounts> {
        self.storage.counts()
    }

    /// Store a root registration record (not yet registered)
    pub async fn put_root_registration(&self, registration: RootRegistration) -> Result<()> {
        self.handle.put_root(registration).await
    }

    /// Attach the registration tx once the destination accepted the root
    pub async fn mark_root_registered(
        &self,
        target: LedgerId,
        root: Digest,
        registered_ref: TxHash,
    ) -> Result<RootRegistration> {
        self.handle.mark_root_registered(target, root, registered_ref).await
    }

    /// Look up a root registration record
    pub fn get_root_registration(
        &self,
        target: LedgerId,
        root: &Digest,
    ) -> Result<Option<RootRegistration>> {
        self.storage.get_root(target, root)
    }

    /// Last block observed on `ledger`
    pub fn checkpoint(&self, ledger: LedgerId) -> Result<Option<u64>> {
        self.storage.get_checkpoint(ledger)
    }

    /// Advance the observer checkpoint; a lower block is ignored
    pub async fn set_checkpoint(&self, ledger: LedgerId, block: u64) -> Result<u64> {
        self.handle.set_checkpoint(ledger, block).await
    }

    /// Drain pending writes and flush to disk
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}
