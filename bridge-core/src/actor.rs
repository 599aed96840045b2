//! Single-writer actor for the transfer store
//!
//! Every mutation of the store is funneled through one Tokio task:
//! - Status transitions are checked and applied without races
//! - `record_observed` is idempotent even with several observers
//! - Bounded mailbox gives backpressure to the relay tasks
//!
//! Reads do not go through the actor; see [`crate::TransferLedger`].
//!
//! # Architecture
//!
//! ```text
//! Observer tasks ──┐
//!                  │  StoreHandle (Clone)
//! Driver tasks ────┤
//!                  ▼
//!        mpsc::channel (bounded)
//!                  │
//!                  ▼
//!        StoreActor (single task)
//!          check transition
//!                  │
//!                  ▼
//!        Storage (WriteBatch: record + indices)
//! ```

use crate::types::{Digest, LedgerId, RootRegistration, Transfer, TransferStatus, TxHash};
use crate::{Error, Result, Storage};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the store actor
#[derive(Debug)]
pub enum StoreMessage {
    /// Insert a newly observed transfer (idempotent by source tx)
    RecordObserved {
        transfer: Box<Transfer>,
        response: oneshot::Sender<Result<bool>>,
    },

    /// Pending -> ProofBuilding, attaching proof and root
    BeginProof {
        source_tx: TxHash,
        proof: Vec<Digest>,
        root: Digest,
        response: oneshot::Sender<Result<Transfer>>,
    },

    /// Record the destination settlement tx before waiting for its receipt
    RecordSubmission {
        source_tx: TxHash,
        dest_ref: TxHash,
        response: oneshot::Sender<Result<Transfer>>,
    },

    /// ProofBuilding -> Completed
    Complete {
        source_tx: TxHash,
        dest_ref: TxHash,
        response: oneshot::Sender<Result<Transfer>>,
    },

    /// Fill a proof and root missing from a ProofBuilding row
    RestoreProof {
        source_tx: TxHash,
        proof: Vec<Digest>,
        root: Digest,
        response: oneshot::Sender<Result<Transfer>>,
    },

    /// ProofBuilding -> Failed
    Fail {
        source_tx: TxHash,
        reason: String,
        response: oneshot::Sender<Result<Transfer>>,
    },

    /// Store a root registration record
    PutRoot {
        registration: RootRegistration,
        response: oneshot::Sender<Result<()>>,
    },

    /// Attach the registration tx to a stored root
    MarkRootRegistered {
        target: LedgerId,
        root: Digest,
        registered_ref: TxHash,
        response: oneshot::Sender<Result<RootRegistration>>,
    },

    /// Advance the observer checkpoint of a ledger
    SetCheckpoint {
        ledger: LedgerId,
        block: u64,
        response: oneshot::Sender<Result<u64>>,
    },

    /// Drain, flush and stop
    Shutdown { response: oneshot::Sender<Result<()>> },
}

/// Actor that owns all writes to the store
#[derive(Debug)]
pub struct StoreActor {
    /// Storage backend
    storage: Arc<Storage>,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<StoreMessage>,
}

impl StoreActor {
    /// Create new actor
    pub fn new(storage: Arc<Storage>, mailbox: mpsc::Receiver<StoreMessage>) -> Self {
        Self { storage, mailbox }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            if let StoreMessage::Shutdown { response } = msg {
                // Reject new work, finish what is queued
                self.mailbox.close();
                while let Ok(queued) = self.mailbox.try_recv() {
                    self.handle_message(queued);
                }
                let _ = response.send(self.storage.flush());
                break;
            }
            self.handle_message(msg);
        }

        tracing::debug!("Store actor stopped");
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: StoreMessage) {
        match msg {
            StoreMessage::RecordObserved { transfer, response } => {
                let _ = response.send(self.storage.insert_transfer(&transfer));
            }

            StoreMessage::BeginProof {
                source_tx,
                proof,
                root,
                response,
            } => {
                let result = self.transition_from(
                    &source_tx,
                    TransferStatus::Pending,
                    TransferStatus::ProofBuilding,
                    |t| {
                        t.proof = Some(proof);
                        t.root = Some(root);
                    },
                );
                let _ = response.send(result);
            }

            StoreMessage::RecordSubmission {
                source_tx,
                dest_ref,
                response,
            } => {
                let result = self.transition_from(
                    &source_tx,
                    TransferStatus::ProofBuilding,
                    TransferStatus::ProofBuilding,
                    |t| {
                        t.dest_settlement_ref = Some(dest_ref);
                    },
                );
                let _ = response.send(result);
            }

            StoreMessage::RestoreProof {
                source_tx,
                proof,
                root,
                response,
            } => {
                let _ = response.send(self.restore_proof(&source_tx, proof, root));
            }

            StoreMessage::Complete {
                source_tx,
                dest_ref,
                response,
            } => {
                let result = self.transition(&source_tx, TransferStatus::Completed, |t| {
                    t.dest_settlement_ref = Some(dest_ref);
                    t.error = None;
                });
                let _ = response.send(result);
            }

            StoreMessage::Fail {
                source_tx,
                reason,
                response,
            } => {
                let result = self.transition(&source_tx, TransferStatus::Failed, |t| {
                    t.error = Some(reason);
                });
                let _ = response.send(result);
            }

            StoreMessage::PutRoot {
                registration,
                response,
            } => {
                let _ = response.send(self.storage.put_root(&registration));
            }

            StoreMessage::MarkRootRegistered {
                target,
                root,
                registered_ref,
                response,
            } => {
                let _ = response.send(self.mark_root_registered(target, root, registered_ref));
            }

            StoreMessage::SetCheckpoint {
                ledger,
                block,
                response,
            } => {
                let _ = response.send(self.set_checkpoint(ledger, block));
            }

            StoreMessage::Shutdown { response } => {
                // Only reached while draining; the loop already stops
                let _ = response.send(Ok(()));
            }
        }
    }

    /// Apply a checked status transition
    ///
    /// An illegal transition leaves the row untouched.
    fn transition<F>(&self, source_tx: &TxHash, next: TransferStatus, apply: F) -> Result<Transfer>
    where
        F: FnOnce(&mut Transfer),
    {
        self.apply_transition(source_tx, None, next, apply)
    }

    /// Like [`Self::transition`], but only from the `from` status
    fn transition_from<F>(
        &self,
        source_tx: &TxHash,
        from: TransferStatus,
        next: TransferStatus,
        apply: F,
    ) -> Result<Transfer>
    where
        F: FnOnce(&mut Transfer),
    {
        self.apply_transition(source_tx, Some(from), next, apply)
    }

    fn apply_transition<F>(
        &self,
        source_tx: &TxHash,
        from: Option<TransferStatus>,
        next: TransferStatus,
        apply: F,
    ) -> Result<Transfer>
    where
        F: FnOnce(&mut Transfer),
    {
        let mut transfer = self.storage.require_transfer(source_tx)?;
        let previous = transfer.status;

        let from_ok = from.map_or(true, |from| from == previous);
        if !from_ok || !previous.can_transition_to(next) {
            tracing::warn!(
                source_tx = %source_tx,
                from = %previous,
                to = %next,
                "Rejected status transition"
            );
            return Err(Error::InvalidTransition {
                source_tx: *source_tx,
                from: previous,
                to: next,
            });
        }

        apply(&mut transfer);
        transfer.status = next;
        transfer.updated_at = Utc::now();

        self.storage.update_transfer(previous, &transfer)?;

        tracing::debug!(
            source_tx = %source_tx,
            from = %previous,
            to = %next,
            "Transfer status updated"
        );

        Ok(transfer)
    }

    /// Recovery path for a ProofBuilding row stored without its proof
    ///
    /// A row that already carries a proof or root is never overwritten.
    fn restore_proof(
        &self,
        source_tx: &TxHash,
        proof: Vec<Digest>,
        root: Digest,
    ) -> Result<Transfer> {
        let current = self.storage.require_transfer(source_tx)?;
        if current.proof.is_some() || current.root.is_some() {
            tracing::warn!(source_tx = %source_tx, "Refusing to replace a stored proof");
            return Err(Error::InvalidInput(format!(
                "transfer {} already has a proof",
                source_tx
            )));
        }

        self.transition_from(
            source_tx,
            TransferStatus::ProofBuilding,
            TransferStatus::ProofBuilding,
            |t| {
                t.proof = Some(proof);
                t.root = Some(root);
            },
        )
    }

    fn mark_root_registered(
        &self,
        target: LedgerId,
        root: Digest,
        registered_ref: TxHash,
    ) -> Result<RootRegistration> {
        let mut registration = self
            .storage
            .get_root(target, &root)?
            .ok_or_else(|| Error::RootNotFound(format!("{} on ledger {}", root, target)))?;
        registration.registered_ref = Some(registered_ref);
        self.storage.put_root(&registration)?;
        Ok(registration)
    }

    /// Checkpoints never move backwards; returns the stored value
    fn set_checkpoint(&self, ledger: LedgerId, block: u64) -> Result<u64> {
        match self.storage.get_checkpoint(ledger)? {
            Some(current) if current >= block => Ok(current),
            _ => {
                self.storage.put_checkpoint(ledger, block)?;
                Ok(block)
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Debug, Clone)]
pub struct StoreHandle {
    sender: mpsc::Sender<StoreMessage>,
}

impl StoreHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<StoreMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> StoreMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Insert an observed transfer; `false` if already present
    pub async fn record_observed(&self, transfer: Transfer) -> Result<bool> {
        self.request(|response| StoreMessage::RecordObserved {
            transfer: Box::new(transfer),
            response,
        })
        .await
    }

    /// Pending -> ProofBuilding
    pub async fn begin_proof(
        &self,
        source_tx: TxHash,
        proof: Vec<Digest>,
        root: Digest,
    ) -> Result<Transfer> {
        self.request(|response| StoreMessage::BeginProof {
            source_tx,
            proof,
            root,
            response,
        })
        .await
    }

    /// Fill a missing proof and root on a ProofBuilding row
    pub async fn restore_proof(
        &self,
        source_tx: TxHash,
        proof: Vec<Digest>,
        root: Digest,
    ) -> Result<Transfer> {
        self.request(|response| StoreMessage::RestoreProof {
            source_tx,
            proof,
            root,
            response,
        })
        .await
    }

    /// Record a submitted destination tx
    pub async fn record_submission(&self, source_tx: TxHash, dest_ref: TxHash) -> Result<Transfer> {
        self.request(|response| StoreMessage::RecordSubmission {
            source_tx,
            dest_ref,
            response,
        })
        .await
    }

    /// ProofBuilding -> Completed
    pub async fn complete(&self, source_tx: TxHash, dest_ref: TxHash) -> Result<Transfer> {
        self.request(|response| StoreMessage::Complete {
            source_tx,
            dest_ref,
            response,
        })
        .await
    }

    /// ProofBuilding -> Failed with a verbatim reason
    pub async fn fail(&self, source_tx: TxHash, reason: String) -> Result<Transfer> {
        self.request(|response| StoreMessage::Fail {
            source_tx,
            reason,
            response,
        })
        .await
    }

    /// Store a root registration record
    pub async fn put_root(&self, registration: RootRegistration) -> Result<()> {
        self.request(|response| StoreMessage::PutRoot {
            registration,
            response,
        })
        .await
    }

    /// Attach the registration tx to a stored root
    pub async fn mark_root_registered(
        &self,
        target: LedgerId,
        root: Digest,
        registered_ref: TxHash,
    ) -> Result<RootRegistration> {
        self.request(|response| StoreMessage::MarkRootRegistered {
            target,
            root,
            registered_ref,
            response,
        })
        .await
    }

    /// Advance a checkpoint; returns the stored value
    pub async fn set_checkpoint(&self, ledger: LedgerId, block: u64) -> Result<u64> {
        self.request(|response| StoreMessage::SetCheckpoint {
            ledger,
            block,
            response,
        })
        .await
    }

    /// Drain the mailbox, flush and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|response| StoreMessage::Shutdown { response })
            .await
    }
}

/// Spawn the store actor
pub fn spawn_store_actor(storage: Arc<Storage>, mailbox_capacity: usize) -> StoreHandle {
    // Bounded channel for backpressure
    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1));
    let actor = StoreActor::new(storage, rx);

    tokio::spawn(async move {
        actor.run().await;
    });

    StoreHandle::new(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, Amount, LeafFields, TransferKind};
    use crate::Config;

    fn open() -> (Arc<Storage>, StoreHandle, tempfile::TempDir) {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.rocksdb.sync_writes = false;

        let storage = Arc::new(Storage::open(&config).unwrap());
        let handle = spawn_store_actor(storage.clone(), 16);
        (storage, handle, temp_dir)
    }

    fn transfer(nonce: u64) -> Transfer {
        let fields = LeafFields {
            sender: Address::repeat_byte(1),
            recipient: Address::repeat_byte(2),
            amount: Amount(10),
            nonce,
            source_ledger: LedgerId(1),
            dest_ledger: LedgerId(2),
            source_timestamp: 1,
        };
        Transfer::observed(Digest([nonce as u8; 32]), 1, TransferKind::Lock, fields)
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let (_storage, handle, _temp) = open();
        handle.shutdown().await.unwrap();

        // Mailbox is closed afterwards
        assert!(matches!(
            handle.record_observed(transfer(1)).await,
            Err(Error::Concurrency(_))
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (storage, handle, _temp) = open();
        let t = transfer(1);
        let tx = t.source_tx;

        assert!(handle.record_observed(t).await.unwrap());

        let root = Digest([7u8; 32]);
        let building = handle.begin_proof(tx, vec![], root).await.unwrap();
        assert_eq!(building.status, TransferStatus::ProofBuilding);
        assert_eq!(building.root, Some(root));

        let dest = Digest([9u8; 32]);
        handle.record_submission(tx, dest).await.unwrap();
        assert_eq!(
            storage.get_transfer(&tx).unwrap().unwrap().dest_settlement_ref,
            Some(dest)
        );

        let done = handle.complete(tx, dest).await.unwrap();
        assert_eq!(done.status, TransferStatus::Completed);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_completed_is_immutable() {
        let (storage, handle, _temp) = open();
        let t = transfer(2);
        let tx = t.source_tx;

        handle.record_observed(t).await.unwrap();
        handle.begin_proof(tx, vec![], Digest::ZERO).await.unwrap();
        handle.complete(tx, Digest([1u8; 32])).await.unwrap();

        let err = handle.fail(tx, "late".into()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let err = handle.begin_proof(tx, vec![], Digest::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        let stored = storage.get_transfer(&tx).unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
        assert!(stored.error.is_none());
    }

    #[tokio::test]
    async fn test_pending_cannot_complete() {
        let (_storage, handle, _temp) = open();
        let t = transfer(3);
        let tx = t.source_tx;
        handle.record_observed(t).await.unwrap();

        assert!(handle.complete(tx, Digest::ZERO).await.is_err());
        assert!(handle.record_submission(tx, Digest::ZERO).await.is_err());
        assert!(handle.restore_proof(tx, vec![], Digest::ZERO).await.is_err());

        // Failing needs a transfer that entered proof building
        let err = handle.fail(tx, "unsupported destination".into()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TransferStatus::Pending,
                to: TransferStatus::Failed,
                ..
            }
        ));

        handle.begin_proof(tx, vec![], Digest::ZERO).await.unwrap();
        let failed = handle.fail(tx, "unsupported destination".into()).await.unwrap();
        assert_eq!(failed.error.as_deref(), Some("unsupported destination"));
    }

    #[tokio::test]
    async fn test_begin_proof_only_from_pending() {
        let (storage, handle, _temp) = open();
        let t = transfer(5);
        let tx = t.source_tx;
        handle.record_observed(t).await.unwrap();

        let root = Digest([7u8; 32]);
        let proof = vec![Digest([8u8; 32])];
        handle.begin_proof(tx, proof.clone(), root).await.unwrap();
        let submitted = Digest([9u8; 32]);
        handle.record_submission(tx, submitted).await.unwrap();

        let err = handle
            .begin_proof(tx, vec![Digest([1u8; 32])], Digest([2u8; 32]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: TransferStatus::ProofBuilding,
                to: TransferStatus::ProofBuilding,
                ..
            }
        ));

        let stored = storage.get_transfer(&tx).unwrap().unwrap();
        assert_eq!(stored.proof, Some(proof));
        assert_eq!(stored.root, Some(root));
        assert_eq!(stored.dest_settlement_ref, Some(submitted));
    }

    #[tokio::test]
    async fn test_restore_proof_fills_only_missing() {
        let (storage, handle, _temp) = open();
        let t = transfer(6);
        let tx = t.source_tx;
        handle.record_observed(t).await.unwrap();
        handle.begin_proof(tx, vec![], Digest([3u8; 32])).await.unwrap();

        // Row already carries a root
        assert!(handle.restore_proof(tx, vec![], Digest([4u8; 32])).await.is_err());
        assert_eq!(storage.get_transfer(&tx).unwrap().unwrap().root, Some(Digest([3u8; 32])));

        // Simulate a row persisted without its proof
        let mut bare = storage.get_transfer(&tx).unwrap().unwrap();
        bare.proof = None;
        bare.root = None;
        storage.update_transfer(TransferStatus::ProofBuilding, &bare).unwrap();

        let restored = handle.restore_proof(tx, vec![], Digest([4u8; 32])).await.unwrap();
        assert_eq!(restored.status, TransferStatus::ProofBuilding);
        assert_eq!(restored.root, Some(Digest([4u8; 32])));
    }

    #[tokio::test]
    async fn test_unknown_transfer() {
        let (_storage, handle, _temp) = open();
        let err = handle.begin_proof(Digest([42u8; 32]), vec![], Digest::ZERO).await.unwrap_err();
        assert!(matches!(err, Error::TransferNotFound(_)));
    }

    #[tokio::test]
    async fn test_concurrent_record_observed_single_row() {
        let (storage, handle, _temp) = open();
        let t = transfer(4);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handle = handle.clone();
            let mut copy = t.clone();
            copy.id = uuid::Uuid::now_v7();
            tasks.push(tokio::spawn(async move { handle.record_observed(copy).await.unwrap() }));
        }

        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        assert_eq!(storage.counts().unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_checkpoint_monotonic() {
        let (storage, handle, _temp) = open();

        assert_eq!(handle.set_checkpoint(LedgerId(1), 10).await.unwrap(), 10);
        assert_eq!(handle.set_checkpoint(LedgerId(1), 5).await.unwrap(), 10);
        assert_eq!(storage.get_checkpoint(LedgerId(1)).unwrap(), Some(10));
        assert_eq!(handle.set_checkpoint(LedgerId(1), 11).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_root_registration_marking() {
        let (storage, handle, _temp) = open();
        let root = Digest([5u8; 32]);

        assert!(matches!(
            handle.mark_root_registered(LedgerId(2), root, Digest::ZERO).await,
            Err(Error::RootNotFound(_))
        ));

        handle
            .put_root(RootRegistration {
                root,
                target_ledger: LedgerId(2),
                member_count: 1,
                registered_ref: None,
            })
            .await
            .unwrap();
        let marked = handle
            .mark_root_registered(LedgerId(2), root, Digest([6u8; 32]))
            .await
            .unwrap();
        assert!(marked.is_registered());
        assert!(storage.get_root(LedgerId(2), &root).unwrap().unwrap().is_registered());
    }
}
