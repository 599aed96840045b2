//! Relay driver
//!
//! Takes pending transfers, builds their proof, makes sure the root is
//! registered on the destination and submits the settlement there.
//!
//! ## Idempotency
//!
//! Before every submission the destination validator is asked whether the
//! nonce is already consumed; a consumed nonce is resolved to the settlement
//! that consumed it instead of being sent again. A retried submission checks
//! the same thing before its next attempt, and a replay rejection is resolved
//! the same way. The destination validator remains the final guard.
//!
//! ## Concurrency
//!
//! Groups (one per destination ledger) run concurrently; transfers within a
//! group run one at a time. A transfer is held by at most one task through
//! the in-flight map.

use crate::chain::{LedgerRuntime, Outcome, Receipt};
use crate::config::ProofStrategy;
use crate::context::RelayContext;
use crate::retry::RetryPolicy;
use crate::{Error, Result};
use bridge_core::{
    Digest, LedgerId, MerkleTree, Rejection, RootRegistration, SettlementClaim,
    SignedRootRegistration, Transfer, TransferKind, TransferStatus, TxHash,
};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Outcome counts of one driver cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Transfers completed
    pub completed: usize,
    /// Transfers marked failed
    pub failed: usize,
    /// Transfers left for a later cycle or restart
    pub deferred: usize,
}

impl CycleReport {
    fn merge(&mut self, other: CycleReport) {
        self.completed += other.completed;
        self.failed += other.failed;
        self.deferred += other.deferred;
    }

    fn add(&mut self, settled: Settled) {
        match settled {
            Settled::Completed => self.completed += 1,
            Settled::Failed => self.failed += 1,
            Settled::Deferred => self.deferred += 1,
        }
    }
}

enum Settled {
    Completed,
    Failed,
    Deferred,
}

/// Removes a transfer from the in-flight map when dropped
struct InFlight {
    map: Arc<DashMap<(LedgerId, u64), ()>>,
    key: (LedgerId, u64),
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

/// Relay driver
#[derive(Debug, Clone)]
pub struct Driver {
    ctx: RelayContext,
    retry: RetryPolicy,
    in_flight: Arc<DashMap<(LedgerId, u64), ()>>,
}

impl Driver {
    /// Create a driver
    pub fn new(ctx: RelayContext) -> Self {
        let retry = RetryPolicy::new(ctx.config.retry.clone());
        Self {
            ctx,
            retry,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Claim a transfer's nonce for this task
    fn hold(&self, transfer: &Transfer) -> Option<InFlight> {
        let key = (transfer.source_ledger(), transfer.nonce());
        match self.in_flight.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InFlight {
                    map: self.in_flight.clone(),
                    key,
                })
            }
        }
    }

    /// Recover, then drive pending transfers until shutdown
    ///
    /// Transfers stuck in ProofBuilding are swept again every
    /// `recovery_interval`, not only at startup.
    pub async fn run(self) {
        let mut shutdown = self.ctx.shutdown.clone();
        let recovery_interval = self.ctx.config.driver.recovery_interval();

        self.sweep().await;
        let mut next_recovery = Instant::now() + recovery_interval;

        info!(
            strategy = ?self.ctx.config.driver.strategy,
            batch_size = self.ctx.config.driver.batch_size,
            recovery_interval_ms = recovery_interval.as_millis() as u64,
            "Relay driver started"
        );

        while !*shutdown.borrow() {
            match self.run_once().await {
                Ok(report) if report != CycleReport::default() => {
                    debug!(
                        completed = report.completed,
                        failed = report.failed,
                        deferred = report.deferred,
                        "Driver cycle"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Driver cycle failed"),
            }

            if Instant::now() >= next_recovery {
                self.sweep().await;
                next_recovery = Instant::now() + recovery_interval;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.ctx.config.driver.poll_interval()) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Relay driver stopped");
    }

    async fn sweep(&self) {
        match self.recover().await {
            Ok(report) if report != CycleReport::default() => {
                info!(
                    completed = report.completed,
                    failed = report.failed,
                    deferred = report.deferred,
                    "Recovered in-flight transfers"
                );
            }
            Ok(_) => {}
            Err(e) => error!(error = %e, "Recovery failed"),
        }
    }

    /// One cycle over pending transfers
    pub async fn run_once(&self) -> Result<CycleReport> {
        let pending = self
            .ctx
            .ledger
            .list_by_status(TransferStatus::Pending, self.ctx.config.driver.batch_size)?;

        let mut report = CycleReport::default();
        if pending.is_empty() {
            return Ok(report);
        }

        let mut groups: BTreeMap<LedgerId, Vec<Transfer>> = BTreeMap::new();
        for transfer in pending {
            groups.entry(transfer.dest_ledger()).or_default().push(transfer);
        }

        let mut tasks = JoinSet::new();
        for (dest, transfers) in groups {
            let driver = self.clone();
            tasks.spawn(async move { driver.process_group(dest, transfers).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(group) => report.merge(group),
                Err(e) => error!(error = %e, "Settlement group task failed"),
            }
        }

        Ok(report)
    }

    async fn process_group(&self, dest: LedgerId, transfers: Vec<Transfer>) -> CycleReport {
        let mut report = CycleReport::default();

        let held: Vec<(Transfer, InFlight)> = transfers
            .into_iter()
            .filter_map(|t| self.hold(&t).map(|guard| (t, guard)))
            .collect();
        if held.is_empty() {
            return report;
        }

        let prepared = match self.prepare(dest, &held).await {
            Ok(prepared) => prepared,
            Err(e) => {
                error!(dest = %dest, error = %e, "Proof construction failed");
                report.deferred += held.len();
                return report;
            }
        };

        for (transfer, member_count) in prepared {
            if self.ctx.is_shutting_down() {
                report.deferred += 1;
                continue;
            }
            let started = Instant::now();
            let result = self.drive_settlement(&transfer, member_count).await;
            report.add(self.finish(&transfer, started, result).await);
        }

        report
    }

    /// Build proofs and move the group to ProofBuilding
    async fn prepare(
        &self,
        dest: LedgerId,
        held: &[(Transfer, InFlight)],
    ) -> Result<Vec<(Transfer, u64)>> {
        let mut prepared = Vec::with_capacity(held.len());

        match self.ctx.config.driver.strategy {
            ProofStrategy::Single => {
                for (transfer, _) in held {
                    // A one-leaf tree: root is the leaf, proof is empty
                    if let Some(t) = self.begin(transfer, Vec::new(), transfer.leaf_digest).await {
                        prepared.push((t, 1));
                    }
                }
            }
            ProofStrategy::Batched => {
                let leaves: Vec<Digest> = held.iter().map(|(t, _)| t.leaf_digest).collect();
                let tree = MerkleTree::build(&leaves)?;
                let root = tree.root();
                let member_count = tree.len() as u64;
                debug!(dest = %dest, root = %root, leaves = member_count, "Built proof tree");

                for (index, (transfer, _)) in held.iter().enumerate() {
                    let proof = tree.proof_at(index)?;
                    if let Some(t) = self.begin(transfer, proof, root).await {
                        prepared.push((t, member_count));
                    }
                }
            }
        }

        Ok(prepared)
    }

    async fn begin(&self, transfer: &Transfer, proof: Vec<Digest>, root: Digest) -> Option<Transfer> {
        match self.ctx.ledger.begin_proof(transfer.source_tx, proof, root).await {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(source_tx = %transfer.source_tx, error = %e, "Could not start proof");
                None
            }
        }
    }

    /// Register the root if needed, then settle exactly once
    async fn drive_settlement(&self, transfer: &Transfer, member_count: u64) -> Result<TxHash> {
        let runtime = self.ctx.runtime(transfer.dest_ledger())?;
        let (proof, root) = match (&transfer.proof, transfer.root) {
            (Some(proof), Some(root)) => (proof.clone(), root),
            _ => {
                return Err(Error::Inconsistency(format!(
                    "transfer {} has no proof",
                    transfer.source_tx
                )))
            }
        };

        self.ensure_root(&runtime, root, member_count).await?;

        if self.ctx.is_shutting_down() {
            return Err(Error::Shutdown);
        }

        if let Some(existing) = self.existing_settlement(&runtime, transfer).await? {
            return Ok(existing);
        }

        let claim = SettlementClaim::new(&transfer.fields, proof, root);
        let dest_ref = self.submit(&runtime, transfer, claim).await?;
        self.ctx
            .ledger
            .record_submission(transfer.source_tx, dest_ref)
            .await?;

        self.await_receipt(&runtime, dest_ref).await?;
        Ok(dest_ref)
    }

    async fn ensure_root(
        &self,
        runtime: &Arc<dyn LedgerRuntime>,
        root: Digest,
        member_count: u64,
    ) -> Result<()> {
        let target = runtime.ledger_id();
        let metrics = &self.ctx.metrics;

        match self.ctx.ledger.get_root_registration(target, &root)? {
            Some(registration) if registration.is_registered() => return Ok(()),
            Some(_) => {}
            None => {
                self.ctx
                    .ledger
                    .put_root_registration(RootRegistration {
                        root,
                        target_ledger: target,
                        member_count,
                        registered_ref: None,
                    })
                    .await?;
            }
        }

        if let Some(tx) = self.registration_tx(runtime, root).await? {
            debug!(
                ledger = %target,
                root = %root,
                registration_tx = %tx,
                "Root already registered on ledger"
            );
            self.ctx.ledger.mark_root_registered(target, root, tx).await?;
            return Ok(());
        }

        let registration = SignedRootRegistration {
            ledger: target,
            root,
            member_count,
            signature: self
                .ctx
                .identity
                .sign_root_registration(target, &root, member_count),
        };

        let submitted = self
            .retry
            .execute("register_root", metrics, |attempt| {
                let registration = registration.clone();
                async move {
                    // An earlier attempt may have landed after timing out
                    if attempt > 0 {
                        if let Some(tx) = runtime.root_registration(registration.root).await? {
                            return Ok(tx);
                        }
                    }
                    runtime.register_root(registration).await
                }
            })
            .await;

        let tx = match submitted {
            Ok(tx) => Some(tx),
            Err(Error::Rejected(Rejection::DuplicateRoot(_))) => {
                self.registration_tx(runtime, root).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(tx) = tx {
            self.await_receipt(runtime, tx).await?;
            self.ctx.ledger.mark_root_registered(target, root, tx).await?;
            metrics.record_root_registered();
            info!(
                ledger = %target,
                root = %root,
                member_count,
                registration_tx = %tx,
                "Root registered"
            );
        }

        Ok(())
    }

    async fn registration_tx(
        &self,
        runtime: &Arc<dyn LedgerRuntime>,
        root: Digest,
    ) -> Result<Option<TxHash>> {
        self.retry
            .execute("root_registration", &self.ctx.metrics, |_| {
                runtime.root_registration(root)
            })
            .await
    }

    /// Settlement already on the destination for this transfer, if any
    async fn existing_settlement(
        &self,
        runtime: &Arc<dyn LedgerRuntime>,
        transfer: &Transfer,
    ) -> Result<Option<TxHash>> {
        let nonce = transfer.nonce();
        let used = self
            .retry
            .execute("is_nonce_used", &self.ctx.metrics, |_| runtime.is_nonce_used(nonce))
            .await?;
        if !used {
            return Ok(None);
        }

        let found = self.lookup_settlement(runtime, transfer).await?;
        info!(
            source_tx = %transfer.source_tx,
            nonce,
            dest_ref = %found,
            "Transfer already settled on destination"
        );
        Ok(Some(found))
    }

    async fn lookup_settlement(
        &self,
        runtime: &Arc<dyn LedgerRuntime>,
        transfer: &Transfer,
    ) -> Result<TxHash> {
        let source = transfer.source_ledger();
        let nonce = transfer.nonce();
        self.retry
            .execute("find_settlement", &self.ctx.metrics, |_| {
                runtime.find_settlement(source, nonce)
            })
            .await?
            .ok_or_else(|| {
                Error::Inconsistency(format!(
                    "nonce {} consumed on ledger {} without a settlement from ledger {}",
                    nonce,
                    runtime.ledger_id(),
                    source
                ))
            })
    }

    async fn submit(
        &self,
        runtime: &Arc<dyn LedgerRuntime>,
        transfer: &Transfer,
        claim: SettlementClaim,
    ) -> Result<TxHash> {
        let kind = transfer.kind;
        let source = transfer.source_ledger();
        let source_tx = transfer.source_tx;
        let nonce = transfer.nonce();

        let submitted = self
            .retry
            .execute(kind.completing_operation(), &self.ctx.metrics, |attempt| {
                let claim = claim.clone();
                async move {
                    if attempt > 0 {
                        if let Some(tx) = runtime.find_settlement(source, nonce).await? {
                            return Ok(tx);
                        }
                    }
                    match kind {
                        TransferKind::Lock => runtime.mint(claim, source_tx).await,
                        TransferKind::Burn => runtime.unlock(claim).await,
                    }
                }
            })
            .await;

        match submitted {
            Ok(tx) => {
                debug!(source_tx = %source_tx, dest_ref = %tx, "Settlement submitted");
                Ok(tx)
            }
            Err(e) if e.is_replay() => {
                warn!(source_tx = %source_tx, nonce, "Nonce already consumed at submission");
                self.lookup_settlement(runtime, transfer).await
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for `tx` to settle on `runtime`
    async fn await_receipt(&self, runtime: &Arc<dyn LedgerRuntime>, tx: TxHash) -> Result<()> {
        let driver = &self.ctx.config.driver;
        let deadline = Instant::now() + driver.settlement_timeout();

        loop {
            match self.retry.timed("receipt", runtime.receipt(tx)).await {
                Ok(Some(Receipt { outcome, .. })) => {
                    return match outcome {
                        Outcome::Success => Ok(()),
                        Outcome::Reverted(reason) => Err(Error::Reverted(reason)),
                    };
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    debug!(tx = %tx, error = %e, "Receipt lookup failed");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "{} not settled within {:?}",
                    tx,
                    driver.settlement_timeout()
                )));
            }
            tokio::time::sleep(driver.receipt_poll_interval()).await;
        }
    }

    async fn finish(&self, transfer: &Transfer, started: Instant, result: Result<TxHash>) -> Settled {
        let source_tx = transfer.source_tx;

        let stored = match result {
            Ok(dest_ref) => match self.ctx.ledger.complete(source_tx, dest_ref).await {
                Ok(_) => {
                    let elapsed = started.elapsed();
                    self.ctx.metrics.record_completed(elapsed.as_secs_f64());
                    info!(
                        source_tx = %source_tx,
                        kind = %transfer.kind,
                        nonce = transfer.nonce(),
                        dest_ref = %dest_ref,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Transfer completed"
                    );
                    return Settled::Completed;
                }
                Err(e) => e,
            },
            Err(Error::Shutdown) => {
                info!(source_tx = %source_tx, "Shutdown before settlement, left for recovery");
                return Settled::Deferred;
            }
            Err(e) => {
                error!(
                    source_tx = %source_tx,
                    kind = %transfer.kind,
                    nonce = transfer.nonce(),
                    error = %e,
                    "Transfer failed"
                );
                match self.ctx.ledger.fail(source_tx, e.to_string()).await {
                    Ok(_) => {
                        self.ctx.metrics.record_failed();
                        return Settled::Failed;
                    }
                    Err(e) => e,
                }
            }
        };

        error!(source_tx = %source_tx, error = %stored, "Could not store transfer outcome");
        Settled::Deferred
    }

    /// Resume transfers left in ProofBuilding by an earlier run
    pub async fn recover(&self) -> Result<CycleReport> {
        let in_progress = self
            .ctx
            .ledger
            .list_by_status(TransferStatus::ProofBuilding, usize::MAX)?;

        let mut report = CycleReport::default();
        for transfer in in_progress {
            let Some(_guard) = self.hold(&transfer) else {
                continue;
            };
            if self.ctx.is_shutting_down() {
                report.deferred += 1;
                continue;
            }

            info!(
                source_tx = %transfer.source_tx,
                nonce = transfer.nonce(),
                submitted = transfer.dest_settlement_ref.is_some(),
                "Recovering transfer"
            );
            let started = Instant::now();
            let result = self.recover_one(&transfer).await;
            report.add(self.finish(&transfer, started, result).await);
        }

        Ok(report)
    }

    async fn recover_one(&self, transfer: &Transfer) -> Result<TxHash> {
        let runtime = self.ctx.runtime(transfer.dest_ledger())?;

        if let Some(dest_ref) = transfer.dest_settlement_ref {
            let receipt = self
                .retry
                .execute("receipt", &self.ctx.metrics, |_| runtime.receipt(dest_ref))
                .await?;
            if let Some(Receipt {
                outcome: Outcome::Success,
                ..
            }) = receipt
            {
                return Ok(dest_ref);
            }
        }

        if let Some(existing) = self.existing_settlement(&runtime, transfer).await? {
            return Ok(existing);
        }

        let transfer = match (&transfer.proof, transfer.root) {
            (Some(_), Some(_)) => transfer.clone(),
            _ => {
                self.ctx
                    .ledger
                    .restore_proof(transfer.source_tx, Vec::new(), transfer.leaf_digest)
                    .await?
            }
        };

        let member_count = match transfer.root {
            Some(root) => self
                .ctx
                .ledger
                .get_root_registration(transfer.dest_ledger(), &root)?
                .map(|r| r.member_count)
                .unwrap_or(1),
            None => 1,
        };

        self.drive_settlement(&transfer, member_count).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, SimulatedLedger};
    use bridge_core::{Address, Amount, KeyPair, LeafFields, TransferLedger};
    use std::time::Duration;
    use tokio::sync::watch;

    const S: LedgerId = LedgerId(1);
    const D: LedgerId = LedgerId(2);

    #[tokio::test]
    async fn test_run_sweeps_stranded_transfers_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.store.data_dir = dir.path().to_path_buf();
        config.driver.poll_interval_ms = 10;
        config.driver.receipt_poll_interval_ms = 5;
        config.driver.recovery_interval_ms = 50;
        config.retry.initial_backoff_ms = 1;
        config.retry.jitter = 0.0;

        let identity = Arc::new(KeyPair::from_seed(&[4u8; 32]));
        let source = Arc::new(SimulatedLedger::new(S, identity.verifying_key()));
        let dest = Arc::new(SimulatedLedger::new(D, identity.verifying_key()));
        let ledger = Arc::new(TransferLedger::open(config.store.clone()).unwrap());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let ctx = RelayContext::new(
            config,
            ledger.clone(),
            vec![
                source as Arc<dyn LedgerRuntime>,
                dest.clone() as Arc<dyn LedgerRuntime>,
            ],
            identity,
            shutdown_rx,
        )
        .unwrap();

        let fields = LeafFields {
            sender: Address::repeat_byte(1),
            recipient: Address::repeat_byte(2),
            amount: Amount(1_000),
            nonce: 1,
            source_ledger: S,
            dest_ledger: D,
            source_timestamp: 1_700_000_012,
        };
        let transfer = Transfer::observed(Digest([3u8; 32]), 1, TransferKind::Lock, fields);
        let tx = transfer.source_tx;
        ledger.record_observed(transfer.clone()).await.unwrap();
        ledger
            .begin_proof(tx, Vec::new(), transfer.leaf_digest)
            .await
            .unwrap();

        // Held elsewhere while the startup sweep runs
        let driver = Driver::new(ctx);
        let guard = driver.hold(&transfer).unwrap();
        let task = tokio::spawn(driver.clone().run());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(
            ledger.get(&tx).unwrap().unwrap().status,
            TransferStatus::ProofBuilding
        );
        drop(guard);

        let settled = tokio::time::timeout(Duration::from_secs(5), async {
            while ledger.get(&tx).unwrap().unwrap().status != TransferStatus::Completed {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(settled.is_ok());
        assert_eq!(dest.settlement_calls(), 1);

        shutdown.send_replace(true);
        task.await.unwrap();
        ledger.shutdown().await.unwrap();
    }
}
