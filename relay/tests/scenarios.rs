//! End-to-end relay scenarios over two simulated ledgers

use async_trait::async_trait;
use bridge_core::{
    Address, Amount, Digest, KeyPair, LedgerId, Rejection, SettlementClaim,
    SignedRootRegistration, TransferLedger, TransferStatus, TxHash, Validator,
};
use bridge_relay::{
    ChainEvent, Config, CycleReport, Driver, Error, LedgerRuntime, Observer, ProofStrategy,
    Receipt, RelayContext, RelayService, RetryConfig, SimulatedLedger,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, watch};

const S: LedgerId = LedgerId(1);
const D: LedgerId = LedgerId(2);

fn units(n: u64) -> Amount {
    Amount::from_units(Decimal::from(n)).unwrap()
}

fn alice() -> Address {
    Address::repeat_byte(0xa1)
}

fn bob() -> Address {
    Address::repeat_byte(0xb0)
}

struct Harness {
    source: Arc<SimulatedLedger>,
    dest: Arc<SimulatedLedger>,
    ledger: Arc<TransferLedger>,
    identity: Arc<KeyPair>,
    ctx: RelayContext,
    driver: Driver,
    observers: Vec<Observer>,
    shutdown: watch::Sender<bool>,
    _dir: TempDir,
}

impl Harness {
    fn new(strategy: ProofStrategy) -> Self {
        Self::with_config(|config| config.driver.strategy = strategy)
    }

    fn with_config(customize: impl FnOnce(&mut Config)) -> Self {
        Self::build(customize, |validator| validator, |dest| {
            dest as Arc<dyn LedgerRuntime>
        })
    }

    fn build(
        customize: impl FnOnce(&mut Config),
        dest_validator: impl FnOnce(Validator) -> Validator,
        dest_runtime: impl FnOnce(Arc<SimulatedLedger>) -> Arc<dyn LedgerRuntime>,
    ) -> Self {
        let dir = TempDir::new().unwrap();

        let mut config = Config::default();
        config.store.data_dir = dir.path().to_path_buf();
        for ledger in &mut config.ledgers {
            ledger.confirmations = 1;
            ledger.poll_interval_ms = 20;
        }
        config.retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
            jitter: 0.0,
            call_timeout_ms: 1_000,
        };
        config.driver.poll_interval_ms = 20;
        config.driver.receipt_poll_interval_ms = 5;
        config.driver.settlement_timeout_ms = 1_000;
        config.status_interval_ms = 20;
        customize(&mut config);

        let identity = Arc::new(KeyPair::from_seed(&[7u8; 32]));
        let source = Arc::new(SimulatedLedger::new(S, identity.verifying_key()));
        let dest = Arc::new(SimulatedLedger::with_validator(dest_validator(Validator::new(
            D,
            identity.verifying_key(),
        ))));
        let ledger = Arc::new(TransferLedger::open(config.store.clone()).unwrap());

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ledgers = config.ledgers.clone();
        let ctx = RelayContext::new(
            config,
            ledger.clone(),
            vec![
                source.clone() as Arc<dyn LedgerRuntime>,
                dest_runtime(dest.clone()),
            ],
            identity.clone(),
            shutdown_rx,
        )
        .unwrap();

        let observers = ledgers
            .into_iter()
            .map(|cfg| Observer::new(ctx.clone(), cfg).unwrap())
            .collect();

        Self {
            source,
            dest,
            ledger,
            identity,
            driver: Driver::new(ctx.clone()),
            ctx,
            observers,
            shutdown,
            _dir: dir,
        }
    }

    /// Finalize everything mined so far and observe both ledgers
    async fn observe(&mut self) -> usize {
        self.source.mine(1);
        self.dest.mine(1);
        let mut recorded = 0;
        for observer in &mut self.observers {
            recorded += observer.poll_once().await.unwrap();
        }
        recorded
    }

    fn status_of(&self, source_tx: &TxHash) -> TransferStatus {
        self.ledger.get(source_tx).unwrap().unwrap().status
    }

    fn signed_root(&self, root: Digest) -> SignedRootRegistration {
        SignedRootRegistration {
            ledger: D,
            root,
            member_count: 1,
            signature: self.identity.sign_root_registration(D, &root, 1),
        }
    }
}

/// Destination whose clock moves one block whenever a root registration is
/// rate limited, as it would while the relay backs off
#[derive(Debug)]
struct TickingOnRateLimit(Arc<SimulatedLedger>);

#[async_trait]
impl LedgerRuntime for TickingOnRateLimit {
    fn ledger_id(&self) -> LedgerId {
        self.0.ledger_id()
    }

    async fn head(&self) -> bridge_relay::Result<u64> {
        self.0.head().await
    }

    async fn events(&self, from: u64, to: u64) -> bridge_relay::Result<Vec<ChainEvent>> {
        self.0.events(from, to).await
    }

    fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.0.subscribe()
    }

    async fn register_root(
        &self,
        registration: SignedRootRegistration,
    ) -> bridge_relay::Result<TxHash> {
        let result = self.0.register_root(registration).await;
        if let Err(Error::Rejected(Rejection::RateLimited { .. })) = &result {
            self.0.mine(1);
        }
        result
    }

    async fn mint(
        &self,
        claim: SettlementClaim,
        source_ref: TxHash,
    ) -> bridge_relay::Result<TxHash> {
        self.0.mint(claim, source_ref).await
    }

    async fn unlock(&self, claim: SettlementClaim) -> bridge_relay::Result<TxHash> {
        self.0.unlock(claim).await
    }

    async fn receipt(&self, tx_hash: TxHash) -> bridge_relay::Result<Option<Receipt>> {
        self.0.receipt(tx_hash).await
    }

    async fn is_nonce_used(&self, nonce: u64) -> bridge_relay::Result<bool> {
        self.0.is_nonce_used(nonce).await
    }

    async fn is_root_valid(&self, root: Digest) -> bridge_relay::Result<bool> {
        self.0.is_root_valid(root).await
    }

    async fn root_registration(&self, root: Digest) -> bridge_relay::Result<Option<TxHash>> {
        self.0.root_registration(root).await
    }

    async fn find_settlement(
        &self,
        source_ledger: LedgerId,
        nonce: u64,
    ) -> bridge_relay::Result<Option<TxHash>> {
        self.0.find_settlement(source_ledger, nonce).await
    }
}

#[tokio::test]
async fn test_lock_is_minted_once() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(10)).unwrap();

    let (source_tx, nonce) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    assert_eq!(h.observe().await, 1);
    assert_eq!(h.status_of(&source_tx), TransferStatus::Pending);

    let report = h.driver.run_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(transfer.root, Some(transfer.leaf_digest));
    assert_eq!(transfer.proof, Some(Vec::new()));
    let dest_ref = transfer.dest_settlement_ref.unwrap();
    assert_eq!(h.dest.find_settlement(S, nonce).await.unwrap(), Some(dest_ref));

    assert!(h.dest.is_nonce_used(nonce).await.unwrap());
    assert_eq!(h.dest.wrapped_balance_of(bob()), units(1));
    assert_eq!(h.source.balance_of(alice()), units(9));
    assert_eq!(h.source.accounting().custodied, units(1));
    assert_eq!(h.dest.root_count(), 1);
    assert_eq!(h.dest.settlement_calls(), 1);

    let registration = h
        .ledger
        .get_root_registration(D, &transfer.leaf_digest)
        .unwrap()
        .unwrap();
    assert!(registration.is_registered());
    assert_eq!(registration.member_count, 1);

    assert_eq!(h.ctx.metrics.transfers_observed.get(), 1);
    assert_eq!(h.ctx.metrics.transfers_completed.get(), 1);

    // Nothing left to do
    assert_eq!(h.driver.run_once().await.unwrap().completed, 0);
    assert_eq!(h.dest.settlement_calls(), 1);
}

#[tokio::test]
async fn test_replayed_mint_is_rejected() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(10)).unwrap();

    let (source_tx, nonce) = h.source.lock(alice(), bob(), units(2), D).unwrap();
    h.observe().await;
    h.driver.run_once().await.unwrap();

    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    let claim = SettlementClaim::new(
        &transfer.fields,
        transfer.proof.clone().unwrap(),
        transfer.root.unwrap(),
    );

    let replay = h.dest.mint(claim, source_tx).await;
    assert!(matches!(
        replay,
        Err(Error::Rejected(Rejection::NonceAlreadyUsed(n))) if n == nonce
    ));
    assert_eq!(h.dest.wrapped_balance_of(bob()), units(2));
    assert_eq!(h.dest.accounting().wrapped_supply, units(2));
}

#[tokio::test]
async fn test_round_trip_conserves_value() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(10)).unwrap();

    let (lock_tx, _) = h.source.lock(alice(), bob(), units(3), D).unwrap();
    h.observe().await;
    assert_eq!(h.driver.run_once().await.unwrap().completed, 1);
    assert_eq!(h.status_of(&lock_tx), TransferStatus::Completed);
    assert_eq!(h.dest.wrapped_balance_of(bob()), units(3));

    let half = Amount::from_units(Decimal::new(15, 1)).unwrap();
    let (burn_tx, _) = h.dest.burn(bob(), alice(), half, S).unwrap();
    assert_eq!(h.observe().await, 1);
    assert_eq!(h.driver.run_once().await.unwrap().completed, 1);

    let burn = h.ledger.get(&burn_tx).unwrap().unwrap();
    assert_eq!(burn.status, TransferStatus::Completed);
    assert_eq!(burn.source_ledger(), D);

    assert_eq!(h.dest.wrapped_balance_of(bob()), half);
    assert_eq!(
        h.source.balance_of(alice()),
        Amount::from_units(Decimal::new(85, 1)).unwrap()
    );

    let source = h.source.accounting();
    let dest = h.dest.accounting();
    assert_eq!(source.custodied, half);
    assert_eq!(dest.wrapped_supply, half);
    assert_eq!(source.custodied, dest.wrapped_supply);
    assert!(source.is_balanced());
    assert!(dest.is_balanced());
}

#[tokio::test]
async fn test_recovery_after_submission() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();

    let (source_tx, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;
    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    let leaf = transfer.leaf_digest;

    // A previous run got as far as submitting the mint
    h.ledger
        .begin_proof(source_tx, Vec::new(), leaf)
        .await
        .unwrap();
    h.dest.register_root(h.signed_root(leaf)).await.unwrap();
    let claim = SettlementClaim::new(&transfer.fields, Vec::new(), leaf);
    let dest_tx = h.dest.mint(claim, source_tx).await.unwrap();
    h.ledger.record_submission(source_tx, dest_tx).await.unwrap();

    let report = Driver::new(h.ctx.clone()).recover().await.unwrap();
    assert_eq!(report.completed, 1);

    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(transfer.dest_settlement_ref, Some(dest_tx));
    assert_eq!(h.dest.settlement_calls(), 1);
    assert_eq!(h.dest.wrapped_balance_of(bob()), units(1));
}

#[tokio::test]
async fn test_recovery_before_submission_is_recorded() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();

    let (source_tx, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;
    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    let leaf = transfer.leaf_digest;

    // Minted, but the run stopped before remembering the destination tx
    h.ledger
        .begin_proof(source_tx, Vec::new(), leaf)
        .await
        .unwrap();
    h.dest.register_root(h.signed_root(leaf)).await.unwrap();
    let claim = SettlementClaim::new(&transfer.fields, Vec::new(), leaf);
    let dest_tx = h.dest.mint(claim, source_tx).await.unwrap();

    let report = Driver::new(h.ctx.clone()).recover().await.unwrap();
    assert_eq!(report.completed, 1);

    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(transfer.dest_settlement_ref, Some(dest_tx));
    assert_eq!(h.dest.settlement_calls(), 1);
    assert_eq!(h.dest.root_count(), 1);
}

#[tokio::test]
async fn test_observer_restart_does_not_duplicate() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    h.source.lock(alice(), bob(), units(1), D).unwrap();

    assert_eq!(h.observe().await, 1);
    assert_eq!(h.ledger.checkpoint(S).unwrap(), Some(1));

    // Fresh observer rewinds by the replay window and re-reads the lock
    let cfg = h.ctx.config.ledger(S).unwrap().clone();
    let mut restarted = Observer::new(h.ctx.clone(), cfg).unwrap();
    assert_eq!(restarted.next_block(), 0);
    assert_eq!(restarted.poll_once().await.unwrap(), 0);

    assert_eq!(h.ledger.counts().unwrap().total, 1);
    assert_eq!(h.ctx.metrics.transfers_observed.get(), 1);
}

#[tokio::test]
async fn test_unconfirmed_events_wait() {
    let h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    h.source.lock(alice(), bob(), units(1), D).unwrap();

    let cfg = h.ctx.config.ledger(S).unwrap().clone();
    let mut observer = Observer::new(h.ctx.clone(), cfg).unwrap();

    // Lock is at the head; one confirmation is required
    assert_eq!(observer.poll_once().await.unwrap(), 0);
    assert_eq!(h.ledger.counts().unwrap().total, 0);

    h.source.mine(1);
    assert_eq!(observer.poll_once().await.unwrap(), 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    let (source_tx, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;

    h.dest.fail_next(2);
    let report = h.driver.run_once().await.unwrap();

    assert_eq!(report.completed, 1);
    assert_eq!(h.status_of(&source_tx), TransferStatus::Completed);
    assert!(h.ctx.metrics.remote_retries.get() >= 2);
    assert_eq!(h.dest.settlement_calls(), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_transfer() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    let (source_tx, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;

    h.dest.fail_next(10);
    let report = h.driver.run_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    assert_eq!(transfer.status, TransferStatus::Failed);
    assert!(transfer.error.unwrap().starts_with("unavailable"));
    assert_eq!(h.ctx.metrics.transfers_failed.get(), 1);

    // Failed transfers stay failed
    h.dest.fail_next(0);
    assert_eq!(h.driver.run_once().await.unwrap(), CycleReport::default());
    assert_eq!(h.status_of(&source_tx), TransferStatus::Failed);
    assert_eq!(h.dest.settlement_calls(), 0);
    assert_eq!(h.dest.wrapped_balance_of(bob()), Amount::ZERO);
}

#[tokio::test]
async fn test_batched_strategy_registers_one_root() {
    let mut h = Harness::new(ProofStrategy::Batched);
    let carol = Address::repeat_byte(0xc0);
    h.source.fund(alice(), units(10)).unwrap();

    let (first, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    let (second, _) = h.source.lock(alice(), carol, units(2), D).unwrap();
    assert_eq!(h.observe().await, 2);

    let report = h.driver.run_once().await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(h.dest.root_count(), 1);

    let first = h.ledger.get(&first).unwrap().unwrap();
    let second = h.ledger.get(&second).unwrap().unwrap();
    assert_eq!(first.status, TransferStatus::Completed);
    assert_eq!(second.status, TransferStatus::Completed);
    assert_eq!(first.root, second.root);
    assert_eq!(first.proof.as_ref().unwrap().len(), 1);

    let root = first.root.unwrap();
    assert_ne!(root, first.leaf_digest);
    let registration = h.ledger.get_root_registration(D, &root).unwrap().unwrap();
    assert_eq!(registration.member_count, 2);
    assert_eq!(h.ctx.metrics.roots_registered.get(), 1);

    assert_eq!(h.dest.wrapped_balance_of(bob()), units(1));
    assert_eq!(h.dest.wrapped_balance_of(carol), units(2));
}

#[tokio::test]
async fn test_concurrent_cycles_settle_once() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;

    let other = h.driver.clone();
    let (a, b) = tokio::join!(h.driver.run_once(), other.run_once());
    assert_eq!(a.unwrap().completed + b.unwrap().completed, 1);
    assert_eq!(h.dest.settlement_calls(), 1);
    assert_eq!(h.dest.wrapped_balance_of(bob()), units(1));
}

#[tokio::test]
async fn test_invalid_events_are_not_recorded() {
    let mut h = Harness::with_config(|config| {
        config.validation.max_amount = Decimal::from(5);
    });
    h.source.fund(alice(), units(100)).unwrap();

    h.source.lock(alice(), bob(), units(10), D).unwrap();
    h.source
        .lock(alice(), Address::repeat_byte(0), units(1), D)
        .unwrap();

    assert_eq!(h.observe().await, 0);
    assert_eq!(h.ledger.counts().unwrap().total, 0);
    assert_eq!(h.ctx.metrics.events_rejected.get(), 2);

    // The checkpoint still moves past them
    assert!(h.ledger.checkpoint(S).unwrap().is_some());
    h.source.lock(alice(), bob(), units(1), D).unwrap();
    assert_eq!(h.observe().await, 1);
}

#[tokio::test]
async fn test_service_settles_and_stops() {
    let h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();

    let service = RelayService::start(h.ctx.clone()).unwrap();
    let mut status = service.status();
    let (source_tx, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();

    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            h.source.mine(1);
            h.dest.mine(1);
            if h.status_of(&source_tx) == TransferStatus::Completed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(settled.is_ok());
    assert_eq!(h.dest.wrapped_balance_of(bob()), units(1));

    let published = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if status.borrow_and_update().counts.completed == 1 {
                break;
            }
            if status.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(published.is_ok());

    h.shutdown.send_replace(true);
    tokio::time::timeout(Duration::from_secs(5), service.join())
        .await
        .unwrap();
    h.ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_proof_fails_transfer() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    let (source_tx, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;

    // Proof that does not fold the leaf into the root
    let leaf = h.ledger.get(&source_tx).unwrap().unwrap().leaf_digest;
    h.ledger
        .begin_proof(source_tx, vec![Digest([9u8; 32])], leaf)
        .await
        .unwrap();

    let report = h.driver.recover().await.unwrap();
    assert_eq!(report.failed, 1);

    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    assert_eq!(transfer.status, TransferStatus::Failed);
    assert_eq!(transfer.error.as_deref(), Some("rejected: invalid merkle proof"));
    assert_eq!(h.dest.settlement_calls(), 1);
    assert_eq!(h.dest.wrapped_balance_of(bob()), Amount::ZERO);
    assert!(!h.dest.is_nonce_used(transfer.nonce()).await.unwrap());
    assert_eq!(h.ctx.metrics.transfers_failed.get(), 1);
    assert_eq!(h.ctx.metrics.remote_retries.get(), 0);
}

#[tokio::test]
async fn test_foreign_nonce_consumption_is_an_inconsistency() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    let (source_tx, nonce) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;

    h.dest.consume_nonce(nonce).unwrap();

    let report = h.driver.run_once().await.unwrap();
    assert_eq!(report.failed, 1);

    let transfer = h.ledger.get(&source_tx).unwrap().unwrap();
    assert_eq!(transfer.status, TransferStatus::Failed);
    let reason = transfer.error.unwrap();
    assert!(reason.starts_with("inconsistency"), "{}", reason);
    assert!(transfer.dest_settlement_ref.is_none());
    assert_eq!(h.dest.settlement_calls(), 0);
    assert_eq!(h.dest.wrapped_balance_of(bob()), Amount::ZERO);
}

#[tokio::test]
async fn test_rate_limited_registration_is_retried() {
    // Three blocks between registrations; each settlement mines two
    let mut h = Harness::build(
        |config| config.driver.strategy = ProofStrategy::Single,
        |validator| validator.with_min_registration_interval(36),
        |dest| Arc::new(TickingOnRateLimit(dest)) as Arc<dyn LedgerRuntime>,
    );
    h.source.fund(alice(), units(10)).unwrap();

    let (first, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    let (second, _) = h.source.lock(alice(), bob(), units(2), D).unwrap();
    assert_eq!(h.observe().await, 2);

    let report = h.driver.run_once().await.unwrap();
    assert_eq!(report.completed, 2);
    assert_eq!(report.failed, 0);

    assert_eq!(h.status_of(&first), TransferStatus::Completed);
    assert_eq!(h.status_of(&second), TransferStatus::Completed);
    assert_eq!(h.dest.root_count(), 2);
    assert_eq!(h.ctx.metrics.roots_registered.get(), 2);
    assert!(h.ctx.metrics.remote_retries.get() >= 1);
    assert_eq!(h.dest.wrapped_balance_of(bob()), units(3));
}

#[tokio::test]
async fn test_pending_transfers_settle_in_nonce_order() {
    let mut h = Harness::with_config(|config| config.driver.batch_size = 1);
    h.source.fund(alice(), units(10)).unwrap();

    let mut locks = Vec::new();
    for n in 1..=4 {
        locks.push(h.source.lock(alice(), bob(), units(n), D).unwrap());
    }
    assert_eq!(h.observe().await, 4);

    for (source_tx, nonce) in &locks {
        let report = h.driver.run_once().await.unwrap();
        assert_eq!(report.completed, 1);
        assert_eq!(h.status_of(source_tx), TransferStatus::Completed);
        assert!(h.dest.is_nonce_used(*nonce).await.unwrap());
        assert!(!h.dest.is_nonce_used(nonce + 1).await.unwrap());
    }
}

#[tokio::test]
async fn test_root_registered_elsewhere_is_recorded() {
    let mut h = Harness::new(ProofStrategy::Single);
    h.source.fund(alice(), units(5)).unwrap();
    let (source_tx, _) = h.source.lock(alice(), bob(), units(1), D).unwrap();
    h.observe().await;

    // Another relay instance registered the same root first
    let leaf = h.ledger.get(&source_tx).unwrap().unwrap().leaf_digest;
    let registration_tx = h.dest.register_root(h.signed_root(leaf)).await.unwrap();

    assert_eq!(h.driver.run_once().await.unwrap().completed, 1);

    let registration = h.ledger.get_root_registration(D, &leaf).unwrap().unwrap();
    assert_eq!(registration.registered_ref, Some(registration_tx));
    assert_eq!(h.dest.root_count(), 1);
    assert_eq!(h.ctx.metrics.roots_registered.get(), 0);
}
