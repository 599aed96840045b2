//! In-process ledger runtime
//!
//! A complete [`LedgerRuntime`] used by the scenario tests and the binary's
//! `--simulate` mode. It owns a [`Validator`] parametrized by its ledger id,
//! native balances, custody and derivative supply, and a block log. Every
//! state-changing call mines exactly one block.
//!
//! `mint`/`unlock` run validation, the feasibility check, nonce consumption
//! and the value effect under one mutex guard with no suspension point in
//! between, so a consumed nonce and its value change land together.

use crate::chain::{ChainEvent, ChainEventKind, LedgerRuntime, Outcome, Receipt, TransferEvent};
use crate::{Error, Result};
use async_trait::async_trait;
use bridge_core::crypto::hash_bytes;
use bridge_core::{
    Address, Amount, Digest, LeafFields, LedgerId, Rejection, SettlementClaim,
    SignedRootRegistration, TxHash, Validator,
};
use ed25519_dalek::VerifyingKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Timestamp of block 0
pub const GENESIS_TIMESTAMP: u64 = 1_700_000_000;

/// Seconds between blocks
pub const BLOCK_TIME: u64 = 12;

/// Value counters of one ledger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accounting {
    /// Total ever locked
    pub locked: Amount,
    /// Total ever unlocked
    pub unlocked: Amount,
    /// Total derivative ever minted
    pub minted: Amount,
    /// Total derivative ever burned
    pub burned: Amount,
    /// Native value currently in custody
    pub custodied: Amount,
    /// Derivative currently outstanding
    pub wrapped_supply: Amount,
}

impl Accounting {
    /// Counters net to the held balances
    pub fn is_balanced(&self) -> bool {
        self.locked.checked_sub(self.unlocked) == Some(self.custodied)
            && self.minted.checked_sub(self.burned) == Some(self.wrapped_supply)
    }
}

#[derive(Debug)]
struct SimState {
    validator: Validator,
    head: u64,
    timestamp: u64,
    tx_counter: u64,
    next_nonce: u64,
    events: Vec<ChainEvent>,
    receipts: HashMap<TxHash, Receipt>,
    settlements: HashMap<(LedgerId, u64), TxHash>,
    root_txs: HashMap<Digest, TxHash>,
    native: HashMap<Address, Amount>,
    wrapped: HashMap<Address, Amount>,
    accounting: Accounting,
    fail_next: u32,
    settlement_calls: u64,
}

impl SimState {
    /// Timestamp the next block will carry
    fn next_timestamp(&self) -> u64 {
        self.timestamp + BLOCK_TIME
    }

    fn next_tx_hash(&mut self, ledger: LedgerId) -> TxHash {
        self.tx_counter += 1;
        let mut preimage = b"sim-tx".to_vec();
        preimage.extend_from_slice(&ledger.to_be_bytes());
        preimage.extend_from_slice(&self.tx_counter.to_be_bytes());
        hash_bytes(&preimage)
    }

    /// Mine one block holding `kinds`, one transaction each
    fn mine_block(&mut self, ledger: LedgerId, kinds: Vec<ChainEventKind>) -> Vec<TxHash> {
        self.head += 1;
        self.timestamp = self.next_timestamp();

        let mut hashes = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let tx_hash = self.next_tx_hash(ledger);
            self.events.push(ChainEvent {
                tx_hash,
                block: self.head,
                timestamp: self.timestamp,
                kind,
            });
            self.receipts.insert(
                tx_hash,
                Receipt {
                    tx_hash,
                    block: self.head,
                    outcome: Outcome::Success,
                },
            );
            hashes.push(tx_hash);
        }
        hashes
    }

    fn take_fault(&mut self, ledger: LedgerId) -> Result<()> {
        if self.fail_next > 0 {
            self.fail_next -= 1;
            return Err(Error::Unavailable(format!("ledger {} endpoint unreachable", ledger)));
        }
        Ok(())
    }
}

fn credit(map: &mut HashMap<Address, Amount>, who: Address, amount: Amount) -> Result<()> {
    let entry = map.entry(who).or_insert(Amount::ZERO);
    *entry = entry
        .checked_add(amount)
        .ok_or_else(|| Rejection::InsufficientFunds("balance overflow".to_string()))?;
    Ok(())
}

fn debit(map: &mut HashMap<Address, Amount>, who: Address, amount: Amount) -> Result<()> {
    let balance = map.get(&who).copied().unwrap_or(Amount::ZERO);
    let remaining = balance.checked_sub(amount).ok_or_else(|| {
        Rejection::InsufficientFunds(format!("{} holds {}, needs {}", who, balance, amount))
    })?;
    map.insert(who, remaining);
    Ok(())
}

fn add(a: Amount, b: Amount) -> Result<Amount> {
    a.checked_add(b)
        .ok_or_else(|| Error::Rejected(Rejection::InsufficientFunds("counter overflow".to_string())))
}

fn sub(a: Amount, b: Amount, what: &str) -> Result<Amount> {
    a.checked_sub(b).ok_or_else(|| {
        Error::Rejected(Rejection::InsufficientFunds(format!(
            "{} {} below {}",
            what, a, b
        )))
    })
}

/// Simulated ledger
#[derive(Debug)]
pub struct SimulatedLedger {
    id: LedgerId,
    state: Mutex<SimState>,
    heads: broadcast::Sender<u64>,
}

impl SimulatedLedger {
    /// Create a ledger whose validator trusts `relayer`
    pub fn new(id: LedgerId, relayer: VerifyingKey) -> Self {
        Self::with_validator(Validator::new(id, relayer))
    }

    /// Create a ledger around a preconfigured validator
    pub fn with_validator(validator: Validator) -> Self {
        let id = validator.ledger_id();
        let (heads, _) = broadcast::channel(64);
        Self {
            id,
            state: Mutex::new(SimState {
                validator,
                head: 0,
                timestamp: GENESIS_TIMESTAMP,
                tx_counter: 0,
                next_nonce: 1,
                events: Vec::new(),
                receipts: HashMap::new(),
                settlements: HashMap::new(),
                root_txs: HashMap::new(),
                native: HashMap::new(),
                wrapped: HashMap::new(),
                accounting: Accounting::default(),
                fail_next: 0,
                settlement_calls: 0,
            }),
            heads,
        }
    }

    fn announce(&self, head: u64) {
        // No subscribers is fine
        let _ = self.heads.send(head);
    }

    /// Credit native balance out of thin air (genesis allocation)
    pub fn fund(&self, who: Address, amount: Amount) -> Result<()> {
        let mut state = self.state.lock();
        credit(&mut state.native, who, amount)
    }

    /// Lock native value for `recipient` on `dest`
    ///
    /// Returns the lock transaction and the nonce assigned to it.
    pub fn lock(
        &self,
        sender: Address,
        recipient: Address,
        amount: Amount,
        dest: LedgerId,
    ) -> Result<(TxHash, u64)> {
        let (tx, nonce, head) = {
            let mut state = self.state.lock();
            let accounting = state.accounting;
            let locked = add(accounting.locked, amount)?;
            let custodied = add(accounting.custodied, amount)?;
            debit(&mut state.native, sender, amount)?;
            state.accounting.locked = locked;
            state.accounting.custodied = custodied;

            let (nonce, event) = self.initiate(&mut *state, sender, recipient, amount, dest);
            let tx = state.mine_block(self.id, vec![ChainEventKind::Lock(event)])[0];
            (tx, nonce, state.head)
        };
        self.announce(head);

        tracing::debug!(ledger = %self.id, nonce, amount = %amount, "Locked");
        Ok((tx, nonce))
    }

    /// Burn derivative for `recipient` on `dest`
    pub fn burn(
        &self,
        sender: Address,
        recipient: Address,
        amount: Amount,
        dest: LedgerId,
    ) -> Result<(TxHash, u64)> {
        let (tx, nonce, head) = {
            let mut state = self.state.lock();
            let accounting = state.accounting;
            let burned = add(accounting.burned, amount)?;
            let supply = sub(accounting.wrapped_supply, amount, "wrapped supply")?;
            debit(&mut state.wrapped, sender, amount)?;
            state.accounting.burned = burned;
            state.accounting.wrapped_supply = supply;

            let (nonce, event) = self.initiate(&mut *state, sender, recipient, amount, dest);
            let tx = state.mine_block(self.id, vec![ChainEventKind::Burn(event)])[0];
            (tx, nonce, state.head)
        };
        self.announce(head);

        tracing::debug!(ledger = %self.id, nonce, amount = %amount, "Burned");
        Ok((tx, nonce))
    }

    fn initiate(
        &self,
        state: &mut SimState,
        sender: Address,
        recipient: Address,
        amount: Amount,
        dest: LedgerId,
    ) -> (u64, TransferEvent) {
        let nonce = state.next_nonce;
        state.next_nonce += 1;
        let fields = LeafFields {
            sender,
            recipient,
            amount,
            nonce,
            source_ledger: self.id,
            dest_ledger: dest,
            source_timestamp: state.next_timestamp(),
        };
        (
            nonce,
            TransferEvent {
                leaf_digest: fields.digest(),
                fields,
            },
        )
    }

    /// Mine `n` empty blocks
    pub fn mine(&self, n: u64) {
        let head = {
            let mut state = self.state.lock();
            for _ in 0..n {
                state.mine_block(self.id, Vec::new());
            }
            state.head
        };
        self.announce(head);
    }

    /// Native balance
    pub fn balance_of(&self, who: Address) -> Amount {
        self.state.lock().native.get(&who).copied().unwrap_or(Amount::ZERO)
    }

    /// Derivative balance
    pub fn wrapped_balance_of(&self, who: Address) -> Amount {
        self.state.lock().wrapped.get(&who).copied().unwrap_or(Amount::ZERO)
    }

    /// Value counters
    pub fn accounting(&self) -> Accounting {
        self.state.lock().accounting
    }

    /// Make the next `n` remote calls fail with `Unavailable`
    pub fn fail_next(&self, n: u32) {
        self.state.lock().fail_next = n;
    }

    /// Number of mint/unlock calls that reached the ledger
    pub fn settlement_calls(&self) -> u64 {
        self.state.lock().settlement_calls
    }

    /// Number of registered roots
    pub fn root_count(&self) -> usize {
        self.state.lock().validator.root_count()
    }

    /// Consume `nonce` on the validator without any settlement behind it
    ///
    /// Stands in for a writer outside the relay touching the same nonce space.
    pub fn consume_nonce(&self, nonce: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.validator.consume(nonce)?;
        Ok(())
    }

    /// Run a settlement under the state lock
    fn settle<F>(&self, claim: &SettlementClaim, kind: F) -> Result<TxHash>
    where
        F: FnOnce(&mut SimState, &SettlementClaim) -> Result<ChainEventKind>,
    {
        let (tx, head) = {
            let mut state = self.state.lock();
            state.take_fault(self.id)?;
            state.settlement_calls += 1;

            state.validator.validate(claim)?;
            // Effects check before they mutate; a validated nonce always consumes
            let event = kind(&mut *state, claim)?;
            state.validator.consume(claim.nonce)?;

            let tx = state.mine_block(self.id, vec![event])[0];
            state.settlements.insert((claim.source_ledger, claim.nonce), tx);
            (tx, state.head)
        };
        self.announce(head);
        Ok(tx)
    }
}

#[async_trait]
impl LedgerRuntime for SimulatedLedger {
    fn ledger_id(&self) -> LedgerId {
        self.id
    }

    async fn head(&self) -> Result<u64> {
        let mut state = self.state.lock();
        state.take_fault(self.id)?;
        Ok(state.head)
    }

    async fn events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>> {
        let mut state = self.state.lock();
        state.take_fault(self.id)?;
        Ok(state
            .events
            .iter()
            .filter(|e| e.block >= from && e.block <= to)
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.heads.subscribe()
    }

    async fn register_root(&self, registration: SignedRootRegistration) -> Result<TxHash> {
        let (tx, head) = {
            let mut state = self.state.lock();
            state.take_fault(self.id)?;
            let now = state.next_timestamp();
            state.validator.register_root(&registration, now)?;
            let tx = state.mine_block(
                self.id,
                vec![ChainEventKind::RootRegistered {
                    root: registration.root,
                    member_count: registration.member_count,
                }],
            )[0];
            state.root_txs.insert(registration.root, tx);
            (tx, state.head)
        };
        self.announce(head);
        Ok(tx)
    }

    async fn mint(&self, claim: SettlementClaim, source_ref: TxHash) -> Result<TxHash> {
        self.settle(&claim, |state, claim| {
            let minted = add(state.accounting.minted, claim.amount)?;
            let supply = add(state.accounting.wrapped_supply, claim.amount)?;
            credit(&mut state.wrapped, claim.recipient, claim.amount)?;
            state.accounting.minted = minted;
            state.accounting.wrapped_supply = supply;
            Ok(ChainEventKind::Mint {
                transfer: TransferEvent {
                    fields: claim.fields(),
                    leaf_digest: claim.fields().digest(),
                },
                source_ref,
            })
        })
    }

    async fn unlock(&self, claim: SettlementClaim) -> Result<TxHash> {
        self.settle(&claim, |state, claim| {
            let custodied = sub(state.accounting.custodied, claim.amount, "custody")?;
            let unlocked = add(state.accounting.unlocked, claim.amount)?;
            credit(&mut state.native, claim.recipient, claim.amount)?;
            state.accounting.custodied = custodied;
            state.accounting.unlocked = unlocked;
            Ok(ChainEventKind::Unlock(TransferEvent {
                fields: claim.fields(),
                leaf_digest: claim.fields().digest(),
            }))
        })
    }

    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>> {
        let mut state = self.state.lock();
        state.take_fault(self.id)?;
        Ok(state.receipts.get(&tx_hash).cloned())
    }

    async fn is_nonce_used(&self, nonce: u64) -> Result<bool> {
        let mut state = self.state.lock();
        state.take_fault(self.id)?;
        Ok(state.validator.is_nonce_used(nonce))
    }

    async fn is_root_valid(&self, root: Digest) -> Result<bool> {
        let mut state = self.state.lock();
        state.take_fault(self.id)?;
        Ok(state.validator.is_root_valid(&root))
    }

    async fn root_registration(&self, root: Digest) -> Result<Option<TxHash>> {
        let mut state = self.state.lock();
        state.take_fault(self.id)?;
        Ok(state.root_txs.get(&root).copied())
    }

    async fn find_settlement(&self, source_ledger: LedgerId, nonce: u64) -> Result<Option<TxHash>> {
        let mut state = self.state.lock();
        state.take_fault(self.id)?;
        Ok(state.settlements.get(&(source_ledger, nonce)).copied())
    }
}
