//! Ledger runtime interface consumed by the relay
//!
//! The runtime executing lock/mint/burn/unlock and owning balances is an
//! external collaborator. The relay only needs this surface from each ledger:
//! block heads and finalized events to observe, the validator entry points,
//! and receipts to know when a submitted operation settled.

use crate::Result;
use async_trait::async_trait;
use bridge_core::{
    Digest, LeafFields, LedgerId, SettlementClaim, SignedRootRegistration, TransferKind, TxHash,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Transfer payload carried by lock/burn/mint/unlock events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEvent {
    /// Committed fields
    pub fields: LeafFields,
    /// Leaf digest as computed by the ledger
    pub leaf_digest: Digest,
}

/// What happened in a ledger event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEventKind {
    /// Value locked into custody
    Lock(TransferEvent),
    /// Derivative burned
    Burn(TransferEvent),
    /// Derivative minted for a source transfer
    Mint {
        /// Settled transfer
        transfer: TransferEvent,
        /// Initiating source transaction
        source_ref: TxHash,
    },
    /// Value released from custody
    Unlock(TransferEvent),
    /// Root accepted by the validator
    RootRegistered {
        /// Registered root
        root: Digest,
        /// Leaves in its tree
        member_count: u64,
    },
}

/// A finalized ledger event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    /// Transaction that emitted the event
    pub tx_hash: TxHash,
    /// Block height
    pub block: u64,
    /// Block timestamp (unix seconds)
    pub timestamp: u64,
    /// Payload
    pub kind: ChainEventKind,
}

impl ChainEvent {
    /// The transfer this event initiates, if it is a lock or burn
    pub fn initiating(&self) -> Option<(TransferKind, &TransferEvent)> {
        match &self.kind {
            ChainEventKind::Lock(event) => Some((TransferKind::Lock, event)),
            ChainEventKind::Burn(event) => Some((TransferKind::Burn, event)),
            _ => None,
        }
    }
}

/// Result of an included transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Effects applied
    Success,
    /// Included but reverted, with the ledger's reason
    Reverted(String),
}

/// Receipt of an included transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction hash
    pub tx_hash: TxHash,
    /// Inclusion block
    pub block: u64,
    /// Outcome
    pub outcome: Outcome,
}

/// One ledger as seen by the relay
///
/// Errors are reported as [`crate::Error::Rejected`] (validator refusal),
/// [`crate::Error::Unavailable`] or [`crate::Error::Timeout`].
#[async_trait]
pub trait LedgerRuntime: Send + Sync + std::fmt::Debug {
    /// Id of this ledger
    fn ledger_id(&self) -> LedgerId;

    /// Current block height
    async fn head(&self) -> Result<u64>;

    /// Events in blocks `from..=to`
    async fn events(&self, from: u64, to: u64) -> Result<Vec<ChainEvent>>;

    /// New-head notifications
    fn subscribe(&self) -> broadcast::Receiver<u64>;

    /// Register a signed root with this ledger's validator
    async fn register_root(&self, registration: SignedRootRegistration) -> Result<TxHash>;

    /// Mint the derivative for a lock on the counterpart ledger
    async fn mint(&self, claim: SettlementClaim, source_ref: TxHash) -> Result<TxHash>;

    /// Release custody for a burn on the counterpart ledger
    async fn unlock(&self, claim: SettlementClaim) -> Result<TxHash>;

    /// Receipt of an included transaction, `None` while unknown
    async fn receipt(&self, tx_hash: TxHash) -> Result<Option<Receipt>>;

    /// Validator: has this nonce been consumed
    async fn is_nonce_used(&self, nonce: u64) -> Result<bool>;

    /// Validator: is this root registered
    async fn is_root_valid(&self, root: Digest) -> Result<bool>;

    /// Transaction that registered `root` on this ledger
    async fn root_registration(&self, root: Digest) -> Result<Option<TxHash>>;

    /// Settlement tx of `(source_ledger, nonce)` on this ledger
    async fn find_settlement(&self, source_ledger: LedgerId, nonce: u64) -> Result<Option<TxHash>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::{Address, Amount};

    fn event(kind: ChainEventKind) -> ChainEvent {
        ChainEvent {
            tx_hash: Digest([1u8; 32]),
            block: 3,
            timestamp: 100,
            kind,
        }
    }

    fn payload() -> TransferEvent {
        let fields = LeafFields {
            sender: Address::repeat_byte(1),
            recipient: Address::repeat_byte(2),
            amount: Amount(1),
            nonce: 1,
            source_ledger: LedgerId(1),
            dest_ledger: LedgerId(2),
            source_timestamp: 100,
        };
        TransferEvent {
            leaf_digest: fields.digest(),
            fields,
        }
    }

    #[test]
    fn test_initiating_events() {
        assert_eq!(
            event(ChainEventKind::Lock(payload())).initiating().map(|(k, _)| k),
            Some(TransferKind::Lock)
        );
        assert_eq!(
            event(ChainEventKind::Burn(payload())).initiating().map(|(k, _)| k),
            Some(TransferKind::Burn)
        );
        assert!(event(ChainEventKind::Unlock(payload())).initiating().is_none());
        assert!(event(ChainEventKind::RootRegistered {
            root: Digest::ZERO,
            member_count: 1
        })
        .initiating()
        .is_none());
    }
}
