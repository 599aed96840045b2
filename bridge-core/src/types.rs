//! Core types for the bridge
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Fixed-width hashing (see [`crate::crypto::leaf_digest`])
//! - Exact arithmetic (integer base units, `Decimal` at the edges)

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Decimal places of one whole asset unit.
pub const AMOUNT_DECIMALS: u32 = 18;

/// Ledger (chain) identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LedgerId(pub u64);

impl LedgerId {
    /// Big-endian bytes, used in storage keys
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for LedgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 20-byte account address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// The zero address (never a valid recipient)
    pub const ZERO: Address = Address([0u8; 20]);

    /// Check for the zero address
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    /// Deterministic test/demo address from a single byte
    pub fn repeat_byte(b: u8) -> Self {
        Self([b; 20])
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|e| crate::Error::InvalidInput(format!("bad address {}: {}", s, e)))?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| crate::Error::InvalidInput(format!("address {} is not 20 bytes", s)))?;
        Ok(Self(bytes))
    }
}

/// Asset amount in base units (18 decimals)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Amount(pub u128);

impl Amount {
    /// Zero amount
    pub const ZERO: Amount = Amount(0);

    /// Convert whole units (e.g. `1.5`) to base units
    pub fn from_units(units: Decimal) -> crate::Result<Self> {
        if units.is_sign_negative() {
            return Err(crate::Error::InvalidInput(format!(
                "negative amount {}",
                units
            )));
        }
        let scale = Decimal::from(10u64.pow(AMOUNT_DECIMALS));
        let base = units
            .checked_mul(scale)
            .ok_or_else(|| crate::Error::InvalidInput(format!("amount {} overflows", units)))?;
        if base.fract() != Decimal::ZERO {
            return Err(crate::Error::InvalidInput(format!(
                "amount {} has more than {} decimals",
                units, AMOUNT_DECIMALS
            )));
        }
        let raw = base
            .trunc()
            .to_u128()
            .ok_or_else(|| crate::Error::InvalidInput(format!("amount {} overflows", units)))?;
        Ok(Self(raw))
    }

    /// Convert to whole units for display/config comparison
    pub fn to_units(self) -> Decimal {
        // Decimal holds 96 bits; amounts beyond that saturate
        let raw = i128::try_from(self.0).unwrap_or(i128::MAX);
        Decimal::try_from_i128_with_scale(raw, AMOUNT_DECIMALS).unwrap_or(Decimal::MAX)
    }

    /// Check for zero
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checked addition
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    /// Checked subtraction
    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_units().normalize())
    }
}

/// 256-bit digest (leaf, interior node, root, or transaction hash)
///
/// Ordering is byte-wise, which equals big-endian numeric order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    /// All-zero digest
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hex without prefix
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self)
    }
}

impl FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)
            .map_err(|e| crate::Error::InvalidInput(format!("bad digest {}: {}", s, e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| crate::Error::InvalidInput(format!("digest {} is not 32 bytes", s)))?;
        Ok(Self(bytes))
    }
}

/// Transaction hash on either ledger
pub type TxHash = Digest;

/// The seven fields committed to by a leaf digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafFields {
    /// Originator on the source ledger
    pub sender: Address,
    /// Beneficiary on the destination ledger
    pub recipient: Address,
    /// Transferred amount
    pub amount: Amount,
    /// Source-ledger nonce
    pub nonce: u64,
    /// Ledger the value left
    pub source_ledger: LedgerId,
    /// Ledger the value arrives on
    pub dest_ledger: LedgerId,
    /// Source block timestamp (unix seconds)
    pub source_timestamp: u64,
}

impl LeafFields {
    /// Canonical leaf digest of these fields
    pub fn digest(&self) -> Digest {
        crate::crypto::leaf_digest(self)
    }
}

/// Operation that initiated a transfer on its source ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferKind {
    /// Value locked in custody; completed by a mint
    Lock = 1,
    /// Derivative burned; completed by an unlock
    Burn = 2,
}

impl TransferKind {
    /// Name of the destination operation that completes this transfer
    pub fn completing_operation(&self) -> &'static str {
        match self {
            TransferKind::Lock => "mint",
            TransferKind::Burn => "unlock",
        }
    }
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferKind::Lock => write!(f, "lock"),
            TransferKind::Burn => write!(f, "burn"),
        }
    }
}

/// Transfer status
///
/// ```text
/// Pending -> ProofBuilding -> Completed
///                          \-> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransferStatus {
    /// Observed, not yet picked up
    Pending = 1,
    /// Proof built, settlement in progress
    ProofBuilding = 2,
    /// Settled on the destination (terminal)
    Completed = 3,
    /// Settlement failed (terminal)
    Failed = 4,
}

impl TransferStatus {
    /// All statuses, in lifecycle order
    pub const ALL: [TransferStatus; 4] = [
        TransferStatus::Pending,
        TransferStatus::ProofBuilding,
        TransferStatus::Completed,
        TransferStatus::Failed,
    ];

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferStatus::Completed | TransferStatus::Failed)
    }

    /// Status only moves forward.
    ///
    /// `ProofBuilding -> ProofBuilding` is allowed so the driver can record
    /// the submission reference before settlement. A transfer only fails
    /// once it has entered proof building.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, ProofBuilding)
                | (ProofBuilding, ProofBuilding)
                | (ProofBuilding, Completed)
                | (ProofBuilding, Failed)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransferStatus::Pending => "pending",
            TransferStatus::ProofBuilding => "proof_building",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A cross-ledger transfer as tracked by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    /// Local row ID (UUIDv7 for time-ordering)
    pub id: Uuid,

    /// Source transaction hash (unique key)
    pub source_tx: TxHash,

    /// Source block height of the initiating event
    pub source_block: u64,

    /// Lock or burn
    pub kind: TransferKind,

    /// Committed fields
    pub fields: LeafFields,

    /// Leaf digest of `fields`
    pub leaf_digest: Digest,

    /// Current status
    pub status: TransferStatus,

    /// Inclusion proof (set when proof is built)
    pub proof: Option<Vec<Digest>>,

    /// Root the proof is built against
    pub root: Option<Digest>,

    /// Destination settlement transaction
    pub dest_settlement_ref: Option<TxHash>,

    /// Failure reason, verbatim
    pub error: Option<String>,

    /// Observed timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// Create a freshly observed (pending) transfer
    pub fn observed(
        source_tx: TxHash,
        source_block: u64,
        kind: TransferKind,
        fields: LeafFields,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            source_tx,
            source_block,
            kind,
            leaf_digest: fields.digest(),
            fields,
            status: TransferStatus::Pending,
            proof: None,
            root: None,
            dest_settlement_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Source ledger
    pub fn source_ledger(&self) -> LedgerId {
        self.fields.source_ledger
    }

    /// Destination ledger
    pub fn dest_ledger(&self) -> LedgerId {
        self.fields.dest_ledger
    }

    /// Source nonce
    pub fn nonce(&self) -> u64 {
        self.fields.nonce
    }
}

/// Root registration record (one per proof tree)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootRegistration {
    /// Merkle root
    pub root: Digest,

    /// Ledger the root is registered on
    pub target_ledger: LedgerId,

    /// Number of leaves in the tree
    pub member_count: u64,

    /// Registration transaction once settled
    pub registered_ref: Option<TxHash>,
}

impl RootRegistration {
    /// Check if registration has settled
    pub fn is_registered(&self) -> bool {
        self.registered_ref.is_some()
    }
}

/// Aggregate transfer counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    /// All transfers
    pub total: u64,
    /// Pending
    pub pending: u64,
    /// Proof building / in flight
    pub processing: u64,
    /// Completed
    pub completed: u64,
    /// Failed
    pub failed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions_forward_only() {
        use TransferStatus::*;
        assert!(Pending.can_transition_to(ProofBuilding));
        assert!(ProofBuilding.can_transition_to(Completed));
        assert!(ProofBuilding.can_transition_to(Failed));

        assert!(!ProofBuilding.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(ProofBuilding));
        assert!(!Failed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
    }

    #[test]
    fn test_status_terminal() {
        assert!(!TransferStatus::Pending.is_terminal());
        assert!(!TransferStatus::ProofBuilding.is_terminal());
        assert!(TransferStatus::Completed.is_terminal());
        assert!(TransferStatus::Failed.is_terminal());
    }

    #[test]
    fn test_amount_units_conversion() {
        let one = Amount::from_units(Decimal::ONE).unwrap();
        assert_eq!(one.0, 1_000_000_000_000_000_000);

        let half = Amount::from_units(Decimal::new(15, 1)).unwrap();
        assert_eq!(half.0, 1_500_000_000_000_000_000);
        assert_eq!(half.to_units(), Decimal::new(15, 1));

        assert!(Amount::from_units(Decimal::new(-1, 0)).is_err());
    }

    #[test]
    fn test_address_parse_and_display() {
        let addr: Address = "0x1111111111111111111111111111111111111111".parse().unwrap();
        assert_eq!(addr, Address::repeat_byte(0x11));
        assert_eq!(addr.to_string(), "0x1111111111111111111111111111111111111111");
        assert!("0x1234".parse::<Address>().is_err());
        assert!(Address::ZERO.is_zero());
    }

    #[test]
    fn test_digest_ordering_is_numeric() {
        let mut low = [0u8; 32];
        low[31] = 0xff;
        let mut high = [0u8; 32];
        high[0] = 0x01;
        assert!(Digest(low) < Digest(high));
    }
}
