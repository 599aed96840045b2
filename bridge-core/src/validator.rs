//! Ledger-side validator
//!
//! One component, instantiated once per ledger with that ledger's id. It holds
//! the set of registered roots and the append-only set of consumed nonces.
//!
//! The validator never moves value itself. The ledger runtime calls
//! [`Validator::validate`] and then [`Validator::consume`] (or the combined
//! [`Validator::validate_and_consume`]) inside the same unit of work as its
//! mint/unlock, so a consumed nonce and the value change land together.

use crate::crypto::verify_root_registration;
use crate::merkle;
use crate::types::{Address, Amount, Digest, LeafFields, LedgerId};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Reasons a ledger rejects a registration or settlement
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    /// Nonce already consumed on this ledger
    #[error("nonce {0} already used")]
    NonceAlreadyUsed(u64),

    /// Root was never registered
    #[error("root {0} is not registered")]
    UnknownRoot(Digest),

    /// Leaf does not fold to the root
    #[error("invalid merkle proof")]
    InvalidProof,

    /// Claim is addressed to another ledger
    #[error("wrong destination: expected ledger {expected}, got {actual}")]
    WrongDestination {
        /// This ledger
        expected: LedgerId,
        /// Ledger named in the claim
        actual: LedgerId,
    },

    /// Zero amount
    #[error("amount must be positive")]
    ZeroAmount,

    /// Zero recipient
    #[error("recipient is the zero address")]
    ZeroRecipient,

    /// Root already registered
    #[error("root {0} already registered")]
    DuplicateRoot(Digest),

    /// Caller is not the authorized relay
    #[error("unauthorized root registration")]
    Unauthorized,

    /// Registration arrived before the minimum interval elapsed
    #[error("root registration rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds of ledger time until the next registration is accepted
        retry_after: u64,
    },

    /// Effect could not be applied (e.g. custody below unlock amount)
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
}

impl Rejection {
    /// Rejections that clear up on their own
    pub fn is_transient(&self) -> bool {
        matches!(self, Rejection::RateLimited { .. })
    }
}

/// A signed request to register a root on a ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRootRegistration {
    /// Target ledger
    pub ledger: LedgerId,
    /// Merkle root
    pub root: Digest,
    /// Leaves in the tree
    pub member_count: u64,
    /// Ed25519 signature by the relay identity
    #[serde(with = "signature_bytes")]
    pub signature: [u8; 64],
}

mod signature_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(sig)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(d)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("signature must be 64 bytes"))
    }
}

/// Arguments of a mint/unlock settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementClaim {
    /// Source-ledger sender
    pub sender: Address,
    /// Destination recipient
    pub recipient: Address,
    /// Amount
    pub amount: Amount,
    /// Source nonce
    pub nonce: u64,
    /// Source ledger
    pub source_ledger: LedgerId,
    /// Destination ledger
    pub dest_ledger: LedgerId,
    /// Source block timestamp
    pub source_timestamp: u64,
    /// Inclusion proof, leaf to root
    pub proof: Vec<Digest>,
    /// Registered root
    pub root: Digest,
}

impl SettlementClaim {
    /// Build a claim from committed fields and a proof
    pub fn new(fields: &LeafFields, proof: Vec<Digest>, root: Digest) -> Self {
        Self {
            sender: fields.sender,
            recipient: fields.recipient,
            amount: fields.amount,
            nonce: fields.nonce,
            source_ledger: fields.source_ledger,
            dest_ledger: fields.dest_ledger,
            source_timestamp: fields.source_timestamp,
            proof,
            root,
        }
    }

    /// The committed fields
    pub fn fields(&self) -> LeafFields {
        LeafFields {
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
            nonce: self.nonce,
            source_ledger: self.source_ledger,
            dest_ledger: self.dest_ledger,
            source_timestamp: self.source_timestamp,
        }
    }
}

/// Metadata kept per registered root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredRoot {
    /// Leaves in the tree
    pub member_count: u64,
    /// Ledger time of registration
    pub registered_at: u64,
}

/// Per-ledger root and nonce registry
#[derive(Debug)]
pub struct Validator {
    ledger_id: LedgerId,
    relayer: VerifyingKey,
    min_registration_interval: u64,
    valid_roots: HashMap<Digest, RegisteredRoot>,
    used_nonces: HashSet<u64>,
    last_registration: Option<u64>,
}

impl Validator {
    /// Create a validator for `ledger_id` trusting `relayer`
    pub fn new(ledger_id: LedgerId, relayer: VerifyingKey) -> Self {
        Self {
            ledger_id,
            relayer,
            min_registration_interval: 0,
            valid_roots: HashMap::new(),
            used_nonces: HashSet::new(),
            last_registration: None,
        }
    }

    /// Require `seconds` of ledger time between registrations
    pub fn with_min_registration_interval(mut self, seconds: u64) -> Self {
        self.min_registration_interval = seconds;
        self
    }

    /// Ledger this validator guards
    pub fn ledger_id(&self) -> LedgerId {
        self.ledger_id
    }

    /// Register a root signed by the relay identity at ledger time `now`
    pub fn register_root(
        &mut self,
        registration: &SignedRootRegistration,
        now: u64,
    ) -> Result<(), Rejection> {
        if registration.ledger != self.ledger_id {
            return Err(Rejection::WrongDestination {
                expected: self.ledger_id,
                actual: registration.ledger,
            });
        }

        verify_root_registration(
            &self.relayer,
            registration.ledger,
            &registration.root,
            registration.member_count,
            &registration.signature,
        )
        .map_err(|_| Rejection::Unauthorized)?;

        if self.valid_roots.contains_key(&registration.root) {
            return Err(Rejection::DuplicateRoot(registration.root));
        }

        if let Some(last) = self.last_registration {
            let next_allowed = last.saturating_add(self.min_registration_interval);
            if now < next_allowed {
                return Err(Rejection::RateLimited {
                    retry_after: next_allowed - now,
                });
            }
        }

        self.valid_roots.insert(
            registration.root,
            RegisteredRoot {
                member_count: registration.member_count,
                registered_at: now,
            },
        );
        self.last_registration = Some(now);

        tracing::debug!(
            ledger = %self.ledger_id,
            root = %registration.root,
            members = registration.member_count,
            "Root registered"
        );

        Ok(())
    }

    /// Check a claim without consuming anything
    ///
    /// Returns the recomputed leaf digest on success.
    pub fn validate(&self, claim: &SettlementClaim) -> Result<Digest, Rejection> {
        if claim.dest_ledger != self.ledger_id {
            return Err(Rejection::WrongDestination {
                expected: self.ledger_id,
                actual: claim.dest_ledger,
            });
        }
        if claim.amount.is_zero() {
            return Err(Rejection::ZeroAmount);
        }
        if claim.recipient.is_zero() {
            return Err(Rejection::ZeroRecipient);
        }
        if self.used_nonces.contains(&claim.nonce) {
            return Err(Rejection::NonceAlreadyUsed(claim.nonce));
        }
        if !self.valid_roots.contains_key(&claim.root) {
            return Err(Rejection::UnknownRoot(claim.root));
        }

        let leaf = claim.fields().digest();
        if !merkle::verify(&leaf, &claim.proof, &claim.root) {
            return Err(Rejection::InvalidProof);
        }

        Ok(leaf)
    }

    /// Mark a validated claim's nonce as used
    ///
    /// Must run in the same unit of work as [`Validator::validate`] and the
    /// value effect.
    pub fn consume(&mut self, nonce: u64) -> Result<(), Rejection> {
        if !self.used_nonces.insert(nonce) {
            return Err(Rejection::NonceAlreadyUsed(nonce));
        }
        Ok(())
    }

    /// Validate and consume in one step
    pub fn validate_and_consume(&mut self, claim: &SettlementClaim) -> Result<Digest, Rejection> {
        let leaf = self.validate(claim)?;
        self.consume(claim.nonce)?;
        Ok(leaf)
    }

    /// Check whether a nonce has been consumed
    pub fn is_nonce_used(&self, nonce: u64) -> bool {
        self.used_nonces.contains(&nonce)
    }

    /// Check whether a root is registered
    pub fn is_root_valid(&self, root: &Digest) -> bool {
        self.valid_roots.contains_key(root)
    }

    /// Registration metadata for a root
    pub fn registered_root(&self, root: &Digest) -> Option<&RegisteredRoot> {
        self.valid_roots.get(root)
    }

    /// Number of registered roots
    pub fn root_count(&self) -> usize {
        self.valid_roots.len()
    }

    /// Number of consumed nonces
    pub fn used_nonce_count(&self) -> usize {
        self.used_nonces.len()
    }
}
