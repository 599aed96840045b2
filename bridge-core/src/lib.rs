//! Bridge Core
//!
//! Proof primitives, ledger-side validation, and the durable transfer
//! record of a two-ledger lock/mint and burn/unlock bridge.
//!
//! # Architecture
//!
//! - **Leaf hashing**: one canonical encoding shared by both ledgers and the relay
//! - **Merkle proofs**: sorted-pair SHA-256 tree, promote-odd, no duplication
//! - **Validator**: per-ledger root registry and append-only nonce set
//! - **Single Writer**: one actor owns every store mutation
//!
//! # Invariants
//!
//! - A nonce is consumed at most once per ledger
//! - A transfer's status only moves forward; completed rows never change
//! - One row per source transaction, however often it is observed

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod config;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod merkle;
pub mod metrics;
pub mod storage;
pub mod types;
pub mod validator;

// Re-exports
pub use config::Config;
pub use crypto::KeyPair;
pub use error::{Error, Result};
pub use ledger::TransferLedger;
pub use merkle::MerkleTree;
pub use metrics::Metrics;
pub use storage::Storage;
pub use types::{
    Address, Amount, Digest, LeafFields, LedgerId, RootRegistration, StatusCounts, Transfer,
    TransferKind, TransferStatus, TxHash,
};
pub use validator::{Rejection, SettlementClaim, SignedRootRegistration, Validator};
