//! # Bridge Relay
//!
//! Off-chain relay for a two-ledger lock/mint and burn/unlock bridge.
//!
//! ## Components
//!
//! - **Observer**: follows each ledger's finalized blocks and records lock/burn
//!   events as pending transfers
//! - **Driver**: builds Merkle proofs, registers roots on the destination and
//!   submits mint/unlock exactly once per transfer
//! - **Status**: counts, listings and periodic snapshots
//!
//! Ledgers are reached through the [`LedgerRuntime`] trait; [`SimulatedLedger`]
//! is a complete in-process implementation.

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod chain;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod observer;
pub mod retry;
pub mod sim;
pub mod status;
pub mod supervisor;

pub use chain::{ChainEvent, ChainEventKind, LedgerRuntime, Outcome, Receipt, TransferEvent};
pub use config::{Config, DriverConfig, LedgerConfig, ProofStrategy, RetryConfig, ValidationConfig};
pub use context::RelayContext;
pub use driver::{CycleReport, Driver};
pub use error::{Error, Result};
pub use observer::Observer;
pub use retry::RetryPolicy;
pub use sim::{Accounting, SimulatedLedger};
pub use status::{RelayStatus, StatusPublisher, StatusSnapshot};
pub use supervisor::RelayService;
