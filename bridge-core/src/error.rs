//! Error types for the bridge core

use crate::types::{TransferStatus, TxHash};
use thiserror::Error;

/// Result type for bridge core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Bridge core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Malformed input (address, digest, amount)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Transfer not found
    #[error("Transfer not found: {0}")]
    TransferNotFound(TxHash),

    /// Root registration not found
    #[error("Root registration not found: {0}")]
    RootNotFound(String),

    /// Status would move backwards or skip a step
    #[error("Invalid transition for {source_tx}: {from} -> {to}")]
    InvalidTransition {
        /// Transfer key
        source_tx: TxHash,
        /// Current status
        from: TransferStatus,
        /// Requested status
        to: TransferStatus,
    },

    /// Merkle tree has no leaves
    #[error("Cannot build a Merkle tree from an empty batch")]
    EmptyTree,

    /// Leaf is not part of the batch
    #[error("Leaf {0} is not part of the batch")]
    LeafNotFound(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}
