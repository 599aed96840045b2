//! Error types for the relay

use bridge_core::Rejection;
use thiserror::Error;

/// Result type for relay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Relay errors
#[derive(Error, Debug)]
pub enum Error {
    /// Transfer store or proof engine error
    #[error("Core error: {0}")]
    Core(#[from] bridge_core::Error),

    /// The ledger refused the call
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    /// The ledger accepted the call but the operation reverted
    #[error("reverted: {0}")]
    Reverted(String),

    /// Ledger endpoint unreachable
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Call or settlement wait exceeded its deadline
    #[error("timeout: {0}")]
    Timeout(String),

    /// Local record and ledger state disagree
    #[error("inconsistency: {0}")]
    Inconsistency(String),

    /// Source event failed observation checks
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Shutdown requested before the step started
    #[error("shutting down")]
    Shutdown,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Errors worth another attempt after a backoff
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Unavailable(_) | Error::Timeout(_) => true,
            Error::Rejected(rejection) => rejection.is_transient(),
            _ => false,
        }
    }

    /// The ledger reports the nonce as already consumed
    pub fn is_replay(&self) -> bool {
        matches!(self, Error::Rejected(Rejection::NonceAlreadyUsed(_)))
    }
}
