//! Error types for the Tesseract Batcher

use ethers::types::Address;
use thiserror::Error;

/// Errors raised by the batch lifecycle operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("No bridged denominator known for voucher denom {denom}")]
    UnknownDenomination { denom: String },

    #[error("No unbatched transfers available for denom {denom}")]
    EmptySelection { denom: String },

    #[error("Total fee overflow while batching denom {denom}")]
    FeeOverflow { denom: String },

    #[error("Conversion overflow for transfer {id} in denom {denom}")]
    ConversionOverflow { denom: String, id: u64 },

    #[error("Batch {nonce} not found for token contract {token_contract:?}")]
    UnknownBatch { token_contract: Address, nonce: u64 },

    #[error("Transfer {id} not found")]
    UnknownTransfer { id: u64 },

    #[error("Pool invariant violated for transfer {id}: {detail}")]
    PoolInvariant { id: u64, detail: &'static str },
}

impl BatchError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        BatchError::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Check if the error is a benign miss callers may treat as a no-op
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            BatchError::UnknownBatch { .. } | BatchError::EmptySelection { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            BatchError::FeeOverflow { .. }
                | BatchError::ConversionOverflow { .. }
                | BatchError::PoolInvariant { .. }
        )
    }
}

/// Service-level error type
#[derive(Error, Debug)]
pub enum BatcherError {
    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Batch coordinator is not running")]
    CoordinatorStopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for batch lifecycle operations
pub type BatchResult<T> = Result<T, BatchError>;

/// Result type for service operations
pub type BatcherResult<T> = Result<T, BatcherError>;
