//! Error types for the bridge relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Chain connection error for chain {chain_id}: {message}")]
    ChainConnection { chain_id: u64, message: String },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("nonce too low on chain {chain_id}")]
    NonceTooLow { chain_id: u64 },

    #[error("replacement transaction underpriced on chain {chain_id}")]
    ReplacementUnderpriced { chain_id: u64 },

    #[error("Gas price error: {0}")]
    GasPrice(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Contract error: {0}")]
    Contract(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Store error: {0}")]
    Store(String),

    #[error("No writer registered for domain {domain_id}")]
    DomainNotFound { domain_id: u8 },

    #[error(
        "{operation} of proposal {source_id}->{destination_id} nonce {deposit_nonce} failed after {attempts} attempts"
    )]
    RetriesExhausted {
        operation: &'static str,
        source_id: u8,
        destination_id: u8,
        deposit_nonce: u64,
        attempts: u32,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Classify an RPC error returned while submitting a transaction.
    pub fn from_submission(chain_id: u64, message: String) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("nonce too low") {
            RelayerError::NonceTooLow { chain_id }
        } else if lower.contains("replacement transaction underpriced") {
            RelayerError::ReplacementUnderpriced { chain_id }
        } else {
            RelayerError::Transaction(message)
        }
    }

    /// Errors that a plain resubmission is expected to clear
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayerError::NonceTooLow { .. } | RelayerError::ReplacementUnderpriced { .. }
        )
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, RelayerError::ChainConnection { .. })
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::RetriesExhausted { .. } | RelayerError::Wallet(_)
        )
    }
}

/// Deposit calldata decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid calldata length for {transfer_type} deposit: expected at least {expected} bytes, got {actual}")]
    TooShort {
        transfer_type: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{field} spans bytes {start}..{end} but calldata is {len} bytes")]
    OutOfBounds {
        field: &'static str,
        start: usize,
        end: usize,
        len: usize,
    },

    #[error("{field} must be exactly 32 bytes, got {len}")]
    NotAWord { field: &'static str, len: usize },

    #[error("priority length is zero")]
    EmptyPriority,

    #[error("payload is missing {0}")]
    MissingField(&'static str),

    #[error("deposit rejected: {0}")]
    Rejected(String),
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;
