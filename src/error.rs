//! Error types for interchain transfers

use crate::types::{Address, Amount, AssetId, TxId};
use thiserror::Error;

/// Main error type for transfer operations
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Asset {symbol} not found on chain {chain}")]
    AssetNotFound { chain: String, symbol: String },

    #[error("Chain alias {alias} could not be resolved")]
    UnknownChain { alias: String },

    #[error("Transport error on chain {chain}: {message}")]
    Transport { chain: String, message: String },

    #[error("Node on chain {chain} refused request: {message}")]
    Node { chain: String, message: String },

    #[error("Node on chain {chain} sent a malformed reply: {message}")]
    MalformedReply { chain: String, message: String },

    #[error("Insufficient funds for asset {asset_id}: have {have}, need {need}")]
    InsufficientFunds {
        asset_id: AssetId,
        have: Amount,
        need: Amount,
    },

    #[error("Keychain has no private key for {address}")]
    MissingKey { address: Address },

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Submission to chain {chain} failed: {message}")]
    Submission { chain: String, message: String },

    #[error("Transaction {tx_id} rejected on chain {chain}")]
    Rejected { chain: String, tx_id: TxId },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Funds exported by {export_tx_id} not visible after {attempts} attempts")]
    PropagationTimeout { export_tx_id: TxId, attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Transfer {id} not found")]
    TransferNotFound { id: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransferError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransferError::Transport { .. }
                | TransferError::Timeout { .. }
                | TransferError::PropagationTimeout { .. }
        )
    }

    /// Short machine-readable kind, used in checkpoints and metrics labels
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Config(_) => "config",
            TransferError::Database(_) => "database",
            TransferError::Credentials(_) => "credentials",
            TransferError::AssetNotFound { .. } => "asset_not_found",
            TransferError::UnknownChain { .. } => "unknown_chain",
            TransferError::Transport { .. } => "transport",
            TransferError::Node { .. } => "node",
            TransferError::MalformedReply { .. } => "malformed_reply",
            TransferError::InsufficientFunds { .. } => "insufficient_funds",
            TransferError::MissingKey { .. } => "missing_key",
            TransferError::Signing(_) => "signing",
            TransferError::Submission { .. } => "submission",
            TransferError::Rejected { .. } => "rejected",
            TransferError::Timeout { .. } => "timeout",
            TransferError::PropagationTimeout { .. } => "propagation_timeout",
            TransferError::Cancelled => "cancelled",
            TransferError::InvalidRequest(_) => "invalid_request",
            TransferError::InvalidStateTransition { .. } => "invalid_state_transition",
            TransferError::TransferNotFound { .. } => "transfer_not_found",
            TransferError::Internal(_) => "internal",
        }
    }
}

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;
