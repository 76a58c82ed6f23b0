//! Error types for the deposit relayer

use thiserror::Error;

/// Main error type for the relayer
#[derive(Error, Debug)]
pub enum RelayerError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Network error on chain {chain_id}: {message}")]
    TransientNetwork { chain_id: u64, message: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Reorg detected on chain {chain_id} at block {block_number}")]
    ChainReorg { chain_id: u64, block_number: u64 },

    #[error("Nonce conflict on chain {chain_id}: {message}")]
    NonceConflict { chain_id: u64, message: String },

    #[error("Insufficient funds on chain {chain_id}: {message}")]
    InsufficientFunds { chain_id: u64, message: String },

    #[error("Fill reverted: {reason}")]
    Reverted { reason: String },

    #[error("Invalid transition for deposit {id} from {from} to {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Deposit {id} not found")]
    DepositNotFound { id: String },

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayerError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RelayerError::TransientNetwork { .. }
                | RelayerError::Timeout { .. }
                | RelayerError::ChainReorg { .. }
        )
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(
            self,
            RelayerError::InsufficientFunds { .. }
                | RelayerError::Reverted { .. }
                | RelayerError::InvalidTransition { .. }
                | RelayerError::Wallet(_)
        )
    }

    /// Violations of relay invariants. These are bugs and must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RelayerError::InvalidTransition { .. })
    }

    /// Short label used for metrics and persisted failure reasons
    pub fn kind(&self) -> &'static str {
        match self {
            RelayerError::Config(_) => "config",
            RelayerError::Database(_) => "database",
            RelayerError::TransientNetwork { .. } => "network",
            RelayerError::Timeout { .. } => "timeout",
            RelayerError::ChainReorg { .. } => "reorg",
            RelayerError::NonceConflict { .. } => "nonce_conflict",
            RelayerError::InsufficientFunds { .. } => "insufficient_funds",
            RelayerError::Reverted { .. } => "reverted",
            RelayerError::InvalidTransition { .. } => "invalid_transition",
            RelayerError::DepositNotFound { .. } => "not_found",
            RelayerError::EventParsing(_) => "event_parsing",
            RelayerError::Wallet(_) => "wallet",
            RelayerError::Cancelled => "cancelled",
            RelayerError::Internal(_) => "internal",
        }
    }
}

/// Result type for relayer operations
pub type RelayerResult<T> = Result<T, RelayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_errors_are_retryable() {
        let err = RelayerError::TransientNetwork {
            chain_id: 1,
            message: "connection reset".to_string(),
        };
        assert!(err.is_retryable());
        assert!(!err.should_alert());

        let err = RelayerError::Timeout {
            operation: "broadcast".to_string(),
        };
        assert!(err.is_retryable());
        assert_eq!(err.kind(), "timeout");
    }

    #[test]
    fn test_fill_outcomes_are_not_retried() {
        let reverted = RelayerError::Reverted {
            reason: "execution reverted".to_string(),
        };
        assert!(!reverted.is_retryable());
        assert!(reverted.should_alert());

        let invalid = RelayerError::InvalidTransition {
            id: "0x01".to_string(),
            from: "Filled".to_string(),
            to: "Submitting".to_string(),
        };
        assert!(invalid.is_fatal());
        assert!(!invalid.is_retryable());
    }
}
