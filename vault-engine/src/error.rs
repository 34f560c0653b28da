// Copyright (c) Starcoin, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Failure of a single chain-access operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
    // Transport level failure (connection, HTTP status, malformed JSON-RPC envelope)
    #[error("transport error: {0}")]
    Transport(String),
    // The call did not resolve within the per-call budget
    #[error("{label} timed out after {after:?}")]
    Timeout { label: String, after: Duration },
    // The node answered with a JSON-RPC error (revert, invalid params, ...)
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    // Return data or log payload did not match the expected ABI shape
    #[error("decode error: {0}")]
    Decode(String),
    // The provider answered, but with something we refuse to trust
    #[error("provider returned inconsistent data: {0}")]
    Inconsistent(String),
}

impl ReadError {
    pub fn error_type(&self) -> &'static str {
        match self {
            ReadError::Transport(_) => "transport",
            ReadError::Timeout { .. } => "timeout",
            ReadError::Rpc { .. } => "rpc",
            ReadError::Decode(_) => "decode",
            ReadError::Inconsistent(_) => "inconsistent",
        }
    }

    /// Whether the transport layer may retry the call.
    pub fn is_transient(&self) -> bool {
        match self {
            ReadError::Transport(_) | ReadError::Timeout { .. } => true,
            ReadError::Rpc { code, message } => is_rate_limited(*code, message),
            ReadError::Decode(_) | ReadError::Inconsistent(_) => false,
        }
    }
}

// Infura and friends report rate limiting as JSON-RPC errors rather than HTTP 429.
fn is_rate_limited(code: i64, message: &str) -> bool {
    let message = message.to_lowercase();
    code == -32005
        || code == 429
        || message.contains("rate limit")
        || message.contains("too many requests")
        || message.contains("quota exceeded")
}

/// Outcome of a wallet-submitted transaction, as far as this engine cares.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("transaction rejected by user: {0}")]
    UserRejected(String),
    #[error("transaction failed: {0}")]
    Failed(String),
}

/// EIP-1193 "User Rejected Request".
pub const USER_REJECTED_CODE: i64 = 4001;

const USER_REJECTION_MARKERS: &[&str] = &[
    "user rejected",
    "user denied",
    "rejected the request",
    "action_rejected",
];

/// Splits a wallet failure signal into "user rejected" vs. everything else.
pub fn classify_transaction_failure(code: Option<i64>, message: &str) -> TransactionError {
    let lowered = message.to_lowercase();
    if code == Some(USER_REJECTED_CODE) || USER_REJECTION_MARKERS.iter().any(|m| lowered.contains(m))
    {
        TransactionError::UserRejected(message.to_string())
    } else {
        TransactionError::Failed(message.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    // Static vault configuration is malformed; fatal at startup
    #[error("invalid vault configuration: {0}")]
    ConfigValidation(String),
    // A batched read came back with the wrong shape; fatal for this vault's snapshot only
    #[error("data integrity failure for vault {vault_id}: {reason}")]
    DataIntegrity { vault_id: String, reason: String },
    // One of the event streams failed; fatal for this vault's history only
    #[error("failed to fetch {stream} logs for vault {vault_id}: {source}")]
    LogFetch {
        vault_id: String,
        stream: &'static str,
        source: ReadError,
    },
    // A single dependent read failed
    #[error("chain read {label} failed: {source}")]
    ChainRead { label: String, source: ReadError },
    #[error("unknown vault: {0}")]
    UnknownVault(String),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

impl EngineError {
    /// Returns a short string identifying the error type for metrics labels
    pub fn error_type(&self) -> &'static str {
        match self {
            EngineError::ConfigValidation(_) => "config_validation",
            EngineError::DataIntegrity { .. } => "data_integrity",
            EngineError::LogFetch { .. } => "log_fetch",
            EngineError::ChainRead { .. } => "chain_read",
            EngineError::UnknownVault(_) => "unknown_vault",
            EngineError::Transaction(TransactionError::UserRejected(_)) => "user_rejected",
            EngineError::Transaction(TransactionError::Failed(_)) => "transaction_failed",
        }
    }

    pub fn data_integrity(vault_id: &str, reason: impl Into<String>) -> Self {
        EngineError::DataIntegrity {
            vault_id: vault_id.to_string(),
            reason: reason.into(),
        }
    }

    pub fn chain_read(label: impl Into<String>, source: ReadError) -> Self {
        EngineError::ChainRead {
            label: label.into(),
            source,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
