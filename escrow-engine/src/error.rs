//! Error types for the escrow system
//!
//! Every operation in the crate returns [`EscrowError`]. Variants follow the
//! platform taxonomy: validation failures are rejected synchronously with no
//! state change, conflicts ask the caller to refetch and retry, integration
//! failures are retryable and never leak internals to end users.

use thiserror::Error;

/// Main error type for escrow operations
#[derive(Error, Debug)]
pub enum EscrowError {
    /// Input or guard validation failed
    #[error("Validation error: {0}")]
    Validation(String),

    /// Balance does not cover the requested debit
    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: i64, available: i64 },

    /// Actor is not allowed to perform the operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record changed concurrently; caller must refetch and retry
    #[error("Conflict: expected status {expected}, found {actual}")]
    Conflict { expected: String, actual: String },

    /// State machine transition errors
    #[error("Invalid state transition: {from_state} -> {to_state}: {reason}")]
    StateTransition {
        from_state: String,
        to_state: String,
        reason: String,
    },

    /// Dispute resolution errors
    #[error("Dispute error: {0}")]
    Dispute(String),

    /// External integration errors (ledger backend, IP gate, etc.)
    #[error("Integration error: {0}")]
    Integration(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by callers to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Integration,
    Internal,
}

impl EscrowError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized<S: Into<String>>(msg: S) -> Self {
        Self::Unauthorized(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(expected: S, actual: S) -> Self {
        Self::Conflict {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a state transition error
    pub fn state_transition<S: Into<String>>(from_state: S, to_state: S, reason: S) -> Self {
        Self::StateTransition {
            from_state: from_state.into(),
            to_state: to_state.into(),
            reason: reason.into(),
        }
    }

    /// Create a dispute error
    pub fn dispute<S: Into<String>>(msg: S) -> Self {
        Self::Dispute(msg.into())
    }

    /// Create an integration error
    pub fn integration<S: Into<String>>(msg: S) -> Self {
        Self::Integration(msg.into())
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_)
            | Self::InsufficientBalance { .. }
            | Self::Unauthorized(_)
            | Self::NotFound(_)
            | Self::StateTransition { .. }
            | Self::Dispute(_) => ErrorKind::Validation,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Integration(_) => ErrorKind::Integration,
            Self::Config(_) | Self::Serialization(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the same request may succeed if issued again
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Integration)
    }

    /// Message safe to show the initiating actor
    pub fn user_message(&self) -> String {
        match self.kind() {
            ErrorKind::Validation => self.to_string(),
            ErrorKind::Conflict => format!(
                "{}. The transaction was updated by someone else; refresh and try again",
                self
            ),
            ErrorKind::Integration => {
                "The service is temporarily unavailable, please retry".to_string()
            }
            ErrorKind::Internal => "An unexpected error occurred".to_string(),
        }
    }
}

impl From<config::ConfigError> for EscrowError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
