use crate::keystore::KeystoreError;
use crate::storage::StorageError;
use crate::trust_lines::TrustLineError;
use thiserror::Error;

/// The error taxonomy of the payment engine.
///
/// None of these ever reach a remote peer: counterparties only see protocol messages (a rejected reservation or a
/// rejecting vote). Local callers see them as the code of a terminal command result.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Malformed or out-of-range input. Fatal to the current transaction and never retried.
    #[error("Invalid value. {0}")]
    Value(String),
    /// Duplicate transaction id, or two transactions contending for the same capacity.
    #[error("Conflict. {0}")]
    Conflict(String),
    /// No trust line, or no live transaction for a message or resource.
    #[error("Not found. {0}")]
    NotFound(String),
    /// Persistence failure. In-memory state has been unwound to the last durable checkpoint.
    #[error("Storage failure. {0}")]
    Io(#[from] StorageError),
    /// A protocol invariant was violated.
    #[error("Protocol invariant violated. {0}")]
    Runtime(String),
}

impl ProtocolError {
    pub fn value(msg: impl Into<String>) -> Self {
        ProtocolError::Value(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        ProtocolError::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        ProtocolError::NotFound(msg.into())
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        ProtocolError::Runtime(msg.into())
    }
}

impl From<KeystoreError> for ProtocolError {
    fn from(error: KeystoreError) -> Self {
        match error {
            KeystoreError::InvalidSignature(_) => ProtocolError::Value(error.to_string()),
            KeystoreError::MissingKey(_) => ProtocolError::NotFound(error.to_string()),
        }
    }
}

impl From<TrustLineError> for ProtocolError {
    fn from(error: TrustLineError) -> Self {
        match error {
            TrustLineError::NoTrustLine(_) | TrustLineError::ReservationNotFound(_) => {
                ProtocolError::NotFound(error.to_string())
            }
            TrustLineError::InsufficientCapacity { .. }
            | TrustLineError::InvalidState { .. }
            | TrustLineError::ShortageGrows { .. }
            | TrustLineError::AlreadyExists(_)
            | TrustLineError::NotSettled(_) => ProtocolError::Value(error.to_string()),
            TrustLineError::Overflow(_) => ProtocolError::Runtime(error.to_string()),
        }
    }
}
