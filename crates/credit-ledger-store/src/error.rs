//! Error types for ledger storage.

use credit_ledger_core::{DeductionId, LedgerError, RequestId};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// A stored value could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// A ledger entry with this request id already exists.
    #[error("duplicate request: {request_id}")]
    DuplicateRequest {
        /// The request id that was replayed.
        request_id: RequestId,
    },

    /// The row lock could not be acquired in time.
    #[error("lock wait timed out")]
    LockTimeout,

    /// A statement exceeded the transaction's statement timeout.
    #[error("statement timed out")]
    StatementTimeout,

    /// The transaction was aborted to preserve serializability.
    #[error("serialization failure")]
    SerializationFailure,

    /// A constraint (non-negative balance, one-to-one link, ...) was violated.
    #[error("constraint violated: {0}")]
    Constraint(String),

    /// A write targeted a row this transaction does not hold a lock on.
    #[error("row not locked by this transaction: {0}")]
    NotLocked(String),

    /// The ledger entry is already reversed.
    #[error("deduction already reversed: {deduction_id}")]
    AlreadyReversed {
        /// The entry that was already reversed.
        deduction_id: DeductionId,
    },

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Its id.
        id: String,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            match db.code().as_deref() {
                Some("40001" | "40P01") => return Self::SerializationFailure,
                Some("55P03") => return Self::LockTimeout,
                Some("57014") => return Self::StatementTimeout,
                Some("23514" | "23505" | "23503") => {
                    return Self::Constraint(db.message().to_string());
                }
                _ => {}
            }
        }
        Self::Database(err.to_string())
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateRequest { request_id } => Self::DuplicateRequest { request_id },
            StoreError::LockTimeout => Self::LockTimeout,
            StoreError::StatementTimeout => Self::TransactionTimeout,
            StoreError::SerializationFailure => Self::SerializationConflict,
            StoreError::AlreadyReversed { deduction_id } => Self::AlreadyReversed { deduction_id },
            other => Self::DeductionFailed(other.to_string()),
        }
    }
}
