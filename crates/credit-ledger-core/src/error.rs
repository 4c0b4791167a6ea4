//! Error types for the credit ledger.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::ids::{DeductionId, IdError, RequestId};

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// How far a balance falls short of a requested deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shortfall {
    /// Balance observed under the row lock.
    pub current_balance: Decimal,
    /// Quantized amount that was requested.
    pub required: Decimal,
    /// `required - current_balance`.
    pub shortfall: Decimal,
}

impl Shortfall {
    /// Build a shortfall from the observed balance and the required amount.
    #[must_use]
    pub fn new(current_balance: Decimal, required: Decimal) -> Self {
        Self {
            current_balance,
            required,
            shortfall: required - current_balance,
        }
    }
}

/// Errors that can occur in ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The balance does not cover the deduction. Not worth retrying with the same amount.
    #[error(
        "insufficient credits: balance={current_balance}, required={required}, shortfall={shortfall}"
    )]
    InsufficientCredits {
        /// Balance at the time of the check.
        current_balance: Decimal,
        /// Quantized amount requested.
        required: Decimal,
        /// Missing credits.
        shortfall: Decimal,
    },

    /// Invalid rounding increment or other configuration value.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The ledger entry does not exist.
    #[error("deduction not found: {deduction_id}")]
    NotFound {
        /// The id that was looked up.
        deduction_id: DeductionId,
    },

    /// The ledger entry was already reversed.
    #[error("deduction already reversed: {deduction_id}")]
    AlreadyReversed {
        /// The id of the reversed entry.
        deduction_id: DeductionId,
    },

    /// A ledger entry with this request id already exists.
    #[error("duplicate request: {request_id}")]
    DuplicateRequest {
        /// The replayed request id.
        request_id: RequestId,
    },

    /// Waiting for a row lock exceeded the configured bound.
    #[error("timed out waiting for a balance lock")]
    LockTimeout,

    /// The transaction exceeded its total time budget.
    #[error("transaction timed out")]
    TransactionTimeout,

    /// The storage engine aborted the transaction to keep it serializable.
    #[error("serialization conflict, retry the operation")]
    SerializationConflict,

    /// Storage failure or any other unexpected error.
    #[error("deduction failed: {0}")]
    DeductionFailed(String),

    /// Invalid caller input (non-positive amount, blank reason, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl LedgerError {
    /// Build an insufficiency error from a [`Shortfall`].
    #[must_use]
    pub fn insufficient(shortfall: Shortfall) -> Self {
        Self::InsufficientCredits {
            current_balance: shortfall.current_balance,
            required: shortfall.required,
            shortfall: shortfall.shortfall,
        }
    }

    /// Whether the whole operation may be retried with the same request id.
    ///
    /// True duplicates are still rejected by the store on retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout
                | Self::TransactionTimeout
                | Self::SerializationConflict
                | Self::DeductionFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn shortfall_math() {
        let s = Shortfall::new(dec!(10), dec!(50));
        assert_eq!(s.shortfall, dec!(40));

        let err = LedgerError::insufficient(s);
        assert_eq!(
            err.to_string(),
            "insufficient credits: balance=10, required=50, shortfall=40"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(LedgerError::LockTimeout.is_transient());
        assert!(LedgerError::SerializationConflict.is_transient());
        assert!(!LedgerError::Configuration("x".into()).is_transient());
        assert!(!LedgerError::AlreadyReversed {
            deduction_id: DeductionId::generate()
        }
        .is_transient());
    }
}
