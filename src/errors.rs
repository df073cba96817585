//! Unified error type for the studio ledger.
//!
//! Errors are grouped the way callers react to them: missing records, rejected
//! input, conflicting concurrent writes, failures of external providers, and
//! infrastructure problems.

use thiserror::Error;

/// All errors produced by the ledger, reconciliation, merge and check-in operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No student with this id exists
    #[error("Student not found: {id}")]
    StudentNotFound {
        /// Student id that was looked up
        id: String,
    },

    /// No transaction with this id exists
    #[error("Transaction not found: {id}")]
    TransactionNotFound {
        /// Transaction id that was looked up
        id: String,
    },

    /// No concession block with this id exists
    #[error("Concession block not found: {id}")]
    BlockNotFound {
        /// Block id that was looked up
        id: String,
    },

    /// No check-in with this id exists
    #[error("Check-in not found: {id}")]
    CheckinNotFound {
        /// Check-in id that was looked up
        id: String,
    },

    /// No concession package with this id exists
    #[error("Concession package not found: {id}")]
    PackageNotFound {
        /// Package id that was looked up
        id: String,
    },

    /// No merge operation with this id exists
    #[error("Merge operation not found: {id}")]
    MergeNotFound {
        /// Merge operation id that was looked up
        id: i64,
    },

    /// Amount is zero, negative, or not finite where a positive amount is required
    #[error("Invalid amount: {amount}")]
    InvalidAmount {
        /// The rejected amount
        amount: f64,
    },

    /// Payment method missing or not acceptable for this operation
    #[error("Invalid payment method: {method}")]
    InvalidPaymentMethod {
        /// Description of the rejected method
        method: String,
    },

    /// The transaction is in a state that does not allow a refund or refund reversal
    #[error("Refund not allowed: {reason}")]
    RefundNotAllowed {
        /// User-facing reason
        reason: String,
    },

    /// Generic input or state validation failure
    #[error("Validation error: {message}")]
    Validation {
        /// User-facing message
        message: String,
    },

    /// A conditional write matched nothing or an id already exists
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflicting state
        message: String,
    },

    /// Payment gateway or identity provider failure
    #[error("{service} error: {message}")]
    ExternalService {
        /// Name of the failing service
        service: String,
        /// Message reported by the service
        message: String,
    },

    /// Configuration could not be loaded or parsed
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the problem
        message: String,
    },

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the operation may succeed if simply attempted again.
    ///
    /// Only infrastructure failures qualify; business rejections never change on retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    /// Maps a unique-constraint violation on insert to [`Error::Conflict`], leaving
    /// every other database error untouched.
    pub(crate) fn from_insert(err: sea_orm::DbErr, what: &str) -> Self {
        match err.sql_err() {
            Some(sea_orm::SqlErr::UniqueConstraintViolation(_)) => Self::Conflict {
                message: format!("{what} already exists"),
            },
            _ => Self::Database(err),
        }
    }
}

/// Convenience `Result` type
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_database_errors_are_retryable() {
        assert!(Error::Database(sea_orm::DbErr::Custom("locked".to_string())).is_retryable());
        assert!(
            !Error::Conflict {
                message: "block exhausted".to_string()
            }
            .is_retryable()
        );
        assert!(!Error::InvalidAmount { amount: -1.0 }.is_retryable());
    }

    #[test]
    fn test_error_messages() {
        let err = Error::RefundNotAllowed {
            reason: "Transaction has already been fully refunded".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Refund not allowed: Transaction has already been fully refunded"
        );

        let err = Error::ExternalService {
            service: "Payment gateway".to_string(),
            message: "card_declined".to_string(),
        };
        assert_eq!(err.to_string(), "Payment gateway error: card_declined");
    }
}
