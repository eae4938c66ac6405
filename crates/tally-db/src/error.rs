//! # Error Types
//!
//! Storage errors and the caller-facing payments error.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Error Propagation                                    │
//! │                                                                         │
//! │  sqlx::Error ──► DbError          (storage, categorized)               │
//! │  CoreError  ─┐                                                          │
//! │  DbError    ─┼──► PaymentsError   (what route handlers see)            │
//! │  Purchase   ─┤       │                                                  │
//! │  Provider   ─┘       ▼                                                  │
//! │                 status_code()   400 / 404 / 409 / 502 / 500            │
//! │                 is_known()      typed domain error vs internal failure │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use tally_core::{CoreError, ProductMissingReason, PurchaseError, ValidationError};
use thiserror::Error;

// =============================================================================
// Database Error
// =============================================================================

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Entity not found in database.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// Unique constraint violation.
    ///
    /// ## When This Occurs
    /// - Inserting a row whose `(tenancy_id, id)` already exists
    #[error("Duplicate {field}: '{value}' already exists")]
    UniqueViolation { field: String, value: String },

    /// Foreign key constraint violation.
    ///
    /// ## When This Occurs
    /// - Invoice referencing a subscription that does not exist
    #[error("Foreign key violation: {message}")]
    ForeignKeyViolation { message: String },

    /// Database connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Migration failed.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// A stored JSON column could not be decoded.
    ///
    /// ## When This Occurs
    /// - `product_json` / `snapshot_json` written by an incompatible version
    /// - A cursor string that is not one this crate produced
    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },

    /// Pool exhausted (all connections in use).
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// Internal database error.
    #[error("Internal database error: {0}")]
    Internal(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn malformed(what: &'static str, reason: impl std::fmt::Display) -> Self {
        DbError::Malformed {
            what,
            reason: reason.to_string(),
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// ## Error Mapping
/// ```text
/// sqlx::Error::RowNotFound    → DbError::NotFound
/// sqlx::Error::Database       → Analyze message for constraint type
/// sqlx::Error::PoolTimedOut   → DbError::PoolExhausted
/// Other                       → DbError::Internal
/// ```
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::NotFound {
                entity: "Record".to_string(),
                id: "unknown".to_string(),
            },

            sqlx::Error::Database(db_err) => {
                let msg = db_err.message();

                // "UNIQUE constraint failed: <table>.<column>"
                if msg.contains("UNIQUE constraint failed") {
                    let field = msg
                        .split("UNIQUE constraint failed: ")
                        .nth(1)
                        .unwrap_or("unknown")
                        .to_string();
                    DbError::UniqueViolation {
                        field,
                        value: "unknown".to_string(),
                    }
                } else if msg.contains("FOREIGN KEY constraint failed") {
                    DbError::ForeignKeyViolation {
                        message: msg.to_string(),
                    }
                } else {
                    DbError::QueryFailed(msg.to_string())
                }
            }

            sqlx::Error::PoolTimedOut => DbError::PoolExhausted,

            sqlx::Error::PoolClosed => DbError::ConnectionFailed("Pool is closed".to_string()),

            _ => DbError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::malformed("json column", err)
    }
}

/// Result type for database operations.
pub type DbResult<T> = Result<T, DbError>;

// =============================================================================
// Config Error
// =============================================================================

/// Errors while loading, validating or saving `ledger.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// The config parsed but is not usable.
    ///
    /// ## When This Occurs
    /// - `page_size = 0`
    /// - A product references an undeclared product line
    /// - An add-on names a product that is not configured
    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("No config path available")]
    NoConfigPath,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// Provider Error
// =============================================================================

/// Failure reported by the payment provider.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider request failed: {0}")]
    Request(String),

    #[error("Provider subscription not found: {0}")]
    SubscriptionNotFound(String),
}

// =============================================================================
// Payments Error
// =============================================================================

/// Errors surfaced to callers of the ledger and purchase APIs.
#[derive(Debug, Error)]
pub enum PaymentsError {
    /// Malformed purchase request; the message is shown as-is.
    #[error("{0}")]
    Validation(String),

    #[error("Customer {customer_id} already owns product {product_id}")]
    ProductAlreadyGranted {
        product_id: String,
        customer_id: String,
    },

    #[error("Customer {customer_id} does not exist")]
    CustomerDoesNotExist { customer_id: String },

    #[error("User not found")]
    UserNotFound,

    #[error("Team {team_id} not found")]
    TeamNotFound { team_id: String },

    #[error("Product {product_id} does not exist")]
    ProductDoesNotExist {
        product_id: String,
        reason: Option<ProductMissingReason>,
    },

    /// The payment provider failed while cancelling a conflicting subscription.
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Db(#[from] DbError),
}

impl PaymentsError {
    /// HTTP status the error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            PaymentsError::Validation(_) => 400,
            PaymentsError::ProductAlreadyGranted { .. } => 409,
            PaymentsError::CustomerDoesNotExist { .. }
            | PaymentsError::UserNotFound
            | PaymentsError::TeamNotFound { .. }
            | PaymentsError::ProductDoesNotExist { .. } => 404,
            PaymentsError::Provider(_) => 502,
            PaymentsError::Core(_) | PaymentsError::Db(_) => 500,
        }
    }

    /// True for typed domain errors callers are expected to match on.
    pub fn is_known(&self) -> bool {
        !matches!(
            self,
            PaymentsError::Provider(_) | PaymentsError::Core(_) | PaymentsError::Db(_)
        )
    }
}

impl From<PurchaseError> for PaymentsError {
    fn from(err: PurchaseError) -> Self {
        match err {
            PurchaseError::ProductDoesNotExist { product_id, reason } => {
                PaymentsError::ProductDoesNotExist { product_id, reason }
            }
            PurchaseError::ProductAlreadyGranted {
                product_id,
                customer_id,
            } => PaymentsError::ProductAlreadyGranted {
                product_id,
                customer_id,
            },
            other => PaymentsError::Validation(other.to_string()),
        }
    }
}

impl From<ValidationError> for PaymentsError {
    fn from(err: ValidationError) -> Self {
        PaymentsError::Validation(err.to_string())
    }
}

/// Result type for ledger and purchase operations.
pub type PaymentsResult<T> = Result<T, PaymentsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(PaymentsError::Validation("x".into()).status_code(), 400);
        assert_eq!(PaymentsError::UserNotFound.status_code(), 404);
        assert_eq!(
            PaymentsError::TeamNotFound {
                team_id: "t".into()
            }
            .status_code(),
            404
        );
        assert_eq!(
            PaymentsError::from(ProviderError::Request("timeout".into())).status_code(),
            502
        );
        assert_eq!(
            PaymentsError::from(CoreError::invariant("broken")).status_code(),
            500
        );
    }

    #[test]
    fn test_purchase_error_mapping() {
        let err = PaymentsError::from(PurchaseError::NotStackable);
        assert!(err.is_known());
        assert_eq!(err.to_string(), "This product is not stackable; quantity must be 1");

        let err = PaymentsError::from(PurchaseError::ProductAlreadyGranted {
            product_id: "pro".into(),
            customer_id: "u1".into(),
        });
        assert_eq!(err.status_code(), 409);

        let err = PaymentsError::from(PurchaseError::ProductDoesNotExist {
            product_id: "credits".into(),
            reason: Some(ProductMissingReason::ItemExists),
        });
        assert!(matches!(
            err,
            PaymentsError::ProductDoesNotExist {
                reason: Some(ProductMissingReason::ItemExists),
                ..
            }
        ));
    }

    #[test]
    fn test_internal_errors_not_known() {
        let err = PaymentsError::from(DbError::PoolExhausted);
        assert!(!err.is_known());
        assert!(!PaymentsError::from(CoreError::invariant("x")).is_known());
    }
}
