//! # Error Types
//!
//! Domain-specific error types for tally-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  tally-core errors (this file)                                         │
//! │  ├── CoreError        - Money, entry shape and ledger invariants       │
//! │  ├── PurchaseError    - Purchase rule rejections                       │
//! │  └── ValidationError  - Malformed ids, quantities, page sizes          │
//! │                                                                         │
//! │  tally-db errors (separate crate)                                      │
//! │  ├── DbError          - Storage failures                               │
//! │  └── PaymentsError    - What callers see (400 / known / internal)      │
//! │                                                                         │
//! │  Flow: CoreError → PaymentsError ← DbError                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `Invariant` is the programmer-error class: a broken entry-index contract or
//! an impossible data shape. It is surfaced, never coerced into a value.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Core ledger errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    /// A quantity that should be integral was not.
    ///
    /// ## When This Occurs
    /// - JSON quantity such as `1.5` passed to [`crate::money::integer_quantity`]
    /// - NaN or infinite input
    #[error("Quantity must be an integer")]
    NonIntegerQuantity,

    /// A money string could not be parsed for its currency.
    ///
    /// ## When This Occurs
    /// - Non-numeric characters (`"12a"`)
    /// - More fractional digits than the currency allows (`"1.234"` in USD)
    #[error("Invalid {currency} amount: '{amount}'")]
    InvalidAmount { amount: String, currency: String },

    /// Currency code is not in the supported set.
    #[error("Unsupported currency: {0}")]
    UnsupportedCurrency(String),

    /// Arithmetic left the representable range.
    #[error("Amount overflow while computing {0}")]
    AmountOverflow(String),

    /// A builder was given input with the wrong shape.
    #[error("Invalid {entry} entry: {reason}")]
    InvalidEntry { entry: &'static str, reason: String },

    /// Internal assertion failure.
    ///
    /// ## When This Occurs
    /// - An expire entry points at an index the grant never recorded
    /// - An expire removes more than the referenced change granted
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl CoreError {
    /// Creates an invariant violation from any message.
    pub fn invariant(message: impl Into<String>) -> Self {
        CoreError::Invariant(message.into())
    }

    /// Creates an invalid-entry error.
    pub fn invalid_entry(entry: &'static str, reason: impl Into<String>) -> Self {
        CoreError::InvalidEntry {
            entry,
            reason: reason.into(),
        }
    }

    /// Returns true for programmer-error failures.
    pub fn is_invariant(&self) -> bool {
        matches!(self, CoreError::Invariant(_))
    }
}

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Purchase Error
// =============================================================================

/// Why a product id could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductMissingReason {
    /// An item, not a product, has this id.
    ItemExists,
    /// The product exists but clients may not buy it.
    ServerOnly,
}

/// A purchase request the business rules reject.
///
/// Messages are shown to the buyer as-is.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PurchaseError {
    #[error("Cannot specify both product_id and product_inline!")]
    BothProductIdAndInline,

    #[error("Cannot specify product_inline when calling from client! Please call with a server API key, or use the product_id parameter.")]
    InlineFromClient,

    #[error("Must specify either product_id or product_inline!")]
    MissingProduct,

    /// ## When This Occurs
    /// - Unknown product id (`reason` is `ItemExists` if an item has that id)
    /// - Server-only product requested by a client
    #[error("Product {product_id} does not exist")]
    ProductDoesNotExist {
        product_id: String,
        reason: Option<ProductMissingReason>,
    },

    #[error("Price not found on product associated with this purchase code")]
    PriceNotFound,

    #[error("This product is not stackable; quantity must be 1")]
    NotStackable,

    #[error("Customer {customer_id} already owns product {product_id}")]
    ProductAlreadyGranted {
        product_id: String,
        customer_id: String,
    },

    #[error("This product is an add-on to a product that the customer does not have")]
    MissingAddOnBase,

    #[error("Customer already has a one-time purchase in this product line")]
    OneTimeConflictInProductLine,
}

impl PurchaseError {
    /// True for plain 400-class rejections (not typed domain errors).
    pub fn is_bad_request(&self) -> bool {
        !matches!(
            self,
            PurchaseError::ProductDoesNotExist { .. } | PurchaseError::ProductAlreadyGranted { .. }
        )
    }
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },
}
