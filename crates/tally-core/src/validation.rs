//! # Validation Module
//!
//! Input checks run before any ledger work.
//!
//! ## Validation Layers
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Layer 1: THIS MODULE       ids present, quantities and sizes in range │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: purchase rules    stackability, add-ons, product lines       │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite            NOT NULL, CHECK, PRIMARY KEY constraints   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_item_id, validate_purchase_quantity};
//!
//! validate_item_id("credits").unwrap();
//! assert!(validate_purchase_quantity(0).is_err());
//! ```

use crate::error::ValidationError;
use crate::{MAX_ID_LENGTH, MAX_PAGE_SIZE, MAX_PURCHASE_QUANTITY};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn validate_id(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    if value.len() > MAX_ID_LENGTH {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_ID_LENGTH,
        });
    }
    Ok(())
}

/// Validates a customer id (user/team UUID or custom string).
pub fn validate_customer_id(customer_id: &str) -> ValidationResult<()> {
    validate_id("customer_id", customer_id)
}

/// Validates an item id.
pub fn validate_item_id(item_id: &str) -> ValidationResult<()> {
    validate_id("item_id", item_id)
}

/// Validates a purchase quantity.
///
/// ## Rules
/// - At least 1
/// - At most [`MAX_PURCHASE_QUANTITY`]
///
/// Stackability is a separate business rule.
pub fn validate_purchase_quantity(quantity: i64) -> ValidationResult<()> {
    if !(1..=MAX_PURCHASE_QUANTITY).contains(&quantity) {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max: MAX_PURCHASE_QUANTITY,
        });
    }
    Ok(())
}

/// Validates a page size for transaction listing.
pub fn validate_page_size(page_size: usize) -> ValidationResult<()> {
    if page_size == 0 || page_size > MAX_PAGE_SIZE {
        return Err(ValidationError::OutOfRange {
            field: "page_size".to_string(),
            min: 1,
            max: MAX_PAGE_SIZE as i64,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids() {
        assert!(validate_customer_id("3f1c1b8e-0000-4000-8000-000000000001").is_ok());
        assert_eq!(
            validate_customer_id("  ").unwrap_err(),
            ValidationError::Required {
                field: "customer_id".into()
            }
        );
        assert!(validate_item_id(&"x".repeat(MAX_ID_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_purchase_quantity() {
        assert!(validate_purchase_quantity(1).is_ok());
        assert!(validate_purchase_quantity(MAX_PURCHASE_QUANTITY).is_ok());
        assert!(validate_purchase_quantity(0).is_err());
        assert!(validate_purchase_quantity(-3).is_err());
    }

    #[test]
    fn test_page_size() {
        assert!(validate_page_size(200).is_ok());
        assert!(validate_page_size(0).is_err());
        assert!(validate_page_size(MAX_PAGE_SIZE + 1).is_err());
    }
}
