//! # tally-core: Pure Logic of the Entitlement Ledger
//!
//! Everything needed to turn purchase rows into ledger transactions and
//! balances, as pure functions with zero I/O.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  Callers (route handlers, jobs)                 │   │
//! │  │   owned products ──► item quantity ──► validate / grant          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                tally-db (storage + resolvers)                   │   │
//! │  │      rows ──► projections ──► k-way merge ──► resolvers         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌────────────┐  ┌──────────┐  │   │
//! │  │   │   money   │  │  ledger   │  │transaction │  │ renewal  │  │   │
//! │  │   │ decimals  │  │  balance  │  │  builders  │  │  windows │  │   │
//! │  │   └───────────┘  └───────────┘  │ projection │  └──────────┘  │   │
//! │  │                                 └────────────┘                  │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Customers, products, config model, owned products
//! - [`money`] - Decimal string arithmetic per currency
//! - [`interval`] - Repeat intervals and calendar math
//! - [`ledger`] - Balance of expirable amounts at an instant
//! - [`transaction`] - Transactions and their typed entries
//! - [`builders`] - Entry constructors
//! - [`projection`] - Row → transaction assembly
//! - [`renewal`] - Synthetic item-grant renewals
//! - [`purchase`] - Purchase rules
//! - [`validation`] - Input checks
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::ledger::{compute_ledger_balance_at_now, LedgerTransaction};
//!
//! const DAY: i64 = 86_400_000;
//! let t0 = 1_735_689_600_000;
//!
//! let txs = [
//!     LedgerTransaction { amount: 10, grant_time: t0, expiration_time: t0 + 14 * DAY },
//!     LedgerTransaction::permanent(-3, t0 + DAY),
//! ];
//! assert_eq!(compute_ledger_balance_at_now(&txs, t0 + 30 * DAY), 0);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod builders;
pub mod error;
pub mod interval;
pub mod ledger;
pub mod money;
pub mod projection;
pub mod purchase;
pub mod renewal;
pub mod transaction;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ProductMissingReason, PurchaseError, ValidationError};
pub use interval::{IntervalUnit, RepeatInterval};
pub use ledger::{compute_ledger_balance_at_now, LedgerTransaction, FAR_FUTURE_MILLIS};
pub use transaction::{EntryRef, Transaction, TransactionEntry, TransactionType};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Page size used when draining transaction sources.
pub const DEFAULT_PAGE_SIZE: usize = 200;

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: usize = 1000;

/// Longest accepted customer or item id.
pub const MAX_ID_LENGTH: usize = 255;

/// Largest quantity of one product in a single purchase.
pub const MAX_PURCHASE_QUANTITY: i64 = 1_000_000;
