//! # tally-db: Storage, Projections and Resolvers for the Ledger
//!
//! This crate reads purchase rows from SQLite, projects them into virtual
//! ledger transactions, and answers ownership and item-quantity questions.
//! It uses sqlx for async SQLite access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  Route handler (owned products / item quantity / grant)                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │    Ledger     │    │ Transactions  │    │ Repositories │  │   │
//! │  │   │ (ledger.rs,   │───►│ sources, merge│───►│ subscription │  │   │
//! │  │   │  purchase.rs) │    │ renewals      │    │ one-time ... │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────┬───────┘  │   │
//! │  │                                                    │          │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────▼───────┐  │   │
//! │  │   │ LedgerConfig  │    │ TenancyCache  │    │   Database   │  │   │
//! │  │   │ (ledger.toml) │    │ (LRU)         │    │  (pool.rs)   │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  │   subscriptions, one_time_purchases, item_quantity_changes,     │   │
//! │  │   subscription_invoices, default_products_snapshots             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Storage and payments error types
//! - [`repository`] - Row repositories with keyset pagination
//! - [`transactions`] - Per-source projections and the k-way merge
//! - [`ledger`] - Owned-products and item-quantity resolvers
//! - [`purchase`] - Purchase validation and grants
//! - [`config`] - `ledger.toml` loading
//! - [`cache`] - Injected tenancy lookup cache
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig, Ledger};
//!
//! let db = Database::new(DbConfig::new("path/to/ledger.db")).await?;
//! let ledger = Ledger::new(db, tenancy);
//!
//! let owned = ledger
//!     .get_owned_products_for_customer(CustomerType::User, &user_id, None)
//!     .await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod migrations;
pub mod pool;
pub mod purchase;
pub mod repository;
pub mod transactions;

// =============================================================================
// Re-exports
// =============================================================================

pub use cache::{TenancyCache, TenancyDirectory};
pub use config::LedgerConfig;
pub use error::{ConfigError, DbError, DbResult, PaymentsError, PaymentsResult, ProviderError};
pub use ledger::Ledger;
pub use pool::{Database, DbConfig};
pub use purchase::{GrantRequest, GrantResult, NoopPaymentProvider, PaymentProvider};
pub use transactions::{Page, PageItem, PageQuery, TransactionFilter, TransactionSource};

// Repository re-exports for convenience
pub use repository::default_products::DefaultProductsRepository;
pub use repository::one_time_purchase::OneTimePurchaseRepository;
pub use repository::subscription::SubscriptionRepository;
