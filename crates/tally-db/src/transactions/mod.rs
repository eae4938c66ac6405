//! # Transaction Sources
//!
//! The ledger stores no transactions. Every source here projects mutable
//! rows into [`Transaction`]s on demand, one cursor page at a time, and the
//! merger interleaves the sources into one feed.
//!
//! ## Source Layout
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Merged Transaction Feed                           │
//! │                  ordered (created_at DESC, id DESC)                     │
//! │                                                                         │
//! │   ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐       │
//! │   │ subscription-*   │ │ one-time-purchase│ │ purchase-refund  │       │
//! │   │ start/end/cancel │ │                  │ │  (merged: subs + │       │
//! │   │ renewal          │ │                  │ │   one-time)      │       │
//! │   └────────┬─────────┘ └────────┬─────────┘ └────────┬─────────┘       │
//! │            │   keyset pages over SQLite rows         │                 │
//! │   ┌────────┴─────────┐ ┌────────┴─────────┐ ┌────────┴─────────┐       │
//! │   │ manual-item-     │ │ default-products-│ │ item-grant-      │       │
//! │   │ quantity-change  │ │ change           │ │ renewal (eager,  │       │
//! │   │                  │ │                  │ │ paged in memory) │       │
//! │   └──────────────────┘ └──────────────────┘ └──────────────────┘       │
//! │                                                                         │
//! │   chargeback / product-version-change / subscription-reactivation      │
//! │   are typed sources that are always empty.                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Cursors
//! - Table sources: the id of the last row returned (`""` = start).
//! - Renewal source: `"{effective_at_millis}:{transaction_id}"`.
//! - Merged sources: a JSON array of the child cursors, in source order.

pub mod merge;
pub mod renewal;
pub mod sources;
pub mod table;

use futures_util::future::BoxFuture;
use std::sync::Arc;
use tally_core::{CustomerType, Tenancy, Transaction, TransactionType};
use tracing::debug;

use crate::error::PaymentsResult;
use crate::pool::Database;
use crate::repository::CustomerFilter;

pub use merge::MergedSource;
pub use renewal::ItemGrantRenewalSource;
pub use table::{EmptySource, TableSource};

// =============================================================================
// Query / Page
// =============================================================================

/// Which transactions a query wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    pub customer_type: Option<CustomerType>,
    pub customer_id: Option<String>,
    /// Only sources of this type are read; the others are skipped.
    pub transaction_type: Option<TransactionType>,
}

impl TransactionFilter {
    pub fn customer(customer_type: CustomerType, customer_id: impl Into<String>) -> Self {
        TransactionFilter {
            customer_type: Some(customer_type),
            customer_id: Some(customer_id.into()),
            transaction_type: None,
        }
    }

    pub fn with_type(mut self, transaction_type: TransactionType) -> Self {
        self.transaction_type = Some(transaction_type);
        self
    }

    pub fn customer_filter(&self) -> CustomerFilter {
        CustomerFilter {
            customer_type: self.customer_type,
            customer_id: self.customer_id.clone(),
        }
    }
}

/// One page request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
    /// Cursor returned by the previous page; `None` starts from the newest.
    pub cursor: Option<String>,
    pub limit: usize,
    pub filter: TransactionFilter,
}

impl PageQuery {
    pub fn first(limit: usize, filter: TransactionFilter) -> Self {
        PageQuery {
            cursor: None,
            limit,
            filter,
        }
    }

    /// The cursor as a non-empty string, or `None` at the start.
    pub fn after(&self) -> Option<&str> {
        self.cursor.as_deref().filter(|c| !c.is_empty())
    }
}

/// A transaction with the cursors before and after it.
#[derive(Debug, Clone, PartialEq)]
pub struct PageItem {
    pub transaction: Transaction,
    pub prev_cursor: String,
    pub next_cursor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub items: Vec<PageItem>,
    pub is_first: bool,
    pub is_last: bool,
    /// Pass back as [`PageQuery::cursor`] to continue.
    pub cursor: String,
}

impl Page {
    pub fn empty(cursor: impl Into<String>, is_first: bool) -> Self {
        Page {
            items: Vec::new(),
            is_first,
            is_last: true,
            cursor: cursor.into(),
        }
    }

    pub fn into_transactions(self) -> Vec<Transaction> {
        self.items.into_iter().map(|item| item.transaction).collect()
    }
}

// =============================================================================
// Source Trait
// =============================================================================

/// A paginated stream of transactions, newest first.
pub trait TransactionSource: Send + Sync {
    /// The single transaction type this source yields; `None` for mixed feeds.
    fn kind(&self) -> Option<TransactionType>;

    fn next_page<'a>(&'a self, query: &'a PageQuery) -> BoxFuture<'a, PaymentsResult<Page>>;
}

/// What every source reads from.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub db: Database,
    pub tenancy: Arc<Tenancy>,
    /// Upper bound for synthesized transactions.
    pub now: i64,
    /// Page size used when a source drains another.
    pub page_size: usize,
}

impl SourceContext {
    pub fn tenancy_id(&self) -> &str {
        &self.tenancy.id
    }
}

/// True when the source should be read under `filter`.
pub fn source_matches(source: &dyn TransactionSource, filter: &TransactionFilter) -> bool {
    match (filter.transaction_type, source.kind()) {
        (Some(wanted), Some(kind)) => wanted == kind,
        _ => true,
    }
}

// =============================================================================
// Draining
// =============================================================================

/// Reads every page of `source` sequentially.
pub async fn drain(
    source: &dyn TransactionSource,
    filter: &TransactionFilter,
    page_size: usize,
) -> PaymentsResult<Vec<Transaction>> {
    let mut query = PageQuery::first(page_size.max(1), filter.clone());
    let mut out = Vec::new();
    loop {
        let page = source.next_page(&query).await?;
        let is_last = page.is_last;
        query.cursor = Some(page.cursor.clone());
        out.extend(page.into_transactions());
        if is_last {
            break;
        }
    }
    debug!(kind = ?source.kind(), count = out.len(), "Drained transaction source");
    Ok(out)
}

/// The merged feed over every source.
pub fn transaction_feed(ctx: &SourceContext) -> MergedSource {
    MergedSource::new(None, sources::all_sources(ctx))
}

/// One page of the merged feed.
pub async fn list_transactions(ctx: &SourceContext, query: &PageQuery) -> PaymentsResult<Page> {
    transaction_feed(ctx).next_page(query).await
}

/// Every transaction of the merged feed matching `filter`.
pub async fn drain_all(ctx: &SourceContext, filter: &TransactionFilter) -> PaymentsResult<Vec<Transaction>> {
    drain(&transaction_feed(ctx), filter, ctx.page_size).await
}
