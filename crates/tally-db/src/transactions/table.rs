//! # Table Sources
//!
//! A [`TableSource`] pages over one table through a [`RowProjection`],
//! which knows how to fetch a keyset page and how to turn the rows into
//! transactions.

use futures_util::future::BoxFuture;
use std::marker::PhantomData;
use tally_core::TransactionType;

use super::{Page, PageItem, PageQuery, SourceContext, TransactionSource};
use crate::error::{DbResult, PaymentsResult};
use crate::repository::CustomerFilter;
use tally_core::Transaction;

/// Row-to-transaction projection of one table.
///
/// `project` must return exactly one transaction per row, in row order.
pub trait RowProjection: Send + Sync + 'static {
    type Row: Send + Sync + 'static;

    const KIND: TransactionType;

    /// The cursor value for a row.
    fn row_id(row: &Self::Row) -> &str;

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<Self::Row>>>;

    fn project<'a>(
        ctx: &'a SourceContext,
        rows: &'a [Self::Row],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>>;
}

/// Single-table, keyset-paginated source.
#[derive(Debug, Clone)]
pub struct TableSource<P> {
    ctx: SourceContext,
    _projection: PhantomData<fn() -> P>,
}

impl<P: RowProjection> TableSource<P> {
    pub fn new(ctx: SourceContext) -> Self {
        TableSource {
            ctx,
            _projection: PhantomData,
        }
    }
}

impl<P: RowProjection> TransactionSource for TableSource<P> {
    fn kind(&self) -> Option<TransactionType> {
        Some(P::KIND)
    }

    fn next_page<'a>(&'a self, query: &'a PageQuery) -> BoxFuture<'a, PaymentsResult<Page>> {
        Box::pin(async move {
            let limit = query.limit.max(1);
            let after = query.after();
            let filter = query.filter.customer_filter();

            let rows = P::fetch(&self.ctx, &filter, after, limit).await?;
            let transactions = P::project(&self.ctx, &rows).await?;
            let is_last = rows.len() < limit;

            let mut cursor = after.unwrap_or_default().to_string();
            let mut items = Vec::with_capacity(rows.len());
            for (row, transaction) in rows.iter().zip(transactions) {
                let next_cursor = P::row_id(row).to_string();
                let prev_cursor = std::mem::replace(&mut cursor, next_cursor.clone());
                items.push(PageItem {
                    transaction,
                    prev_cursor,
                    next_cursor,
                });
            }

            Ok(Page {
                items,
                is_first: after.is_none(),
                is_last,
                cursor,
            })
        })
    }
}

/// A typed source with no backing events yet.
#[derive(Debug, Clone, Copy)]
pub struct EmptySource {
    kind: TransactionType,
}

impl EmptySource {
    pub fn new(kind: TransactionType) -> Self {
        EmptySource { kind }
    }
}

impl TransactionSource for EmptySource {
    fn kind(&self) -> Option<TransactionType> {
        Some(self.kind)
    }

    fn next_page<'a>(&'a self, query: &'a PageQuery) -> BoxFuture<'a, PaymentsResult<Page>> {
        let cursor = query.after().unwrap_or_default().to_string();
        let is_first = query.after().is_none();
        Box::pin(async move { Ok(Page::empty(cursor, is_first)) })
    }
}
