//! # Per-Table Projections
//!
//! One [`RowProjection`] per table-backed transaction type.
//!
//! ## Projection Map
//! ```text
//! ┌──────────────────────────────┬──────────────────────────┬──────────────────┐
//! │ Transaction type             │ Rows                     │ Time column      │
//! ├──────────────────────────────┼──────────────────────────┼──────────────────┤
//! │ subscription-start           │ subscriptions            │ created_at       │
//! │ subscription-end             │ subscriptions (ended)    │ ended_at         │
//! │ subscription-cancel          │ subscriptions (pending)  │ updated_at       │
//! │ subscription-renewal         │ subscription_invoices    │ created_at       │
//! │ one-time-purchase            │ one_time_purchases       │ created_at       │
//! │ purchase-refund              │ both purchase tables     │ refunded_at      │
//! │ manual-item-quantity-change  │ item_quantity_changes    │ created_at       │
//! │ default-products-change      │ default_products_snaps.  │ created_at       │
//! └──────────────────────────────┴──────────────────────────┴──────────────────┘
//! ```

use futures_util::future::BoxFuture;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tally_core::projection::{
    default_products_change_transaction, manual_item_quantity_change_transaction,
    purchase_refund_transaction, purchase_start_transaction, subscription_cancel_transaction,
    subscription_end_transaction, subscription_renewal_transaction,
};
use tally_core::{Transaction, TransactionType};

use super::renewal::ItemGrantRenewalSource;
use super::table::{EmptySource, RowProjection, TableSource};
use super::{MergedSource, SourceContext, TransactionSource};
use crate::error::{DbError, DbResult, PaymentsResult};
use crate::repository::default_products::DefaultProductsSnapshotRow;
use crate::repository::invoice::InvoiceRow;
use crate::repository::item_quantity_change::ItemQuantityChangeRow;
use crate::repository::one_time_purchase::{self, OneTimePurchaseRow};
use crate::repository::subscription::{self, SubscriptionRow};
use crate::repository::CustomerFilter;

/// Projects each row, failing on the first error.
fn project_each<R>(
    rows: &[R],
    project: impl Fn(&R) -> PaymentsResult<Transaction>,
) -> PaymentsResult<Vec<Transaction>> {
    rows.iter().map(project).collect()
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionStartRows;

impl RowProjection for SubscriptionStartRows {
    type Row = SubscriptionRow;
    const KIND: TransactionType = TransactionType::SubscriptionStart;

    fn row_id(row: &SubscriptionRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<SubscriptionRow>>> {
        Box::pin(async move {
            ctx.db
                .subscriptions()
                .page(&subscription::STARTED, ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [SubscriptionRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| Ok(purchase_start_transaction(&row.to_purchase_record()?)?))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionEndRows;

impl RowProjection for SubscriptionEndRows {
    type Row = SubscriptionRow;
    const KIND: TransactionType = TransactionType::SubscriptionEnd;

    fn row_id(row: &SubscriptionRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<SubscriptionRow>>> {
        Box::pin(async move {
            ctx.db
                .subscriptions()
                .page(&subscription::ENDED, ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [SubscriptionRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| Ok(subscription_end_transaction(&row.to_purchase_record()?)?))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionCancelRows;

impl RowProjection for SubscriptionCancelRows {
    type Row = SubscriptionRow;
    const KIND: TransactionType = TransactionType::SubscriptionCancel;

    fn row_id(row: &SubscriptionRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<SubscriptionRow>>> {
        Box::pin(async move {
            ctx.db
                .subscriptions()
                .page(&subscription::CANCEL_PENDING, ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [SubscriptionRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| {
                Ok(subscription_cancel_transaction(
                    &row.to_purchase_record()?,
                    row.updated_at_millis,
                )?)
            })
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionRenewalRows;

impl RowProjection for SubscriptionRenewalRows {
    type Row = InvoiceRow;
    const KIND: TransactionType = TransactionType::SubscriptionRenewal;

    fn row_id(row: &InvoiceRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<InvoiceRow>>> {
        Box::pin(async move {
            ctx.db
                .invoices()
                .page_renewals(ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    /// Loads the invoiced subscriptions in one query, then charges each.
    fn project<'a>(
        ctx: &'a SourceContext,
        rows: &'a [InvoiceRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            let ids: Vec<String> = rows
                .iter()
                .map(|invoice| invoice.subscription_id.clone())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let subscriptions: HashMap<String, SubscriptionRow> = ctx
                .db
                .subscriptions()
                .get_many(ctx.tenancy_id(), &ids)
                .await?
                .into_iter()
                .map(|row| (row.id.clone(), row))
                .collect();

            project_each(rows, |invoice| {
                let subscription = subscriptions
                    .get(&invoice.subscription_id)
                    .ok_or_else(|| DbError::not_found("Subscription", &invoice.subscription_id))?;
                Ok(subscription_renewal_transaction(
                    &invoice.id,
                    &subscription.to_purchase_record()?,
                    invoice.created_at_millis,
                )?)
            })
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionRefundRows;

impl RowProjection for SubscriptionRefundRows {
    type Row = SubscriptionRow;
    const KIND: TransactionType = TransactionType::PurchaseRefund;

    fn row_id(row: &SubscriptionRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<SubscriptionRow>>> {
        Box::pin(async move {
            ctx.db
                .subscriptions()
                .page(&subscription::REFUNDED, ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [SubscriptionRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| Ok(purchase_refund_transaction(&row.to_purchase_record()?)?))
        })
    }
}

// =============================================================================
// One-Time Purchases
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct OneTimePurchaseRows;

impl RowProjection for OneTimePurchaseRows {
    type Row = OneTimePurchaseRow;
    const KIND: TransactionType = TransactionType::OneTimePurchase;

    fn row_id(row: &OneTimePurchaseRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<OneTimePurchaseRow>>> {
        Box::pin(async move {
            ctx.db
                .one_time_purchases()
                .page(&one_time_purchase::PURCHASED, ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [OneTimePurchaseRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| Ok(purchase_start_transaction(&row.to_purchase_record()?)?))
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OneTimeRefundRows;

impl RowProjection for OneTimeRefundRows {
    type Row = OneTimePurchaseRow;
    const KIND: TransactionType = TransactionType::PurchaseRefund;

    fn row_id(row: &OneTimePurchaseRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<OneTimePurchaseRow>>> {
        Box::pin(async move {
            ctx.db
                .one_time_purchases()
                .page(&one_time_purchase::REFUNDED, ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [OneTimePurchaseRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| Ok(purchase_refund_transaction(&row.to_purchase_record()?)?))
        })
    }
}

// =============================================================================
// Manual Changes / Default Products
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ManualChangeRows;

impl RowProjection for ManualChangeRows {
    type Row = ItemQuantityChangeRow;
    const KIND: TransactionType = TransactionType::ManualItemQuantityChange;

    fn row_id(row: &ItemQuantityChangeRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<ItemQuantityChangeRow>>> {
        Box::pin(async move {
            ctx.db
                .item_quantity_changes()
                .page(ctx.tenancy_id(), filter, after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [ItemQuantityChangeRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| {
                Ok(manual_item_quantity_change_transaction(
                    &row.id,
                    &row.customer(),
                    &row.item_id,
                    row.quantity,
                    row.created_at_millis,
                )?)
            })
        })
    }
}

/// Snapshots are tenancy-wide; the customer filter does not apply.
#[derive(Debug, Clone, Copy)]
pub struct DefaultProductsRows;

impl RowProjection for DefaultProductsRows {
    type Row = DefaultProductsSnapshotRow;
    const KIND: TransactionType = TransactionType::DefaultProductsChange;

    fn row_id(row: &DefaultProductsSnapshotRow) -> &str {
        &row.id
    }

    fn fetch<'a>(
        ctx: &'a SourceContext,
        _filter: &'a CustomerFilter,
        after: Option<&'a str>,
        limit: usize,
    ) -> BoxFuture<'a, DbResult<Vec<DefaultProductsSnapshotRow>>> {
        Box::pin(async move {
            ctx.db
                .default_products()
                .page(ctx.tenancy_id(), after, limit)
                .await
        })
    }

    fn project<'a>(
        _ctx: &'a SourceContext,
        rows: &'a [DefaultProductsSnapshotRow],
    ) -> BoxFuture<'a, PaymentsResult<Vec<Transaction>>> {
        Box::pin(async move {
            project_each(rows, |row| {
                Ok(default_products_change_transaction(
                    &row.id,
                    row.snapshot()?,
                    row.created_at_millis,
                ))
            })
        })
    }
}

// =============================================================================
// Source Set
// =============================================================================

pub type SubscriptionStartSource = TableSource<SubscriptionStartRows>;
pub type SubscriptionEndSource = TableSource<SubscriptionEndRows>;
pub type SubscriptionCancelSource = TableSource<SubscriptionCancelRows>;
pub type SubscriptionRenewalSource = TableSource<SubscriptionRenewalRows>;
pub type OneTimePurchaseSource = TableSource<OneTimePurchaseRows>;
pub type ManualItemQuantityChangeSource = TableSource<ManualChangeRows>;
pub type DefaultProductsChangeSource = TableSource<DefaultProductsRows>;

/// Refunds of subscriptions and one-time purchases, merged.
pub fn purchase_refund_source(ctx: &SourceContext) -> MergedSource {
    MergedSource::new(
        Some(TransactionType::PurchaseRefund),
        vec![
            Arc::new(TableSource::<SubscriptionRefundRows>::new(ctx.clone())),
            Arc::new(TableSource::<OneTimeRefundRows>::new(ctx.clone())),
        ],
    )
}

/// Every source of the ledger, in a fixed order.
///
/// The order is part of the merged cursor format.
pub fn all_sources(ctx: &SourceContext) -> Vec<Arc<dyn TransactionSource>> {
    vec![
        Arc::new(SubscriptionStartSource::new(ctx.clone())),
        Arc::new(SubscriptionEndSource::new(ctx.clone())),
        Arc::new(SubscriptionCancelSource::new(ctx.clone())),
        Arc::new(SubscriptionRenewalSource::new(ctx.clone())),
        Arc::new(OneTimePurchaseSource::new(ctx.clone())),
        Arc::new(purchase_refund_source(ctx)),
        Arc::new(ManualItemQuantityChangeSource::new(ctx.clone())),
        Arc::new(ItemGrantRenewalSource::new(ctx.clone())),
        Arc::new(DefaultProductsChangeSource::new(ctx.clone())),
        Arc::new(EmptySource::new(TransactionType::Chargeback)),
        Arc::new(EmptySource::new(TransactionType::ProductVersionChange)),
        Arc::new(EmptySource::new(TransactionType::SubscriptionReactivation)),
    ]
}
