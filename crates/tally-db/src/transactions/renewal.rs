//! # Item Grant Renewal Source
//!
//! Renewals have no backing rows. Each page re-drains the grant, revocation
//! and snapshot sources, generates every renewal up to `now`, and slices the
//! sorted result in memory.
//!
//! ```text
//!   subscription-start ─┐
//!   one-time-purchase  ─┤ grants
//!   subscription-end   ─┐                    ┌──────────────────────────┐
//!   purchase-refund    ─┤ revocations  ────► │ generate_item_grant_     │ ──► sort DESC ──► page
//!   default-products-  ─┘ snapshots          │ renewals(.., now)        │
//!   change                                   └──────────────────────────┘
//! ```
//!
//! The generated set is kept per source instance and filter, so draining
//! one source pages through a single generation.

use futures_util::future::BoxFuture;
use std::collections::BTreeSet;
use std::sync::Arc;
use tally_core::renewal::{generate_item_grant_renewals, RenewalInput};
use tally_core::{Customer, Transaction, TransactionType};
use tokio::sync::Mutex;
use tracing::debug;

use super::sources::{
    purchase_refund_source, DefaultProductsChangeSource, OneTimePurchaseSource,
    SubscriptionEndSource, SubscriptionStartSource,
};
use super::{drain, Page, PageItem, PageQuery, SourceContext, TransactionFilter, TransactionSource};
use crate::error::{DbError, PaymentsResult};

/// Cursor of a renewal: `"{effective_at_millis}:{id}"`.
fn renewal_cursor(transaction: &Transaction) -> String {
    format!("{}:{}", transaction.effective_at_millis, transaction.id)
}

fn parse_cursor(cursor: &str) -> PaymentsResult<(i64, &str)> {
    let (millis, id) = cursor
        .split_once(':')
        .ok_or_else(|| DbError::malformed("renewal cursor", cursor))?;
    let millis = millis
        .parse::<i64>()
        .map_err(|e| DbError::malformed("renewal cursor", e))?;
    Ok((millis, id))
}

/// Renewals generated for one filter.
type Generated = Option<(TransactionFilter, Arc<Vec<Transaction>>)>;

#[derive(Debug, Clone)]
pub struct ItemGrantRenewalSource {
    ctx: SourceContext,
    generated: Arc<Mutex<Generated>>,
}

impl ItemGrantRenewalSource {
    pub fn new(ctx: SourceContext) -> Self {
        ItemGrantRenewalSource {
            ctx,
            generated: Arc::new(Mutex::new(None)),
        }
    }

    /// The generated set for `filter`, computed on first use.
    async fn renewals(&self, filter: &TransactionFilter) -> PaymentsResult<Arc<Vec<Transaction>>> {
        let mut generated = self.generated.lock().await;
        if let Some((cached_filter, renewals)) = generated.as_ref() {
            if cached_filter == filter {
                return Ok(Arc::clone(renewals));
            }
        }
        let renewals = Arc::new(self.generate(filter).await?);
        *generated = Some((filter.clone(), Arc::clone(&renewals)));
        Ok(renewals)
    }

    /// Every renewal for the filter's customer up to `now`, newest first.
    pub async fn generate(&self, filter: &TransactionFilter) -> PaymentsResult<Vec<Transaction>> {
        let ctx = &self.ctx;
        let customer_only = TransactionFilter {
            transaction_type: None,
            ..filter.clone()
        };
        let page_size = ctx.page_size;

        let start_source = SubscriptionStartSource::new(ctx.clone());
        let purchase_source = OneTimePurchaseSource::new(ctx.clone());
        let end_source = SubscriptionEndSource::new(ctx.clone());
        let refund_source = purchase_refund_source(ctx);
        let snapshot_source = DefaultProductsChangeSource::new(ctx.clone());

        let (mut grants, purchases, mut revocations, refunds, snapshots) = tokio::try_join!(
            drain(&start_source, &customer_only, page_size),
            drain(&purchase_source, &customer_only, page_size),
            drain(&end_source, &customer_only, page_size),
            drain(&refund_source, &customer_only, page_size),
            drain(&snapshot_source, &customer_only, page_size),
        )?;
        grants.extend(purchases);
        revocations.extend(refunds);

        let product_line_ids: BTreeSet<String> = ctx
            .tenancy
            .config
            .payments
            .product_lines
            .keys()
            .cloned()
            .collect();
        let customer = match (filter.customer_type, &filter.customer_id) {
            (Some(customer_type), Some(customer_id)) => {
                Some(Customer::new(customer_type, customer_id.clone()))
            }
            _ => None,
        };

        let mut renewals = generate_item_grant_renewals(RenewalInput {
            grants: &grants,
            revocations: &revocations,
            default_snapshots: &snapshots,
            product_line_ids: &product_line_ids,
            customer: customer.as_ref(),
            now: ctx.now,
        })?;
        renewals.sort_by(|a, b| {
            (b.effective_at_millis, b.id.as_str()).cmp(&(a.effective_at_millis, a.id.as_str()))
        });

        debug!(
            tenancy_id = %ctx.tenancy_id(),
            customer_id = ?filter.customer_id,
            count = renewals.len(),
            "Generated item grant renewals"
        );
        Ok(renewals)
    }
}

impl TransactionSource for ItemGrantRenewalSource {
    fn kind(&self) -> Option<TransactionType> {
        Some(TransactionType::ItemGrantRenewal)
    }

    fn next_page<'a>(&'a self, query: &'a PageQuery) -> BoxFuture<'a, PaymentsResult<Page>> {
        Box::pin(async move {
            let limit = query.limit.max(1);
            let renewals = self.renewals(&query.filter).await?;

            let start = match query.after() {
                Some(after) => {
                    let (millis, id) = parse_cursor(after)?;
                    renewals
                        .iter()
                        .position(|t| (t.effective_at_millis, t.id.as_str()) < (millis, id))
                        .unwrap_or(renewals.len())
                }
                None => 0,
            };
            let total = renewals.len();
            let end = (start + limit).min(total);

            let mut cursor = query.after().unwrap_or_default().to_string();
            let mut items = Vec::with_capacity(end - start);
            for transaction in renewals[start..end].iter().cloned() {
                let next_cursor = renewal_cursor(&transaction);
                let prev_cursor = std::mem::replace(&mut cursor, next_cursor.clone());
                items.push(PageItem {
                    transaction,
                    prev_cursor,
                    next_cursor,
                });
            }

            Ok(Page {
                items,
                is_first: query.after().is_none(),
                is_last: end == total,
                cursor,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use crate::repository::one_time_purchase::NewOneTimePurchase;
    use tally_core::{
        CustomerType, IncludedItem, IntervalUnit, ItemExpiry, PaymentsConfig, Price, Prices,
        Product, PurchaseCreationSource, RepeatInterval, Tenancy, TenancyConfig,
    };

    const T0: i64 = 1_735_689_600_000;
    const WEEK: i64 = 7 * 86_400_000;

    fn pack() -> Product {
        let mut product = Product::new(CustomerType::Custom);
        product.stackable = true;
        product.prices = Prices::Priced(indexmap::IndexMap::from([(
            "once".to_string(),
            Price::from_amounts([("USD", "5")]),
        )]));
        product.included_items.insert(
            "credits".into(),
            IncludedItem {
                quantity: 10,
                repeat: Some(RepeatInterval::new(1, IntervalUnit::Week)),
                expires: ItemExpiry::Never,
            },
        );
        product
    }

    async fn buy(db: &Database, at: i64) {
        db.one_time_purchases()
            .insert(
                "t1",
                &NewOneTimePurchase {
                    customer: Customer::new(CustomerType::Custom, "acme"),
                    product_id: Some("pack".into()),
                    price_id: Some("once".into()),
                    product: pack(),
                    quantity: 1,
                    creation_source: PurchaseCreationSource::PurchasePage,
                    created_at_millis: at,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pages_share_one_generation() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let mut payments = PaymentsConfig::default();
        payments.products.insert("pack".into(), pack());
        let ctx = SourceContext {
            db: db.clone(),
            tenancy: Arc::new(Tenancy {
                id: "t1".into(),
                project_id: "p1".into(),
                config: TenancyConfig { payments },
            }),
            now: T0 + 3 * WEEK,
            page_size: 50,
        };
        buy(&db, T0).await;

        let source = ItemGrantRenewalSource::new(ctx.clone());
        let filter = TransactionFilter::customer(CustomerType::Custom, "acme");
        let first = source
            .next_page(&PageQuery::first(1, filter.clone()))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 1);
        assert!(!first.is_last);

        // Rows written mid-drain are not seen by the same source.
        buy(&db, T0).await;
        let rest = source
            .next_page(&PageQuery {
                cursor: Some(first.cursor.clone()),
                limit: 10,
                filter: filter.clone(),
            })
            .await
            .unwrap();
        assert_eq!(rest.items.len(), 2);
        assert!(rest.is_last);

        let fresh = drain(&ItemGrantRenewalSource::new(ctx), &filter, 2)
            .await
            .unwrap();
        assert_eq!(fresh.len(), 6);
    }
}
