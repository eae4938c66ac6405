//! # Subscription Invoice Repository
//!
//! One row per provider invoice. The invoice that created the subscription
//! is flagged and never projected; its charge is on subscription-start.

use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use super::{fetch_page, CustomerFilter, CustomerScope, PageSpec};
use crate::error::DbResult;

/// Renewal invoices by creation time.
pub const RENEWALS: PageSpec = PageSpec {
    table: "subscription_invoices",
    time_column: "created_at_millis",
    condition: Some("is_subscription_creation_invoice = 0"),
    scope: CustomerScope::ViaSubscription,
};

/// A `subscription_invoices` row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct InvoiceRow {
    pub tenancy_id: String,
    pub id: String,
    pub subscription_id: String,
    pub stripe_invoice_id: String,
    pub is_subscription_creation_invoice: bool,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone)]
pub struct InvoiceRepository {
    pool: SqlitePool,
}

impl InvoiceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InvoiceRepository { pool }
    }

    /// Records an invoice against an existing subscription.
    ///
    /// ## Errors
    /// `DbError::ForeignKeyViolation` when the subscription does not exist.
    pub async fn insert(
        &self,
        tenancy_id: &str,
        subscription_id: &str,
        stripe_invoice_id: &str,
        is_subscription_creation_invoice: bool,
        created_at_millis: i64,
    ) -> DbResult<InvoiceRow> {
        let row = InvoiceRow {
            tenancy_id: tenancy_id.to_string(),
            id: Uuid::new_v4().to_string(),
            subscription_id: subscription_id.to_string(),
            stripe_invoice_id: stripe_invoice_id.to_string(),
            is_subscription_creation_invoice,
            created_at_millis,
        };

        debug!(
            tenancy_id = %tenancy_id,
            subscription_id = %subscription_id,
            invoice_id = %row.id,
            "Recording subscription invoice"
        );

        sqlx::query(
            r#"
            INSERT INTO subscription_invoices (
                tenancy_id, id, subscription_id, stripe_invoice_id,
                is_subscription_creation_invoice, created_at_millis
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.tenancy_id)
        .bind(&row.id)
        .bind(&row.subscription_id)
        .bind(&row.stripe_invoice_id)
        .bind(row.is_subscription_creation_invoice)
        .bind(row.created_at_millis)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    /// One page of renewal invoices; the customer filter applies through the
    /// owning subscription.
    pub async fn page_renewals(
        &self,
        tenancy_id: &str,
        filter: &CustomerFilter,
        after: Option<&str>,
        limit: usize,
    ) -> DbResult<Vec<InvoiceRow>> {
        fetch_page(&self.pool, &RENEWALS, tenancy_id, filter, after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::pool::{Database, DbConfig};
    use crate::repository::subscription::NewSubscription;
    use tally_core::{Customer, CustomerType, Product, PurchaseCreationSource, SubscriptionStatus};

    #[tokio::test]
    async fn test_renewal_pages_skip_creation_invoice() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let sub = db
            .subscriptions()
            .insert(
                "t1",
                &NewSubscription {
                    customer: Customer::new(CustomerType::Custom, "c1"),
                    product_id: Some("pro".into()),
                    price_id: None,
                    product: Product::new(CustomerType::Custom),
                    quantity: 1,
                    status: SubscriptionStatus::Active,
                    stripe_subscription_id: Some("sub_123".into()),
                    current_period_start_millis: 0,
                    current_period_end_millis: None,
                    billing_cycle_anchor_millis: None,
                    creation_source: PurchaseCreationSource::PurchasePage,
                    created_at_millis: 0,
                },
            )
            .await
            .unwrap();

        let repo = db.invoices();
        repo.insert("t1", &sub.id, "in_0", true, 0).await.unwrap();
        repo.insert("t1", &sub.id, "in_1", false, 100).await.unwrap();

        let mine = repo
            .page_renewals("t1", &CustomerFilter::customer(CustomerType::Custom, "c1"), None, 10)
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].stripe_invoice_id, "in_1");

        let theirs = repo
            .page_renewals("t1", &CustomerFilter::customer(CustomerType::Custom, "c2"), None, 10)
            .await
            .unwrap();
        assert!(theirs.is_empty());
    }

    #[tokio::test]
    async fn test_invoice_requires_subscription() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let err = db
            .invoices()
            .insert("t1", "missing", "in_1", false, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::ForeignKeyViolation { .. }));
    }
}
