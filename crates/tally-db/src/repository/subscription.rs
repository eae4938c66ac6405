//! # Subscription Repository
//!
//! Database operations for subscription rows.
//!
//! ## Key Operations
//! - Insert on grant / provider webhook
//! - Lifecycle updates: cancel-at-period-end, end, refund
//! - Keyset pages for the start, end, cancel and refund sources
//!
//! ## Lifecycle Columns
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  created_at ──► subscription-start                                     │
//! │  cancel_at_period_end = 1 (ended_at NULL) ──► subscription-cancel      │
//! │  ended_at   ──► subscription-end                                       │
//! │  refunded_at ─► purchase-refund                                        │
//! │                                                                         │
//! │  Rows are mutable; the ledger re-derives transactions on every read.  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use sqlx::SqlitePool;
use tally_core::projection::{PurchaseKind, PurchaseRecord};
use tally_core::{Customer, CustomerType, Product, PurchaseCreationSource, SubscriptionStatus};
use tracing::debug;
use uuid::Uuid;

use super::{fetch_page, CustomerFilter, CustomerScope, PageSpec};
use crate::error::{DbError, DbResult};

/// Subscriptions by creation time.
pub const STARTED: PageSpec = PageSpec {
    table: "subscriptions",
    time_column: "created_at_millis",
    condition: None,
    scope: CustomerScope::Columns,
};

/// Ended subscriptions by end time.
pub const ENDED: PageSpec = PageSpec {
    table: "subscriptions",
    time_column: "ended_at_millis",
    condition: Some("ended_at_millis IS NOT NULL"),
    scope: CustomerScope::Columns,
};

/// Subscriptions set to cancel at period end that have not ended yet.
pub const CANCEL_PENDING: PageSpec = PageSpec {
    table: "subscriptions",
    time_column: "updated_at_millis",
    condition: Some("cancel_at_period_end = 1 AND ended_at_millis IS NULL"),
    scope: CustomerScope::Columns,
};

/// Refunded subscriptions by refund time.
pub const REFUNDED: PageSpec = PageSpec {
    table: "subscriptions",
    time_column: "refunded_at_millis",
    condition: Some("refunded_at_millis IS NOT NULL"),
    scope: CustomerScope::Columns,
};

/// A `subscriptions` row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub tenancy_id: String,
    pub id: String,
    pub customer_type: CustomerType,
    pub customer_id: String,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub product_json: String,
    pub quantity: i64,
    pub status: SubscriptionStatus,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start_millis: i64,
    pub current_period_end_millis: Option<i64>,
    pub cancel_at_period_end: bool,
    pub ended_at_millis: Option<i64>,
    pub refunded_at_millis: Option<i64>,
    pub billing_cycle_anchor_millis: Option<i64>,
    pub creation_source: PurchaseCreationSource,
    pub created_at_millis: i64,
    pub updated_at_millis: i64,
}

impl SubscriptionRow {
    pub fn customer(&self) -> Customer {
        Customer::new(self.customer_type, self.customer_id.clone())
    }

    /// Decodes the product snapshot taken at purchase time.
    pub fn product(&self) -> DbResult<Product> {
        serde_json::from_str(&self.product_json)
            .map_err(|e| DbError::malformed("subscription product_json", e))
    }

    /// Storage-independent view used by the projections.
    pub fn to_purchase_record(&self) -> DbResult<PurchaseRecord> {
        Ok(PurchaseRecord {
            id: self.id.clone(),
            kind: PurchaseKind::Subscription,
            customer: self.customer(),
            product_id: self.product_id.clone(),
            price_id: self.price_id.clone(),
            product: self.product()?,
            quantity: self.quantity,
            creation_source: self.creation_source,
            created_at_millis: self.created_at_millis,
            cycle_anchor_millis: self
                .billing_cycle_anchor_millis
                .unwrap_or(self.created_at_millis),
            ended_at_millis: self.ended_at_millis,
            refunded_at_millis: self.refunded_at_millis,
        })
    }
}

/// Fields of a subscription about to be created.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub customer: Customer,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub product: Product,
    pub quantity: i64,
    pub status: SubscriptionStatus,
    pub stripe_subscription_id: Option<String>,
    pub current_period_start_millis: i64,
    pub current_period_end_millis: Option<i64>,
    pub billing_cycle_anchor_millis: Option<i64>,
    pub creation_source: PurchaseCreationSource,
    pub created_at_millis: i64,
}

/// Repository for subscription rows.
///
/// ## Usage
/// ```rust,ignore
/// let repo = db.subscriptions();
/// let row = repo.insert(tenancy_id, &new_subscription).await?;
/// repo.set_ended(tenancy_id, &row.id, now).await?;
/// ```
#[derive(Debug, Clone)]
pub struct SubscriptionRepository {
    pool: SqlitePool,
}

impl SubscriptionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SubscriptionRepository { pool }
    }

    /// Inserts a subscription with a fresh UUID.
    pub async fn insert(&self, tenancy_id: &str, new: &NewSubscription) -> DbResult<SubscriptionRow> {
        let id = Uuid::new_v4().to_string();
        let product_json = serde_json::to_string(&new.product)?;

        debug!(
            tenancy_id = %tenancy_id,
            subscription_id = %id,
            customer_id = %new.customer.customer_id,
            "Inserting subscription"
        );

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                tenancy_id, id, customer_type, customer_id, product_id, price_id,
                product_json, quantity, status, stripe_subscription_id,
                current_period_start_millis, current_period_end_millis,
                cancel_at_period_end, ended_at_millis, refunded_at_millis,
                billing_cycle_anchor_millis, creation_source,
                created_at_millis, updated_at_millis
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, NULL, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(tenancy_id)
        .bind(&id)
        .bind(new.customer.customer_type)
        .bind(&new.customer.customer_id)
        .bind(&new.product_id)
        .bind(&new.price_id)
        .bind(&product_json)
        .bind(new.quantity)
        .bind(new.status)
        .bind(&new.stripe_subscription_id)
        .bind(new.current_period_start_millis)
        .bind(new.current_period_end_millis)
        .bind(new.billing_cycle_anchor_millis)
        .bind(new.creation_source)
        .bind(new.created_at_millis)
        .bind(new.created_at_millis)
        .execute(&self.pool)
        .await?;

        self.get(tenancy_id, &id)
            .await?
            .ok_or_else(|| DbError::not_found("Subscription", &id))
    }

    pub async fn get(&self, tenancy_id: &str, id: &str) -> DbResult<Option<SubscriptionRow>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM subscriptions WHERE tenancy_id = ? AND id = ?",
        )
        .bind(tenancy_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Fetches several rows at once; missing ids are skipped.
    pub async fn get_many(&self, tenancy_id: &str, ids: &[String]) -> DbResult<Vec<SubscriptionRow>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(
            "SELECT * FROM subscriptions WHERE tenancy_id = ",
        );
        qb.push_bind(tenancy_id.to_string()).push(" AND id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");

        let rows = qb
            .build_query_as::<SubscriptionRow>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Ends a subscription locally, for rows with no provider-side subscription.
    ///
    /// Sets status `canceled`, closes the current period, and records the end.
    pub async fn end_now(&self, tenancy_id: &str, id: &str, now_millis: i64) -> DbResult<()> {
        debug!(tenancy_id = %tenancy_id, subscription_id = %id, "Ending subscription locally");

        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET
                status = ?,
                current_period_end_millis = ?,
                cancel_at_period_end = 1,
                ended_at_millis = ?,
                updated_at_millis = ?
            WHERE tenancy_id = ? AND id = ?
            "#,
        )
        .bind(SubscriptionStatus::Canceled)
        .bind(now_millis)
        .bind(now_millis)
        .bind(now_millis)
        .bind(tenancy_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Subscription", id));
        }
        Ok(())
    }

    /// Records the provider-reported end of a subscription.
    pub async fn set_ended(&self, tenancy_id: &str, id: &str, ended_at_millis: i64) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET status = ?, ended_at_millis = ?, updated_at_millis = ?
            WHERE tenancy_id = ? AND id = ?
            "#,
        )
        .bind(SubscriptionStatus::Canceled)
        .bind(ended_at_millis)
        .bind(ended_at_millis)
        .bind(tenancy_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Subscription", id));
        }
        Ok(())
    }

    pub async fn set_refunded(&self, tenancy_id: &str, id: &str, refunded_at_millis: i64) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET refunded_at_millis = ?, updated_at_millis = ?
            WHERE tenancy_id = ? AND id = ?
            "#,
        )
        .bind(refunded_at_millis)
        .bind(refunded_at_millis)
        .bind(tenancy_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Subscription", id));
        }
        Ok(())
    }

    /// Flags (or unflags) a subscription to cancel at the end of its period.
    pub async fn set_cancel_at_period_end(
        &self,
        tenancy_id: &str,
        id: &str,
        cancel: bool,
        at_millis: i64,
    ) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions SET cancel_at_period_end = ?, updated_at_millis = ?
            WHERE tenancy_id = ? AND id = ?
            "#,
        )
        .bind(cancel)
        .bind(at_millis)
        .bind(tenancy_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("Subscription", id));
        }
        Ok(())
    }

    /// One keyset page over `spec`, newest first.
    pub async fn page(
        &self,
        spec: &PageSpec,
        tenancy_id: &str,
        filter: &CustomerFilter,
        after: Option<&str>,
        limit: usize,
    ) -> DbResult<Vec<SubscriptionRow>> {
        fetch_page(&self.pool, spec, tenancy_id, filter, after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    const T0: i64 = 1_735_689_600_000;

    fn new_subscription(customer_id: &str, created_at: i64) -> NewSubscription {
        NewSubscription {
            customer: Customer::new(CustomerType::Custom, customer_id),
            product_id: Some("pro".into()),
            price_id: None,
            product: Product::new(CustomerType::Custom),
            quantity: 1,
            status: SubscriptionStatus::Active,
            stripe_subscription_id: None,
            current_period_start_millis: created_at,
            current_period_end_millis: None,
            billing_cycle_anchor_millis: None,
            creation_source: PurchaseCreationSource::ApiGrant,
            created_at_millis: created_at,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.subscriptions();

        let row = repo.insert("t1", &new_subscription("c1", T0)).await.unwrap();
        assert_eq!(row.customer_type, CustomerType::Custom);
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert!(!row.cancel_at_period_end);

        let record = row.to_purchase_record().unwrap();
        assert_eq!(record.cycle_anchor_millis, T0);
        assert_eq!(record.kind, PurchaseKind::Subscription);

        assert!(repo.get("other-tenancy", &row.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_now() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.subscriptions();
        let row = repo.insert("t1", &new_subscription("c1", T0)).await.unwrap();

        repo.end_now("t1", &row.id, T0 + 5).await.unwrap();
        let row = repo.get("t1", &row.id).await.unwrap().unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert_eq!(row.ended_at_millis, Some(T0 + 5));
        assert_eq!(row.current_period_end_millis, Some(T0 + 5));
        assert!(row.cancel_at_period_end);

        assert!(matches!(
            repo.end_now("t1", "missing", T0).await,
            Err(DbError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_keyset_pages_with_tied_times() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.subscriptions();
        for _ in 0..5 {
            repo.insert("t1", &new_subscription("c1", T0)).await.unwrap();
        }
        repo.insert("t1", &new_subscription("c2", T0)).await.unwrap();

        let filter = CustomerFilter::customer(CustomerType::Custom, "c1");
        let mut seen = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = repo
                .page(&STARTED, "t1", &filter, after.as_deref(), 2)
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|row| row.id.clone());
            seen.extend(page.into_iter().map(|row| row.id));
        }

        assert_eq!(seen.len(), 5);
        let mut sorted = seen.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn test_ended_page_filters_rows() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.subscriptions();
        let a = repo.insert("t1", &new_subscription("c1", T0)).await.unwrap();
        repo.insert("t1", &new_subscription("c1", T0 + 1)).await.unwrap();
        repo.set_ended("t1", &a.id, T0 + 10).await.unwrap();

        let rows = repo
            .page(&ENDED, "t1", &CustomerFilter::default(), None, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, a.id);
    }
}
