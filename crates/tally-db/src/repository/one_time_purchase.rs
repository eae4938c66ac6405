//! # One-Time Purchase Repository
//!
//! Database operations for one-time purchase rows. A one-time purchase has
//! no end; only a refund takes it back.

use sqlx::SqlitePool;
use tally_core::projection::{PurchaseKind, PurchaseRecord};
use tally_core::{Customer, CustomerType, Product, PurchaseCreationSource};
use tracing::debug;
use uuid::Uuid;

use super::{fetch_page, CustomerFilter, CustomerScope, PageSpec};
use crate::error::{DbError, DbResult};

/// Purchases by creation time.
pub const PURCHASED: PageSpec = PageSpec {
    table: "one_time_purchases",
    time_column: "created_at_millis",
    condition: None,
    scope: CustomerScope::Columns,
};

/// Refunded purchases by refund time.
pub const REFUNDED: PageSpec = PageSpec {
    table: "one_time_purchases",
    time_column: "refunded_at_millis",
    condition: Some("refunded_at_millis IS NOT NULL"),
    scope: CustomerScope::Columns,
};

/// A `one_time_purchases` row.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OneTimePurchaseRow {
    pub tenancy_id: String,
    pub id: String,
    pub customer_type: CustomerType,
    pub customer_id: String,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub product_json: String,
    pub quantity: i64,
    pub refunded_at_millis: Option<i64>,
    pub creation_source: PurchaseCreationSource,
    pub created_at_millis: i64,
}

impl OneTimePurchaseRow {
    pub fn product(&self) -> DbResult<Product> {
        serde_json::from_str(&self.product_json)
            .map_err(|e| DbError::malformed("one-time purchase product_json", e))
    }

    pub fn to_purchase_record(&self) -> DbResult<PurchaseRecord> {
        Ok(PurchaseRecord {
            id: self.id.clone(),
            kind: PurchaseKind::OneTime,
            customer: Customer::new(self.customer_type, self.customer_id.clone()),
            product_id: self.product_id.clone(),
            price_id: self.price_id.clone(),
            product: self.product()?,
            quantity: self.quantity,
            creation_source: self.creation_source,
            created_at_millis: self.created_at_millis,
            cycle_anchor_millis: self.created_at_millis,
            ended_at_millis: None,
            refunded_at_millis: self.refunded_at_millis,
        })
    }
}

/// Fields of a one-time purchase about to be created.
#[derive(Debug, Clone)]
pub struct NewOneTimePurchase {
    pub customer: Customer,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub product: Product,
    pub quantity: i64,
    pub creation_source: PurchaseCreationSource,
    pub created_at_millis: i64,
}

#[derive(Debug, Clone)]
pub struct OneTimePurchaseRepository {
    pool: SqlitePool,
}

impl OneTimePurchaseRepository {
    pub fn new(pool: SqlitePool) -> Self {
        OneTimePurchaseRepository { pool }
    }

    pub async fn insert(
        &self,
        tenancy_id: &str,
        new: &NewOneTimePurchase,
    ) -> DbResult<OneTimePurchaseRow> {
        let row = OneTimePurchaseRow {
            tenancy_id: tenancy_id.to_string(),
            id: Uuid::new_v4().to_string(),
            customer_type: new.customer.customer_type,
            customer_id: new.customer.customer_id.clone(),
            product_id: new.product_id.clone(),
            price_id: new.price_id.clone(),
            product_json: serde_json::to_string(&new.product)?,
            quantity: new.quantity,
            refunded_at_millis: None,
            creation_source: new.creation_source,
            created_at_millis: new.created_at_millis,
        };

        debug!(
            tenancy_id = %tenancy_id,
            purchase_id = %row.id,
            customer_id = %row.customer_id,
            quantity = row.quantity,
            "Inserting one-time purchase"
        );

        sqlx::query(
            r#"
            INSERT INTO one_time_purchases (
                tenancy_id, id, customer_type, customer_id, product_id, price_id,
                product_json, quantity, refunded_at_millis, creation_source, created_at_millis
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&row.tenancy_id)
        .bind(&row.id)
        .bind(row.customer_type)
        .bind(&row.customer_id)
        .bind(&row.product_id)
        .bind(&row.price_id)
        .bind(&row.product_json)
        .bind(row.quantity)
        .bind(row.creation_source)
        .bind(row.created_at_millis)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn get(&self, tenancy_id: &str, id: &str) -> DbResult<Option<OneTimePurchaseRow>> {
        let row = sqlx::query_as::<_, OneTimePurchaseRow>(
            "SELECT * FROM one_time_purchases WHERE tenancy_id = ? AND id = ?",
        )
        .bind(tenancy_id)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn set_refunded(&self, tenancy_id: &str, id: &str, refunded_at_millis: i64) -> DbResult<()> {
        debug!(tenancy_id = %tenancy_id, purchase_id = %id, "Refunding one-time purchase");

        let result = sqlx::query(
            "UPDATE one_time_purchases SET refunded_at_millis = ? WHERE tenancy_id = ? AND id = ?",
        )
        .bind(refunded_at_millis)
        .bind(tenancy_id)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("OneTimePurchase", id));
        }
        Ok(())
    }

    pub async fn page(
        &self,
        spec: &PageSpec,
        tenancy_id: &str,
        filter: &CustomerFilter,
        after: Option<&str>,
        limit: usize,
    ) -> DbResult<Vec<OneTimePurchaseRow>> {
        fetch_page(&self.pool, spec, tenancy_id, filter, after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_insert_and_refund() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.one_time_purchases();

        let row = repo
            .insert(
                "t1",
                &NewOneTimePurchase {
                    customer: Customer::new(CustomerType::Custom, "c1"),
                    product_id: Some("credits".into()),
                    price_id: None,
                    product: Product::new(CustomerType::Custom),
                    quantity: 2,
                    creation_source: PurchaseCreationSource::TestMode,
                    created_at_millis: 1_000,
                },
            )
            .await
            .unwrap();

        let refunded = repo
            .page(&REFUNDED, "t1", &CustomerFilter::default(), None, 10)
            .await
            .unwrap();
        assert!(refunded.is_empty());

        repo.set_refunded("t1", &row.id, 2_000).await.unwrap();
        let stored = repo.get("t1", &row.id).await.unwrap().unwrap();
        assert_eq!(stored.refunded_at_millis, Some(2_000));

        let record = stored.to_purchase_record().unwrap();
        assert!(record.test_mode());
        assert_eq!(record.quantity, 2);
    }

    #[tokio::test]
    async fn test_malformed_product_json() {
        let row = OneTimePurchaseRow {
            tenancy_id: "t1".into(),
            id: "p1".into(),
            customer_type: CustomerType::User,
            customer_id: "u1".into(),
            product_id: None,
            price_id: None,
            product_json: "{not json".into(),
            quantity: 1,
            refunded_at_millis: None,
            creation_source: PurchaseCreationSource::PurchasePage,
            created_at_millis: 0,
        };
        assert!(matches!(row.product(), Err(DbError::Malformed { .. })));
    }
}
