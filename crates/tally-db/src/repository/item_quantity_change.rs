//! # Item Quantity Change Repository
//!
//! Manual, admin or API driven item deltas outside the product-grant path.

use sqlx::SqlitePool;
use tally_core::{Customer, CustomerType};
use tracing::debug;
use uuid::Uuid;

use super::{fetch_page, CustomerFilter, CustomerScope, PageSpec};
use crate::error::DbResult;

pub const CHANGES: PageSpec = PageSpec {
    table: "item_quantity_changes",
    time_column: "created_at_millis",
    condition: None,
    scope: CustomerScope::Columns,
};

/// An `item_quantity_changes` row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct ItemQuantityChangeRow {
    pub tenancy_id: String,
    pub id: String,
    pub customer_type: CustomerType,
    pub customer_id: String,
    pub item_id: String,
    pub quantity: i64,
    pub description: Option<String>,
    pub created_at_millis: i64,
}

impl ItemQuantityChangeRow {
    pub fn customer(&self) -> Customer {
        Customer::new(self.customer_type, self.customer_id.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ItemQuantityChangeRepository {
    pool: SqlitePool,
}

impl ItemQuantityChangeRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ItemQuantityChangeRepository { pool }
    }

    /// Records a signed quantity delta for one item.
    pub async fn insert(
        &self,
        tenancy_id: &str,
        customer: &Customer,
        item_id: &str,
        quantity: i64,
        description: Option<&str>,
        created_at_millis: i64,
    ) -> DbResult<ItemQuantityChangeRow> {
        let row = ItemQuantityChangeRow {
            tenancy_id: tenancy_id.to_string(),
            id: Uuid::new_v4().to_string(),
            customer_type: customer.customer_type,
            customer_id: customer.customer_id.clone(),
            item_id: item_id.to_string(),
            quantity,
            description: description.map(str::to_string),
            created_at_millis,
        };

        debug!(
            tenancy_id = %tenancy_id,
            customer_id = %row.customer_id,
            item_id = %item_id,
            quantity,
            "Recording item quantity change"
        );

        sqlx::query(
            r#"
            INSERT INTO item_quantity_changes (
                tenancy_id, id, customer_type, customer_id, item_id, quantity,
                description, created_at_millis
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.tenancy_id)
        .bind(&row.id)
        .bind(row.customer_type)
        .bind(&row.customer_id)
        .bind(&row.item_id)
        .bind(row.quantity)
        .bind(&row.description)
        .bind(row.created_at_millis)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    pub async fn page(
        &self,
        tenancy_id: &str,
        filter: &CustomerFilter,
        after: Option<&str>,
        limit: usize,
    ) -> DbResult<Vec<ItemQuantityChangeRow>> {
        fetch_page(&self.pool, &CHANGES, tenancy_id, filter, after, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_insert_and_page_by_customer() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.item_quantity_changes();
        let alice = Customer::new(CustomerType::Custom, "alice");
        let bob = Customer::new(CustomerType::Custom, "bob");

        repo.insert("t1", &alice, "credits", 25, Some("goodwill"), 10).await.unwrap();
        repo.insert("t1", &alice, "credits", -5, None, 20).await.unwrap();
        repo.insert("t1", &bob, "credits", 7, None, 30).await.unwrap();

        let rows = repo
            .page("t1", &CustomerFilter::customer(CustomerType::Custom, "alice"), None, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].quantity, -5);
        assert_eq!(rows[1].description.as_deref(), Some("goodwill"));
    }
}
