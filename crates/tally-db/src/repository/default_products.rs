//! # Default Products Snapshot Repository
//!
//! Append-only audit trail of the tenancy's include-by-default products.
//! A new row is written only when the configured set differs from the
//! latest stored one.

use sqlx::SqlitePool;
use tally_core::ProductSnapshot;
use tracing::{debug, info};
use uuid::Uuid;

use super::{fetch_page, CustomerFilter, CustomerScope, PageSpec};
use crate::error::{DbError, DbResult};

pub const SNAPSHOTS: PageSpec = PageSpec {
    table: "default_products_snapshots",
    time_column: "created_at_millis",
    condition: None,
    scope: CustomerScope::Tenancy,
};

/// A `default_products_snapshots` row.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct DefaultProductsSnapshotRow {
    pub tenancy_id: String,
    pub id: String,
    pub snapshot_json: String,
    pub created_at_millis: i64,
}

impl DefaultProductsSnapshotRow {
    pub fn snapshot(&self) -> DbResult<ProductSnapshot> {
        serde_json::from_str(&self.snapshot_json)
            .map_err(|e| DbError::malformed("default products snapshot_json", e))
    }
}

#[derive(Debug, Clone)]
pub struct DefaultProductsRepository {
    pool: SqlitePool,
}

impl DefaultProductsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DefaultProductsRepository { pool }
    }

    /// The most recent snapshot row, if any.
    pub async fn latest(&self, tenancy_id: &str) -> DbResult<Option<DefaultProductsSnapshotRow>> {
        let row = sqlx::query_as::<_, DefaultProductsSnapshotRow>(
            r#"
            SELECT * FROM default_products_snapshots
            WHERE tenancy_id = ?
            ORDER BY created_at_millis DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(tenancy_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn insert(
        &self,
        tenancy_id: &str,
        snapshot: &ProductSnapshot,
        created_at_millis: i64,
    ) -> DbResult<DefaultProductsSnapshotRow> {
        let row = DefaultProductsSnapshotRow {
            tenancy_id: tenancy_id.to_string(),
            id: Uuid::new_v4().to_string(),
            snapshot_json: serde_json::to_string(snapshot)?,
            created_at_millis,
        };

        info!(
            tenancy_id = %tenancy_id,
            snapshot_id = %row.id,
            products = snapshot.len(),
            "Appending default products snapshot"
        );

        sqlx::query(
            r#"
            INSERT INTO default_products_snapshots (tenancy_id, id, snapshot_json, created_at_millis)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&row.tenancy_id)
        .bind(&row.id)
        .bind(&row.snapshot_json)
        .bind(row.created_at_millis)
        .execute(&self.pool)
        .await?;

        Ok(row)
    }

    /// Every snapshot row of the tenancy, oldest first.
    pub async fn all(&self, tenancy_id: &str) -> DbResult<Vec<DefaultProductsSnapshotRow>> {
        let rows = sqlx::query_as::<_, DefaultProductsSnapshotRow>(
            r#"
            SELECT * FROM default_products_snapshots
            WHERE tenancy_id = ?
            ORDER BY created_at_millis ASC, id ASC
            "#,
        )
        .bind(tenancy_id)
        .fetch_all(&self.pool)
        .await?;
        debug!(tenancy_id = %tenancy_id, count = rows.len(), "Loaded default products snapshots");
        Ok(rows)
    }

    pub async fn page(
        &self,
        tenancy_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> DbResult<Vec<DefaultProductsSnapshotRow>> {
        fetch_page(
            &self.pool,
            &SNAPSHOTS,
            tenancy_id,
            &CustomerFilter::default(),
            after,
            limit,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tally_core::{CustomerType, Product};

    #[tokio::test]
    async fn test_latest_snapshot() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.default_products();
        assert!(repo.latest("t1").await.unwrap().is_none());

        let mut snapshot = ProductSnapshot::new();
        repo.insert("t1", &snapshot, 10).await.unwrap();
        snapshot.insert("free".into(), Product::new(CustomerType::User));
        let second = repo.insert("t1", &snapshot, 20).await.unwrap();

        let latest = repo.latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.snapshot().unwrap(), snapshot);
        assert_eq!(repo.all("t1").await.unwrap().len(), 2);
        assert!(repo.latest("t2").await.unwrap().is_none());
    }
}
