//! # Customer Repository
//!
//! Existence checks for users and teams. The ledger never creates
//! customers during a read; `insert_*` exist for provisioning and tests.

use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

#[derive(Debug, Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CustomerRepository { pool }
    }

    pub async fn user_exists(&self, tenancy_id: &str, user_id: &str) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM project_users WHERE tenancy_id = ? AND id = ?",
        )
        .bind(tenancy_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn team_exists(&self, tenancy_id: &str, team_id: &str) -> DbResult<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM teams WHERE tenancy_id = ? AND id = ?")
                .bind(tenancy_id)
                .bind(team_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    pub async fn insert_user(&self, tenancy_id: &str, user_id: &str, created_at_millis: i64) -> DbResult<()> {
        debug!(tenancy_id = %tenancy_id, user_id = %user_id, "Inserting project user");
        sqlx::query("INSERT INTO project_users (tenancy_id, id, created_at_millis) VALUES (?, ?, ?)")
            .bind(tenancy_id)
            .bind(user_id)
            .bind(created_at_millis)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn insert_team(&self, tenancy_id: &str, team_id: &str, created_at_millis: i64) -> DbResult<()> {
        debug!(tenancy_id = %tenancy_id, team_id = %team_id, "Inserting team");
        sqlx::query("INSERT INTO teams (tenancy_id, id, created_at_millis) VALUES (?, ?, ?)")
            .bind(tenancy_id)
            .bind(team_id)
            .bind(created_at_millis)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::pool::{Database, DbConfig};

    #[tokio::test]
    async fn test_user_and_team_existence() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let repo = db.customers();

        assert!(!repo.user_exists("t1", "u1").await.unwrap());
        repo.insert_user("t1", "u1", 0).await.unwrap();
        assert!(repo.user_exists("t1", "u1").await.unwrap());
        assert!(!repo.user_exists("t2", "u1").await.unwrap());
        assert!(!repo.team_exists("t1", "u1").await.unwrap());

        let err = repo.insert_user("t1", "u1", 0).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
    }
}
