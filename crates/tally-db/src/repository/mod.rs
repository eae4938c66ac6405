//! # Repository Module
//!
//! Row access for the payments tables.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Transaction source / resolver                                          │
//! │       │                                                                 │
//! │       │  db.subscriptions().page(...)                                  │
//! │       ▼                                                                 │
//! │  SubscriptionRepository                                                 │
//! │  ├── insert / get / update                                              │
//! │  └── page(spec, filter, after, limit)  ── keyset pagination            │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite                                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Keyset Pagination
//! Every page is ordered `(time DESC, id DESC)`. The cursor is the id of the
//! last row returned; the next page continues with
//! `time < pivot OR (time = pivot AND id < cursor)` where `pivot` is the
//! cursor row's own time. Ties on time therefore never skip or repeat rows.
//!
//! ## Available Repositories
//!
//! - [`subscription::SubscriptionRepository`]
//! - [`one_time_purchase::OneTimePurchaseRepository`]
//! - [`item_quantity_change::ItemQuantityChangeRepository`]
//! - [`invoice::InvoiceRepository`]
//! - [`default_products::DefaultProductsRepository`]
//! - [`customer::CustomerRepository`]

pub mod customer;
pub mod default_products;
pub mod invoice;
pub mod item_quantity_change;
pub mod one_time_purchase;
pub mod subscription;

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tally_core::CustomerType;
use tracing::debug;

use crate::error::DbResult;

/// Restricts rows to one customer (or one customer type).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerFilter {
    pub customer_type: Option<CustomerType>,
    pub customer_id: Option<String>,
}

impl CustomerFilter {
    pub fn customer(customer_type: CustomerType, customer_id: impl Into<String>) -> Self {
        CustomerFilter {
            customer_type: Some(customer_type),
            customer_id: Some(customer_id.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.customer_type.is_none() && self.customer_id.is_none()
    }
}

/// How a table's rows are tied to a customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerScope {
    /// The table has `customer_type` / `customer_id` columns.
    Columns,
    /// The table has `subscription_id`; the customer lives on the subscription.
    ViaSubscription,
    /// Tenancy-wide rows.
    Tenancy,
}

/// Which rows of a table a source pages over, and by which instant.
#[derive(Debug, Clone, Copy)]
pub struct PageSpec {
    pub table: &'static str,
    pub time_column: &'static str,
    /// Extra SQL predicate, e.g. `ended_at_millis IS NOT NULL`.
    pub condition: Option<&'static str>,
    pub scope: CustomerScope,
}

fn push_customer_columns(qb: &mut QueryBuilder<'_, Sqlite>, filter: &CustomerFilter) {
    if let Some(customer_type) = filter.customer_type {
        qb.push(" AND customer_type = ").push_bind(customer_type);
    }
    if let Some(customer_id) = &filter.customer_id {
        qb.push(" AND customer_id = ").push_bind(customer_id.clone());
    }
}

fn push_pivot(qb: &mut QueryBuilder<'_, Sqlite>, spec: &PageSpec, tenancy_id: &str, after: &str) {
    qb.push("(SELECT ")
        .push(spec.time_column)
        .push(" FROM ")
        .push(spec.table)
        .push(" WHERE tenancy_id = ")
        .push_bind(tenancy_id.to_string())
        .push(" AND id = ")
        .push_bind(after.to_string())
        .push(")");
}

/// Fetches one page of rows, newest first.
///
/// `after` is the id of the last row of the previous page.
pub async fn fetch_page<R>(
    pool: &SqlitePool,
    spec: &PageSpec,
    tenancy_id: &str,
    filter: &CustomerFilter,
    after: Option<&str>,
    limit: usize,
) -> DbResult<Vec<R>>
where
    R: for<'r> sqlx::FromRow<'r, SqliteRow> + Send + Unpin,
{
    let mut qb: QueryBuilder<'_, Sqlite> = QueryBuilder::new("SELECT * FROM ");
    qb.push(spec.table)
        .push(" WHERE tenancy_id = ")
        .push_bind(tenancy_id.to_string());

    if let Some(condition) = spec.condition {
        qb.push(" AND ").push(condition);
    }

    match spec.scope {
        CustomerScope::Columns => push_customer_columns(&mut qb, filter),
        CustomerScope::ViaSubscription if !filter.is_empty() => {
            qb.push(" AND subscription_id IN (SELECT id FROM subscriptions WHERE tenancy_id = ")
                .push_bind(tenancy_id.to_string());
            push_customer_columns(&mut qb, filter);
            qb.push(")");
        }
        CustomerScope::ViaSubscription | CustomerScope::Tenancy => {}
    }

    if let Some(after) = after {
        qb.push(" AND (").push(spec.time_column).push(" < ");
        push_pivot(&mut qb, spec, tenancy_id, after);
        qb.push(" OR (").push(spec.time_column).push(" = ");
        push_pivot(&mut qb, spec, tenancy_id, after);
        qb.push(" AND id < ").push_bind(after.to_string()).push("))");
    }

    qb.push(" ORDER BY ")
        .push(spec.time_column)
        .push(" DESC, id DESC LIMIT ")
        .push_bind(limit as i64);

    let rows = qb.build_query_as::<R>().fetch_all(pool).await?;
    debug!(table = spec.table, count = rows.len(), "Fetched page");
    Ok(rows)
}
