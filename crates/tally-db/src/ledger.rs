//! # Ledger Resolvers
//!
//! Answers the two read questions of the ledger for one customer, as of an
//! instant: which products are owned, and how many of an item are held.
//! Nothing is cached; every call replays the merged transaction history.
//!
//! ## Resolution Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  ensure default-products snapshot is current (append if changed)       │
//! │                              │                                          │
//! │                              ▼                                          │
//! │  drain merged feed for (customer_type, customer_id)                    │
//! │  keep effective_at_millis <= now                                       │
//! │                              │                                          │
//! │            ┌─────────────────┴─────────────────┐                        │
//! │            ▼                                   ▼                        │
//! │  owned products                      item quantity                      │
//! │  grants - revocations                changes (+) / expires (-)          │
//! │  + include-by-default                compute_ledger_balance_at_now     │
//! │    (line / id fallback)                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tally_core::ledger::{compute_ledger_balance_at_now, LedgerTransaction};
use tally_core::transaction::{GrantSource, SubscriptionChangeType};
use tally_core::validation::{validate_customer_id, validate_item_id};
use tally_core::{
    CoreError, CoreResult, CustomerType, EntryRef, OwnedProduct, OwnedProductKind,
    PaymentsConfig, SubscriptionDetails, Tenancy, Transaction, TransactionEntry,
    DEFAULT_PAGE_SIZE,
};
use tracing::debug;
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::{PaymentsError, PaymentsResult};
use crate::pool::Database;
use crate::repository::default_products::DefaultProductsSnapshotRow;
use crate::transactions::{
    drain_all, list_transactions, Page, PageQuery, SourceContext, TransactionFilter,
};

// =============================================================================
// Ledger
// =============================================================================

/// Read side of the ledger for one tenancy.
///
/// ## Usage
/// ```rust,ignore
/// let ledger = Ledger::new(db, tenancy);
/// let owned = ledger
///     .get_owned_products_for_customer(CustomerType::Custom, "acme", None)
///     .await?;
/// let seats = ledger
///     .get_item_quantity_for_customer(CustomerType::Custom, "acme", "seats", None)
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct Ledger {
    db: Database,
    tenancy: Arc<Tenancy>,
    page_size: usize,
}

impl Ledger {
    pub fn new(db: Database, tenancy: Tenancy) -> Self {
        Ledger {
            db,
            tenancy: Arc::new(tenancy),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn from_config(db: Database, config: &LedgerConfig) -> Self {
        Ledger::new(db, config.tenancy()).with_page_size(config.page_size())
    }

    /// Page size used when draining sources (clamped to at least 1).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn tenancy(&self) -> &Tenancy {
        &self.tenancy
    }

    pub fn payments(&self) -> &PaymentsConfig {
        &self.tenancy.config.payments
    }

    /// Source context bounded by `now`.
    pub fn context(&self, now: i64) -> SourceContext {
        SourceContext {
            db: self.db.clone(),
            tenancy: Arc::clone(&self.tenancy),
            now,
            page_size: self.page_size,
        }
    }

    // =========================================================================
    // Snapshot Freshness
    // =========================================================================

    /// Appends a default-products snapshot if the configured set differs
    /// from the latest stored one. Returns the current snapshot row.
    ///
    /// Racing callers may both append; the extra identical row is harmless.
    pub async fn ensure_default_products_snapshot_up_to_date(
        &self,
        at_millis: i64,
    ) -> PaymentsResult<DefaultProductsSnapshotRow> {
        let repo = self.db.default_products();
        let current = self.payments().default_products();

        if let Some(latest) = repo.latest(&self.tenancy.id).await? {
            if latest.snapshot()? == current {
                return Ok(latest);
            }
        }
        let row = repo.insert(&self.tenancy.id, &current, at_millis).await?;
        Ok(row)
    }

    // =========================================================================
    // Customers
    // =========================================================================

    /// Checks that the customer exists. Custom customers always do.
    ///
    /// ## Errors
    /// - `UserNotFound` when a user id is not a UUID or has no row
    /// - `TeamNotFound` when a team id is not a UUID or has no row
    pub async fn ensure_customer_exists(
        &self,
        customer_type: CustomerType,
        customer_id: &str,
    ) -> PaymentsResult<()> {
        validate_customer_id(customer_id)?;
        let customers = self.db.customers();
        let is_uuid = Uuid::parse_str(customer_id).is_ok();
        match customer_type {
            CustomerType::User => {
                if !is_uuid || !customers.user_exists(&self.tenancy.id, customer_id).await? {
                    return Err(PaymentsError::UserNotFound);
                }
            }
            CustomerType::Team => {
                if !is_uuid || !customers.team_exists(&self.tenancy.id, customer_id).await? {
                    return Err(PaymentsError::TeamNotFound {
                        team_id: customer_id.to_string(),
                    });
                }
            }
            CustomerType::Custom => {}
        }
        Ok(())
    }

    // =========================================================================
    // History
    // =========================================================================

    /// One page of the tenancy-wide transaction feed as of `now`.
    pub async fn list_transactions(&self, query: &PageQuery, now: i64) -> PaymentsResult<Page> {
        list_transactions(&self.context(now), query).await
    }

    /// The customer's full history, effective at or before `now`, oldest first.
    pub async fn customer_history(
        &self,
        customer_type: CustomerType,
        customer_id: &str,
        now: i64,
    ) -> PaymentsResult<Vec<Transaction>> {
        let filter = TransactionFilter::customer(customer_type, customer_id);
        let mut history: Vec<Transaction> = drain_all(&self.context(now), &filter)
            .await?
            .into_iter()
            .filter(|tx| tx.effective_at_millis <= now)
            .collect();
        history.sort_by(|a, b| {
            (a.effective_at_millis, a.id.as_str()).cmp(&(b.effective_at_millis, b.id.as_str()))
        });
        Ok(history)
    }

    /// Wall clock for the snapshot upsert; `now` bounds only the read.
    async fn prepare(
        &self,
        customer_type: CustomerType,
        customer_id: &str,
        now: Option<i64>,
    ) -> PaymentsResult<i64> {
        let wall_clock = Utc::now().timestamp_millis();
        self.ensure_customer_exists(customer_type, customer_id).await?;
        self.ensure_default_products_snapshot_up_to_date(wall_clock)
            .await?;
        Ok(now.unwrap_or(wall_clock))
    }

    // =========================================================================
    // Resolvers
    // =========================================================================

    /// Products the customer owns as of `now` (default: the call time).
    pub async fn get_owned_products_for_customer(
        &self,
        customer_type: CustomerType,
        customer_id: &str,
        now: Option<i64>,
    ) -> PaymentsResult<Vec<OwnedProduct>> {
        let now = self.prepare(customer_type, customer_id, now).await?;
        let history = self.customer_history(customer_type, customer_id, now).await?;

        let mut owned = resolve_owned_products(&history, customer_type, self.payments());

        let subscription_ids: Vec<String> = owned
            .iter()
            .filter_map(|p| p.subscription.as_ref().map(|s| s.subscription_id.clone()))
            .collect();
        if !subscription_ids.is_empty() {
            let rows = self
                .db
                .subscriptions()
                .get_many(&self.tenancy.id, &subscription_ids)
                .await?;
            let provider_ids: HashMap<&str, &str> = rows
                .iter()
                .filter_map(|row| {
                    row.stripe_subscription_id
                        .as_deref()
                        .map(|provider_id| (row.id.as_str(), provider_id))
                })
                .collect();
            for details in owned.iter_mut().filter_map(|p| p.subscription.as_mut()) {
                details.provider_subscription_id = provider_ids
                    .get(details.subscription_id.as_str())
                    .map(|id| id.to_string());
            }
        }

        debug!(
            tenancy_id = %self.tenancy.id,
            customer_id = %customer_id,
            now,
            owned = owned.len(),
            "Resolved owned products"
        );
        Ok(owned)
    }

    /// Quantity of `item_id` the customer holds as of `now` (default: the call time).
    pub async fn get_item_quantity_for_customer(
        &self,
        customer_type: CustomerType,
        customer_id: &str,
        item_id: &str,
        now: Option<i64>,
    ) -> PaymentsResult<i64> {
        validate_item_id(item_id)?;
        let now = self.prepare(customer_type, customer_id, now).await?;
        let history = self.customer_history(customer_type, customer_id, now).await?;
        let quantity = resolve_item_quantity(&history, item_id, now)?;

        debug!(
            tenancy_id = %self.tenancy.id,
            customer_id = %customer_id,
            item_id = %item_id,
            now,
            quantity,
            "Resolved item quantity"
        );
        Ok(quantity)
    }
}

// =============================================================================
// Pure Resolution
// =============================================================================

/// Folds a customer's history (already bounded by `now`) into owned products.
///
/// Paid grants come first in history order, then include-by-default
/// products from the latest snapshot that no paid product displaces.
///
/// Each purchase is its own entry: stackable products bought several times
/// appear once per purchase with the same `id` and distinct `source_id`s.
/// Sum `quantity` over matching ids for the total held.
pub fn resolve_owned_products(
    history: &[Transaction],
    customer_type: CustomerType,
    payments: &PaymentsConfig,
) -> Vec<OwnedProduct> {
    let mut revoked: HashMap<&str, i64> = HashMap::new();
    let mut cancel_pending: BTreeSet<&str> = BTreeSet::new();
    for tx in history {
        for entry in &tx.entries {
            match entry {
                TransactionEntry::ProductRevocation(revocation) => {
                    *revoked
                        .entry(revocation.adjusted.transaction_id.as_str())
                        .or_default() += revocation.quantity;
                }
                TransactionEntry::ActiveSubscriptionChange(change)
                    if change.change_type == SubscriptionChangeType::Cancel =>
                {
                    cancel_pending.insert(change.subscription_id.as_str());
                }
                _ => {}
            }
        }
    }

    let mut owned = Vec::new();
    for tx in history {
        for entry in &tx.entries {
            let TransactionEntry::ProductGrant(grant) = entry else {
                continue;
            };
            let quantity = grant.quantity - revoked.get(tx.id.as_str()).copied().unwrap_or(0);
            if quantity <= 0 {
                continue;
            }
            let (kind, source_id, subscription) = match &grant.source {
                GrantSource::Subscription { subscription_id } => (
                    OwnedProductKind::Subscription,
                    subscription_id.clone(),
                    Some(SubscriptionDetails {
                        subscription_id: subscription_id.clone(),
                        provider_subscription_id: None,
                        cancel_at_period_end: cancel_pending.contains(subscription_id.as_str()),
                        is_cancelable: grant.product_id.is_some(),
                    }),
                ),
                GrantSource::OneTimePurchase {
                    one_time_purchase_id,
                } => (OwnedProductKind::OneTime, one_time_purchase_id.clone(), None),
                GrantSource::IncludeByDefault => {
                    (OwnedProductKind::IncludeByDefault, tx.id.clone(), None)
                }
            };
            owned.push(OwnedProduct {
                id: grant.product_id.clone(),
                kind,
                quantity,
                product: grant.product.clone(),
                created_at_millis: tx.created_at_millis,
                source_id,
                subscription,
            });
        }
    }

    let latest_snapshot = history.iter().rev().find_map(|tx| {
        tx.entries.iter().find_map(|entry| match entry {
            TransactionEntry::DefaultProductsChange(change) => Some((tx, &change.snapshot)),
            _ => None,
        })
    });
    if let Some((tx, snapshot)) = latest_snapshot {
        let mut defaults = Vec::new();
        for (product_id, product) in snapshot {
            if product.customer_type != customer_type {
                continue;
            }
            let line = product
                .product_line_id
                .as_deref()
                .filter(|line| payments.product_lines.contains_key(*line));
            let displaced = match line {
                Some(line) => owned
                    .iter()
                    .any(|p| !p.is_default() && p.product_line_id() == Some(line)),
                None => owned.iter().any(|p| p.id.as_deref() == Some(product_id.as_str())),
            };
            if displaced {
                continue;
            }
            defaults.push(OwnedProduct {
                id: Some(product_id.clone()),
                kind: OwnedProductKind::IncludeByDefault,
                quantity: 1,
                product: product.clone(),
                created_at_millis: tx.created_at_millis,
                source_id: tx.id.clone(),
                subscription: None,
            });
        }
        owned.extend(defaults);
    }
    owned
}

/// Balance of one item over a customer's history (sorted oldest first).
///
/// Each change counts as a permanent grant at its transaction's effective
/// time; each expire is permanent usage at its own effective time.
///
/// ## Errors
/// `CoreError::Invariant` when an expire points at no earlier change of the
/// same item, or expires more than that change has left.
pub fn resolve_item_quantity(history: &[Transaction], item_id: &str, now: i64) -> CoreResult<i64> {
    let mut remaining: HashMap<EntryRef, i64> = HashMap::new();
    let mut ledger = Vec::new();

    for tx in history.iter().filter(|tx| tx.effective_at_millis <= now) {
        for (index, entry) in tx.entries.iter().enumerate() {
            match entry {
                TransactionEntry::ItemQuantityChange(change) if change.item_id == item_id => {
                    remaining.insert(tx.entry_ref(index), change.quantity);
                    ledger.push(LedgerTransaction::permanent(
                        change.quantity,
                        tx.effective_at_millis,
                    ));
                }
                TransactionEntry::ItemQuantityExpire(expire) if expire.item_id == item_id => {
                    let left = remaining.get_mut(&expire.adjusted).ok_or_else(|| {
                        CoreError::invariant(format!(
                            "item_quantity_expire {}[{}] references unknown item_quantity_change {}[{}] for item {}",
                            tx.id,
                            index,
                            expire.adjusted.transaction_id,
                            expire.adjusted.entry_index,
                            item_id
                        ))
                    })?;
                    if expire.quantity > *left {
                        return Err(CoreError::invariant(format!(
                            "item_quantity_expire {}[{}] expires {} of item {} but only {} remain",
                            tx.id, index, expire.quantity, item_id, left
                        )));
                    }
                    *left -= expire.quantity;
                    ledger.push(LedgerTransaction::permanent(
                        -expire.quantity,
                        tx.effective_at_millis,
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(compute_ledger_balance_at_now(&ledger, now))
}
