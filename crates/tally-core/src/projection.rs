//! # Row Projections
//!
//! Pure functions that turn one mutable source row into its virtual
//! transaction(s). The storage layer reads rows; everything about entry
//! order and back-references lives here.
//!
//! ## Entry Orders
//! ```text
//! subscription-start   [active_subscription_start, money_transfer?, product_grant, item_quantity_change*]
//! one-time-purchase    [money_transfer?, product_grant, item_quantity_change*]
//! subscription-end     [active_subscription_stop, product_revocation, item_quantity_expire*]
//! purchase-refund      [money_transfer?, product_revocation, item_quantity_expire*, active_subscription_stop?]
//! subscription-cancel  [active_subscription_change(cancel)]
//! subscription-renewal [money_transfer?]
//! manual change        [item_quantity_change]
//! default products     [default_products_change]
//! ```
//!
//! ## Ended And Refunded
//! A subscription can be both ended and refunded. Only the earlier of the two
//! events revokes the grant and expires items (end wins a tie); the later one
//! keeps its lifecycle/money entries only, so nothing is revoked twice.

use crate::builders::{
    create_active_subscription_change_entry, create_active_subscription_start_entry,
    create_active_subscription_stop_entry, create_default_products_change_entry,
    create_item_quantity_change_entries_for_product, create_item_quantity_change_entry,
    create_item_quantity_expire_entries_for_product, create_money_transfer_entry,
    create_product_grant_entry, create_product_revocation_entry, item_quantity_change_indices,
    ProductGrantParams,
};
use crate::error::{CoreError, CoreResult};
use crate::money::{build_charged_amount, negate_charged_amount, ChargedAmount};
use crate::transaction::{
    EntryRef, GrantSource, SubscriptionChangeType, Transaction, TransactionEntry, TransactionType,
};
use crate::types::{Customer, Product, ProductSnapshot, PurchaseCreationSource};

// =============================================================================
// Purchase Record
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurchaseKind {
    Subscription,
    OneTime,
}

/// Storage-independent view of a subscription or one-time purchase row.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseRecord {
    pub id: String,
    pub kind: PurchaseKind,
    pub customer: Customer,
    pub product_id: Option<String>,
    pub price_id: Option<String>,
    pub product: Product,
    pub quantity: i64,
    pub creation_source: PurchaseCreationSource,
    pub created_at_millis: i64,
    /// `billing_cycle_anchor` for subscriptions when set, else `created_at`.
    pub cycle_anchor_millis: i64,
    pub ended_at_millis: Option<i64>,
    pub refunded_at_millis: Option<i64>,
}

impl PurchaseRecord {
    pub fn test_mode(&self) -> bool {
        self.creation_source.is_test_mode()
    }

    /// What the purchase charged, per currency.
    pub fn charged_amount(&self) -> CoreResult<ChargedAmount> {
        match self.price_id.as_deref().and_then(|id| self.product.price(id)) {
            Some(price) => build_charged_amount(price, self.quantity),
            None => Ok(ChargedAmount::new()),
        }
    }

    fn grant_source(&self) -> GrantSource {
        match self.kind {
            PurchaseKind::Subscription => GrantSource::Subscription {
                subscription_id: self.id.clone(),
            },
            PurchaseKind::OneTime => GrantSource::OneTimePurchase {
                one_time_purchase_id: self.id.clone(),
            },
        }
    }

    /// True when the end event carries the revocation.
    fn revokes_at_end(&self) -> bool {
        match (self.ended_at_millis, self.refunded_at_millis) {
            (Some(ended), Some(refunded)) => ended <= refunded,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// True when the refund event carries the revocation.
    fn revokes_at_refund(&self) -> bool {
        self.refunded_at_millis.is_some() && !self.revokes_at_end()
    }
}

pub fn end_transaction_id(purchase_id: &str) -> String {
    format!("{}:end", purchase_id)
}

pub fn refund_transaction_id(purchase_id: &str) -> String {
    format!("{}:refund", purchase_id)
}

pub fn cancel_transaction_id(purchase_id: &str) -> String {
    format!("{}:cancel", purchase_id)
}

pub fn default_products_transaction_id(snapshot_id: &str) -> String {
    format!("default-products:{}", snapshot_id)
}

// =============================================================================
// Start / One-Time Purchase
// =============================================================================

/// Entries of the start transaction, without `adjusted_by`.
fn purchase_start_entries(purchase: &PurchaseRecord) -> CoreResult<Vec<TransactionEntry>> {
    let customer = &purchase.customer;
    let mut entries = Vec::new();

    if purchase.kind == PurchaseKind::Subscription {
        entries.push(create_active_subscription_start_entry(
            customer,
            &purchase.id,
            purchase.product_id.as_deref(),
            &purchase.product,
        )?);
    }
    if let Some(transfer) =
        create_money_transfer_entry(customer, purchase.charged_amount()?, purchase.test_mode())
    {
        entries.push(transfer);
    }

    let changes =
        create_item_quantity_change_entries_for_product(customer, &purchase.product, purchase.quantity)?;
    let grant_index = entries.len();
    let indices = item_quantity_change_indices(&changes, grant_index + 1);

    entries.push(create_product_grant_entry(ProductGrantParams {
        customer,
        product_id: purchase.product_id.as_deref(),
        product: &purchase.product,
        price_id: purchase.price_id.as_deref(),
        quantity: purchase.quantity,
        cycle_anchor: purchase.cycle_anchor_millis,
        source: purchase.grant_source(),
        item_quantity_change_indices: indices,
    })?);
    entries.extend(changes);
    Ok(entries)
}

/// `subscription-start` or `one-time-purchase`, at the row's creation time.
pub fn purchase_start_transaction(purchase: &PurchaseRecord) -> CoreResult<Transaction> {
    let kind = match purchase.kind {
        PurchaseKind::Subscription => TransactionType::SubscriptionStart,
        PurchaseKind::OneTime => TransactionType::OneTimePurchase,
    };
    let mut tx = Transaction::new(
        purchase.id.clone(),
        kind,
        purchase.created_at_millis,
        purchase_start_entries(purchase)?,
        purchase.test_mode(),
    );

    if purchase.revokes_at_end() {
        tx.adjusted_by.push(EntryRef::new(end_transaction_id(&purchase.id), 1));
    }
    if purchase.revokes_at_refund() {
        let revocation_index = usize::from(refund_money_transfer(purchase)?.is_some());
        tx.adjusted_by
            .push(EntryRef::new(refund_transaction_id(&purchase.id), revocation_index));
    }
    Ok(tx)
}

/// Revocation and item expirations against the start transaction.
fn revocation_entries(purchase: &PurchaseRecord) -> CoreResult<Vec<TransactionEntry>> {
    let start_entries = purchase_start_entries(purchase)?;
    let (grant_index, grant) = start_entries
        .iter()
        .enumerate()
        .find_map(|(i, entry)| match entry {
            TransactionEntry::ProductGrant(grant) => Some((i, grant)),
            _ => None,
        })
        .ok_or_else(|| {
            CoreError::invariant(format!("start transaction {} has no product_grant", purchase.id))
        })?;

    let mut entries = Vec::new();
    if purchase.quantity > 0 {
        entries.push(create_product_revocation_entry(
            &purchase.customer,
            EntryRef::new(purchase.id.clone(), grant_index),
            purchase.quantity,
        )?);
    }
    entries.extend(create_item_quantity_expire_entries_for_product(
        &purchase.customer,
        grant,
        &purchase.id,
    )?);
    Ok(entries)
}

// =============================================================================
// End / Cancel / Renewal
// =============================================================================

/// `subscription-end` at `ended_at`.
///
/// ## Errors
/// `CoreError::InvalidEntry` when the row has no `ended_at`.
pub fn subscription_end_transaction(purchase: &PurchaseRecord) -> CoreResult<Transaction> {
    let ended_at = purchase
        .ended_at_millis
        .ok_or_else(|| CoreError::invalid_entry("subscription-end", "requires ended_at"))?;

    let mut entries = vec![create_active_subscription_stop_entry(&purchase.customer, &purchase.id)?];
    if purchase.revokes_at_end() {
        entries.extend(revocation_entries(purchase)?);
    }
    Ok(Transaction::new(
        end_transaction_id(&purchase.id),
        TransactionType::SubscriptionEnd,
        ended_at,
        entries,
        purchase.test_mode(),
    ))
}

/// `subscription-cancel`: intent to cancel at period end, recorded at `at_millis`.
pub fn subscription_cancel_transaction(
    purchase: &PurchaseRecord,
    at_millis: i64,
) -> CoreResult<Transaction> {
    let entry = create_active_subscription_change_entry(
        &purchase.customer,
        &purchase.id,
        SubscriptionChangeType::Cancel,
        None,
    )?;
    Ok(Transaction::new(
        cancel_transaction_id(&purchase.id),
        TransactionType::SubscriptionCancel,
        at_millis,
        vec![entry],
        purchase.test_mode(),
    ))
}

/// `subscription-renewal` for one invoice: re-charges, never re-grants.
pub fn subscription_renewal_transaction(
    invoice_id: &str,
    subscription: &PurchaseRecord,
    at_millis: i64,
) -> CoreResult<Transaction> {
    let entries = create_money_transfer_entry(
        &subscription.customer,
        subscription.charged_amount()?,
        subscription.test_mode(),
    )
    .into_iter()
    .collect();
    Ok(Transaction::new(
        invoice_id,
        TransactionType::SubscriptionRenewal,
        at_millis,
        entries,
        subscription.test_mode(),
    ))
}

// =============================================================================
// Refund
// =============================================================================

fn refund_money_transfer(purchase: &PurchaseRecord) -> CoreResult<Option<TransactionEntry>> {
    let negated = negate_charged_amount(&purchase.charged_amount()?);
    Ok(create_money_transfer_entry(
        &purchase.customer,
        negated,
        purchase.test_mode(),
    ))
}

/// `purchase-refund` at `refunded_at`.
pub fn purchase_refund_transaction(purchase: &PurchaseRecord) -> CoreResult<Transaction> {
    let refunded_at = purchase
        .refunded_at_millis
        .ok_or_else(|| CoreError::invalid_entry("purchase-refund", "requires refunded_at"))?;

    let mut entries: Vec<TransactionEntry> = refund_money_transfer(purchase)?.into_iter().collect();
    if purchase.revokes_at_refund() {
        entries.extend(revocation_entries(purchase)?);
        if purchase.kind == PurchaseKind::Subscription {
            entries.push(create_active_subscription_stop_entry(&purchase.customer, &purchase.id)?);
        }
    }
    Ok(Transaction::new(
        refund_transaction_id(&purchase.id),
        TransactionType::PurchaseRefund,
        refunded_at,
        entries,
        purchase.test_mode(),
    ))
}

// =============================================================================
// Manual Changes / Default Products
// =============================================================================

/// `manual-item-quantity-change`: an admin/API quantity delta.
pub fn manual_item_quantity_change_transaction(
    change_id: &str,
    customer: &Customer,
    item_id: &str,
    quantity: i64,
    at_millis: i64,
) -> CoreResult<Transaction> {
    Ok(Transaction::new(
        change_id,
        TransactionType::ManualItemQuantityChange,
        at_millis,
        vec![create_item_quantity_change_entry(customer, item_id, quantity)?],
        false,
    ))
}

/// `default-products-change` for one snapshot row.
pub fn default_products_change_transaction(
    snapshot_id: &str,
    snapshot: ProductSnapshot,
    at_millis: i64,
) -> Transaction {
    Transaction::new(
        default_products_transaction_id(snapshot_id),
        TransactionType::DefaultProductsChange,
        at_millis,
        vec![create_default_products_change_entry(snapshot)],
        false,
    )
}
