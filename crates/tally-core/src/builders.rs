//! # Entry Builders
//!
//! Pure constructors for every [`TransactionEntry`] variant.
//!
//! Builders validate shape and never perform I/O. Product-level helpers emit
//! one item entry per included item, in the product's declaration order, so
//! the grant's `item_quantity_change_indices` can be computed from positions.

use std::collections::BTreeMap;

use crate::error::{CoreError, CoreResult};
use crate::money::ChargedAmount;
use crate::transaction::{
    ActiveSubscriptionChangeEntry, ActiveSubscriptionStartEntry, ActiveSubscriptionStopEntry,
    DefaultProductsChangeEntry, EntryRef, GrantSource, ItemQuantityChangeEntry,
    ItemQuantityExpireEntry, MoneyTransferEntry, NetAmount, ProductGrantEntry,
    ProductRevocationEntry, SubscriptionChangeType, TransactionEntry,
};
use crate::types::{Customer, ItemExpiry, Product, ProductSnapshot};

fn require_customer(entry: &'static str, customer: &Customer) -> CoreResult<()> {
    if customer.customer_id.is_empty() {
        return Err(CoreError::invalid_entry(entry, "customer_id is required"));
    }
    Ok(())
}

// =============================================================================
// Product Grant / Revocation
// =============================================================================

/// Inputs of [`create_product_grant_entry`].
#[derive(Debug, Clone)]
pub struct ProductGrantParams<'a> {
    pub customer: &'a Customer,
    pub product_id: Option<&'a str>,
    pub product: &'a Product,
    pub price_id: Option<&'a str>,
    pub quantity: i64,
    pub cycle_anchor: i64,
    pub source: GrantSource,
    pub item_quantity_change_indices: BTreeMap<String, usize>,
}

pub fn create_product_grant_entry(params: ProductGrantParams<'_>) -> CoreResult<TransactionEntry> {
    require_customer("product_grant", params.customer)?;
    if params.quantity < 0 {
        return Err(CoreError::invalid_entry(
            "product_grant",
            format!("quantity must not be negative, got {}", params.quantity),
        ));
    }
    let source_id_missing = match &params.source {
        GrantSource::Subscription { subscription_id } => subscription_id.is_empty(),
        GrantSource::OneTimePurchase { one_time_purchase_id } => one_time_purchase_id.is_empty(),
        GrantSource::IncludeByDefault => false,
    };
    if source_id_missing {
        return Err(CoreError::invalid_entry("product_grant", "source id is empty"));
    }

    Ok(TransactionEntry::ProductGrant(ProductGrantEntry {
        customer: params.customer.clone(),
        product_id: params.product_id.map(str::to_string),
        product: params.product.clone(),
        price_id: params.price_id.map(str::to_string),
        quantity: params.quantity,
        cycle_anchor: params.cycle_anchor,
        source: params.source,
        item_quantity_change_indices: params.item_quantity_change_indices,
    }))
}

pub fn create_product_revocation_entry(
    customer: &Customer,
    adjusted: EntryRef,
    quantity: i64,
) -> CoreResult<TransactionEntry> {
    require_customer("product_revocation", customer)?;
    if quantity <= 0 {
        return Err(CoreError::invalid_entry(
            "product_revocation",
            format!("quantity must be positive, got {}", quantity),
        ));
    }
    Ok(TransactionEntry::ProductRevocation(ProductRevocationEntry {
        customer: customer.clone(),
        adjusted,
        quantity,
    }))
}

// =============================================================================
// Items
// =============================================================================

pub fn create_item_quantity_change_entry(
    customer: &Customer,
    item_id: &str,
    quantity: i64,
) -> CoreResult<TransactionEntry> {
    require_customer("item_quantity_change", customer)?;
    if item_id.is_empty() {
        return Err(CoreError::invalid_entry("item_quantity_change", "item_id is required"));
    }
    Ok(TransactionEntry::ItemQuantityChange(ItemQuantityChangeEntry {
        customer: customer.clone(),
        item_id: item_id.to_string(),
        quantity,
    }))
}

pub fn create_item_quantity_expire_entry(
    customer: &Customer,
    item_id: &str,
    quantity: i64,
    adjusted: EntryRef,
) -> CoreResult<TransactionEntry> {
    require_customer("item_quantity_expire", customer)?;
    if quantity <= 0 {
        return Err(CoreError::invalid_entry(
            "item_quantity_expire",
            format!("quantity must be positive, got {}", quantity),
        ));
    }
    Ok(TransactionEntry::ItemQuantityExpire(ItemQuantityExpireEntry {
        customer: customer.clone(),
        item_id: item_id.to_string(),
        quantity,
        adjusted,
    }))
}

/// Item id and granted quantity for each included item with a positive total.
pub fn granted_item_quantities(product: &Product, purchase_quantity: i64) -> Vec<(&str, i64)> {
    product
        .included_items
        .iter()
        .map(|(item_id, item)| (item_id.as_str(), item.quantity.saturating_mul(purchase_quantity)))
        .filter(|(_, quantity)| *quantity > 0)
        .collect()
}

/// One `item_quantity_change` per included item, skipping non-positive totals.
pub fn create_item_quantity_change_entries_for_product(
    customer: &Customer,
    product: &Product,
    purchase_quantity: i64,
) -> CoreResult<Vec<TransactionEntry>> {
    granted_item_quantities(product, purchase_quantity)
        .into_iter()
        .map(|(item_id, quantity)| create_item_quantity_change_entry(customer, item_id, quantity))
        .collect()
}

/// Maps item ids to the positions their change entries will take when
/// appended after `offset` existing entries.
pub fn item_quantity_change_indices(
    changes: &[TransactionEntry],
    offset: usize,
) -> BTreeMap<String, usize> {
    changes
        .iter()
        .enumerate()
        .filter_map(|(i, entry)| match entry {
            TransactionEntry::ItemQuantityChange(change) => Some((change.item_id.clone(), offset + i)),
            _ => None,
        })
        .collect()
}

/// Expires the purchase-scoped items a grant produced.
///
/// Only items with `expires = "when-purchase-expires"` are expired.
///
/// ## Errors
/// `CoreError::Invariant` when the grant has no recorded index for an item it
/// should have produced; that means the start transaction was assembled in a
/// different order than its grant claims.
pub fn create_item_quantity_expire_entries_for_product(
    customer: &Customer,
    grant: &ProductGrantEntry,
    grant_transaction_id: &str,
) -> CoreResult<Vec<TransactionEntry>> {
    let mut entries = Vec::new();
    for (item_id, quantity) in granted_item_quantities(&grant.product, grant.quantity) {
        let expires = grant
            .product
            .included_items
            .get(item_id)
            .map(|item| item.expires)
            .unwrap_or_default();
        if expires != ItemExpiry::WhenPurchaseExpires {
            continue;
        }
        let index = grant
            .item_quantity_change_indices
            .get(item_id)
            .copied()
            .ok_or_else(|| {
                CoreError::invariant(format!(
                    "item_quantity_change index not found for item {}",
                    item_id
                ))
            })?;
        entries.push(create_item_quantity_expire_entry(
            customer,
            item_id,
            quantity,
            EntryRef::new(grant_transaction_id, index),
        )?);
    }
    Ok(entries)
}

// =============================================================================
// Money
// =============================================================================

/// Builds a money transfer, or `None` when there is nothing to record.
///
/// Returns `None` when `skip` is set (test-mode purchases) or the charged
/// map is empty.
pub fn create_money_transfer_entry(
    customer: &Customer,
    charged_amount: ChargedAmount,
    skip: bool,
) -> Option<TransactionEntry> {
    if skip || charged_amount.is_empty() {
        return None;
    }
    let usd = charged_amount
        .get("USD")
        .cloned()
        .unwrap_or_else(|| "0".to_string());
    Some(TransactionEntry::MoneyTransfer(MoneyTransferEntry {
        customer: customer.clone(),
        charged_amount,
        net_amount: NetAmount { usd },
    }))
}

// =============================================================================
// Subscription Lifecycle
// =============================================================================

pub fn create_active_subscription_start_entry(
    customer: &Customer,
    subscription_id: &str,
    product_id: Option<&str>,
    product: &Product,
) -> CoreResult<TransactionEntry> {
    require_customer("active_subscription_start", customer)?;
    Ok(TransactionEntry::ActiveSubscriptionStart(ActiveSubscriptionStartEntry {
        customer: customer.clone(),
        subscription_id: subscription_id.to_string(),
        product_id: product_id.map(str::to_string),
        product: product.clone(),
    }))
}

pub fn create_active_subscription_stop_entry(
    customer: &Customer,
    subscription_id: &str,
) -> CoreResult<TransactionEntry> {
    require_customer("active_subscription_stop", customer)?;
    Ok(TransactionEntry::ActiveSubscriptionStop(ActiveSubscriptionStopEntry {
        customer: customer.clone(),
        subscription_id: subscription_id.to_string(),
    }))
}

pub fn create_active_subscription_change_entry(
    customer: &Customer,
    subscription_id: &str,
    change_type: SubscriptionChangeType,
    product: Option<(Option<&str>, &Product)>,
) -> CoreResult<TransactionEntry> {
    require_customer("active_subscription_change", customer)?;
    if change_type == SubscriptionChangeType::Switch && product.is_none() {
        return Err(CoreError::invalid_entry(
            "active_subscription_change",
            "switch requires the new product",
        ));
    }
    Ok(TransactionEntry::ActiveSubscriptionChange(ActiveSubscriptionChangeEntry {
        customer: customer.clone(),
        subscription_id: subscription_id.to_string(),
        change_type,
        product_id: product.and_then(|(id, _)| id.map(str::to_string)),
        product: product.map(|(_, p)| p.clone()),
    }))
}

pub fn create_default_products_change_entry(snapshot: ProductSnapshot) -> TransactionEntry {
    TransactionEntry::DefaultProductsChange(DefaultProductsChangeEntry { snapshot })
}
