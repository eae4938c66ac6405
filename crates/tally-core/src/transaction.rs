//! # Transactions
//!
//! Virtual ledger transactions and their typed entries.
//!
//! ## Anatomy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Transaction "sub-1"  (subscription-start)                              │
//! │                                                                         │
//! │   [0] active_subscription_start                                        │
//! │   [1] money_transfer            (absent in test mode / free)           │
//! │   [2] product_grant   item_quantity_change_indices = { seats: 3 }      │
//! │   [3] item_quantity_change  seats +4                                   │
//! │                                                                         │
//! │  Transaction "sub-1:end"  (subscription-end)                            │
//! │                                                                         │
//! │   [0] active_subscription_stop                                         │
//! │   [1] product_revocation   → ("sub-1", 2)                              │
//! │   [2] item_quantity_expire → ("sub-1", 3)  seats 4                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Entry order inside a transaction is a contract: adjustments address an
//! entry by `(transaction_id, entry_index)`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::money::ChargedAmount;
use crate::types::{Customer, Product, ProductSnapshot};

// =============================================================================
// Transaction Type
// =============================================================================

/// The kind of economic event a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum TransactionType {
    SubscriptionStart,
    SubscriptionEnd,
    SubscriptionCancel,
    SubscriptionRenewal,
    OneTimePurchase,
    PurchaseRefund,
    ManualItemQuantityChange,
    ItemGrantRenewal,
    DefaultProductsChange,
    Chargeback,
    ProductVersionChange,
    SubscriptionReactivation,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::SubscriptionStart => "subscription-start",
            TransactionType::SubscriptionEnd => "subscription-end",
            TransactionType::SubscriptionCancel => "subscription-cancel",
            TransactionType::SubscriptionRenewal => "subscription-renewal",
            TransactionType::OneTimePurchase => "one-time-purchase",
            TransactionType::PurchaseRefund => "purchase-refund",
            TransactionType::ManualItemQuantityChange => "manual-item-quantity-change",
            TransactionType::ItemGrantRenewal => "item-grant-renewal",
            TransactionType::DefaultProductsChange => "default-products-change",
            TransactionType::Chargeback => "chargeback",
            TransactionType::ProductVersionChange => "product-version-change",
            TransactionType::SubscriptionReactivation => "subscription-reactivation",
        }
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Entries
// =============================================================================

/// Points at one entry of one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryRef {
    pub transaction_id: String,
    pub entry_index: usize,
}

impl EntryRef {
    pub fn new(transaction_id: impl Into<String>, entry_index: usize) -> Self {
        EntryRef {
            transaction_id: transaction_id.into(),
            entry_index,
        }
    }
}

/// What a product grant is backed by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GrantSource {
    Subscription { subscription_id: String },
    OneTimePurchase { one_time_purchase_id: String },
    IncludeByDefault,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductGrantEntry {
    pub customer: Customer,
    pub product_id: Option<String>,
    pub product: Product,
    pub price_id: Option<String>,
    pub quantity: i64,
    /// Anchor for repeat-interval renewals (epoch millis).
    pub cycle_anchor: i64,
    pub source: GrantSource,
    /// Item id → index of the `item_quantity_change` entry this grant produced.
    pub item_quantity_change_indices: BTreeMap<String, usize>,
}

impl ProductGrantEntry {
    pub fn subscription_id(&self) -> Option<&str> {
        match &self.source {
            GrantSource::Subscription { subscription_id } => Some(subscription_id),
            _ => None,
        }
    }

    pub fn one_time_purchase_id(&self) -> Option<&str> {
        match &self.source {
            GrantSource::OneTimePurchase { one_time_purchase_id } => Some(one_time_purchase_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRevocationEntry {
    pub customer: Customer,
    pub adjusted: EntryRef,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantityChangeEntry {
    pub customer: Customer,
    pub item_id: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemQuantityExpireEntry {
    pub customer: Customer,
    pub item_id: String,
    pub quantity: i64,
    pub adjusted: EntryRef,
}

/// Net amount of a money transfer (USD only for now).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetAmount {
    #[serde(rename = "USD")]
    pub usd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoneyTransferEntry {
    pub customer: Customer,
    pub charged_amount: ChargedAmount,
    pub net_amount: NetAmount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSubscriptionStartEntry {
    pub customer: Customer,
    pub subscription_id: String,
    pub product_id: Option<String>,
    pub product: Product,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSubscriptionStopEntry {
    pub customer: Customer,
    pub subscription_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionChangeType {
    Cancel,
    Reactivate,
    Switch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSubscriptionChangeEntry {
    pub customer: Customer,
    pub subscription_id: String,
    pub change_type: SubscriptionChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product: Option<Product>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultProductsChangeEntry {
    pub snapshot: ProductSnapshot,
}

/// One effect inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransactionEntry {
    ProductGrant(ProductGrantEntry),
    ProductRevocation(ProductRevocationEntry),
    ItemQuantityChange(ItemQuantityChangeEntry),
    ItemQuantityExpire(ItemQuantityExpireEntry),
    MoneyTransfer(MoneyTransferEntry),
    ActiveSubscriptionStart(ActiveSubscriptionStartEntry),
    ActiveSubscriptionStop(ActiveSubscriptionStopEntry),
    ActiveSubscriptionChange(ActiveSubscriptionChangeEntry),
    DefaultProductsChange(DefaultProductsChangeEntry),
}

impl TransactionEntry {
    /// Wire name of the entry variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            TransactionEntry::ProductGrant(_) => "product_grant",
            TransactionEntry::ProductRevocation(_) => "product_revocation",
            TransactionEntry::ItemQuantityChange(_) => "item_quantity_change",
            TransactionEntry::ItemQuantityExpire(_) => "item_quantity_expire",
            TransactionEntry::MoneyTransfer(_) => "money_transfer",
            TransactionEntry::ActiveSubscriptionStart(_) => "active_subscription_start",
            TransactionEntry::ActiveSubscriptionStop(_) => "active_subscription_stop",
            TransactionEntry::ActiveSubscriptionChange(_) => "active_subscription_change",
            TransactionEntry::DefaultProductsChange(_) => "default_products_change",
        }
    }

    /// The entry this one adjusts, if it is an adjustment.
    pub fn adjusted(&self) -> Option<&EntryRef> {
        match self {
            TransactionEntry::ProductRevocation(e) => Some(&e.adjusted),
            TransactionEntry::ItemQuantityExpire(e) => Some(&e.adjusted),
            TransactionEntry::ProductGrant(_)
            | TransactionEntry::ItemQuantityChange(_)
            | TransactionEntry::MoneyTransfer(_)
            | TransactionEntry::ActiveSubscriptionStart(_)
            | TransactionEntry::ActiveSubscriptionStop(_)
            | TransactionEntry::ActiveSubscriptionChange(_)
            | TransactionEntry::DefaultProductsChange(_) => None,
        }
    }

    /// The customer the entry affects; tenancy-wide entries have none.
    pub fn customer(&self) -> Option<&Customer> {
        match self {
            TransactionEntry::ProductGrant(e) => Some(&e.customer),
            TransactionEntry::ProductRevocation(e) => Some(&e.customer),
            TransactionEntry::ItemQuantityChange(e) => Some(&e.customer),
            TransactionEntry::ItemQuantityExpire(e) => Some(&e.customer),
            TransactionEntry::MoneyTransfer(e) => Some(&e.customer),
            TransactionEntry::ActiveSubscriptionStart(e) => Some(&e.customer),
            TransactionEntry::ActiveSubscriptionStop(e) => Some(&e.customer),
            TransactionEntry::ActiveSubscriptionChange(e) => Some(&e.customer),
            TransactionEntry::DefaultProductsChange(_) => None,
        }
    }
}

// =============================================================================
// Transaction
// =============================================================================

/// An immutable, computed ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub created_at_millis: i64,
    pub effective_at_millis: i64,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub entries: Vec<TransactionEntry>,
    pub adjusted_by: Vec<EntryRef>,
    pub test_mode: bool,
}

impl Transaction {
    /// Creates a transaction whose created and effective times coincide.
    pub fn new(
        id: impl Into<String>,
        kind: TransactionType,
        at_millis: i64,
        entries: Vec<TransactionEntry>,
        test_mode: bool,
    ) -> Self {
        Transaction {
            id: id.into(),
            created_at_millis: at_millis,
            effective_at_millis: at_millis,
            kind,
            entries,
            adjusted_by: Vec::new(),
            test_mode,
        }
    }

    /// Index and body of the first product grant.
    pub fn product_grant(&self) -> Option<(usize, &ProductGrantEntry)> {
        self.entries.iter().enumerate().find_map(|(i, entry)| match entry {
            TransactionEntry::ProductGrant(grant) => Some((i, grant)),
            _ => None,
        })
    }

    /// Reference to an entry of this transaction.
    pub fn entry_ref(&self, entry_index: usize) -> EntryRef {
        EntryRef::new(self.id.clone(), entry_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CustomerType;

    #[test]
    fn test_transaction_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&TransactionType::ManualItemQuantityChange).unwrap(),
            "\"manual-item-quantity-change\""
        );
        assert_eq!(TransactionType::ItemGrantRenewal.as_str(), "item-grant-renewal");
    }

    #[test]
    fn test_entry_tagging() {
        let entry = TransactionEntry::ItemQuantityExpire(ItemQuantityExpireEntry {
            customer: Customer::new(CustomerType::User, "u1"),
            item_id: "seats".into(),
            quantity: 4,
            adjusted: EntryRef::new("sub-1", 3),
        });
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "item_quantity_expire");
        assert_eq!(json["adjusted"]["transaction_id"], "sub-1");

        let back: TransactionEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.adjusted(), Some(&EntryRef::new("sub-1", 3)));
        assert_eq!(back.type_name(), "item_quantity_expire");
    }

    #[test]
    fn test_non_adjustments_have_no_reference() {
        let entry = TransactionEntry::ItemQuantityChange(ItemQuantityChangeEntry {
            customer: Customer::new(CustomerType::Team, "t1"),
            item_id: "credits".into(),
            quantity: 10,
        });
        assert!(entry.adjusted().is_none());
        assert_eq!(entry.customer().unwrap().customer_id, "t1");
    }
}
