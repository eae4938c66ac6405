//! # Purchase Rules
//!
//! The storage-free half of purchase validation: which product is being
//! bought, which price applies, and whether the customer's current holdings
//! allow it.
//!
//! ## Rule Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  resolve product     product_id XOR product_inline, access checks      │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  (storage) customer exists, owned products                             │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  select price        explicit id or first declared tier                │
//! │  stackable           quantity must be 1 otherwise                      │
//! │  already granted     non-stackable product owned by id                 │
//! │  add-on              some base product must be owned                   │
//! │  product line        one-time purchase in the line blocks              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ProductMissingReason, PurchaseError};
use crate::interval::RepeatInterval;
use crate::money::currency;
use crate::types::{
    CustomerType, IncludedItem, OwnedProduct, OwnedProductKind, PaymentsConfig, Price, Prices,
    Product,
};

/// Who is calling the purchase API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessType {
    Client,
    Server,
    Admin,
}

/// A product defined in the request instead of the tenancy config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InlineProduct {
    #[serde(default)]
    pub display_name: Option<String>,
    pub customer_type: CustomerType,
    #[serde(default)]
    pub free_trial: Option<RepeatInterval>,
    #[serde(default)]
    pub server_only: bool,
    #[serde(default)]
    pub prices: IndexMap<String, Price>,
    #[serde(default)]
    pub included_items: IndexMap<String, IncludedItem>,
}

impl InlineProduct {
    /// Converts to a product: never stackable, no product line, no add-on
    /// base, every price server-only, unsupported currencies dropped.
    pub fn into_product(self) -> Product {
        let prices = self
            .prices
            .into_iter()
            .map(|(price_id, price)| {
                let amounts = price
                    .amounts
                    .into_iter()
                    .filter(|(code, _)| currency(code).is_some())
                    .collect();
                let price = Price {
                    interval: price.interval,
                    free_trial: price.free_trial,
                    server_only: true,
                    amounts,
                };
                (price_id, price)
            })
            .collect();

        Product {
            display_name: self.display_name,
            customer_type: self.customer_type,
            product_line_id: None,
            is_add_on_to: Vec::new(),
            stackable: false,
            server_only: self.server_only,
            free_trial: self.free_trial,
            prices: Prices::Priced(prices),
            included_items: self.included_items,
        }
    }
}

/// The product a purchase request refers to.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProduct {
    /// `None` for inline products.
    pub product_id: Option<String>,
    pub product: Product,
}

/// Resolves `product_id` or `product_inline` into one product.
///
/// ## Errors
/// Checked in this order:
/// 1. both given
/// 2. inline product from a client
/// 3. neither given
/// 4. unknown product id (`ItemExists` when an item has that id)
/// 5. server-only product requested by a client
pub fn ensure_product_id_or_inline_product(
    config: &PaymentsConfig,
    access: AccessType,
    product_id: Option<&str>,
    inline: Option<InlineProduct>,
) -> Result<ResolvedProduct, PurchaseError> {
    match (product_id, inline) {
        (Some(_), Some(_)) => Err(PurchaseError::BothProductIdAndInline),
        (None, Some(_)) if access == AccessType::Client => Err(PurchaseError::InlineFromClient),
        (None, None) => Err(PurchaseError::MissingProduct),
        (Some(product_id), None) => {
            let Some(product) = config.products.get(product_id) else {
                let reason = config
                    .items
                    .contains_key(product_id)
                    .then_some(ProductMissingReason::ItemExists);
                return Err(PurchaseError::ProductDoesNotExist {
                    product_id: product_id.to_string(),
                    reason,
                });
            };
            if product.server_only && access == AccessType::Client {
                return Err(PurchaseError::ProductDoesNotExist {
                    product_id: product_id.to_string(),
                    reason: Some(ProductMissingReason::ServerOnly),
                });
            }
            Ok(ResolvedProduct {
                product_id: Some(product_id.to_string()),
                product: product.clone(),
            })
        }
        (None, Some(inline)) => Ok(ResolvedProduct {
            product_id: None,
            product: inline.into_product(),
        }),
    }
}

// =============================================================================
// Purchase Context
// =============================================================================

/// What the customer already holds, relative to a prospective purchase.
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseContext {
    pub owned_products: Vec<OwnedProduct>,
    pub already_owns_product: bool,
    /// The product's line, only if declared in the config.
    pub product_line_id: Option<String>,
    /// Owned non-default products in the same line, minus add-on bases.
    pub conflicting_products: Vec<OwnedProduct>,
}

impl PurchaseContext {
    /// Builds the context from already-resolved owned products. Never fails.
    pub fn new(
        config: &PaymentsConfig,
        owned_products: Vec<OwnedProduct>,
        product: &Product,
        product_id: Option<&str>,
    ) -> Self {
        let already_owns_product = product_id.is_some_and(|id| {
            owned_products
                .iter()
                .any(|owned| owned.id.as_deref() == Some(id))
        });

        let product_line_id = product
            .product_line_id
            .as_deref()
            .filter(|line| config.product_lines.contains_key(*line))
            .map(str::to_string);

        let conflicting_products = match product_line_id.as_deref() {
            Some(line) => owned_products
                .iter()
                .filter(|owned| {
                    owned.id.as_deref().is_some_and(|id| {
                        owned.product_line_id() == Some(line)
                            && !owned.is_default()
                            && !product.is_add_on_to.iter().any(|base| base == id)
                    })
                })
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        PurchaseContext {
            owned_products,
            already_owns_product,
            product_line_id,
            conflicting_products,
        }
    }

    /// First conflicting subscription, the one a new grant replaces.
    pub fn conflicting_subscription(&self) -> Option<&OwnedProduct> {
        self.conflicting_products
            .iter()
            .find(|owned| owned.kind == OwnedProductKind::Subscription)
    }
}

// =============================================================================
// Rules
// =============================================================================

/// The price tier a purchase will be charged at.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectedPrice {
    pub price_id: String,
    pub price: Price,
}

/// Picks the explicit price, or the first declared tier.
///
/// Include-by-default products have no price and select nothing.
pub fn select_price(
    product: &Product,
    price_id: Option<&str>,
) -> Result<Option<SelectedPrice>, PurchaseError> {
    if product.prices.is_include_by_default() {
        return Ok(None);
    }
    let selected = match price_id {
        Some(id) => {
            let price = product.price(id).ok_or(PurchaseError::PriceNotFound)?;
            Some((id.to_string(), price))
        }
        None => product
            .prices
            .first()
            .map(|(id, price)| (id.clone(), price)),
    };
    Ok(selected.map(|(price_id, price)| SelectedPrice {
        price_id,
        price: price.clone(),
    }))
}

pub fn check_stackable(product: &Product, quantity: i64) -> Result<(), PurchaseError> {
    if quantity != 1 && !product.stackable {
        return Err(PurchaseError::NotStackable);
    }
    Ok(())
}

/// Ownership rules that need the purchase context.
pub fn check_ownership_rules(
    context: &PurchaseContext,
    product: &Product,
    product_id: Option<&str>,
    customer_id: &str,
) -> Result<(), PurchaseError> {
    if let Some(product_id) = product_id {
        if !product.stackable && context.already_owns_product {
            return Err(PurchaseError::ProductAlreadyGranted {
                product_id: product_id.to_string(),
                customer_id: customer_id.to_string(),
            });
        }
    }

    if product.is_add_on() {
        let owns_base = context.owned_products.iter().any(|owned| {
            owned
                .id
                .as_deref()
                .is_some_and(|id| product.is_add_on_to.iter().any(|base| base == id))
        });
        if !owns_base {
            return Err(PurchaseError::MissingAddOnBase);
        }
    }

    if context.product_line_id.is_some()
        && context
            .conflicting_products
            .iter()
            .any(|owned| owned.kind == OwnedProductKind::OneTime)
    {
        return Err(PurchaseError::OneTimeConflictInProductLine);
    }
    Ok(())
}
