//! # Domain Types
//!
//! Customers, products, the tenancy payments config and resolver output.
//!
//! ## Config Shape
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  tenancy.config.payments                                               │
//! │  ├── products        product id → Product                              │
//! │  │     ├── prices    "include-by-default" | price id → Price            │
//! │  │     └── included_items   item id → { quantity, repeat, expires }     │
//! │  ├── product_lines   line id → ProductLine   (exclusivity groups)      │
//! │  └── items           item id → ItemConfig                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same [`Product`] type is used for config entries, purchase-row
//! snapshots and `default_products_change` snapshots.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::interval::{repeat_or_never, RepeatInterval};

// =============================================================================
// Customer Type
// =============================================================================

/// Kind of entity that can own products and items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum CustomerType {
    User,
    Team,
    Custom,
}

impl CustomerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerType::User => "user",
            CustomerType::Team => "team",
            CustomerType::Custom => "custom",
        }
    }
}

impl std::fmt::Display for CustomerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CustomerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(CustomerType::User),
            "team" => Ok(CustomerType::Team),
            "custom" => Ok(CustomerType::Custom),
            other => Err(format!(
                "Unknown customer type: '{}'. Valid options: user, team, custom",
                other
            )),
        }
    }
}

/// A user, team or custom customer within a tenancy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Customer {
    pub customer_type: CustomerType,
    pub customer_id: String,
}

impl Customer {
    pub fn new(customer_type: CustomerType, customer_id: impl Into<String>) -> Self {
        Customer {
            customer_type,
            customer_id: customer_id.into(),
        }
    }
}

// =============================================================================
// Purchase Rows
// =============================================================================

/// Where a subscription or one-time purchase row came from.
///
/// `TestMode` rows produce `test_mode` transactions without money transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PurchaseCreationSource {
    PurchasePage,
    TestMode,
    ApiGrant,
}

impl PurchaseCreationSource {
    pub fn is_test_mode(&self) -> bool {
        matches!(self, PurchaseCreationSource::TestMode)
    }
}

/// Provider-side subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Incomplete,
    Canceled,
}

// =============================================================================
// Products
// =============================================================================

/// When granted item quantities stop counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "kebab-case")]
#[ts(export)]
pub enum ItemExpiry {
    #[default]
    Never,
    WhenPurchaseExpires,
    WhenRepeated,
}

/// An item bundled with a product.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IncludedItem {
    #[serde(default)]
    pub quantity: i64,

    #[serde(default, with = "repeat_or_never")]
    pub repeat: Option<RepeatInterval>,

    #[serde(default)]
    pub expires: ItemExpiry,
}

/// One price tier of a product.
///
/// Currency amounts are flattened next to the tier settings, so a config
/// entry reads `{ USD = "9.99", interval = [1, "month"] }`. Values that are
/// not strings are carried along and ignored when charging.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Price {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<RepeatInterval>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_trial: Option<RepeatInterval>,

    #[serde(default)]
    pub server_only: bool,

    #[serde(flatten)]
    pub amounts: IndexMap<String, serde_json::Value>,
}

impl Price {
    /// Builds a price from `(currency, amount)` pairs.
    pub fn from_amounts<'a>(amounts: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Price {
            amounts: amounts
                .into_iter()
                .map(|(c, a)| (c.to_string(), serde_json::Value::String(a.to_string())))
                .collect(),
            ..Price::default()
        }
    }

    pub fn with_interval(mut self, interval: RepeatInterval) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// Marker for the `"include-by-default"` prices keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncludeByDefault {
    #[serde(rename = "include-by-default")]
    IncludeByDefault,
}

/// Prices of a product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prices {
    /// Free fallback product owned when nothing paid covers it.
    IncludeByDefault(IncludeByDefault),
    /// Price id → tier, in declaration order.
    Priced(IndexMap<String, Price>),
}

impl Default for Prices {
    fn default() -> Self {
        Prices::Priced(IndexMap::new())
    }
}

impl Prices {
    pub fn is_include_by_default(&self) -> bool {
        matches!(self, Prices::IncludeByDefault(_))
    }

    pub fn get(&self, price_id: &str) -> Option<&Price> {
        match self {
            Prices::IncludeByDefault(_) => None,
            Prices::Priced(prices) => prices.get(price_id),
        }
    }

    /// First declared price tier.
    pub fn first(&self) -> Option<(&String, &Price)> {
        match self {
            Prices::IncludeByDefault(_) => None,
            Prices::Priced(prices) => prices.first(),
        }
    }
}

/// A product definition or snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    pub customer_type: CustomerType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_line_id: Option<String>,

    /// Base products this add-on requires (any one of them).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub is_add_on_to: Vec<String>,

    #[serde(default)]
    pub stackable: bool,

    #[serde(default)]
    pub server_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_trial: Option<RepeatInterval>,

    #[serde(default)]
    pub prices: Prices,

    #[serde(default)]
    pub included_items: IndexMap<String, IncludedItem>,
}

impl Product {
    /// Creates an empty, priceless product for the given customer type.
    pub fn new(customer_type: CustomerType) -> Self {
        Product {
            display_name: None,
            customer_type,
            product_line_id: None,
            is_add_on_to: Vec::new(),
            stackable: false,
            server_only: false,
            free_trial: None,
            prices: Prices::default(),
            included_items: IndexMap::new(),
        }
    }

    pub fn is_add_on(&self) -> bool {
        !self.is_add_on_to.is_empty()
    }

    /// Price tier by id, if this product is priced.
    pub fn price(&self, price_id: &str) -> Option<&Price> {
        self.prices.get(price_id)
    }
}

/// A product line (exclusivity group).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProductLine {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_type: Option<CustomerType>,
}

/// A countable entitlement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ItemConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_type: Option<CustomerType>,
}

// =============================================================================
// Tenancy
// =============================================================================

/// Map of product id → product, used for default-product snapshots.
pub type ProductSnapshot = IndexMap<String, Product>;

/// The `payments` block of a tenancy config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PaymentsConfig {
    #[serde(default)]
    pub products: IndexMap<String, Product>,

    #[serde(default)]
    pub product_lines: IndexMap<String, ProductLine>,

    #[serde(default)]
    pub items: IndexMap<String, ItemConfig>,
}

impl PaymentsConfig {
    /// Every configured product whose prices are `"include-by-default"`.
    pub fn default_products(&self) -> ProductSnapshot {
        self.products
            .iter()
            .filter(|(_, product)| product.prices.is_include_by_default())
            .map(|(id, product)| (id.clone(), product.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TenancyConfig {
    #[serde(default)]
    pub payments: PaymentsConfig,
}

/// An isolated customer environment with its own config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenancy {
    pub id: String,
    pub project_id: String,
    #[serde(default)]
    pub config: TenancyConfig,
}

// =============================================================================
// Owned Products (resolver output)
// =============================================================================

/// How an owned product came to be owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum OwnedProductKind {
    #[serde(rename = "one_time")]
    OneTime,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "include-by-default")]
    IncludeByDefault,
}

/// Subscription-specific fields of an owned product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub subscription_id: String,
    /// `None` for test-mode and API-granted subscriptions.
    pub provider_subscription_id: Option<String>,
    pub cancel_at_period_end: bool,
    pub is_cancelable: bool,
}

/// A product the customer owns as of the query instant.
///
/// Materialized fresh on every query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnedProduct {
    /// `None` for inline products.
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: OwnedProductKind,
    pub quantity: i64,
    pub product: Product,
    pub created_at_millis: i64,
    /// Subscription id, one-time purchase id, or the granting transaction id.
    pub source_id: String,
    pub subscription: Option<SubscriptionDetails>,
}

impl OwnedProduct {
    pub fn product_line_id(&self) -> Option<&str> {
        self.product.product_line_id.as_deref()
    }

    pub fn is_default(&self) -> bool {
        self.kind == OwnedProductKind::IncludeByDefault
    }
}
