//! # Purchases
//!
//! Validation of a prospective purchase against what the customer already
//! owns, and the grant that writes the new row.
//!
//! ## Grant Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  resolve product (id or inline)                                        │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  validate_purchase_session                                             │
//! │    1. customer exists                                                  │
//! │    2. price selection (explicit id, else first tier)                   │
//! │    3. quantity (range, stackable)                                      │
//! │    4. already owned / add-on base / one-time line conflict             │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  grant_product_to_customer                                             │
//! │    cancel conflicting subscription ── provider id? ──► provider cancel │
//! │                                    └─ otherwise ────► end row locally  │
//! │    no price        ──► OneTime { purchase_id: None }                   │
//! │    no interval     ──► one_time_purchases row                          │
//! │    interval        ──► subscriptions row (active)                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tally_core::interval::add_interval;
use tally_core::purchase::{
    check_ownership_rules, check_stackable, ensure_product_id_or_inline_product, select_price,
    AccessType, InlineProduct, PurchaseContext, ResolvedProduct, SelectedPrice,
};
use tally_core::validation::validate_purchase_quantity;
use tally_core::{CoreError, Customer, CustomerType, PurchaseCreationSource, SubscriptionStatus};
use tracing::{info, warn};

use crate::error::{PaymentsError, PaymentsResult, ProviderError};
use crate::ledger::Ledger;
use crate::repository::one_time_purchase::NewOneTimePurchase;
use crate::repository::subscription::NewSubscription;

// =============================================================================
// Payment Provider
// =============================================================================

/// Provider-side operations a grant may need.
pub trait PaymentProvider: Send + Sync {
    /// Cancels a subscription at the provider immediately.
    fn cancel_subscription<'a>(
        &'a self,
        provider_subscription_id: &'a str,
    ) -> BoxFuture<'a, Result<(), ProviderError>>;
}

/// Provider for deployments without one. Every cancel succeeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPaymentProvider;

impl PaymentProvider for NoopPaymentProvider {
    fn cancel_subscription<'a>(
        &'a self,
        provider_subscription_id: &'a str,
    ) -> BoxFuture<'a, Result<(), ProviderError>> {
        Box::pin(async move {
            warn!(
                provider_subscription_id = %provider_subscription_id,
                "No payment provider configured; skipping provider cancel"
            );
            Ok(())
        })
    }
}

// =============================================================================
// Requests / Results
// =============================================================================

/// A validated purchase, ready to be granted.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPurchase {
    /// `None` for include-by-default products.
    pub selected_price: Option<SelectedPrice>,
    pub context: PurchaseContext,
}

/// Everything needed to grant a product.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub customer_type: CustomerType,
    pub customer_id: String,
    pub product: ResolvedProduct,
    pub price_id: Option<String>,
    pub quantity: i64,
    pub creation_source: PurchaseCreationSource,
    /// Creation time of the new row.
    pub at_millis: i64,
}

/// The row a grant created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GrantResult {
    /// `purchase_id` is `None` when nothing was written (include-by-default).
    OneTime { purchase_id: Option<String> },
    Subscription { subscription_id: String },
}

// =============================================================================
// Validation
// =============================================================================

impl Ledger {
    /// Resolves `product_id` or `product_inline` against the tenancy config.
    pub fn resolve_product(
        &self,
        access: AccessType,
        product_id: Option<&str>,
        product_inline: Option<InlineProduct>,
    ) -> PaymentsResult<ResolvedProduct> {
        Ok(ensure_product_id_or_inline_product(
            self.payments(),
            access,
            product_id,
            product_inline,
        )?)
    }

    /// What the customer owns relative to `product`, as of `now`.
    pub async fn get_purchase_context(
        &self,
        customer_type: CustomerType,
        customer_id: &str,
        product: &ResolvedProduct,
        now: Option<i64>,
    ) -> PaymentsResult<PurchaseContext> {
        let owned = self
            .get_owned_products_for_customer(customer_type, customer_id, now)
            .await?;
        Ok(PurchaseContext::new(
            self.payments(),
            owned,
            &product.product,
            product.product_id.as_deref(),
        ))
    }

    /// Enforces the purchase rules for `customer_id` buying `product`.
    ///
    /// The customer type is the product's.
    ///
    /// ## Errors
    /// - `UserNotFound` / `TeamNotFound` for unknown customers
    /// - `Validation` for an unknown price id, a bad quantity, a missing
    ///   add-on base or a one-time purchase already in the product line
    /// - `ProductAlreadyGranted` for a non-stackable product already owned
    pub async fn validate_purchase_session(
        &self,
        customer_id: &str,
        product: &ResolvedProduct,
        price_id: Option<&str>,
        quantity: i64,
        now: Option<i64>,
    ) -> PaymentsResult<ValidatedPurchase> {
        let customer_type = product.product.customer_type;
        self.ensure_customer_exists(customer_type, customer_id).await?;

        let selected_price = select_price(&product.product, price_id)?;
        validate_purchase_quantity(quantity)?;
        check_stackable(&product.product, quantity)?;

        let context = self
            .get_purchase_context(customer_type, customer_id, product, now)
            .await?;
        check_ownership_rules(
            &context,
            &product.product,
            product.product_id.as_deref(),
            customer_id,
        )?;

        Ok(ValidatedPurchase {
            selected_price,
            context,
        })
    }

    // =========================================================================
    // Grant
    // =========================================================================

    /// Validates, replaces a conflicting subscription, and writes the
    /// purchase row.
    pub async fn grant_product_to_customer(
        &self,
        request: &GrantRequest,
        provider: &impl PaymentProvider,
    ) -> PaymentsResult<GrantResult> {
        if request.product.product.customer_type != request.customer_type {
            return Err(PaymentsError::Validation(format!(
                "Product is for {} customers, not {}",
                request.product.product.customer_type, request.customer_type
            )));
        }
        let validated = self
            .validate_purchase_session(
                &request.customer_id,
                &request.product,
                request.price_id.as_deref(),
                request.quantity,
                Some(request.at_millis),
            )
            .await?;

        let tenancy_id = self.tenancy().id.as_str();
        if let Some(conflicting) = validated.context.conflicting_subscription() {
            let provider_id = conflicting
                .subscription
                .as_ref()
                .and_then(|s| s.provider_subscription_id.as_deref());
            info!(
                tenancy_id = %tenancy_id,
                customer_id = %request.customer_id,
                subscription_id = %conflicting.source_id,
                via_provider = provider_id.is_some(),
                "Cancelling conflicting subscription"
            );
            match provider_id {
                Some(provider_id) => provider.cancel_subscription(provider_id).await?,
                None => {
                    self.db()
                        .subscriptions()
                        .end_now(tenancy_id, &conflicting.source_id, request.at_millis)
                        .await?
                }
            }
        }

        let Some(selected) = validated.selected_price else {
            return Ok(GrantResult::OneTime { purchase_id: None });
        };
        let customer = Customer::new(request.customer_type, request.customer_id.clone());

        let Some(interval) = selected.price.interval else {
            let row = self
                .db()
                .one_time_purchases()
                .insert(
                    tenancy_id,
                    &NewOneTimePurchase {
                        customer,
                        product_id: request.product.product_id.clone(),
                        price_id: Some(selected.price_id),
                        product: request.product.product.clone(),
                        quantity: request.quantity,
                        creation_source: request.creation_source,
                        created_at_millis: request.at_millis,
                    },
                )
                .await?;
            return Ok(GrantResult::OneTime {
                purchase_id: Some(row.id),
            });
        };

        let period_end = add_interval(request.at_millis, interval, 1).ok_or_else(|| {
            CoreError::invariant(format!("billing interval {} overflows", interval.key()))
        })?;
        let row = self
            .db()
            .subscriptions()
            .insert(
                tenancy_id,
                &NewSubscription {
                    customer,
                    product_id: request.product.product_id.clone(),
                    price_id: Some(selected.price_id),
                    product: request.product.product.clone(),
                    quantity: request.quantity,
                    status: SubscriptionStatus::Active,
                    stripe_subscription_id: None,
                    current_period_start_millis: request.at_millis,
                    current_period_end_millis: Some(period_end),
                    billing_cycle_anchor_millis: None,
                    creation_source: request.creation_source,
                    created_at_millis: request.at_millis,
                },
            )
            .await?;
        Ok(GrantResult::Subscription {
            subscription_id: row.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use indexmap::IndexMap;
    use std::sync::Mutex;
    use tally_core::{
        IntervalUnit, Price, Prices, Product, ProductLine, RepeatInterval, Tenancy, TenancyConfig,
    };

    const T0: i64 = 1_735_689_600_000;

    /// Records every cancel it is asked to perform.
    #[derive(Default)]
    struct RecordingProvider {
        cancelled: Mutex<Vec<String>>,
    }

    impl PaymentProvider for RecordingProvider {
        fn cancel_subscription<'a>(
            &'a self,
            provider_subscription_id: &'a str,
        ) -> BoxFuture<'a, Result<(), ProviderError>> {
            Box::pin(async move {
                self.cancelled
                    .lock()
                    .unwrap()
                    .push(provider_subscription_id.to_string());
                Ok(())
            })
        }
    }

    fn product(line: Option<&str>, interval: Option<RepeatInterval>) -> Product {
        let mut product = Product::new(CustomerType::Custom);
        product.product_line_id = line.map(str::to_string);
        let mut price = Price::from_amounts([("USD", "10")]);
        price.interval = interval;
        product.prices = Prices::Priced(IndexMap::from([("default".to_string(), price)]));
        product
    }

    async fn ledger() -> Ledger {
        let weekly = Some(RepeatInterval::new(1, IntervalUnit::Week));
        let mut config = tally_core::PaymentsConfig::default();
        config.product_lines.insert("plans".into(), ProductLine::default());
        config.products.insert("basic".into(), product(Some("plans"), weekly));
        config.products.insert("pro".into(), product(Some("plans"), weekly));
        config.products.insert("lifetime".into(), product(Some("plans"), None));
        config.products.insert("credits-pack".into(), product(None, None));

        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        Ledger::new(
            db,
            Tenancy {
                id: "t1".into(),
                project_id: "p1".into(),
                config: TenancyConfig { payments: config },
            },
        )
    }

    fn request(ledger: &Ledger, product_id: &str, at: i64) -> GrantRequest {
        GrantRequest {
            customer_type: CustomerType::Custom,
            customer_id: "acme".into(),
            product: ledger
                .resolve_product(AccessType::Server, Some(product_id), None)
                .unwrap(),
            price_id: None,
            quantity: 1,
            creation_source: PurchaseCreationSource::ApiGrant,
            at_millis: at,
        }
    }

    #[tokio::test]
    async fn test_grant_one_time_purchase() {
        let ledger = ledger().await;
        let result = ledger
            .grant_product_to_customer(&request(&ledger, "credits-pack", T0), &NoopPaymentProvider)
            .await
            .unwrap();
        let GrantResult::OneTime {
            purchase_id: Some(id),
        } = result
        else {
            panic!("expected a one-time purchase, got {:?}", result);
        };
        let row = ledger
            .db()
            .one_time_purchases()
            .get("t1", &id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.price_id.as_deref(), Some("default"));
    }

    #[tokio::test]
    async fn test_grant_subscription_sets_period_end() {
        let ledger = ledger().await;
        let result = ledger
            .grant_product_to_customer(&request(&ledger, "basic", T0), &NoopPaymentProvider)
            .await
            .unwrap();
        let GrantResult::Subscription { subscription_id } = result else {
            panic!("expected a subscription, got {:?}", result);
        };
        let row = ledger
            .db()
            .subscriptions()
            .get("t1", &subscription_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Active);
        assert_eq!(row.current_period_end_millis, Some(T0 + 7 * 86_400_000));
    }

    #[tokio::test]
    async fn test_grant_replaces_local_subscription() {
        let ledger = ledger().await;
        let provider = RecordingProvider::default();
        let GrantResult::Subscription {
            subscription_id: basic,
        } = ledger
            .grant_product_to_customer(&request(&ledger, "basic", T0), &provider)
            .await
            .unwrap()
        else {
            panic!("expected a subscription");
        };

        ledger
            .grant_product_to_customer(&request(&ledger, "pro", T0 + 1000), &provider)
            .await
            .unwrap();

        let row = ledger
            .db()
            .subscriptions()
            .get("t1", &basic)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.ended_at_millis, Some(T0 + 1000));
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert!(provider.cancelled.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let ledger = ledger().await;
        let basic = ledger
            .resolve_product(AccessType::Server, Some("basic"), None)
            .unwrap();

        let err = ledger
            .validate_purchase_session("acme", &basic, Some("missing"), 1, Some(T0))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Price not found on product associated with this purchase code"
        );

        let err = ledger
            .validate_purchase_session("acme", &basic, None, 2, Some(T0))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        ledger
            .grant_product_to_customer(&request(&ledger, "basic", T0), &NoopPaymentProvider)
            .await
            .unwrap();
        let err = ledger
            .validate_purchase_session("acme", &basic, None, 1, Some(T0 + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentsError::ProductAlreadyGranted { .. }));
    }

    #[tokio::test]
    async fn test_one_time_blocks_line() {
        let ledger = ledger().await;
        ledger
            .grant_product_to_customer(&request(&ledger, "lifetime", T0), &NoopPaymentProvider)
            .await
            .unwrap();
        let err = ledger
            .grant_product_to_customer(&request(&ledger, "pro", T0 + 1), &NoopPaymentProvider)
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Customer already has a one-time purchase in this product line"
        );
    }

    #[tokio::test]
    async fn test_customer_type_must_match_product() {
        let ledger = ledger().await;
        let mut req = request(&ledger, "basic", T0);
        req.customer_type = CustomerType::Team;
        let err = ledger
            .grant_product_to_customer(&req, &NoopPaymentProvider)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);
    }
}
