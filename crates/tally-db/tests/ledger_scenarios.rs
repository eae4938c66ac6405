//! End-to-end ledger scenarios against an in-memory database.
//!
//! Each test writes purchase rows the way the payment flows would, then
//! asks the resolvers what the customer owns at chosen instants.

use futures_util::future::BoxFuture;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::sync::Mutex;
use tally_core::purchase::AccessType;
use tally_core::{
    Customer, CustomerType, IncludeByDefault, IncludedItem, IntervalUnit, ItemExpiry,
    OwnedProductKind, PaymentsConfig, Price, Prices, Product, ProductLine,
    PurchaseCreationSource, RepeatInterval, SubscriptionStatus, Tenancy, TenancyConfig,
    TransactionEntry, TransactionType,
};
use tally_db::repository::one_time_purchase::{NewOneTimePurchase, OneTimePurchaseRow};
use tally_db::repository::subscription::{NewSubscription, SubscriptionRow};
use tally_db::{
    Database, DbConfig, GrantRequest, GrantResult, Ledger, PageQuery, PaymentProvider,
    PaymentsError, ProviderError, TransactionFilter,
};

/// 2025-01-01T00:00:00Z
const T0: i64 = 1_735_689_600_000;
const SECOND: i64 = 1_000;
const DAY: i64 = 86_400_000;
const TENANCY: &str = "t1";
const CUSTOMER: &str = "acme";

fn weekly() -> RepeatInterval {
    RepeatInterval::new(1, IntervalUnit::Week)
}

fn item(quantity: i64, repeat: Option<RepeatInterval>, expires: ItemExpiry) -> IncludedItem {
    IncludedItem {
        quantity,
        repeat,
        expires,
    }
}

fn priced(
    line: Option<&str>,
    interval: Option<RepeatInterval>,
    items: &[(&str, IncludedItem)],
) -> Product {
    let mut product = Product::new(CustomerType::Custom);
    product.product_line_id = line.map(str::to_string);
    let mut price = Price::from_amounts([("USD", "10")]);
    price.interval = interval;
    product.prices = Prices::Priced(IndexMap::from([("default".to_string(), price)]));
    for (item_id, included) in items {
        product.included_items.insert(item_id.to_string(), included.clone());
    }
    product
}

async fn ledger_with(payments: PaymentsConfig) -> Ledger {
    let db = Database::new(DbConfig::in_memory()).await.unwrap();
    Ledger::new(
        db,
        Tenancy {
            id: TENANCY.into(),
            project_id: "p1".into(),
            config: TenancyConfig { payments },
        },
    )
}

fn customer() -> Customer {
    Customer::new(CustomerType::Custom, CUSTOMER)
}

async fn subscribe(
    ledger: &Ledger,
    product_id: &str,
    at: i64,
    creation_source: PurchaseCreationSource,
) -> SubscriptionRow {
    ledger
        .db()
        .subscriptions()
        .insert(
            TENANCY,
            &NewSubscription {
                customer: customer(),
                product_id: Some(product_id.into()),
                price_id: Some("default".into()),
                product: ledger.payments().products[product_id].clone(),
                quantity: 1,
                status: SubscriptionStatus::Active,
                stripe_subscription_id: None,
                current_period_start_millis: at,
                current_period_end_millis: Some(at + 7 * DAY),
                billing_cycle_anchor_millis: None,
                creation_source,
                created_at_millis: at,
            },
        )
        .await
        .unwrap()
}

async fn buy(ledger: &Ledger, product_id: &str, quantity: i64, at: i64) -> OneTimePurchaseRow {
    ledger
        .db()
        .one_time_purchases()
        .insert(
            TENANCY,
            &NewOneTimePurchase {
                customer: customer(),
                product_id: Some(product_id.into()),
                price_id: Some("default".into()),
                product: ledger.payments().products[product_id].clone(),
                quantity,
                creation_source: PurchaseCreationSource::PurchasePage,
                created_at_millis: at,
            },
        )
        .await
        .unwrap()
}

async fn quantity(ledger: &Ledger, item_id: &str, now: i64) -> i64 {
    ledger
        .get_item_quantity_for_customer(CustomerType::Custom, CUSTOMER, item_id, Some(now))
        .await
        .unwrap()
}

async fn owned_ids(ledger: &Ledger, now: i64) -> Vec<String> {
    ledger
        .get_owned_products_for_customer(CustomerType::Custom, CUSTOMER, Some(now))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|p| p.id)
        .collect()
}

// =============================================================================
// Repeating Items
// =============================================================================

async fn weekly_pack(expires: ItemExpiry) -> Ledger {
    let mut payments = PaymentsConfig::default();
    payments.products.insert(
        "pack".into(),
        priced(None, None, &[("credits", item(10, Some(weekly()), expires))]),
    );
    let ledger = ledger_with(payments).await;
    buy(&ledger, "pack", 1, T0).await;
    ledger
}

#[tokio::test]
async fn test_weekly_when_repeated_keeps_current_window() {
    let ledger = weekly_pack(ItemExpiry::WhenRepeated).await;
    assert_eq!(quantity(&ledger, "credits", T0 + 28 * DAY).await, 10);
    assert_eq!(quantity(&ledger, "credits", T0 + 3 * DAY).await, 10);
}

#[tokio::test]
async fn test_weekly_never_accumulates() {
    let ledger = weekly_pack(ItemExpiry::Never).await;
    assert_eq!(quantity(&ledger, "credits", T0 + 28 * DAY).await, 50);
    assert_eq!(quantity(&ledger, "credits", T0 + 28 * DAY - 1).await, 40);
}

#[tokio::test]
async fn test_backdated_billing_anchor_renews_from_purchase() {
    let mut payments = PaymentsConfig::default();
    payments.products.insert(
        "plan".into(),
        priced(
            None,
            Some(weekly()),
            &[("credits", item(10, Some(weekly()), ItemExpiry::WhenRepeated))],
        ),
    );
    let ledger = ledger_with(payments).await;
    ledger
        .db()
        .subscriptions()
        .insert(
            TENANCY,
            &NewSubscription {
                customer: customer(),
                product_id: Some("plan".into()),
                price_id: Some("default".into()),
                product: ledger.payments().products["plan"].clone(),
                quantity: 1,
                status: SubscriptionStatus::Active,
                stripe_subscription_id: None,
                current_period_start_millis: T0,
                current_period_end_millis: Some(T0 + 7 * DAY),
                billing_cycle_anchor_millis: Some(T0 - 21 * DAY),
                creation_source: PurchaseCreationSource::PurchasePage,
                created_at_millis: T0,
            },
        )
        .await
        .unwrap();

    assert_eq!(quantity(&ledger, "credits", T0 + DAY).await, 10);
    assert_eq!(quantity(&ledger, "credits", T0 + 7 * DAY).await, 10);
    assert_eq!(quantity(&ledger, "credits", T0 + 30 * DAY).await, 10);
}

// =============================================================================
// Subscription End / Refund
// =============================================================================

#[tokio::test]
async fn test_subscription_end_revokes_and_expires_seats() {
    let mut payments = PaymentsConfig::default();
    payments.products.insert(
        "team".into(),
        priced(
            None,
            Some(weekly()),
            &[("seats", item(4, None, ItemExpiry::WhenPurchaseExpires))],
        ),
    );
    let ledger = ledger_with(payments).await;
    let row = subscribe(&ledger, "team", T0, PurchaseCreationSource::PurchasePage).await;

    let t_end = T0 + 10 * DAY;
    ledger
        .db()
        .subscriptions()
        .set_ended(TENANCY, &row.id, t_end)
        .await
        .unwrap();

    assert_eq!(owned_ids(&ledger, t_end - SECOND).await, vec!["team"]);
    assert_eq!(quantity(&ledger, "seats", t_end - SECOND).await, 4);

    assert!(owned_ids(&ledger, t_end + SECOND).await.is_empty());
    assert_eq!(quantity(&ledger, "seats", t_end + SECOND).await, 0);
}

#[tokio::test]
async fn test_refund_removes_product_and_items() {
    let mut payments = PaymentsConfig::default();
    let mut pack = priced(
        None,
        None,
        &[("credits", item(50, None, ItemExpiry::WhenPurchaseExpires))],
    );
    pack.stackable = true;
    payments.products.insert("pack".into(), pack);
    let ledger = ledger_with(payments).await;

    let kept = buy(&ledger, "pack", 2, T0).await;
    let refunded = buy(&ledger, "pack", 3, T0 + SECOND).await;
    ledger
        .db()
        .one_time_purchases()
        .set_refunded(TENANCY, &refunded.id, T0 + DAY)
        .await
        .unwrap();

    let owned = ledger
        .get_owned_products_for_customer(CustomerType::Custom, CUSTOMER, Some(T0 + 2 * DAY))
        .await
        .unwrap();
    assert_eq!(owned.len(), 1);
    assert_eq!(owned[0].source_id, kept.id);
    assert_eq!(owned[0].quantity, 2);
    assert_eq!(owned[0].kind, OwnedProductKind::OneTime);

    // 2 × 50 survive; the refunded 3 × 50 are expired again.
    assert_eq!(quantity(&ledger, "credits", T0 + 2 * DAY).await, 100);
    assert_eq!(quantity(&ledger, "credits", T0 + DAY - 1).await, 250);
}

#[tokio::test]
async fn test_ended_then_refunded_subscription_revokes_once() {
    let mut payments = PaymentsConfig::default();
    payments.products.insert(
        "team".into(),
        priced(
            None,
            Some(weekly()),
            &[("seats", item(4, None, ItemExpiry::WhenPurchaseExpires))],
        ),
    );
    let ledger = ledger_with(payments).await;
    let row = subscribe(&ledger, "team", T0, PurchaseCreationSource::PurchasePage).await;
    let subscriptions = ledger.db().subscriptions();
    subscriptions.set_ended(TENANCY, &row.id, T0 + DAY).await.unwrap();
    subscriptions
        .set_refunded(TENANCY, &row.id, T0 + 2 * DAY)
        .await
        .unwrap();

    assert!(owned_ids(&ledger, T0 + 3 * DAY).await.is_empty());
    assert_eq!(quantity(&ledger, "seats", T0 + 3 * DAY).await, 0);

    let history = ledger
        .customer_history(CustomerType::Custom, CUSTOMER, T0 + 3 * DAY)
        .await
        .unwrap();
    let refund = history
        .iter()
        .find(|tx| tx.kind == TransactionType::PurchaseRefund)
        .unwrap();
    assert!(refund
        .entries
        .iter()
        .all(|e| !matches!(e, TransactionEntry::ProductRevocation(_))));
    assert!(refund
        .entries
        .iter()
        .any(|e| matches!(e, TransactionEntry::MoneyTransfer(_))));
}

#[tokio::test]
async fn test_test_mode_refund_moves_no_money() {
    let mut payments = PaymentsConfig::default();
    payments
        .products
        .insert("team".into(), priced(None, Some(weekly()), &[]));
    let ledger = ledger_with(payments).await;
    let row = subscribe(&ledger, "team", T0, PurchaseCreationSource::TestMode).await;
    ledger
        .db()
        .subscriptions()
        .set_refunded(TENANCY, &row.id, T0 + DAY)
        .await
        .unwrap();

    let history = ledger
        .customer_history(CustomerType::Custom, CUSTOMER, T0 + 2 * DAY)
        .await
        .unwrap();
    assert!(history.iter().all(|tx| tx.test_mode));
    assert!(history.iter().all(|tx| tx
        .entries
        .iter()
        .all(|e| !matches!(e, TransactionEntry::MoneyTransfer(_)))));
}

// =============================================================================
// Additivity
// =============================================================================

#[tokio::test]
async fn test_mixed_sources_add_up() {
    let mut payments = PaymentsConfig::default();
    payments.products.insert(
        "plan".into(),
        priced(
            None,
            Some(weekly()),
            &[("x", item(100, None, ItemExpiry::WhenPurchaseExpires))],
        ),
    );
    let mut pack = priced(None, None, &[("x", item(50, None, ItemExpiry::Never))]);
    pack.stackable = true;
    payments.products.insert("pack".into(), pack);
    let ledger = ledger_with(payments).await;

    subscribe(&ledger, "plan", T0, PurchaseCreationSource::PurchasePage).await;
    buy(&ledger, "pack", 2, T0 + SECOND).await;
    ledger
        .db()
        .item_quantity_changes()
        .insert(TENANCY, &customer(), "x", 25, None, T0 + 2 * SECOND)
        .await
        .unwrap();

    assert_eq!(quantity(&ledger, "x", T0 + DAY).await, 225);
    assert_eq!(quantity(&ledger, "x", T0 + SECOND).await, 200);
}

// =============================================================================
// Default Products
// =============================================================================

async fn plans_ledger() -> Ledger {
    let mut payments = PaymentsConfig::default();
    payments.product_lines.insert("plans".into(), ProductLine::default());

    let mut free = Product::new(CustomerType::Custom);
    free.product_line_id = Some("plans".into());
    free.prices = Prices::IncludeByDefault(IncludeByDefault::IncludeByDefault);
    free.included_items
        .insert("credits".into(), item(5, Some(weekly()), ItemExpiry::WhenRepeated));
    payments.products.insert("free".into(), free);

    payments.products.insert(
        "pro".into(),
        priced(
            Some("plans"),
            Some(weekly()),
            &[("credits", item(100, None, ItemExpiry::WhenPurchaseExpires))],
        ),
    );
    payments
        .products
        .insert("basic".into(), priced(Some("plans"), Some(weekly()), &[]));

    let ledger = ledger_with(payments).await;
    ledger
        .ensure_default_products_snapshot_up_to_date(T0)
        .await
        .unwrap();
    ledger
}

#[tokio::test]
async fn test_default_product_fills_gaps_in_line() {
    let ledger = plans_ledger().await;
    let row = subscribe(&ledger, "pro", T0 + 10 * DAY, PurchaseCreationSource::PurchasePage).await;
    ledger
        .db()
        .subscriptions()
        .set_ended(TENANCY, &row.id, T0 + 20 * DAY)
        .await
        .unwrap();

    // Queried newest first: each instant stands on its own.
    assert_eq!(owned_ids(&ledger, T0 + 25 * DAY).await, vec!["free"]);
    assert_eq!(owned_ids(&ledger, T0 + 15 * DAY).await, vec!["pro"]);
    assert_eq!(owned_ids(&ledger, T0 + 5 * DAY).await, vec!["free"]);
    assert_eq!(owned_ids(&ledger, T0 + 25 * DAY).await, vec!["free"]);

    let owned = ledger
        .get_owned_products_for_customer(CustomerType::Custom, CUSTOMER, Some(T0 + 5 * DAY))
        .await
        .unwrap();
    assert_eq!(owned[0].kind, OwnedProductKind::IncludeByDefault);
    assert_eq!(owned[0].quantity, 1);

    assert_eq!(quantity(&ledger, "credits", T0 + 5 * DAY).await, 5);
    assert_eq!(quantity(&ledger, "credits", T0 + 15 * DAY).await, 100);
    assert_eq!(quantity(&ledger, "credits", T0 + 25 * DAY).await, 5);
}

#[tokio::test]
async fn test_default_product_for_other_customer_type_is_skipped() {
    let ledger = plans_ledger().await;
    let user_id = uuid::Uuid::new_v4().to_string();
    ledger
        .db()
        .customers()
        .insert_user(TENANCY, &user_id, T0)
        .await
        .unwrap();
    let owned = ledger
        .get_owned_products_for_customer(CustomerType::User, &user_id, Some(T0 + DAY))
        .await
        .unwrap();
    assert!(owned.is_empty());
}

// =============================================================================
// Purchases
// =============================================================================

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

fn grant_request(ledger: &Ledger, product_id: &str, at: i64) -> GrantRequest {
    GrantRequest {
        customer_type: CustomerType::Custom,
        customer_id: CUSTOMER.into(),
        product: ledger
            .resolve_product(AccessType::Server, Some(product_id), None)
            .unwrap(),
        price_id: None,
        quantity: 1,
        creation_source: PurchaseCreationSource::PurchasePage,
        at_millis: at,
    }
}

#[tokio::test]
async fn test_grant_cancels_provider_subscription_in_line() {
    let ledger = plans_ledger().await;
    let row = ledger
        .db()
        .subscriptions()
        .insert(
            TENANCY,
            &NewSubscription {
                customer: customer(),
                product_id: Some("basic".into()),
                price_id: Some("default".into()),
                product: ledger.payments().products["basic"].clone(),
                quantity: 1,
                status: SubscriptionStatus::Active,
                stripe_subscription_id: Some("sub_provider_1".into()),
                current_period_start_millis: T0,
                current_period_end_millis: Some(T0 + 7 * DAY),
                billing_cycle_anchor_millis: None,
                creation_source: PurchaseCreationSource::PurchasePage,
                created_at_millis: T0,
            },
        )
        .await
        .unwrap();

    let owned = ledger
        .get_owned_products_for_customer(CustomerType::Custom, CUSTOMER, Some(T0 + DAY))
        .await
        .unwrap();
    let details = owned[0].subscription.as_ref().unwrap();
    assert_eq!(details.provider_subscription_id.as_deref(), Some("sub_provider_1"));

    let provider = RecordingProvider::default();
    let result = ledger
        .grant_product_to_customer(&grant_request(&ledger, "pro", T0 + DAY), &provider)
        .await
        .unwrap();
    assert!(matches!(result, GrantResult::Subscription { .. }));
    assert_eq!(*provider.cancelled.lock().unwrap(), vec!["sub_provider_1"]);

    // The provider owns the end; the local row is untouched.
    let row = ledger
        .db()
        .subscriptions()
        .get(TENANCY, &row.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.ended_at_millis, None);
}

#[tokio::test]
async fn test_include_by_default_grant_writes_nothing() {
    let ledger = plans_ledger().await;
    let result = ledger
        .grant_product_to_customer(
            &grant_request(&ledger, "free", T0 + DAY),
            &RecordingProvider::default(),
        )
        .await;
    // The default product is already owned and not stackable.
    assert!(matches!(
        result,
        Err(PaymentsError::ProductAlreadyGranted { .. })
    ));

    let mut request = grant_request(&ledger, "free", T0 + DAY);
    request.customer_id = "someone-else".into();
    request.at_millis = T0 - DAY;
    let result = ledger
        .grant_product_to_customer(&request, &RecordingProvider::default())
        .await
        .unwrap();
    assert_eq!(result, GrantResult::OneTime { purchase_id: None });
}

#[tokio::test]
async fn test_purchase_validation_messages() {
    let ledger = plans_ledger().await;

    let err = ledger
        .resolve_product(AccessType::Client, None, None)
        .unwrap_err();
    assert_eq!(err.to_string(), "Must specify either product_id or product_inline!");

    let err = ledger
        .resolve_product(AccessType::Server, Some("nope"), None)
        .unwrap_err();
    assert_eq!(err.status_code(), 404);

    let pro = ledger
        .resolve_product(AccessType::Server, Some("pro"), None)
        .unwrap();
    let err = ledger
        .validate_purchase_session(CUSTOMER, &pro, None, 2, Some(T0))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "This product is not stackable; quantity must be 1");

    let validated = ledger
        .validate_purchase_session(CUSTOMER, &pro, None, 1, Some(T0))
        .await
        .unwrap();
    assert_eq!(validated.selected_price.unwrap().price_id, "default");
    assert_eq!(validated.context.product_line_id.as_deref(), Some("plans"));
    // The default product never conflicts.
    assert!(validated.context.conflicting_products.is_empty());
}

// =============================================================================
// Transaction Feed
// =============================================================================

#[tokio::test]
async fn test_feed_pages_cover_every_transaction_once() {
    let ledger = plans_ledger().await;
    let sub = subscribe(&ledger, "pro", T0, PurchaseCreationSource::PurchasePage).await;
    ledger
        .db()
        .invoices()
        .insert(TENANCY, &sub.id, "in_1", true, T0)
        .await
        .unwrap();
    ledger
        .db()
        .invoices()
        .insert(TENANCY, &sub.id, "in_2", false, T0 + 7 * DAY)
        .await
        .unwrap();
    ledger
        .db()
        .item_quantity_changes()
        .insert(TENANCY, &customer(), "credits", 7, None, T0 + DAY)
        .await
        .unwrap();
    ledger
        .db()
        .subscriptions()
        .set_ended(TENANCY, &sub.id, T0 + 9 * DAY)
        .await
        .unwrap();

    let now = T0 + 10 * DAY;
    let mut query = PageQuery::first(2, TransactionFilter::default());
    let mut seen = Vec::new();
    loop {
        let page = ledger.list_transactions(&query, now).await.unwrap();
        assert!(page.items.len() <= 2);
        seen.extend(page.items.into_iter().map(|i| i.transaction));
        if page.is_last {
            break;
        }
        query.cursor = Some(page.cursor);
    }

    let ids: HashSet<&str> = seen.iter().map(|tx| tx.id.as_str()).collect();
    assert_eq!(ids.len(), seen.len());
    for pair in seen.windows(2) {
        assert!(
            (pair[0].created_at_millis, pair[0].id.as_str())
                >= (pair[1].created_at_millis, pair[1].id.as_str())
        );
    }
    let kinds: HashSet<TransactionType> = seen.iter().map(|tx| tx.kind).collect();
    for kind in [
        TransactionType::SubscriptionStart,
        TransactionType::SubscriptionEnd,
        TransactionType::SubscriptionRenewal,
        TransactionType::ManualItemQuantityChange,
        TransactionType::DefaultProductsChange,
    ] {
        assert!(kinds.contains(&kind), "missing {}", kind);
    }

    let renewals = ledger
        .list_transactions(
            &PageQuery::first(
                50,
                TransactionFilter::default().with_type(TransactionType::SubscriptionRenewal),
            ),
            now,
        )
        .await
        .unwrap();
    assert_eq!(renewals.items.len(), 1);
    assert!(renewals.is_last);
}
