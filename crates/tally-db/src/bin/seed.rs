//! # Seed Data Generator
//!
//! Writes a small purchase history for one demo customer and prints what
//! the ledger resolves from it.
//!
//! ## Usage
//! ```bash
//! # Seed ./tally_dev.db with the built-in demo tenancy
//! cargo run -p tally-db --bin seed
//!
//! # Specify database path
//! cargo run -p tally-db --bin seed -- --db ./data/ledger.db
//!
//! # Use the payments config from a ledger.toml
//! cargo run -p tally-db --bin seed -- --config ./ledger.toml
//! ```
//!
//! ## Generated History
//! For the custom customer `demo-co`:
//! - `pro` subscription (weekly) granted 20 days ago
//! - two `credits-pack` one-time purchases
//! - a manual `credits` adjustment of +25
//! - the `free` plan as the include-by-default fallback

use chrono::{Duration, Utc};
use indexmap::IndexMap;
use std::env;
use std::path::PathBuf;
use tally_core::purchase::AccessType;
use tally_core::{
    Customer, CustomerType, IncludeByDefault, IncludedItem, IntervalUnit, ItemExpiry,
    PaymentsConfig, Price, Prices, Product, ProductLine, PurchaseCreationSource, RepeatInterval,
    Tenancy, TenancyConfig,
};
use tally_db::{
    Database, DbConfig, GrantRequest, Ledger, LedgerConfig, NoopPaymentProvider, PaymentsError,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const CUSTOMER_ID: &str = "demo-co";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tally_db=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Tenancy used when no config file is given.
fn demo_tenancy() -> Tenancy {
    let weekly = RepeatInterval::new(1, IntervalUnit::Week);
    let mut payments = PaymentsConfig::default();
    payments.product_lines.insert(
        "plans".into(),
        ProductLine {
            display_name: Some("Plans".into()),
            customer_type: Some(CustomerType::Custom),
        },
    );

    let mut free = Product::new(CustomerType::Custom);
    free.display_name = Some("Free".into());
    free.product_line_id = Some("plans".into());
    free.prices = Prices::IncludeByDefault(IncludeByDefault::IncludeByDefault);
    free.included_items.insert(
        "credits".into(),
        IncludedItem {
            quantity: 5,
            repeat: Some(weekly),
            expires: ItemExpiry::WhenRepeated,
        },
    );
    payments.products.insert("free".into(), free);

    let mut pro = Product::new(CustomerType::Custom);
    pro.display_name = Some("Pro".into());
    pro.product_line_id = Some("plans".into());
    pro.prices = Prices::Priced(IndexMap::from([(
        "weekly".to_string(),
        Price::from_amounts([("USD", "12.50"), ("EUR", "11")]).with_interval(weekly),
    )]));
    pro.included_items.insert(
        "seats".into(),
        IncludedItem {
            quantity: 4,
            repeat: None,
            expires: ItemExpiry::WhenPurchaseExpires,
        },
    );
    pro.included_items.insert(
        "credits".into(),
        IncludedItem {
            quantity: 100,
            repeat: Some(weekly),
            expires: ItemExpiry::WhenRepeated,
        },
    );
    payments.products.insert("pro".into(), pro);

    let mut pack = Product::new(CustomerType::Custom);
    pack.display_name = Some("Credits Pack".into());
    pack.stackable = true;
    pack.prices = Prices::Priced(IndexMap::from([(
        "once".to_string(),
        Price::from_amounts([("USD", "5")]),
    )]));
    pack.included_items.insert(
        "credits".into(),
        IncludedItem {
            quantity: 50,
            repeat: None,
            expires: ItemExpiry::Never,
        },
    );
    payments.products.insert("credits-pack".into(), pack);

    Tenancy {
        id: "demo".into(),
        project_id: "demo-project".into(),
        config: TenancyConfig { payments },
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    // Parse command line arguments
    let args: Vec<String> = env::args().collect();

    let mut db_path = String::from("./tally_dev.db");
    let mut config_path: Option<PathBuf> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>       Database file path (default: ./tally_dev.db)");
                println!("  -c, --config <PATH>   ledger.toml to take the tenancy from");
                println!("  -h, --help            Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    let (tenancy, page_size) = match config_path {
        Some(path) => {
            let config = LedgerConfig::load(Some(path))?;
            (config.tenancy(), config.page_size())
        }
        None => (demo_tenancy(), tally_core::DEFAULT_PAGE_SIZE),
    };

    let db = Database::new(DbConfig::new(&db_path)).await?;
    let ledger = Ledger::new(db, tenancy).with_page_size(page_size);
    info!(db = %db_path, tenancy_id = %ledger.tenancy().id, "Connected to database");

    let now = Utc::now();
    let owned = ledger
        .get_owned_products_for_customer(CustomerType::Custom, CUSTOMER_ID, None)
        .await?;
    if owned.iter().any(|p| !p.is_default()) {
        info!(customer_id = CUSTOMER_ID, "Customer already has purchases; skipping seed");
    } else {
        let grant = |product_id: &str, quantity: i64, at: i64| -> Result<GrantRequest, PaymentsError> {
            Ok(GrantRequest {
                customer_type: CustomerType::Custom,
                customer_id: CUSTOMER_ID.to_string(),
                product: ledger.resolve_product(AccessType::Server, Some(product_id), None)?,
                price_id: None,
                quantity,
                creation_source: PurchaseCreationSource::ApiGrant,
                at_millis: at,
            })
        };

        let subscribed_at = (now - Duration::days(20)).timestamp_millis();
        let provider = NoopPaymentProvider;
        for (product_id, quantity, at) in [
            ("pro", 1, subscribed_at),
            ("credits-pack", 2, subscribed_at + 1_000),
            ("credits-pack", 1, subscribed_at + 2_000),
        ] {
            let result = ledger
                .grant_product_to_customer(&grant(product_id, quantity, at)?, &provider)
                .await?;
            info!(product_id, ?result, "Granted");
        }

        ledger
            .db()
            .item_quantity_changes()
            .insert(
                &ledger.tenancy().id,
                &Customer::new(CustomerType::Custom, CUSTOMER_ID),
                "credits",
                25,
                Some("seed bonus"),
                subscribed_at + 3_000,
            )
            .await?;
    }

    let owned = ledger
        .get_owned_products_for_customer(CustomerType::Custom, CUSTOMER_ID, None)
        .await?;
    let payments = ledger.payments();
    let mut item_ids: Vec<&String> = payments.items.keys().collect();
    for product in payments.products.values() {
        for item_id in product.included_items.keys() {
            if !item_ids.contains(&item_id) {
                item_ids.push(item_id);
            }
        }
    }

    let mut items = serde_json::Map::new();
    for item_id in item_ids {
        let quantity = ledger
            .get_item_quantity_for_customer(CustomerType::Custom, CUSTOMER_ID, item_id, None)
            .await?;
        items.insert(item_id.clone(), quantity.into());
    }

    let report = serde_json::json!({
        "customer_id": CUSTOMER_ID,
        "owned_products": owned,
        "item_quantities": items,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    ledger.db().close().await;
    Ok(())
}
