#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use marketplace_service::api::AppState;
use marketplace_service::config::EngineConfig;
use marketplace_service::error::MarketError;
use marketplace_service::ledger;
use marketplace_service::models::*;
use marketplace_service::payments::{authorization_url, Checkout, PaymentGateway};
use marketplace_service::schema::*;
use marketplace_service::{run_migrations, DbPool};
use shared::CheckoutData;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock};
use uuid::Uuid;

static MIGRATED: OnceLock<()> = OnceLock::new();

/// Postgres pool for integration tests, or `None` when `TEST_DATABASE_URL` is unset.
///
/// Every test seeds its own uuid-scoped rows, so tests share one database safely.
pub async fn test_pool() -> Option<DbPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping database test");
        return None;
    };
    MIGRATED.get_or_init(|| run_migrations(&url).expect("failed to run migrations"));

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(url);
    let pool = DbPool::builder()
        .max_size(8)
        .min_idle(Some(1))
        .build(manager)
        .await
        .expect("failed to build pool");
    Some(pool)
}

pub fn dec(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).unwrap()
}

#[derive(Debug, Clone, Copy)]
pub struct Listing {
    pub merchant_id: Uuid,
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub inventory_id: Uuid,
}

async fn insert_product(conn: &mut AsyncPgConnection, merchant_id: Uuid, price: &str) -> Uuid {
    let product = NewProduct {
        id: Uuid::new_v4(),
        merchant_id,
        name: format!("product-{}", Uuid::new_v4().simple()),
        base_price: dec(price),
        is_active: true,
    };
    diesel::insert_into(products::table)
        .values(&product)
        .execute(conn)
        .await
        .unwrap();
    product.id
}

async fn insert_inventory(
    conn: &mut AsyncPgConnection,
    merchant_id: Uuid,
    product_id: Option<Uuid>,
    variant_id: Option<Uuid>,
    quantity: i32,
    backorder_allowed: bool,
) -> Uuid {
    let row = NewInventory {
        id: Uuid::new_v4(),
        product_id,
        variant_id,
        merchant_id,
        quantity,
        reserved_quantity: 0,
        low_stock_threshold: 5,
        backorder_allowed,
    };
    diesel::insert_into(inventory::table)
        .values(&row)
        .execute(conn)
        .await
        .unwrap();
    row.id
}

/// A simple product with product-level stock, owned by `merchant_id`.
pub async fn listing_for(pool: &DbPool, merchant_id: Uuid, price: &str, quantity: i32) -> Listing {
    let mut conn = pool.get().await.unwrap();
    let product_id = insert_product(&mut conn, merchant_id, price).await;
    let inventory_id = insert_inventory(&mut conn, merchant_id, Some(product_id), None, quantity, false).await;
    Listing {
        merchant_id,
        product_id,
        variant_id: None,
        inventory_id,
    }
}

pub async fn listing(pool: &DbPool, price: &str, quantity: i32) -> Listing {
    listing_for(pool, Uuid::new_v4(), price, quantity).await
}

pub async fn backorder_listing(pool: &DbPool, price: &str, quantity: i32) -> Listing {
    let mut conn = pool.get().await.unwrap();
    let merchant_id = Uuid::new_v4();
    let product_id = insert_product(&mut conn, merchant_id, price).await;
    let inventory_id = insert_inventory(&mut conn, merchant_id, Some(product_id), None, quantity, true).await;
    Listing {
        merchant_id,
        product_id,
        variant_id: None,
        inventory_id,
    }
}

/// A product whose stock is tracked on one variant priced differently from the base.
pub async fn variant_listing(pool: &DbPool, base_price: &str, variant_price: &str, quantity: i32) -> Listing {
    let mut conn = pool.get().await.unwrap();
    let merchant_id = Uuid::new_v4();
    let product_id = insert_product(&mut conn, merchant_id, base_price).await;
    let variant = NewProductVariant {
        id: Uuid::new_v4(),
        product_id,
        name: "large".to_string(),
        price: dec(variant_price),
        is_active: true,
    };
    diesel::insert_into(product_variants::table)
        .values(&variant)
        .execute(&mut conn)
        .await
        .unwrap();
    let inventory_id = insert_inventory(&mut conn, merchant_id, None, Some(variant.id), quantity, false).await;
    Listing {
        merchant_id,
        product_id,
        variant_id: Some(variant.id),
        inventory_id,
    }
}

pub async fn deactivate_product(pool: &DbPool, product_id: Uuid) {
    let mut conn = pool.get().await.unwrap();
    diesel::update(products::table.find(product_id))
        .set(products::is_active.eq(false))
        .execute(&mut conn)
        .await
        .unwrap();
}

pub async fn stock(pool: &DbPool, inventory_id: Uuid) -> Inventory {
    let mut conn = pool.get().await.unwrap();
    ledger::get(&mut conn, inventory_id).await.unwrap()
}

/// Moves an order's creation time into the past so the sweeper sees it.
pub async fn backdate_order(pool: &DbPool, order_id: Uuid, minutes: i64) {
    let mut conn = pool.get().await.unwrap();
    diesel::update(orders::table.find(order_id))
        .set(orders::created_at.eq(chrono::Utc::now() - chrono::Duration::minutes(minutes)))
        .execute(&mut conn)
        .await
        .unwrap();
}

pub async fn order_splits(pool: &DbPool, order_id: Uuid) -> Vec<OrderMerchantSplit> {
    let mut conn = pool.get().await.unwrap();
    marketplace_service::settlement::splits_for_order(&mut conn, order_id)
        .await
        .unwrap()
}

pub async fn outbox_types(pool: &DbPool, aggregate_id: Uuid) -> Vec<String> {
    let mut conn = pool.get().await.unwrap();
    outbox_events::table
        .filter(outbox_events::aggregate_id.eq(aggregate_id))
        .order(outbox_events::created_at.asc())
        .select(outbox_events::event_type)
        .load::<String>(&mut conn)
        .await
        .unwrap()
}

/// Payment gateway double that records every call.
#[derive(Default)]
pub struct RecordingGateway {
    pub fail_checkout: bool,
    pub fail_refunds: bool,
    pub checkouts: Mutex<Vec<CheckoutData>>,
    pub verifications: Mutex<Vec<(Uuid, String)>>,
    pub refunds: Mutex<Vec<(Uuid, String)>>,
}

impl RecordingGateway {
    pub fn refunds(&self) -> Vec<(Uuid, String)> {
        self.refunds.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn initiate_checkout(&self, checkout: &CheckoutData) -> Result<Checkout, MarketError> {
        if self.fail_checkout {
            return Err(MarketError::Payment("checkout unavailable".into()));
        }
        self.checkouts.lock().unwrap().push(checkout.clone());
        Ok(Checkout {
            reference: checkout.reference.clone(),
            authorization_url: authorization_url("http://pay.test/checkout", &checkout.reference),
        })
    }

    async fn verify_payment(&self, order_id: Uuid, reference: &str) -> Result<(), MarketError> {
        self.verifications
            .lock()
            .unwrap()
            .push((order_id, reference.to_string()));
        Ok(())
    }

    async fn request_refund(&self, order_id: Uuid, reference: &str) -> Result<(), MarketError> {
        if self.fail_refunds {
            return Err(MarketError::Payment("refund rejected".into()));
        }
        self.refunds
            .lock()
            .unwrap()
            .push((order_id, reference.to_string()));
        Ok(())
    }
}

pub fn engine(pool: &DbPool, gateway: Arc<RecordingGateway>) -> AppState {
    AppState::new(pool.clone(), EngineConfig::default(), gateway)
}

/// Ends the escrow hold on every split of an order.
pub async fn release_escrow(pool: &DbPool, order_id: Uuid) {
    let mut conn = pool.get().await.unwrap();
    diesel::update(order_merchant_splits::table.filter(order_merchant_splits::order_id.eq(order_id)))
        .set(order_merchant_splits::hold_until.eq(chrono::Utc::now() - chrono::Duration::minutes(1)))
        .execute(&mut conn)
        .await
        .unwrap();
}

/// An active product with no inventory row behind it.
pub async fn unstocked_product(pool: &DbPool) -> Uuid {
    let mut conn = pool.get().await.unwrap();
    insert_product(&mut conn, Uuid::new_v4(), "10.00").await
}

/// Overwrites the reservation count directly, bypassing the ledger.
pub async fn force_reserved(pool: &DbPool, inventory_id: Uuid, reserved: i32) {
    let mut conn = pool.get().await.unwrap();
    diesel::update(inventory::table.find(inventory_id))
        .set(inventory::reserved_quantity.eq(reserved))
        .execute(&mut conn)
        .await
        .unwrap();
}
