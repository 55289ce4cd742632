//! Inventory ledger. The only code that writes `quantity` and `reserved_quantity`.
//!
//! Every movement is a single conditional `UPDATE`: the guard and the write happen in one
//! statement, so concurrent callers can never both pass a stale availability check. The
//! functions take a connection so callers can compose them inside their own transaction.

use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::Integer;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use shared::{InventoryTarget, StockStatus};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog;
use crate::error::{MarketError, MarketResult};
use crate::models::{Inventory, NewInventory};
use crate::schema::inventory;
use crate::DbPool;

diesel::sql_function!(fn greatest(a: Integer, b: Integer) -> Integer);

fn ensure_positive(quantity: i32) -> MarketResult<()> {
    if quantity <= 0 {
        return Err(MarketError::InvalidQuantity(quantity));
    }
    Ok(())
}

async fn exists(conn: &mut AsyncPgConnection, inventory_id: Uuid) -> MarketResult<bool> {
    let found = diesel::select(diesel::dsl::exists(inventory::table.find(inventory_id)))
        .get_result::<bool>(conn)
        .await?;
    Ok(found)
}

/// Turns a zero-row guarded update into the right error.
async fn rejected(conn: &mut AsyncPgConnection, inventory_id: Uuid, requested: i32) -> MarketError {
    match exists(conn, inventory_id).await {
        Ok(true) => MarketError::InsufficientStock {
            inventory_id,
            requested,
        },
        Ok(false) => MarketError::InventoryNotFound(inventory_id),
        Err(e) => e,
    }
}

/// Holds `quantity` units for a cart. Fails without side effects when fewer are available.
pub async fn reserve(conn: &mut AsyncPgConnection, inventory_id: Uuid, quantity: i32) -> MarketResult<Inventory> {
    ensure_positive(quantity)?;

    let updated = diesel::update(inventory::table)
        .filter(inventory::id.eq(inventory_id))
        .filter(
            (inventory::quantity - inventory::reserved_quantity)
                .ge(quantity)
                .or(inventory::backorder_allowed.eq(true)),
        )
        .set((
            inventory::reserved_quantity.eq(inventory::reserved_quantity + quantity),
            inventory::updated_at.eq(Utc::now()),
        ))
        .returning(Inventory::as_returning())
        .get_result(conn)
        .await
        .optional()?;

    match updated {
        Some(row) => Ok(row),
        None => Err(rejected(conn, inventory_id, quantity).await),
    }
}

/// Gives a reservation back. Clamped at zero so a double release cannot go negative.
pub async fn release(conn: &mut AsyncPgConnection, inventory_id: Uuid, quantity: i32) -> MarketResult<Inventory> {
    ensure_positive(quantity)?;

    diesel::update(inventory::table.find(inventory_id))
        .set((
            inventory::reserved_quantity.eq(greatest(inventory::reserved_quantity - quantity, 0)),
            inventory::updated_at.eq(Utc::now()),
        ))
        .returning(Inventory::as_returning())
        .get_result(conn)
        .await
        .optional()?
        .ok_or(MarketError::InventoryNotFound(inventory_id))
}

/// Converts a reservation into a sale: both counters drop by `quantity`.
pub async fn commit(conn: &mut AsyncPgConnection, inventory_id: Uuid, quantity: i32) -> MarketResult<Inventory> {
    ensure_positive(quantity)?;

    let updated = diesel::update(inventory::table)
        .filter(inventory::id.eq(inventory_id))
        .filter(inventory::reserved_quantity.ge(quantity))
        .set((
            inventory::quantity.eq(inventory::quantity - quantity),
            inventory::reserved_quantity.eq(inventory::reserved_quantity - quantity),
            inventory::updated_at.eq(Utc::now()),
        ))
        .returning(Inventory::as_returning())
        .get_result(conn)
        .await
        .optional()?;

    match updated {
        Some(row) => Ok(row),
        None => Err(rejected(conn, inventory_id, quantity).await),
    }
}

/// Puts sold units back on the shelf. Never touches reservations.
pub async fn restock(conn: &mut AsyncPgConnection, inventory_id: Uuid, quantity: i32) -> MarketResult<Inventory> {
    ensure_positive(quantity)?;

    diesel::update(inventory::table.find(inventory_id))
        .set((
            inventory::quantity.eq(inventory::quantity + quantity),
            inventory::updated_at.eq(Utc::now()),
        ))
        .returning(Inventory::as_returning())
        .get_result(conn)
        .await
        .optional()?
        .ok_or(MarketError::InventoryNotFound(inventory_id))
}

/// Merchant stock correction. A negative `delta` may not cut into units already reserved.
pub async fn adjust_stock(conn: &mut AsyncPgConnection, inventory_id: Uuid, delta: i32) -> MarketResult<Inventory> {
    if delta == 0 {
        return Err(MarketError::InvalidQuantity(delta));
    }

    let updated = diesel::update(inventory::table)
        .filter(inventory::id.eq(inventory_id))
        .filter(
            (inventory::quantity + delta)
                .ge(inventory::reserved_quantity)
                .or(inventory::backorder_allowed.eq(true)),
        )
        .set((
            inventory::quantity.eq(inventory::quantity + delta),
            inventory::updated_at.eq(Utc::now()),
        ))
        .returning(Inventory::as_returning())
        .get_result(conn)
        .await
        .optional()?;

    match updated {
        Some(row) => Ok(row),
        None => Err(rejected(conn, inventory_id, delta.abs()).await),
    }
}

pub async fn get(conn: &mut AsyncPgConnection, inventory_id: Uuid) -> MarketResult<Inventory> {
    inventory::table
        .find(inventory_id)
        .select(Inventory::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or(MarketError::InventoryNotFound(inventory_id))
}

/// `SELECT ... FOR UPDATE`; the row stays locked until the surrounding transaction ends.
pub async fn lock(conn: &mut AsyncPgConnection, inventory_id: Uuid) -> MarketResult<Inventory> {
    inventory::table
        .find(inventory_id)
        .select(Inventory::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or(MarketError::InventoryNotFound(inventory_id))
}

pub async fn find_for_target(
    conn: &mut AsyncPgConnection,
    target: InventoryTarget,
    merchant_id: Uuid,
) -> MarketResult<Option<Inventory>> {
    let query = inventory::table
        .filter(inventory::merchant_id.eq(merchant_id))
        .into_boxed();
    let query = match target {
        InventoryTarget::Product(id) => query.filter(inventory::product_id.eq(id)),
        InventoryTarget::Variant(id) => query.filter(inventory::variant_id.eq(id)),
    };

    let row = query
        .select(Inventory::as_select())
        .first(conn)
        .await
        .optional()?;
    Ok(row)
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInventory {
    pub target: InventoryTarget,
    pub quantity: i32,
    #[serde(default = "default_low_stock_threshold")]
    pub low_stock_threshold: i32,
    #[serde(default)]
    pub backorder_allowed: bool,
}

fn default_low_stock_threshold() -> i32 {
    5
}

#[derive(Debug, Clone, Serialize)]
pub struct InventoryView {
    #[serde(flatten)]
    pub inventory: Inventory,
    pub target: Option<InventoryTarget>,
    pub available: i32,
    pub stock_status: StockStatus,
}

impl From<Inventory> for InventoryView {
    fn from(inventory: Inventory) -> Self {
        let level = inventory.level();
        Self {
            target: inventory.target(),
            available: level.available(),
            stock_status: level.status(),
            inventory,
        }
    }
}

/// Merchant-facing inventory management on top of the ledger primitives.
#[derive(Clone)]
pub struct InventoryService {
    pool: DbPool,
}

impl InventoryService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, merchant_id: Uuid, request: CreateInventory) -> MarketResult<InventoryView> {
        if request.quantity < 0 {
            return Err(MarketError::InvalidQuantity(request.quantity));
        }
        if request.low_stock_threshold < 0 {
            return Err(MarketError::InvalidQuantity(request.low_stock_threshold));
        }

        let mut conn = self.pool.get().await?;
        let product = catalog::owning_product(&mut conn, request.target).await?;
        if product.merchant_id != merchant_id {
            return Err(MarketError::Unauthorized);
        }

        let row = NewInventory {
            id: Uuid::new_v4(),
            product_id: request.target.product_id(),
            variant_id: request.target.variant_id(),
            merchant_id,
            quantity: request.quantity,
            reserved_quantity: 0,
            low_stock_threshold: request.low_stock_threshold,
            backorder_allowed: request.backorder_allowed,
        };

        let created = diesel::insert_into(inventory::table)
            .values(&row)
            .returning(Inventory::as_returning())
            .get_result(&mut conn)
            .await
            .map_err(|e| match e {
                DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                    MarketError::InvalidInventoryTarget(format!(
                        "inventory already exists for {:?}",
                        request.target
                    ))
                }
                other => other.into(),
            })?;

        info!("Created inventory {} for {:?}", created.id, request.target);
        Ok(created.into())
    }

    pub async fn get(&self, merchant_id: Uuid, inventory_id: Uuid) -> MarketResult<InventoryView> {
        let mut conn = self.pool.get().await?;
        let row = get(&mut conn, inventory_id).await?;
        if row.merchant_id != merchant_id {
            return Err(MarketError::Unauthorized);
        }
        Ok(row.into())
    }

    pub async fn adjust(&self, merchant_id: Uuid, inventory_id: Uuid, delta: i32) -> MarketResult<InventoryView> {
        let mut conn = self.pool.get().await?;
        let current = get(&mut conn, inventory_id).await?;
        if current.merchant_id != merchant_id {
            return Err(MarketError::Unauthorized);
        }

        let row = adjust_stock(&mut conn, inventory_id, delta).await?;
        let view = InventoryView::from(row);
        if view.inventory.level().is_low() {
            warn!(
                "Inventory {} is {:?} after adjustment ({} available)",
                inventory_id, view.stock_status, view.available
            );
        }
        Ok(view)
    }
}
