//! Cart reservation manager.
//!
//! Every quantity change on a cart line is paired with the opposite ledger movement in the same
//! transaction, and the cart row is locked first so two requests on one cart run one at a time.

use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::{Deserialize, Serialize};
use shared::{line_total, CartStatus, InventoryTarget};
use tracing::info;
use uuid::Uuid;

use crate::catalog::{self, PriceBook};
use crate::error::{MarketError, MarketResult};
use crate::ledger;
use crate::models::{Cart, CartItem, NewCart, NewCartItem};
use crate::schema::{cart_items, carts};
use crate::DbPool;

#[derive(Debug, Clone, Deserialize)]
pub struct AddCartItem {
    pub product_id: Uuid,
    pub variant_id: Option<Uuid>,
    pub quantity: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    #[serde(flatten)]
    pub item: CartItem,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub cart: Cart,
    pub items: Vec<CartLine>,
    pub total: BigDecimal,
}

/// Locks and returns the user's active cart, if there is one.
pub async fn lock_active_cart(conn: &mut AsyncPgConnection, user_id: Uuid) -> MarketResult<Option<Cart>> {
    let cart = carts::table
        .filter(carts::user_id.eq(user_id))
        .filter(carts::status.eq(CartStatus::Active.as_str()))
        .select(Cart::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?;
    Ok(cart)
}

/// At most one active cart per user: a racing insert loses to the partial unique index.
pub async fn get_or_create_active_cart(conn: &mut AsyncPgConnection, user_id: Uuid) -> MarketResult<Cart> {
    if let Some(cart) = lock_active_cart(conn, user_id).await? {
        return Ok(cart);
    }

    let new_cart = NewCart {
        id: Uuid::new_v4(),
        user_id,
        status: CartStatus::Active.to_string(),
    };
    diesel::insert_into(carts::table)
        .values(&new_cart)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;

    lock_active_cart(conn, user_id)
        .await?
        .ok_or(MarketError::CartNotFound)
}

pub async fn items_of(conn: &mut AsyncPgConnection, cart_id: Uuid) -> MarketResult<Vec<CartItem>> {
    let items = cart_items::table
        .filter(cart_items::cart_id.eq(cart_id))
        .order(cart_items::created_at.asc())
        .select(CartItem::as_select())
        .load(conn)
        .await?;
    Ok(items)
}

async fn find_line(
    conn: &mut AsyncPgConnection,
    cart_id: Uuid,
    product_id: Uuid,
    variant_id: Option<Uuid>,
) -> MarketResult<Option<CartItem>> {
    let query = cart_items::table
        .filter(cart_items::cart_id.eq(cart_id))
        .filter(cart_items::product_id.eq(product_id))
        .into_boxed();
    let query = match variant_id {
        Some(id) => query.filter(cart_items::variant_id.eq(id)),
        None => query.filter(cart_items::variant_id.is_null()),
    };
    let line = query
        .select(CartItem::as_select())
        .first(conn)
        .await
        .optional()?;
    Ok(line)
}

/// Locks the cart that owns `item_id` and checks it belongs to `user_id`.
async fn lock_line(conn: &mut AsyncPgConnection, user_id: Uuid, item_id: Uuid) -> MarketResult<(Cart, CartItem)> {
    let cart_id = cart_items::table
        .find(item_id)
        .select(cart_items::cart_id)
        .first::<Uuid>(conn)
        .await
        .optional()?
        .ok_or(MarketError::CartItemNotFound(item_id))?;

    let cart = carts::table
        .find(cart_id)
        .select(Cart::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or(MarketError::CartNotFound)?;
    if cart.user_id != user_id {
        return Err(MarketError::Unauthorized);
    }
    if cart.status != CartStatus::Active.as_str() {
        return Err(MarketError::CartNotFound);
    }

    // Re-read under the cart lock; a concurrent removal may have won.
    let item = cart_items::table
        .find(item_id)
        .select(CartItem::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or(MarketError::CartItemNotFound(item_id))?;
    Ok((cart, item))
}

async fn touch(conn: &mut AsyncPgConnection, cart_id: Uuid) -> MarketResult<()> {
    diesel::update(carts::table.find(cart_id))
        .set(carts::updated_at.eq(Utc::now()))
        .execute(conn)
        .await?;
    Ok(())
}

async fn delete_line(conn: &mut AsyncPgConnection, item: &CartItem) -> MarketResult<()> {
    ledger::release(conn, item.inventory_id, item.quantity).await?;
    diesel::delete(cart_items::table.find(item.id))
        .execute(conn)
        .await?;
    Ok(())
}

/// Reserves `request.quantity` and merges it into the cart, inside the caller's transaction.
async fn add_line(conn: &mut AsyncPgConnection, cart: &Cart, request: &AddCartItem) -> MarketResult<CartItem> {
    if request.quantity <= 0 {
        return Err(MarketError::InvalidQuantity(request.quantity));
    }

    let product = catalog::sellable_product(conn, request.product_id).await?;
    let target = match request.variant_id {
        Some(variant_id) => {
            let variant = catalog::sellable_variant(conn, product.id, variant_id).await?;
            InventoryTarget::Variant(variant.id)
        }
        None => InventoryTarget::Product(product.id),
    };
    let inventory = ledger::find_for_target(conn, target, product.merchant_id)
        .await?
        .ok_or_else(|| MarketError::InvalidInventoryTarget(format!("no inventory tracked for {:?}", target)))?;

    ledger::reserve(conn, inventory.id, request.quantity).await?;

    let item = match find_line(conn, cart.id, product.id, request.variant_id).await? {
        Some(line) => {
            diesel::update(cart_items::table.find(line.id))
                .set((
                    cart_items::quantity.eq(cart_items::quantity + request.quantity),
                    cart_items::updated_at.eq(Utc::now()),
                ))
                .returning(CartItem::as_returning())
                .get_result(conn)
                .await?
        }
        None => {
            let line = NewCartItem {
                id: Uuid::new_v4(),
                cart_id: cart.id,
                product_id: product.id,
                variant_id: request.variant_id,
                merchant_id: product.merchant_id,
                inventory_id: inventory.id,
                quantity: request.quantity,
            };
            diesel::insert_into(cart_items::table)
                .values(&line)
                .returning(CartItem::as_returning())
                .get_result(conn)
                .await?
        }
    };
    Ok(item)
}

#[derive(Clone)]
pub struct CartService {
    pool: DbPool,
}

impl CartService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn add_item(&self, user_id: Uuid, request: AddCartItem) -> MarketResult<CartItem> {
        if request.quantity <= 0 {
            return Err(MarketError::InvalidQuantity(request.quantity));
        }
        let added = request.quantity;
        let mut conn = self.pool.get().await?;

        let item = conn
            .transaction::<_, MarketError, _>(|conn| {
                Box::pin(async move {
                    let cart = get_or_create_active_cart(conn, user_id).await?;
                    let item = add_line(conn, &cart, &request).await?;
                    touch(conn, cart.id).await?;
                    Ok(item)
                })
            })
            .await?;

        info!(
            "User {} reserved {} of inventory {} (line now {})",
            user_id, added, item.inventory_id, item.quantity
        );
        Ok(item)
    }

    /// Adds several lines at once. Either every line is reserved or none is.
    pub async fn add_items(&self, user_id: Uuid, requests: Vec<AddCartItem>) -> MarketResult<Vec<CartItem>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(bad) = requests.iter().find(|r| r.quantity <= 0) {
            return Err(MarketError::InvalidQuantity(bad.quantity));
        }
        let mut conn = self.pool.get().await?;

        let items = conn
            .transaction::<_, MarketError, _>(|conn| {
                Box::pin(async move {
                    let cart = get_or_create_active_cart(conn, user_id).await?;
                    let mut items = Vec::with_capacity(requests.len());
                    for request in &requests {
                        items.push(add_line(conn, &cart, request).await?);
                    }
                    touch(conn, cart.id).await?;
                    Ok(items)
                })
            })
            .await?;

        info!("User {} bulk-added {} cart lines", user_id, items.len());
        Ok(items)
    }

    /// Sets a line to `quantity`, reserving or releasing the difference. Zero removes the line.
    ///
    /// Returns `None` when the line was removed.
    pub async fn update_item_quantity(
        &self,
        user_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    ) -> MarketResult<Option<CartItem>> {
        if quantity < 0 {
            return Err(MarketError::InvalidQuantity(quantity));
        }
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, MarketError, _>(|conn| {
            Box::pin(async move {
                let (cart, item) = lock_line(conn, user_id, item_id).await?;

                if quantity == 0 {
                    delete_line(conn, &item).await?;
                    touch(conn, cart.id).await?;
                    return Ok(None);
                }

                let delta = quantity - item.quantity;
                if delta > 0 {
                    ledger::reserve(conn, item.inventory_id, delta).await?;
                } else if delta < 0 {
                    ledger::release(conn, item.inventory_id, -delta).await?;
                } else {
                    return Ok(Some(item));
                }

                let updated = diesel::update(cart_items::table.find(item.id))
                    .set((
                        cart_items::quantity.eq(quantity),
                        cart_items::updated_at.eq(Utc::now()),
                    ))
                    .returning(CartItem::as_returning())
                    .get_result(conn)
                    .await?;
                touch(conn, cart.id).await?;
                Ok(Some(updated))
            })
        })
        .await
    }

    pub async fn remove_item(&self, user_id: Uuid, item_id: Uuid) -> MarketResult<()> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, MarketError, _>(|conn| {
            Box::pin(async move {
                let (cart, item) = lock_line(conn, user_id, item_id).await?;
                delete_line(conn, &item).await?;
                touch(conn, cart.id).await?;
                Ok(())
            })
        })
        .await?;

        info!("User {} removed cart item {}", user_id, item_id);
        Ok(())
    }

    /// Releases every line and abandons the cart. The next add opens a fresh one.
    pub async fn clear_cart(&self, user_id: Uuid) -> MarketResult<()> {
        let mut conn = self.pool.get().await?;

        let released = conn
            .transaction::<_, MarketError, _>(|conn| {
                Box::pin(async move {
                    let cart = lock_active_cart(conn, user_id)
                        .await?
                        .ok_or(MarketError::CartNotFound)?;
                    let items = items_of(conn, cart.id).await?;
                    for item in &items {
                        delete_line(conn, item).await?;
                    }

                    let next = CartStatus::Active.transition(CartStatus::Abandoned)?;
                    diesel::update(carts::table.find(cart.id))
                        .set((
                            carts::status.eq(next.as_str()),
                            carts::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;
                    Ok(items.len())
                })
            })
            .await?;

        info!("User {} cleared cart, released {} lines", user_id, released);
        Ok(())
    }

    /// The active cart with live prices. Opens an empty cart when there is none.
    pub async fn get_cart(&self, user_id: Uuid) -> MarketResult<CartView> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, MarketError, _>(|conn| {
            Box::pin(async move {
                let cart = get_or_create_active_cart(conn, user_id).await?;
                let items = items_of(conn, cart.id).await?;
                let prices = PriceBook::load(conn, items.iter().map(|i| (i.product_id, i.variant_id))).await?;

                let mut total = BigDecimal::from(0).with_scale(2);
                let mut lines = Vec::with_capacity(items.len());
                for item in items {
                    let unit_price = prices.price(item.product_id, item.variant_id)?;
                    let amount = line_total(&unit_price, item.quantity);
                    total += &amount;
                    lines.push(CartLine {
                        item,
                        unit_price,
                        line_total: amount,
                    });
                }

                Ok(CartView {
                    cart,
                    items: lines,
                    total,
                })
            })
        })
        .await
    }
}
