//! Order conversion: drains the active cart into an order, its items and the merchant splits.

use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::json;
use shared::{line_total, CartStatus, CheckoutData, FulfillmentStatus, NotificationEvent, OrderStatus};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cart;
use crate::catalog::PriceBook;
use crate::config::EngineConfig;
use crate::error::{MarketError, MarketResult};
use crate::ledger;
use crate::models::{NewOrder, NewOrderItem, Order, OrderItem};
use crate::outbox;
use crate::payments::{Checkout, PaymentGateway};
use crate::schema::{cart_items, carts, order_items, orders};
use crate::settlement;
use crate::DbPool;

#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    #[serde(flatten)]
    pub order: Order,
    pub items: Vec<OrderItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlacedOrder {
    #[serde(flatten)]
    pub details: OrderDetails,
    /// Missing when the payment service could not be reached; the order stands regardless.
    pub checkout: Option<Checkout>,
}

pub fn payment_reference(order_id: Uuid) -> String {
    format!("ORD-{}", order_id.simple())
}

pub async fn lock_order(conn: &mut AsyncPgConnection, order_id: Uuid) -> MarketResult<Order> {
    orders::table
        .find(order_id)
        .select(Order::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or(MarketError::OrderNotFound(order_id))
}

pub async fn items_of(conn: &mut AsyncPgConnection, order_id: Uuid) -> MarketResult<Vec<OrderItem>> {
    let items = order_items::table
        .filter(order_items::order_id.eq(order_id))
        .order(order_items::created_at.asc())
        .select(OrderItem::as_select())
        .load(conn)
        .await?;
    Ok(items)
}

/// Payment completion. Only a `Pending` order moves; an order already paid (or further along) is left as is.
pub async fn mark_paid(conn: &mut AsyncPgConnection, order_id: Uuid, reference: &str) -> MarketResult<Order> {
    let order = lock_order(conn, order_id).await?;
    if order.payment_reference.as_deref() != Some(reference) {
        return Err(MarketError::Payment(format!(
            "reference {} does not belong to order {}",
            reference, order_id
        )));
    }

    let current: OrderStatus = order.status.parse()?;
    if matches!(
        current,
        OrderStatus::Paid | OrderStatus::Processing | OrderStatus::Shipped | OrderStatus::Completed
    ) {
        return Ok(order);
    }
    let next = current.transition(OrderStatus::Paid).map_err(|e| {
        if current == OrderStatus::Cancelled {
            warn!("Payment {} arrived for cancelled order {}", reference, order_id);
        }
        e
    })?;

    let paid = diesel::update(orders::table.find(order_id))
        .set((
            orders::status.eq(next.as_str()),
            orders::updated_at.eq(Utc::now()),
        ))
        .returning(Order::as_returning())
        .get_result(conn)
        .await?;

    outbox::enqueue(
        conn,
        order_id,
        outbox::ORDER_PAID,
        &NotificationEvent::new(
            paid.user_id,
            "order_paid",
            json!({ "order_id": order_id, "total_amount": paid.total_amount }),
        ),
    )
    .await?;

    info!("Order {} paid with reference {}", order_id, reference);
    Ok(paid)
}

#[derive(Clone)]
pub struct OrderService {
    pool: DbPool,
    config: EngineConfig,
    payments: Arc<dyn PaymentGateway>,
}

impl OrderService {
    pub fn new(pool: DbPool, config: EngineConfig, payments: Arc<dyn PaymentGateway>) -> Self {
        Self {
            pool,
            config,
            payments,
        }
    }

    /// Converts the user's active cart into a `Pending` order in one transaction, then opens checkout.
    pub async fn create_order(&self, user_id: Uuid) -> MarketResult<PlacedOrder> {
        let mut conn = self.pool.get().await?;
        let config = self.config.clone();

        let (order, items) = conn
            .transaction::<_, MarketError, _>(|conn| {
                Box::pin(async move {
                    let cart = cart::lock_active_cart(conn, user_id)
                        .await?
                        .ok_or(MarketError::CartNotFound)?;
                    let mut lines = cart::items_of(conn, cart.id).await?;
                    if lines.is_empty() {
                        return Err(MarketError::EmptyCart);
                    }
                    // Fixed lock order across concurrent conversions.
                    lines.sort_by_key(|line| line.inventory_id);

                    let prices = PriceBook::load(conn, lines.iter().map(|l| (l.product_id, l.variant_id))).await?;
                    let order_id = Uuid::new_v4();
                    let mut sub_total = BigDecimal::from(0).with_scale(2);
                    let mut new_items = Vec::with_capacity(lines.len());

                    for line in &lines {
                        ledger::commit(conn, line.inventory_id, line.quantity).await?;

                        let price = prices.price(line.product_id, line.variant_id)?;
                        sub_total += line_total(&price, line.quantity);
                        new_items.push(NewOrderItem {
                            id: Uuid::new_v4(),
                            order_id,
                            merchant_id: line.merchant_id,
                            product_id: line.product_id,
                            variant_id: line.variant_id,
                            inventory_id: line.inventory_id,
                            quantity: line.quantity,
                            price,
                            fulfillment_status: FulfillmentStatus::Processing.to_string(),
                        });
                    }

                    let order = diesel::insert_into(orders::table)
                        .values(&NewOrder {
                            id: order_id,
                            user_id,
                            total_amount: sub_total.clone(),
                            sub_total,
                            currency: config.currency.clone(),
                            status: OrderStatus::Pending.to_string(),
                            payment_reference: None,
                        })
                        .returning(Order::as_returning())
                        .get_result(conn)
                        .await?;

                    let items = diesel::insert_into(order_items::table)
                        .values(&new_items)
                        .returning(OrderItem::as_returning())
                        .get_results(conn)
                        .await?;

                    settlement::create_splits(conn, order_id, &new_items, &config.settlement, Utc::now()).await?;

                    diesel::delete(cart_items::table.filter(cart_items::cart_id.eq(cart.id)))
                        .execute(conn)
                        .await?;
                    let converted = CartStatus::Active.transition(CartStatus::Converted)?;
                    diesel::update(carts::table.find(cart.id))
                        .set((
                            carts::status.eq(converted.as_str()),
                            carts::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    outbox::enqueue(
                        conn,
                        order_id,
                        outbox::ORDER_CREATED,
                        &NotificationEvent::new(
                            user_id,
                            "order_created",
                            json!({
                                "order_id": order_id,
                                "total_amount": order.total_amount,
                                "currency": order.currency,
                                "items": items.len(),
                            }),
                        ),
                    )
                    .await?;

                    Ok((order, items))
                })
            })
            .await?;

        info!(
            "User {} converted cart into order {} ({} items, {} {})",
            user_id,
            order.id,
            items.len(),
            order.total_amount,
            order.currency
        );

        let (order, checkout) = self.open_checkout(order).await;
        Ok(PlacedOrder {
            details: OrderDetails { order, items },
            checkout,
        })
    }

    /// Post-commit side effect: a failure is logged and leaves the order without a reference.
    async fn open_checkout(&self, order: Order) -> (Order, Option<Checkout>) {
        let request = CheckoutData {
            order_id: order.id,
            user_id: order.user_id,
            reference: payment_reference(order.id),
            amount: order.total_amount.clone(),
            currency: order.currency.clone(),
        };

        let checkout = match self.payments.initiate_checkout(&request).await {
            Ok(checkout) => checkout,
            Err(e) => {
                error!("Failed to initiate checkout for order {}: {}", order.id, e);
                return (order, None);
            }
        };

        let stored = async {
            let mut conn = self.pool.get().await?;
            let order = diesel::update(orders::table.find(order.id))
                .set(orders::payment_reference.eq(checkout.reference.clone()))
                .returning(Order::as_returning())
                .get_result(&mut conn)
                .await?;
            Ok::<_, MarketError>(order)
        }
        .await;

        match stored {
            Ok(order) => (order, Some(checkout)),
            Err(e) => {
                error!("Failed to store payment reference for order {}: {}", order.id, e);
                (order, None)
            }
        }
    }

    pub async fn get_order(&self, user_id: Uuid, order_id: Uuid) -> MarketResult<OrderDetails> {
        let mut conn = self.pool.get().await?;
        let order = orders::table
            .find(order_id)
            .select(Order::as_select())
            .first(&mut conn)
            .await
            .optional()?
            .ok_or(MarketError::OrderNotFound(order_id))?;
        if order.user_id != user_id {
            return Err(MarketError::Unauthorized);
        }
        let items = items_of(&mut conn, order_id).await?;
        Ok(OrderDetails { order, items })
    }

    pub async fn list_orders(&self, user_id: Uuid) -> MarketResult<Vec<Order>> {
        let mut conn = self.pool.get().await?;
        let orders = orders::table
            .filter(orders::user_id.eq(user_id))
            .order(orders::created_at.desc())
            .select(Order::as_select())
            .load(&mut conn)
            .await?;
        Ok(orders)
    }

    /// A merchant's lines across all orders, newest first, optionally narrowed to one fulfillment status.
    pub async fn list_merchant_items(
        &self,
        merchant_id: Uuid,
        status: Option<FulfillmentStatus>,
    ) -> MarketResult<Vec<OrderItem>> {
        let mut conn = self.pool.get().await?;
        let mut query = order_items::table
            .filter(order_items::merchant_id.eq(merchant_id))
            .into_boxed();
        if let Some(status) = status {
            query = query.filter(order_items::fulfillment_status.eq(status.as_str()));
        }
        let items = query
            .order(order_items::created_at.desc())
            .select(OrderItem::as_select())
            .load(&mut conn)
            .await?;
        Ok(items)
    }

    /// Asks the payment service to confirm the order's payment; the reply handler applies the result.
    pub async fn verify_payment(&self, user_id: Uuid, order_id: Uuid) -> MarketResult<Order> {
        let details = self.get_order(user_id, order_id).await?;
        let order = details.order;
        let reference = order
            .payment_reference
            .clone()
            .ok_or_else(|| MarketError::Payment(format!("order {} has no checkout", order_id)))?;

        let status: OrderStatus = order.status.parse()?;
        if status != OrderStatus::Pending {
            return Ok(order);
        }
        self.payments.verify_payment(order_id, &reference).await?;
        Ok(order)
    }

    pub async fn mark_paid(&self, order_id: Uuid, reference: &str) -> MarketResult<Order> {
        let mut conn = self.pool.get().await?;
        let reference = reference.to_string();
        conn.transaction::<_, MarketError, _>(|conn| {
            Box::pin(async move { mark_paid(conn, order_id, &reference).await })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_reference_is_stable_per_order() {
        let id = Uuid::new_v4();
        assert_eq!(payment_reference(id), payment_reference(id));
        assert!(payment_reference(id).starts_with("ORD-"));
        assert_eq!(payment_reference(id).matches('-').count(), 1);
    }
}
