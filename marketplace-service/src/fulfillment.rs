use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::json;
use shared::{derive_order_status, FulfillmentStatus, NotificationEvent, OrderStatus, StatusError};
use tracing::info;
use uuid::Uuid;

use crate::error::{MarketError, MarketResult};
use crate::models::OrderItem;
use crate::orders;
use crate::outbox;
use crate::schema::{order_items, orders as orders_table};
use crate::DbPool;

#[derive(Debug, Clone, Serialize)]
pub struct ItemTransition {
    pub item: OrderItem,
    pub order_status: OrderStatus,
}

#[derive(Clone)]
pub struct FulfillmentService {
    pool: DbPool,
}

impl FulfillmentService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Moves one order item along its fulfillment table and re-derives the order's status.
    ///
    /// Ownership is checked before state, so a foreign merchant always sees `Unauthorized`.
    pub async fn transition_item(
        &self,
        merchant_id: Uuid,
        item_id: Uuid,
        next: FulfillmentStatus,
    ) -> MarketResult<ItemTransition> {
        let mut conn = self.pool.get().await?;

        let outcome = conn
            .transaction::<_, MarketError, _>(|conn| {
                Box::pin(async move {
                    let order_id = order_items::table
                        .find(item_id)
                        .filter(order_items::merchant_id.eq(merchant_id))
                        .select(order_items::order_id)
                        .first::<Uuid>(conn)
                        .await
                        .optional()?;
                    let order_id = match order_id {
                        Some(id) => id,
                        None => {
                            let exists = diesel::select(diesel::dsl::exists(order_items::table.find(item_id)))
                                .get_result::<bool>(conn)
                                .await?;
                            return Err(if exists {
                                MarketError::Unauthorized
                            } else {
                                MarketError::OrderItemNotFound(item_id)
                            });
                        }
                    };

                    // Order before item, same as cancellation.
                    let order = orders::lock_order(conn, order_id).await?;
                    let order_status: OrderStatus = order.status.parse()?;
                    // Items move only while the order is paid and not yet closed.
                    if !matches!(
                        order_status,
                        OrderStatus::Paid | OrderStatus::Processing | OrderStatus::Shipped
                    ) {
                        return Err(MarketError::InvalidTransition(StatusError::InvalidTransition {
                            kind: "order item",
                            from: order_status.to_string(),
                            to: next.to_string(),
                        }));
                    }

                    let item = order_items::table
                        .find(item_id)
                        .select(OrderItem::as_select())
                        .for_update()
                        .first(conn)
                        .await?;
                    let current: FulfillmentStatus = item.fulfillment_status.parse()?;
                    let next = current.transition(next)?;

                    let item = diesel::update(order_items::table.find(item_id))
                        .set((
                            order_items::fulfillment_status.eq(next.as_str()),
                            order_items::updated_at.eq(Utc::now()),
                        ))
                        .returning(OrderItem::as_returning())
                        .get_result(conn)
                        .await?;

                    let statuses = orders::items_of(conn, order_id)
                        .await?
                        .iter()
                        .map(|i| i.fulfillment_status.parse::<FulfillmentStatus>())
                        .collect::<Result<Vec<_>, _>>()?;

                    let order_status = match derive_order_status(order_status, &statuses) {
                        Some(derived) => {
                            diesel::update(orders_table::table.find(order_id))
                                .set((
                                    orders_table::status.eq(derived.as_str()),
                                    orders_table::updated_at.eq(Utc::now()),
                                ))
                                .execute(conn)
                                .await?;
                            derived
                        }
                        None => order_status,
                    };

                    outbox::enqueue(
                        conn,
                        order_id,
                        outbox::ORDER_ITEM_STATUS_CHANGED,
                        &NotificationEvent::new(
                            order.user_id,
                            "order_item_status_changed",
                            json!({
                                "order_id": order_id,
                                "item_id": item_id,
                                "from": current,
                                "to": next,
                                "order_status": order_status,
                            }),
                        ),
                    )
                    .await?;

                    Ok(ItemTransition { item, order_status })
                })
            })
            .await?;

        info!(
            "Merchant {} moved item {} to {}; order {} is {}",
            merchant_id,
            item_id,
            outcome.item.fulfillment_status,
            outcome.item.order_id,
            outcome.order_status
        );
        Ok(outcome)
    }
}
