//! Cancellation and the abandoned-order sweeper. Both put committed stock back through the ledger.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use serde_json::json;
use shared::{NotificationEvent, OrderStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{MarketError, MarketResult};
use crate::ledger;
use crate::models::Order;
use crate::orders;
use crate::outbox;
use crate::payments::PaymentGateway;
use crate::schema::orders as orders_table;
use crate::settlement;
use crate::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelActor {
    Owner(Uuid),
    Sweeper,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelOutcome {
    pub order: Order,
    pub refund_requested: bool,
    /// Set when the refund request failed. The cancellation itself is committed either way.
    pub refund_error: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepReport {
    pub cancelled: Vec<Uuid>,
    /// Orders that left `Pending` between the scan and the lock.
    pub skipped: usize,
    pub failed: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.cancelled.is_empty() && self.skipped == 0 && self.failed.is_empty()
    }
}

/// Cancels and restocks one order inside the caller's transaction.
///
/// Returns `None` only for the sweeper, when the order is no longer `Pending`.
pub async fn cancel_locked(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    actor: CancelActor,
    reason: &str,
) -> MarketResult<Option<Order>> {
    let order = orders::lock_order(conn, order_id).await?;
    if let CancelActor::Owner(user_id) = actor {
        if order.user_id != user_id {
            return Err(MarketError::Unauthorized);
        }
    }

    let current: OrderStatus = order.status.parse()?;
    if actor == CancelActor::Sweeper && current != OrderStatus::Pending {
        return Ok(None);
    }
    let next = current.transition(OrderStatus::Cancelled)?;

    let cancelled = diesel::update(orders_table::table.find(order_id))
        .set((
            orders_table::status.eq(next.as_str()),
            orders_table::cancellation_reason.eq(reason),
            orders_table::updated_at.eq(Utc::now()),
        ))
        .returning(Order::as_returning())
        .get_result(conn)
        .await?;

    let mut items = orders::items_of(conn, order_id).await?;
    items.sort_by_key(|item| item.inventory_id);
    for item in &items {
        ledger::lock(conn, item.inventory_id).await?;
        ledger::restock(conn, item.inventory_id, item.quantity).await?;
    }

    let reversed = settlement::reverse_for_order(conn, order_id).await?;

    outbox::enqueue(
        conn,
        order_id,
        outbox::ORDER_CANCELLED,
        &NotificationEvent::new(
            cancelled.user_id,
            "order_cancelled",
            json!({ "order_id": order_id, "reason": reason }),
        ),
    )
    .await?;

    info!(
        "Order {} cancelled ({}): restocked {} items, reversed {} splits",
        order_id,
        reason,
        items.len(),
        reversed
    );
    Ok(Some(cancelled))
}

#[derive(Clone)]
pub struct CancellationService {
    pool: DbPool,
    payments: Arc<dyn PaymentGateway>,
    abandon_after: chrono::Duration,
}

impl CancellationService {
    pub fn new(pool: DbPool, payments: Arc<dyn PaymentGateway>, abandon_after: chrono::Duration) -> Self {
        Self {
            pool,
            payments,
            abandon_after,
        }
    }

    async fn cancel(&self, order_id: Uuid, actor: CancelActor, reason: String) -> MarketResult<Option<Order>> {
        let mut conn = self.pool.get().await?;
        conn.transaction::<_, MarketError, _>(|conn| {
            Box::pin(async move { cancel_locked(conn, order_id, actor, &reason).await })
        })
        .await
    }

    /// Post-commit refund. Failures are reported, never rolled back into the order.
    async fn refund(&self, order: &Order) -> (bool, Option<String>) {
        let Some(reference) = order.payment_reference.as_deref() else {
            return (false, None);
        };
        match self.payments.request_refund(order.id, reference).await {
            Ok(()) => (true, None),
            Err(e) => {
                error!("Refund request for order {} failed: {}", order.id, e);
                (true, Some(e.to_string()))
            }
        }
    }

    /// Buyer cancellation. Only the owner may cancel, and only while the order is `Pending`.
    pub async fn cancel_order(&self, order_id: Uuid, user_id: Uuid, reason: Option<String>) -> MarketResult<CancelOutcome> {
        let reason = reason
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "cancelled by customer".to_string());

        let order = self
            .cancel(order_id, CancelActor::Owner(user_id), reason)
            .await?
            .ok_or(MarketError::OrderNotFound(order_id))?;

        let (refund_requested, refund_error) = self.refund(&order).await;
        Ok(CancelOutcome {
            order,
            refund_requested,
            refund_error,
        })
    }

    /// Cancels every `Pending` order older than the abandonment window, one transaction each.
    pub async fn cleanup_abandoned_orders(&self, now: DateTime<Utc>) -> MarketResult<SweepReport> {
        let cutoff = now - self.abandon_after;
        let candidates = {
            let mut conn = self.pool.get().await?;
            orders_table::table
                .filter(orders_table::status.eq(OrderStatus::Pending.as_str()))
                .filter(orders_table::created_at.lt(cutoff))
                .order(orders_table::created_at.asc())
                .select(orders_table::id)
                .load::<Uuid>(&mut conn)
                .await?
        };

        let reason = format!(
            "payment not completed within {} minutes",
            self.abandon_after.num_minutes()
        );
        let mut report = SweepReport::default();
        for order_id in candidates {
            match self.cancel(order_id, CancelActor::Sweeper, reason.clone()).await {
                Ok(Some(order)) => {
                    self.refund(&order).await;
                    report.cancelled.push(order_id);
                }
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!("Failed to cancel abandoned order {}: {}", order_id, e);
                    report.failed.push(order_id);
                }
            }
        }
        Ok(report)
    }

    pub async fn run(&self, every: Duration) {
        let mut interval = time::interval(every);

        loop {
            interval.tick().await;

            match self.cleanup_abandoned_orders(Utc::now()).await {
                Ok(report) if report.is_empty() => {}
                Ok(report) => info!(
                    "Abandoned order sweep: {} cancelled, {} skipped, {} failed",
                    report.cancelled.len(),
                    report.skipped,
                    report.failed.len()
                ),
                Err(e) => warn!("Abandoned order sweep failed: {}", e),
            }
        }
    }
}
