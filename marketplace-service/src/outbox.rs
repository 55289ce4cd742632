use anyhow::Result;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use rdkafka::producer::{FutureProducer, FutureRecord};
use shared::NotificationEvent;
use std::time::Duration;
use tokio::time;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::MarketResult;
use crate::models::*;
use crate::schema::*;
use crate::DbPool;

pub const ORDER_CREATED: &str = "OrderCreated";
pub const ORDER_PAID: &str = "OrderPaid";
pub const ORDER_CANCELLED: &str = "OrderCancelled";
pub const ORDER_ITEM_STATUS_CHANGED: &str = "OrderItemStatusChanged";

/// Records a notification inside the caller's transaction. Nothing is published until it commits.
pub async fn enqueue(
    conn: &mut AsyncPgConnection,
    aggregate_id: Uuid,
    event_type: &str,
    event: &NotificationEvent,
) -> MarketResult<()> {
    let row = NewOutboxEvent {
        id: Uuid::new_v4(),
        aggregate_id,
        event_type: event_type.to_string(),
        event_data: serde_json::to_value(event)?,
    };

    diesel::insert_into(outbox_events::table)
        .values(&row)
        .execute(conn)
        .await?;
    Ok(())
}

pub struct OutboxProcessor {
    pool: DbPool,
    producer: FutureProducer,
    topic: String,
}

impl OutboxProcessor {
    pub fn new(pool: DbPool, producer: FutureProducer, topic: String) -> Self {
        Self { pool, producer, topic }
    }

    pub async fn run(&self) {
        let mut interval = time::interval(Duration::from_secs(5));

        loop {
            interval.tick().await;

            if let Err(e) = self.process_outbox_events().await {
                error!("Error processing outbox events: {}", e);
            }
        }
    }

    async fn process_outbox_events(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;

        let unprocessed_events = outbox_events::table
            .filter(outbox_events::processed.eq(false))
            .order(outbox_events::created_at.asc())
            .limit(100)
            .select(DbOutboxEvent::as_select())
            .load(&mut conn)
            .await?;

        for event in unprocessed_events {
            if let Err(e) = self.publish_event(&event).await {
                error!("Failed to publish event {}: {}", event.id, e);
                continue;
            }

            diesel::update(outbox_events::table.find(event.id))
                .set(outbox_events::processed.eq(true))
                .execute(&mut conn)
                .await?;

            info!("Published {} for {}", event.event_type, event.aggregate_id);
        }

        Ok(())
    }

    async fn publish_event(&self, event: &DbOutboxEvent) -> Result<()> {
        let json = serde_json::to_string(&event.event_data)?;
        let key = event.aggregate_id.to_string();
        let record = FutureRecord::to(&self.topic)
            .payload(&json)
            .key(&key)
            .headers(rdkafka::message::OwnedHeaders::new().insert(rdkafka::message::Header {
                key: "event_type",
                value: Some(event.event_type.as_str()),
            }));

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish event: {}", e))?;

        Ok(())
    }
}
