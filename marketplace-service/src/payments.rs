//! Payment collaborator: commands out to the payment service, replies back in.

use anyhow::Result;
use async_trait::async_trait;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use serde::{Deserialize, Serialize};
use shared::*;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{MarketError, MarketResult};
use crate::models::ProcessedCommand;
use crate::orders;
use crate::schema::processed_commands;
use crate::DbPool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkout {
    pub reference: String,
    pub authorization_url: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn initiate_checkout(&self, checkout: &CheckoutData) -> MarketResult<Checkout>;

    /// Asks the provider to confirm a reference. The order flips to `Paid` when the answer arrives.
    async fn verify_payment(&self, order_id: Uuid, reference: &str) -> MarketResult<()>;

    async fn request_refund(&self, order_id: Uuid, reference: &str) -> MarketResult<()>;
}

pub struct KafkaPaymentGateway {
    producer: FutureProducer,
    command_topic: String,
    checkout_base_url: String,
}

impl KafkaPaymentGateway {
    pub fn new(producer: FutureProducer, command_topic: String, checkout_base_url: String) -> Self {
        Self {
            producer,
            command_topic,
            checkout_base_url,
        }
    }

    async fn send_command(&self, command: &Command) -> Result<()> {
        let json = serde_json::to_string(command)?;
        let key = command.order_id.to_string();
        let record = FutureRecord::to(&self.command_topic)
            .payload(&json)
            .key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send command: {}", e))?;

        Ok(())
    }

    async fn dispatch(&self, command: Command) -> MarketResult<()> {
        self.send_command(&command)
            .await
            .map_err(|e| MarketError::Payment(e.to_string()))?;
        info!(
            "Sent {:?} for order {}",
            command.command_type, command.order_id
        );
        Ok(())
    }
}

pub fn authorization_url(base: &str, reference: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), reference)
}

#[async_trait]
impl PaymentGateway for KafkaPaymentGateway {
    async fn initiate_checkout(&self, checkout: &CheckoutData) -> MarketResult<Checkout> {
        let command = Command::new(
            checkout.order_id,
            CommandType::InitiateCheckout,
            serde_json::to_value(checkout)?,
        );
        self.dispatch(command).await?;

        Ok(Checkout {
            reference: checkout.reference.clone(),
            authorization_url: authorization_url(&self.checkout_base_url, &checkout.reference),
        })
    }

    async fn verify_payment(&self, order_id: Uuid, reference: &str) -> MarketResult<()> {
        let payload = serde_json::to_value(PaymentReference {
            order_id,
            reference: reference.to_string(),
        })?;
        self.dispatch(Command::new(order_id, CommandType::VerifyPayment, payload))
            .await
    }

    async fn request_refund(&self, order_id: Uuid, reference: &str) -> MarketResult<()> {
        let payload = serde_json::to_value(PaymentReference {
            order_id,
            reference: reference.to_string(),
        })?;
        self.dispatch(Command::refund(order_id, payload)).await
    }
}

/// Applies payment service replies. Each reply is applied at most once.
pub struct PaymentReplyHandler {
    pool: DbPool,
}

impl PaymentReplyHandler {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => match serde_json::from_str::<CommandReply>(json_str) {
                                Ok(reply) => {
                                    if let Err(e) = self.handle_reply(reply).await {
                                        error!("Error handling reply: {}", e);
                                    }
                                }
                                Err(e) => warn!("Ignoring malformed reply: {}", e),
                            },
                            Err(e) => error!("Error parsing reply payload: {}", e),
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async) {
                        error!("Error committing reply message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving reply message: {}", e),
            }
        }
    }

    pub async fn handle_reply(&self, reply: CommandReply) -> MarketResult<()> {
        let mut conn = self.pool.get().await?;

        conn.transaction::<_, MarketError, _>(|conn| {
            Box::pin(async move {
                if !claim_reply(conn, &reply).await? {
                    info!("Reply to command {} already applied", reply.command_id);
                    return Ok(());
                }
                apply_reply(conn, &reply).await
            })
        })
        .await
    }
}

async fn claim_reply(conn: &mut AsyncPgConnection, reply: &CommandReply) -> MarketResult<bool> {
    let row = ProcessedCommand {
        idempotency_key: format!("reply_{}", reply.command_id),
        command_id: reply.command_id,
        result: reply.result.clone(),
        processed_at: Some(chrono::Utc::now()),
    };
    let inserted = diesel::insert_into(processed_commands::table)
        .values(&row)
        .on_conflict_do_nothing()
        .execute(conn)
        .await?;
    Ok(inserted == 1)
}

async fn apply_reply(conn: &mut AsyncPgConnection, reply: &CommandReply) -> MarketResult<()> {
    if reply.status == CommandStatus::Failed {
        warn!(
            "{:?} failed for order {}: {}",
            reply.command_type,
            reply.order_id,
            reply.error.as_deref().unwrap_or("no reason given")
        );
        return Ok(());
    }

    let outcome: Option<PaymentOutcome> = match &reply.result {
        Some(value) => Some(serde_json::from_value(value.clone())?),
        None => None,
    };

    match (reply.command_type, outcome) {
        (CommandType::VerifyPayment, Some(outcome)) if outcome.status == PaymentStatus::Success => {
            orders::mark_paid(conn, outcome.order_id, &outcome.reference).await?;
        }
        (CommandType::VerifyPayment, outcome) => {
            warn!(
                "Payment for order {} not confirmed: {:?}",
                reply.order_id,
                outcome.map(|o| o.status)
            );
        }
        (CommandType::RefundPayment, _) => {
            info!("Refund confirmed for order {}", reply.order_id);
        }
        (CommandType::InitiateCheckout, _) => {
            info!("Checkout opened for order {}", reply.order_id);
        }
    }
    Ok(())
}
