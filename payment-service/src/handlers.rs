use anyhow::{anyhow, Result};
use bigdecimal::BigDecimal;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use futures::StreamExt;
use num_traits::ToPrimitive;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::Message;
use shared::*;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// Amount in the currency's minor unit (kobo for NGN), as providers expect it.
pub fn to_minor_units(amount: &BigDecimal) -> Option<i64> {
    (amount * BigDecimal::from(100)).round(0).to_i64()
}

/// Outcome of verifying a reference. Settled payments keep their status.
pub fn verification_status(current: PaymentStatus, roll: f64, success_rate: f64) -> PaymentStatus {
    match current {
        PaymentStatus::Pending if roll < success_rate => PaymentStatus::Success,
        PaymentStatus::Pending => PaymentStatus::Failed,
        settled => settled,
    }
}

/// A captured payment is refunded; one never captured is voided.
pub fn refund_status(current: PaymentStatus) -> PaymentStatus {
    match current {
        PaymentStatus::Success | PaymentStatus::Refunded => PaymentStatus::Refunded,
        PaymentStatus::Pending | PaymentStatus::Failed => PaymentStatus::Failed,
    }
}

pub struct CommandHandler {
    pool: DbPool,
    producer: FutureProducer,
    reply_topic: String,
    success_rate: f64,
}

impl CommandHandler {
    pub fn new(pool: DbPool, producer: FutureProducer, reply_topic: String, success_rate: f64) -> Self {
        Self {
            pool,
            producer,
            reply_topic,
            success_rate,
        }
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    if let Some(payload) = m.payload_view::<str>() {
                        match payload {
                            Ok(json_str) => match serde_json::from_str::<Command>(json_str) {
                                Ok(command) => {
                                    if let Err(e) = self.handle_command(command).await {
                                        error!("Error handling command: {}", e);
                                    }
                                }
                                Err(e) => warn!("Ignoring malformed command: {}", e),
                            },
                            Err(e) => error!("Error parsing payload: {}", e),
                        }
                    }
                    if let Err(e) = consumer.commit_message(&m, rdkafka::consumer::CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
    }

    async fn handle_command(&self, command: Command) -> Result<()> {
        let mut conn = self.pool.get().await?;

        if let Some(existing) = self.check_idempotency(&mut conn, &command.idempotency_key).await? {
            info!("Command {} already processed, resending stored reply", command.idempotency_key);
            let stored: CommandReply = match existing.result {
                Some(value) => serde_json::from_value(value)?,
                None => CommandReply::success(&command, None),
            };
            let reply = CommandReply {
                id: Uuid::new_v4(),
                command_id: command.id,
                created_at: Utc::now(),
                ..stored
            };
            self.send_reply(reply).await?;
            return Ok(());
        }

        let success_rate = self.success_rate;
        let reply = conn
            .transaction::<_, anyhow::Error, _>(|conn| {
                Box::pin(async move {
                    let reply = match command.command_type {
                        CommandType::InitiateCheckout => handle_initiate_checkout(conn, &command).await,
                        CommandType::VerifyPayment => handle_verify_payment(conn, &command, success_rate).await,
                        CommandType::RefundPayment => handle_refund_payment(conn, &command).await,
                    }
                    .unwrap_or_else(|e| CommandReply::failed(&command, e.to_string()));

                    store_processed_command(conn, &command, &reply).await?;
                    Ok(reply)
                })
            })
            .await?;

        self.send_reply(reply).await?;
        Ok(())
    }

    async fn check_idempotency(&self, conn: &mut AsyncPgConnection, key: &str) -> Result<Option<ProcessedCommand>> {
        let result = processed_commands::table
            .filter(processed_commands::idempotency_key.eq(key))
            .select(ProcessedCommand::as_select())
            .first(conn)
            .await
            .optional()?;
        Ok(result)
    }

    async fn send_reply(&self, reply: CommandReply) -> Result<()> {
        let json = serde_json::to_string(&reply)?;
        let key = reply.order_id.to_string();
        let record = FutureRecord::to(&self.reply_topic)
            .payload(&json)
            .key(&key);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| anyhow!("Failed to send reply: {}", e))?;

        Ok(())
    }
}

async fn find_payment(conn: &mut AsyncPgConnection, reference: &str) -> Result<Payment> {
    payments::table
        .filter(payments::reference.eq(reference))
        .select(Payment::as_select())
        .for_update()
        .first(conn)
        .await
        .optional()?
        .ok_or_else(|| anyhow!("unknown payment reference {}", reference))
}

async fn set_status(conn: &mut AsyncPgConnection, payment: &Payment, status: PaymentStatus) -> Result<Payment> {
    let updated = diesel::update(payments::table.find(payment.id))
        .set((
            payments::status.eq(status.as_str()),
            payments::processed_at.eq(Some(Utc::now())),
            payments::updated_at.eq(Utc::now()),
        ))
        .returning(Payment::as_returning())
        .get_result(conn)
        .await?;
    Ok(updated)
}

async fn handle_initiate_checkout(conn: &mut AsyncPgConnection, command: &Command) -> Result<CommandReply> {
    let checkout: CheckoutData = serde_json::from_value(command.payload.clone())?;
    let amount_minor = to_minor_units(&checkout.amount)
        .ok_or_else(|| anyhow!("amount {} out of range", checkout.amount))?;

    let new_payment = NewPayment {
        id: Uuid::new_v4(),
        order_id: checkout.order_id,
        user_id: checkout.user_id,
        reference: checkout.reference.clone(),
        amount: checkout.amount.clone(),
        amount_minor,
        currency: checkout.currency.clone(),
        status: PaymentStatus::Pending.as_str().to_string(),
    };

    diesel::insert_into(payments::table)
        .values(&new_payment)
        .on_conflict(payments::reference)
        .do_nothing()
        .execute(conn)
        .await?;

    let payment = find_payment(conn, &checkout.reference).await?;
    info!(
        "Opened checkout {} for order {}: {} {} ({} minor)",
        payment.reference, payment.order_id, payment.amount, payment.currency, payment.amount_minor
    );
    Ok(CommandReply::success(command, Some(serde_json::to_value(payment.outcome())?)))
}

async fn handle_verify_payment(conn: &mut AsyncPgConnection, command: &Command, success_rate: f64) -> Result<CommandReply> {
    let request: PaymentReference = serde_json::from_value(command.payload.clone())?;
    let payment = find_payment(conn, &request.reference).await?;
    if payment.order_id != request.order_id {
        return Ok(CommandReply::failed(command, "reference belongs to another order".to_string()));
    }

    let current = payment.status();
    let next = verification_status(current, rand::random::<f64>(), success_rate);
    let payment = if next != current {
        set_status(conn, &payment, next).await?
    } else {
        payment
    };

    info!("Verified {} for order {}: {}", payment.reference, payment.order_id, payment.status);
    Ok(CommandReply::success(command, Some(serde_json::to_value(payment.outcome())?)))
}

async fn handle_refund_payment(conn: &mut AsyncPgConnection, command: &Command) -> Result<CommandReply> {
    let request: PaymentReference = serde_json::from_value(command.payload.clone())?;
    let payment = find_payment(conn, &request.reference).await?;

    let current = payment.status();
    let next = refund_status(current);
    let payment = if next != current {
        set_status(conn, &payment, next).await?
    } else {
        payment
    };

    info!("Refund for order {}: payment {} is {}", payment.order_id, payment.reference, payment.status);
    Ok(CommandReply::success(command, Some(serde_json::to_value(payment.outcome())?)))
}

async fn store_processed_command(conn: &mut AsyncPgConnection, command: &Command, reply: &CommandReply) -> Result<()> {
    let processed_command = ProcessedCommand {
        idempotency_key: command.idempotency_key.clone(),
        command_id: command.id,
        result: Some(serde_json::to_value(reply)?),
        processed_at: Some(Utc::now()),
    };

    diesel::insert_into(processed_commands::table)
        .values(&processed_command)
        .execute(conn)
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn minor_units_round_to_the_nearest_kobo() {
        assert_eq!(to_minor_units(&BigDecimal::from_str("1250.50").unwrap()), Some(125050));
        assert_eq!(to_minor_units(&BigDecimal::from_str("10.004").unwrap()), Some(1000));
        assert_eq!(to_minor_units(&BigDecimal::from_str("10.006").unwrap()), Some(1001));
        assert_eq!(to_minor_units(&BigDecimal::from(0)), Some(0));
    }

    #[test]
    fn verification_only_moves_pending_payments() {
        assert_eq!(verification_status(PaymentStatus::Pending, 0.1, 0.8), PaymentStatus::Success);
        assert_eq!(verification_status(PaymentStatus::Pending, 0.9, 0.8), PaymentStatus::Failed);
        assert_eq!(verification_status(PaymentStatus::Refunded, 0.1, 0.8), PaymentStatus::Refunded);
        assert_eq!(verification_status(PaymentStatus::Failed, 0.1, 0.8), PaymentStatus::Failed);
    }

    #[test]
    fn refunds_void_uncaptured_payments() {
        assert_eq!(refund_status(PaymentStatus::Success), PaymentStatus::Refunded);
        assert_eq!(refund_status(PaymentStatus::Refunded), PaymentStatus::Refunded);
        assert_eq!(refund_status(PaymentStatus::Pending), PaymentStatus::Failed);
    }
}
