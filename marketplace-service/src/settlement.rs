//! Merchant settlement ledger: one escrowed split per (order, merchant).

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, AsyncPgConnection, RunQueryDsl};
use serde::Serialize;
use shared::{merchant_gross, split_amounts, SplitStatus};
use tracing::info;
use uuid::Uuid;

use crate::config::SettlementPolicy;
use crate::error::{MarketError, MarketResult};
use crate::models::{NewOrderItem, NewOrderMerchantSplit, OrderMerchantSplit};
use crate::schema::order_merchant_splits;
use crate::DbPool;

/// Writes the splits for a freshly converted order. Runs inside the conversion transaction.
pub async fn create_splits(
    conn: &mut AsyncPgConnection,
    order_id: Uuid,
    items: &[NewOrderItem],
    policy: &SettlementPolicy,
    now: DateTime<Utc>,
) -> MarketResult<Vec<OrderMerchantSplit>> {
    let gross = merchant_gross(items.iter().map(|i| (i.merchant_id, &i.price, i.quantity)));

    let rows: Vec<NewOrderMerchantSplit> = gross
        .into_iter()
        .map(|(merchant_id, gross)| {
            let amounts = split_amounts(&gross, &policy.commission_rate);
            NewOrderMerchantSplit {
                id: Uuid::new_v4(),
                order_id,
                merchant_id,
                gross_amount: amounts.gross,
                fee: amounts.fee,
                amount_due: amounts.amount_due,
                status: SplitStatus::Pending.to_string(),
                hold_until: now + policy.escrow,
            }
        })
        .collect();

    let splits = diesel::insert_into(order_merchant_splits::table)
        .values(&rows)
        .returning(OrderMerchantSplit::as_returning())
        .get_results(conn)
        .await?;
    Ok(splits)
}

/// Voids every split of a cancelled order that has not been paid out. Rows are kept.
pub async fn reverse_for_order(conn: &mut AsyncPgConnection, order_id: Uuid) -> MarketResult<usize> {
    let reversible = [
        SplitStatus::Pending.as_str(),
        SplitStatus::PayoutRequested.as_str(),
    ];
    let reversed = diesel::update(order_merchant_splits::table)
        .filter(order_merchant_splits::order_id.eq(order_id))
        .filter(order_merchant_splits::status.eq_any(reversible))
        .set((
            order_merchant_splits::status.eq(SplitStatus::Reversed.as_str()),
            order_merchant_splits::updated_at.eq(Utc::now()),
        ))
        .execute(conn)
        .await?;
    Ok(reversed)
}

pub async fn splits_for_order(conn: &mut AsyncPgConnection, order_id: Uuid) -> MarketResult<Vec<OrderMerchantSplit>> {
    let splits = order_merchant_splits::table
        .filter(order_merchant_splits::order_id.eq(order_id))
        .order(order_merchant_splits::merchant_id.asc())
        .select(OrderMerchantSplit::as_select())
        .load(conn)
        .await?;
    Ok(splits)
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutRequest {
    pub merchant_id: Uuid,
    pub splits: Vec<OrderMerchantSplit>,
    pub total: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MerchantBalance {
    /// Past escrow and ready for a payout request.
    pub available: BigDecimal,
    /// Still inside the escrow window.
    pub held: BigDecimal,
    pub payout_requested: BigDecimal,
    pub paid: BigDecimal,
}

impl MerchantBalance {
    fn summarize<'a, I>(splits: I, now: DateTime<Utc>) -> MarketResult<Self>
    where
        I: IntoIterator<Item = &'a OrderMerchantSplit>,
    {
        let zero = || BigDecimal::from(0).with_scale(2);
        let mut balance = MerchantBalance {
            available: zero(),
            held: zero(),
            payout_requested: zero(),
            paid: zero(),
        };
        for split in splits {
            let bucket = match split.status.parse::<SplitStatus>()? {
                SplitStatus::Pending if split.hold_until <= now => &mut balance.available,
                SplitStatus::Pending => &mut balance.held,
                SplitStatus::PayoutRequested => &mut balance.payout_requested,
                SplitStatus::Paid => &mut balance.paid,
                SplitStatus::Reversed => continue,
            };
            *bucket += &split.amount_due;
        }
        Ok(balance)
    }
}

fn total_due(splits: &[OrderMerchantSplit]) -> BigDecimal {
    splits
        .iter()
        .fold(BigDecimal::from(0).with_scale(2), |acc, s| acc + &s.amount_due)
}

#[derive(Clone)]
pub struct SettlementService {
    pool: DbPool,
}

impl SettlementService {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Pending splits whose escrow hold has ended.
    pub async fn eligible_splits(&self, merchant_id: Uuid, now: DateTime<Utc>) -> MarketResult<Vec<OrderMerchantSplit>> {
        let mut conn = self.pool.get().await?;
        let splits = order_merchant_splits::table
            .filter(order_merchant_splits::merchant_id.eq(merchant_id))
            .filter(order_merchant_splits::status.eq(SplitStatus::Pending.as_str()))
            .filter(order_merchant_splits::hold_until.le(now))
            .order(order_merchant_splits::hold_until.asc())
            .select(OrderMerchantSplit::as_select())
            .load(&mut conn)
            .await?;
        Ok(splits)
    }

    /// Claims every eligible split for a payout in one statement; the transfer itself happens elsewhere.
    pub async fn request_payout(&self, merchant_id: Uuid) -> MarketResult<PayoutRequest> {
        let mut conn = self.pool.get().await?;
        let now = Utc::now();
        let splits = diesel::update(order_merchant_splits::table)
            .filter(order_merchant_splits::merchant_id.eq(merchant_id))
            .filter(order_merchant_splits::status.eq(SplitStatus::Pending.as_str()))
            .filter(order_merchant_splits::hold_until.le(now))
            .set((
                order_merchant_splits::status.eq(SplitStatus::PayoutRequested.as_str()),
                order_merchant_splits::updated_at.eq(now),
            ))
            .returning(OrderMerchantSplit::as_returning())
            .get_results(&mut conn)
            .await?;

        let total = total_due(&splits);
        info!(
            "Merchant {} requested payout of {} over {} splits",
            merchant_id,
            total,
            splits.len()
        );
        Ok(PayoutRequest {
            merchant_id,
            splits,
            total,
        })
    }

    /// Confirms a payout. Every split must currently be `payout_requested`, or nothing changes.
    pub async fn mark_paid(&self, split_ids: &[Uuid]) -> MarketResult<Vec<OrderMerchantSplit>> {
        let mut conn = self.pool.get().await?;
        let split_ids = split_ids.to_vec();

        conn.transaction::<_, MarketError, _>(|conn| {
            Box::pin(async move {
                let locked = order_merchant_splits::table
                    .filter(order_merchant_splits::id.eq_any(&split_ids))
                    .select(OrderMerchantSplit::as_select())
                    .for_update()
                    .load(conn)
                    .await?;

                for id in &split_ids {
                    let split = locked
                        .iter()
                        .find(|s| s.id == *id)
                        .ok_or_else(|| MarketError::TransactionFailed(anyhow::anyhow!("split {} not found", id)))?;
                    split.status.parse::<SplitStatus>()?.transition(SplitStatus::Paid)?;
                }

                let paid = diesel::update(order_merchant_splits::table)
                    .filter(order_merchant_splits::id.eq_any(&split_ids))
                    .set((
                        order_merchant_splits::status.eq(SplitStatus::Paid.as_str()),
                        order_merchant_splits::updated_at.eq(Utc::now()),
                    ))
                    .returning(OrderMerchantSplit::as_returning())
                    .get_results(conn)
                    .await?;
                Ok(paid)
            })
        })
        .await
    }

    pub async fn balance(&self, merchant_id: Uuid) -> MarketResult<MerchantBalance> {
        let mut conn = self.pool.get().await?;
        let splits = order_merchant_splits::table
            .filter(order_merchant_splits::merchant_id.eq(merchant_id))
            .select(OrderMerchantSplit::as_select())
            .load(&mut conn)
            .await?;
        MerchantBalance::summarize(&splits, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::str::FromStr;

    fn split(status: SplitStatus, due: &str, hold_until: DateTime<Utc>) -> OrderMerchantSplit {
        let now = Utc::now();
        OrderMerchantSplit {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            merchant_id: Uuid::nil(),
            gross_amount: BigDecimal::from_str(due).unwrap(),
            fee: BigDecimal::from(0),
            amount_due: BigDecimal::from_str(due).unwrap(),
            status: status.to_string(),
            hold_until,
            created_at: now,
            updated_at: now,
        }
    }

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn balance_buckets_by_status_and_escrow() {
        let now = Utc::now();
        let splits = vec![
            split(SplitStatus::Pending, "10.00", now - Duration::hours(1)),
            split(SplitStatus::Pending, "5.50", now + Duration::hours(1)),
            split(SplitStatus::PayoutRequested, "7.25", now - Duration::hours(5)),
            split(SplitStatus::Paid, "3.00", now - Duration::days(5)),
            split(SplitStatus::Reversed, "99.99", now - Duration::days(5)),
        ];

        let balance = MerchantBalance::summarize(&splits, now).unwrap();
        assert_eq!(balance.available, dec("10.00"));
        assert_eq!(balance.held, dec("5.50"));
        assert_eq!(balance.payout_requested, dec("7.25"));
        assert_eq!(balance.paid, dec("3.00"));
    }

    #[test]
    fn hold_ending_exactly_now_is_available() {
        let now = Utc::now();
        let balance = MerchantBalance::summarize(&[split(SplitStatus::Pending, "1.00", now)], now).unwrap();
        assert_eq!(balance.available, dec("1.00"));
        assert_eq!(balance.held, dec("0"));
    }

    #[test]
    fn unknown_split_status_is_an_error() {
        let mut bad = split(SplitStatus::Pending, "1.00", Utc::now());
        bad.status = "lost".into();
        assert!(MerchantBalance::summarize(&[bad], Utc::now()).is_err());
    }

    #[test]
    fn total_due_sums_amounts() {
        let now = Utc::now();
        let splits = [
            split(SplitStatus::PayoutRequested, "1.10", now),
            split(SplitStatus::PayoutRequested, "2.20", now),
        ];
        assert_eq!(total_due(&splits), dec("3.30"));
    }
}
