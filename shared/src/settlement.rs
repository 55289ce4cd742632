use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitAmounts {
    pub gross: BigDecimal,
    pub fee: BigDecimal,
    pub amount_due: BigDecimal,
}

pub fn line_total(unit_price: &BigDecimal, quantity: i32) -> BigDecimal {
    (unit_price * BigDecimal::from(quantity)).with_scale(2)
}

/// Gross sales per merchant from `(merchant, unit price, quantity)` lines.
pub fn merchant_gross<'a, I>(lines: I) -> BTreeMap<Uuid, BigDecimal>
where
    I: IntoIterator<Item = (Uuid, &'a BigDecimal, i32)>,
{
    let mut totals: BTreeMap<Uuid, BigDecimal> = BTreeMap::new();
    for (merchant_id, price, quantity) in lines {
        *totals.entry(merchant_id).or_insert_with(|| BigDecimal::from(0)) += line_total(price, quantity);
    }
    totals
}

/// Platform fee is rounded to cents; the merchant gets the remainder so
/// `fee + amount_due == gross` exactly.
pub fn split_amounts(gross: &BigDecimal, commission_rate: &BigDecimal) -> SplitAmounts {
    let gross = gross.with_scale(2);
    let fee = (&gross * commission_rate).round(2).with_scale(2);
    let amount_due = (&gross - &fee).with_scale(2);
    SplitAmounts {
        gross,
        fee,
        amount_due,
    }
}
