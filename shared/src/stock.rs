use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an inventory row counts: a simple product or one of its variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum InventoryTarget {
    Product(Uuid),
    Variant(Uuid),
}

impl InventoryTarget {
    /// Rebuilds the target from the two nullable key columns. Exactly one must be set.
    pub fn from_columns(product_id: Option<Uuid>, variant_id: Option<Uuid>) -> Option<Self> {
        match (product_id, variant_id) {
            (Some(id), None) => Some(InventoryTarget::Product(id)),
            (None, Some(id)) => Some(InventoryTarget::Variant(id)),
            _ => None,
        }
    }

    pub fn product_id(&self) -> Option<Uuid> {
        match self {
            InventoryTarget::Product(id) => Some(*id),
            InventoryTarget::Variant(_) => None,
        }
    }

    pub fn variant_id(&self) -> Option<Uuid> {
        match self {
            InventoryTarget::Product(_) => None,
            InventoryTarget::Variant(id) => Some(*id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    LowStock,
    OutOfStock,
    Backorder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StockLevel {
    pub quantity: i32,
    pub reserved_quantity: i32,
    pub low_stock_threshold: i32,
    pub backorder_allowed: bool,
}

impl StockLevel {
    /// Sellable units right now, never negative.
    pub fn available(&self) -> i32 {
        (self.quantity - self.reserved_quantity).max(0)
    }

    pub fn status(&self) -> StockStatus {
        let available = self.available();
        if available == 0 {
            if self.backorder_allowed {
                StockStatus::Backorder
            } else {
                StockStatus::OutOfStock
            }
        } else if available <= self.low_stock_threshold {
            StockStatus::LowStock
        } else {
            StockStatus::InStock
        }
    }

    pub fn is_low(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }

    /// `0 <= reserved <= quantity`, relaxed only for backorder rows.
    pub fn holds_invariant(&self) -> bool {
        self.reserved_quantity >= 0
            && (self.backorder_allowed
                || (self.quantity >= 0 && self.reserved_quantity <= self.quantity))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn level(quantity: i32, reserved: i32, backorder: bool) -> StockLevel {
        StockLevel {
            quantity,
            reserved_quantity: reserved,
            low_stock_threshold: 5,
            backorder_allowed: backorder,
        }
    }

    #[test]
    fn target_requires_exactly_one_key() {
        let id = Uuid::new_v4();
        assert_eq!(
            InventoryTarget::from_columns(Some(id), None),
            Some(InventoryTarget::Product(id))
        );
        assert_eq!(
            InventoryTarget::from_columns(None, Some(id)),
            Some(InventoryTarget::Variant(id))
        );
        assert_eq!(InventoryTarget::from_columns(None, None), None);
        assert_eq!(InventoryTarget::from_columns(Some(id), Some(id)), None);
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(level(20, 0, false).status(), StockStatus::InStock);
        assert_eq!(level(20, 16, false).status(), StockStatus::LowStock);
        assert_eq!(level(3, 3, false).status(), StockStatus::OutOfStock);
        assert_eq!(level(-2, 0, true).status(), StockStatus::Backorder);
    }

    #[test]
    fn low_includes_the_threshold_itself() {
        assert!(!level(6, 0, false).is_low());
        assert!(level(5, 0, false).is_low());
        assert!(level(9, 9, false).is_low());
    }

    #[test]
    fn oversold_backorder_row_reports_zero_available() {
        assert_eq!(level(-4, 2, true).available(), 0);
        assert!(level(-4, 2, true).holds_invariant());
        assert!(!level(-4, 2, false).holds_invariant());
    }

    proptest! {
        #[test]
        fn available_is_never_negative(q in -100i32..100, r in 0i32..200) {
            prop_assert!(level(q, r, true).available() >= 0);
        }

        #[test]
        fn available_plus_reserved_is_quantity_when_invariant_holds(q in 0i32..1000, r in 0i32..1000) {
            let l = level(q, r, false);
            if l.holds_invariant() {
                prop_assert_eq!(l.available() + l.reserved_quantity, l.quantity);
            }
        }
    }
}
