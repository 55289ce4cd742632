use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    #[error("unknown {kind} status: {value}")]
    Unknown { kind: &'static str, value: String },
    #[error("{kind} cannot move from {from} to {to}")]
    InvalidTransition {
        kind: &'static str,
        from: String,
        to: String,
    },
}

macro_rules! status_strings {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }

            /// Checks the move against the transition table and returns the new state.
            pub fn transition(self, next: $ty) -> Result<$ty, StatusError> {
                if self.can_transition_to(next) {
                    Ok(next)
                } else {
                    Err(StatusError::InvalidTransition {
                        kind: $kind,
                        from: self.as_str().to_string(),
                        to: next.as_str().to_string(),
                    })
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = StatusError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(StatusError::Unknown {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CartStatus {
    Active,
    Converted,
    Abandoned,
}

status_strings!(CartStatus, "cart", {
    Active => "active",
    Converted => "converted",
    Abandoned => "abandoned",
});

impl CartStatus {
    pub fn can_transition_to(self, next: CartStatus) -> bool {
        matches!(
            (self, next),
            (CartStatus::Active, CartStatus::Converted) | (CartStatus::Active, CartStatus::Abandoned)
        )
    }
}

/// Coarse order status. Per-merchant progress lives on the order items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Shipped,
    Completed,
    Cancelled,
}

status_strings!(OrderStatus, "order", {
    Pending => "Pending",
    Paid => "Paid",
    Processing => "Processing",
    Shipped => "Shipped",
    Completed => "Completed",
    Cancelled => "Cancelled",
});

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Paid, Processing)
                | (Paid, Shipped)
                | (Paid, Completed)
                | (Processing, Shipped)
                | (Processing, Completed)
                | (Shipped, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FulfillmentStatus {
    Processing,
    Confirmed,
    Declined,
    SentToAronovaHub,
    Shipped,
}

status_strings!(FulfillmentStatus, "fulfillment", {
    Processing => "Processing",
    Confirmed => "Confirmed",
    Declined => "Declined",
    SentToAronovaHub => "SentToAronovaHub",
    Shipped => "Shipped",
});

impl FulfillmentStatus {
    pub fn can_transition_to(self, next: FulfillmentStatus) -> bool {
        use FulfillmentStatus::*;
        matches!(
            (self, next),
            (Processing, Confirmed)
                | (Processing, Declined)
                | (Confirmed, SentToAronovaHub)
                | (SentToAronovaHub, Shipped)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FulfillmentStatus::Declined | FulfillmentStatus::Shipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitStatus {
    Pending,
    PayoutRequested,
    Paid,
    Reversed,
}

status_strings!(SplitStatus, "settlement split", {
    Pending => "pending",
    PayoutRequested => "payout_requested",
    Paid => "paid",
    Reversed => "reversed",
});

impl SplitStatus {
    pub fn can_transition_to(self, next: SplitStatus) -> bool {
        use SplitStatus::*;
        matches!(
            (self, next),
            (Pending, PayoutRequested)
                | (Pending, Reversed)
                | (PayoutRequested, Paid)
                | (PayoutRequested, Reversed)
        )
    }
}

/// Derives the order's aggregate status from its items.
///
/// Only orders that are already paid and in fulfillment move; declined lines
/// are ignored, and an order whose every line was declined is left alone.
/// Returns `None` when the status should not change.
pub fn derive_order_status(current: OrderStatus, items: &[FulfillmentStatus]) -> Option<OrderStatus> {
    if !matches!(
        current,
        OrderStatus::Paid | OrderStatus::Processing | OrderStatus::Shipped
    ) {
        return None;
    }

    let active: Vec<FulfillmentStatus> = items
        .iter()
        .copied()
        .filter(|s| *s != FulfillmentStatus::Declined)
        .collect();
    if active.is_empty() {
        return None;
    }

    let next = if active.iter().all(|s| *s == FulfillmentStatus::Shipped) {
        OrderStatus::Completed
    } else if active.iter().all(|s| {
        matches!(
            s,
            FulfillmentStatus::SentToAronovaHub | FulfillmentStatus::Shipped
        )
    }) {
        OrderStatus::Shipped
    } else if items.iter().any(|s| *s != FulfillmentStatus::Processing) {
        OrderStatus::Processing
    } else {
        return None;
    };

    if next != current && current.can_transition_to(next) {
        Some(next)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fulfillment_happy_path_is_accepted_in_order() {
        let mut status = FulfillmentStatus::Processing;
        for next in [
            FulfillmentStatus::Confirmed,
            FulfillmentStatus::SentToAronovaHub,
            FulfillmentStatus::Shipped,
        ] {
            status = status.transition(next).unwrap();
        }
        assert_eq!(status, FulfillmentStatus::Shipped);
    }

    #[test]
    fn processing_cannot_jump_to_shipped() {
        let err = FulfillmentStatus::Processing
            .transition(FulfillmentStatus::Shipped)
            .unwrap_err();
        assert_eq!(
            err,
            StatusError::InvalidTransition {
                kind: "fulfillment",
                from: "Processing".into(),
                to: "Shipped".into(),
            }
        );
    }

    #[test]
    fn order_leaves_pending_only_by_payment_or_cancellation() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Paid));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Shipped));
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn status_strings_round_trip_through_from_str() {
        for s in FulfillmentStatus::ALL {
            assert_eq!(s.as_str().parse::<FulfillmentStatus>().unwrap(), *s);
        }
        assert_eq!(
            "payout_requested".parse::<SplitStatus>().unwrap(),
            SplitStatus::PayoutRequested
        );
        assert!("New".parse::<FulfillmentStatus>().is_err());
    }

    #[test]
    fn serde_names_match_stored_strings() {
        assert_eq!(
            serde_json::to_value(SplitStatus::PayoutRequested).unwrap(),
            serde_json::json!("payout_requested")
        );
        assert_eq!(
            serde_json::to_value(CartStatus::Active).unwrap(),
            serde_json::json!("active")
        );
        assert_eq!(
            serde_json::to_value(FulfillmentStatus::SentToAronovaHub).unwrap(),
            serde_json::json!("SentToAronovaHub")
        );
    }

    #[test]
    fn aggregate_status_follows_items() {
        use FulfillmentStatus::*;
        assert_eq!(
            derive_order_status(OrderStatus::Paid, &[Confirmed, Processing]),
            Some(OrderStatus::Processing)
        );
        assert_eq!(
            derive_order_status(OrderStatus::Processing, &[SentToAronovaHub, Declined]),
            Some(OrderStatus::Shipped)
        );
        assert_eq!(
            derive_order_status(OrderStatus::Shipped, &[Shipped, Shipped]),
            Some(OrderStatus::Completed)
        );
        assert_eq!(derive_order_status(OrderStatus::Paid, &[Processing]), None);
        assert_eq!(derive_order_status(OrderStatus::Paid, &[Declined, Declined]), None);
        assert_eq!(derive_order_status(OrderStatus::Pending, &[Confirmed]), None);
        assert_eq!(derive_order_status(OrderStatus::Cancelled, &[Shipped]), None);
    }

    fn fulfillment() -> impl Strategy<Value = FulfillmentStatus> {
        prop::sample::select(FulfillmentStatus::ALL.to_vec())
    }

    fn order() -> impl Strategy<Value = OrderStatus> {
        prop::sample::select(OrderStatus::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn terminal_fulfillment_states_reject_everything(from in fulfillment(), to in fulfillment()) {
            if from.is_terminal() {
                prop_assert!(from.transition(to).is_err());
            }
        }

        #[test]
        fn no_order_transition_leaves_a_terminal_state(from in order(), to in order()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        #[test]
        fn derived_status_is_always_a_legal_move(
            current in order(),
            items in prop::collection::vec(fulfillment(), 0..6),
        ) {
            if let Some(next) = derive_order_status(current, &items) {
                prop_assert!(current.can_transition_to(next));
            }
        }
    }
}
