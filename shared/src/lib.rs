pub mod settlement;
pub mod status;
pub mod stock;

pub use settlement::{line_total, merchant_gross, split_amounts, SplitAmounts};
pub use status::{
    derive_order_status, CartStatus, FulfillmentStatus, OrderStatus, SplitStatus, StatusError,
};
pub use stock::{InventoryTarget, StockLevel, StockStatus};

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub order_id: Uuid,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandType {
    InitiateCheckout,
    VerifyPayment,
    RefundPayment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReply {
    pub id: Uuid,
    pub command_id: Uuid,
    pub order_id: Uuid,
    pub command_type: CommandType,
    pub status: CommandStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutData {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub reference: String,
    pub amount: BigDecimal,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentReference {
    pub order_id: Uuid,
    pub reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Success => "success",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PaymentStatus::Pending),
            "success" => Some(PaymentStatus::Success),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

/// What the payment service reports back for a reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOutcome {
    pub order_id: Uuid,
    pub reference: String,
    pub status: PaymentStatus,
    pub authorization_url: Option<String>,
}

/// Fire-and-forget notification, published only after the writing transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub recipient: Uuid,
    pub template: String,
    pub data: serde_json::Value,
}

impl NotificationEvent {
    pub fn new(recipient: Uuid, template: &str, data: serde_json::Value) -> Self {
        Self {
            recipient,
            template: template.to_string(),
            data,
        }
    }
}

impl Command {
    pub fn new(order_id: Uuid, command_type: CommandType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id,
            command_type,
            payload,
            idempotency_key: format!("{}_{:?}_{}", order_id, command_type, Uuid::new_v4()),
            created_at: Utc::now(),
        }
    }

    /// Refunds are keyed on the order alone so a resend can never refund twice.
    pub fn refund(order_id: Uuid, payload: serde_json::Value) -> Self {
        Self {
            idempotency_key: format!("{}_{:?}", order_id, CommandType::RefundPayment),
            ..Self::new(order_id, CommandType::RefundPayment, payload)
        }
    }
}

impl CommandReply {
    pub fn success(command: &Command, result: Option<serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id: command.id,
            order_id: command.order_id,
            command_type: command.command_type,
            status: CommandStatus::Success,
            result,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn failed(command: &Command, error: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            command_id: command.id,
            order_id: command.order_id,
            command_type: command.command_type,
            status: CommandStatus::Failed,
            result: None,
            error: Some(error),
            created_at: Utc::now(),
        }
    }
}
