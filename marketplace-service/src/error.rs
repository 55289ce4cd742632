use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use diesel_async::pooled_connection::PoolError;
use serde_json::json;
use shared::StatusError;
use uuid::Uuid;

pub type MarketResult<T> = Result<T, MarketError>;

#[derive(Debug, thiserror::Error)]
pub enum MarketError {
    #[error("insufficient stock on inventory {inventory_id} for quantity {requested}")]
    InsufficientStock { inventory_id: Uuid, requested: i32 },
    #[error("{0}")]
    InvalidTransition(StatusError),
    #[error("cart has no items")]
    EmptyCart,
    #[error("no active cart")]
    CartNotFound,
    #[error("cart item {0} not found")]
    CartItemNotFound(Uuid),
    #[error("order {0} not found")]
    OrderNotFound(Uuid),
    #[error("order item {0} not found")]
    OrderItemNotFound(Uuid),
    #[error("no inventory for {0}")]
    InventoryNotFound(Uuid),
    #[error("product {0} not found")]
    ProductNotFound(Uuid),
    #[error("variant {0} not found")]
    VariantNotFound(Uuid),
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),
    #[error("invalid inventory target: {0}")]
    InvalidInventoryTarget(String),
    #[error("not allowed to act on this resource")]
    Unauthorized,
    #[error("payment service: {0}")]
    Payment(String),
    #[error("transaction failed: {0}")]
    TransactionFailed(#[source] anyhow::Error),
}

impl MarketError {
    pub fn code(&self) -> &'static str {
        match self {
            MarketError::InsufficientStock { .. } => "insufficient_stock",
            MarketError::InvalidTransition(_) => "invalid_transition",
            MarketError::EmptyCart => "empty_cart",
            MarketError::CartNotFound => "cart_not_found",
            MarketError::CartItemNotFound(_) => "cart_item_not_found",
            MarketError::OrderNotFound(_) => "order_not_found",
            MarketError::OrderItemNotFound(_) => "order_item_not_found",
            MarketError::InventoryNotFound(_) => "inventory_not_found",
            MarketError::ProductNotFound(_) => "product_not_found",
            MarketError::VariantNotFound(_) => "variant_not_found",
            MarketError::InvalidQuantity(_) => "invalid_quantity",
            MarketError::InvalidInventoryTarget(_) => "invalid_inventory_target",
            MarketError::Unauthorized => "unauthorized",
            MarketError::Payment(_) => "payment_error",
            MarketError::TransactionFailed(_) => "transaction_failed",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            MarketError::InsufficientStock { .. } | MarketError::InvalidTransition(_) => {
                StatusCode::CONFLICT
            }
            MarketError::EmptyCart
            | MarketError::InvalidQuantity(_)
            | MarketError::InvalidInventoryTarget(_) => StatusCode::UNPROCESSABLE_ENTITY,
            MarketError::CartNotFound
            | MarketError::CartItemNotFound(_)
            | MarketError::OrderNotFound(_)
            | MarketError::OrderItemNotFound(_)
            | MarketError::InventoryNotFound(_)
            | MarketError::ProductNotFound(_)
            | MarketError::VariantNotFound(_) => StatusCode::NOT_FOUND,
            MarketError::Unauthorized => StatusCode::FORBIDDEN,
            MarketError::Payment(_) => StatusCode::BAD_GATEWAY,
            MarketError::TransactionFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<diesel::result::Error> for MarketError {
    fn from(e: diesel::result::Error) -> Self {
        MarketError::TransactionFailed(e.into())
    }
}

impl From<bb8::RunError<PoolError>> for MarketError {
    fn from(e: bb8::RunError<PoolError>) -> Self {
        MarketError::TransactionFailed(anyhow::anyhow!("connection pool: {}", e))
    }
}

impl From<serde_json::Error> for MarketError {
    fn from(e: serde_json::Error) -> Self {
        MarketError::TransactionFailed(e.into())
    }
}

impl From<StatusError> for MarketError {
    fn from(e: StatusError) -> Self {
        match e {
            StatusError::InvalidTransition { .. } => MarketError::InvalidTransition(e),
            // A status column we cannot parse is corrupt data, not a caller mistake.
            StatusError::Unknown { .. } => MarketError::TransactionFailed(e.into()),
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

impl IntoResponse for MarketError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {:#}", self);
        }
        json_error(status, self.code(), self.to_string())
    }
}
