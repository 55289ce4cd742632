use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    response::{Json, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::FulfillmentStatus;
use std::sync::Arc;
use uuid::Uuid;

use crate::cancellation::{CancelOutcome, CancellationService};
use crate::cart::{AddCartItem, CartService, CartView};
use crate::config::EngineConfig;
use crate::error::{json_error, MarketError};
use crate::fulfillment::{FulfillmentService, ItemTransition};
use crate::ledger::{CreateInventory, InventoryService, InventoryView};
use crate::models::{CartItem, Order, OrderItem, OrderMerchantSplit};
use crate::orders::{OrderDetails, OrderService, PlacedOrder};
use crate::payments::PaymentGateway;
use crate::settlement::{MerchantBalance, PayoutRequest, SettlementService};
use crate::DbPool;

type ApiResult<T> = Result<T, MarketError>;

#[derive(Clone)]
pub struct AppState {
    pub carts: CartService,
    pub orders: OrderService,
    pub fulfillment: FulfillmentService,
    pub cancellations: CancellationService,
    pub inventory: InventoryService,
    pub settlement: SettlementService,
}

impl AppState {
    pub fn new(pool: DbPool, config: EngineConfig, payments: Arc<dyn PaymentGateway>) -> Self {
        Self {
            carts: CartService::new(pool.clone()),
            orders: OrderService::new(pool.clone(), config.clone(), payments.clone()),
            fulfillment: FulfillmentService::new(pool.clone()),
            cancellations: CancellationService::new(pool.clone(), payments, config.abandon_after),
            inventory: InventoryService::new(pool.clone()),
            settlement: SettlementService::new(pool),
        }
    }
}

/// Buyer identity, set by the authentication layer in front of this service.
#[derive(Debug, Clone, Copy)]
pub struct UserId(pub Uuid);

/// Merchant identity, set by the authentication layer in front of this service.
#[derive(Debug, Clone, Copy)]
pub struct MerchantId(pub Uuid);

fn header_uuid(parts: &Parts, name: &'static str) -> Result<Uuid, Response> {
    let value = parts
        .headers
        .get(name)
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "missing_identity", format!("missing {} header", name)))?;
    value
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .ok_or_else(|| json_error(StatusCode::BAD_REQUEST, "invalid_identity", format!("{} must be a uuid", name)))
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for UserId {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_uuid(parts, "x-user-id").map(UserId)
    }
}

#[axum::async_trait]
impl<S: Send + Sync> FromRequestParts<S> for MerchantId {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        header_uuid(parts, "x-merchant-id").map(MerchantId)
    }
}

#[derive(Debug, Deserialize)]
pub struct BulkAddRequest {
    pub items: Vec<AddCartItem>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateQuantityRequest {
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub status: FulfillmentStatus,
}

#[derive(Debug, Deserialize)]
pub struct MerchantItemsQuery {
    pub status: Option<FulfillmentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct AdjustRequest {
    pub delta: i32,
}

#[derive(Debug, Deserialize)]
pub struct MarkPaidRequest {
    pub split_ids: Vec<Uuid>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/cart", get(get_cart).delete(clear_cart))
        .route("/cart/items", post(add_cart_item))
        .route("/cart/items/bulk", post(add_cart_items))
        .route("/cart/items/:item_id", patch(update_cart_item).delete(remove_cart_item))
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id/cancel", post(cancel_order))
        .route("/orders/:order_id/verify-payment", post(verify_payment))
        .route("/merchant/order-items", get(list_merchant_items))
        .route("/merchant/order-items/:item_id/status", post(transition_item))
        .route("/merchant/inventory", post(create_inventory))
        .route("/merchant/inventory/:inventory_id", get(get_inventory))
        .route("/merchant/inventory/:inventory_id/adjust", post(adjust_inventory))
        .route("/merchant/settlement/balance", get(settlement_balance))
        .route("/merchant/settlement/eligible", get(eligible_splits))
        .route("/merchant/settlement/payouts", post(request_payout))
        .route("/internal/settlement/paid", post(mark_splits_paid))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check() -> &'static str {
    "OK"
}

async fn get_cart(State(state): State<AppState>, UserId(user): UserId) -> ApiResult<Json<CartView>> {
    Ok(Json(state.carts.get_cart(user).await?))
}

async fn clear_cart(State(state): State<AppState>, UserId(user): UserId) -> ApiResult<StatusCode> {
    state.carts.clear_cart(user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_cart_item(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(request): Json<AddCartItem>,
) -> ApiResult<(StatusCode, Json<CartItem>)> {
    let item = state.carts.add_item(user, request).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn add_cart_items(
    State(state): State<AppState>,
    UserId(user): UserId,
    Json(request): Json<BulkAddRequest>,
) -> ApiResult<(StatusCode, Json<Vec<CartItem>>)> {
    let items = state.carts.add_items(user, request.items).await?;
    Ok((StatusCode::CREATED, Json(items)))
}

async fn update_cart_item(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(item_id): Path<Uuid>,
    Json(request): Json<UpdateQuantityRequest>,
) -> ApiResult<Response> {
    use axum::response::IntoResponse;

    match state
        .carts
        .update_item_quantity(user, item_id, request.quantity)
        .await?
    {
        Some(item) => Ok(Json(item).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn remove_cart_item(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(item_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    state.carts.remove_item(user, item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_order(
    State(state): State<AppState>,
    UserId(user): UserId,
) -> ApiResult<(StatusCode, Json<PlacedOrder>)> {
    let placed = state.orders.create_order(user).await?;
    Ok((StatusCode::CREATED, Json(placed)))
}

async fn list_orders(State(state): State<AppState>, UserId(user): UserId) -> ApiResult<Json<Vec<Order>>> {
    Ok(Json(state.orders.list_orders(user).await?))
}

async fn get_order(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(order_id): Path<Uuid>,
) -> ApiResult<Json<OrderDetails>> {
    Ok(Json(state.orders.get_order(user, order_id).await?))
}

async fn cancel_order(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(order_id): Path<Uuid>,
    request: Option<Json<CancelRequest>>,
) -> ApiResult<Json<CancelOutcome>> {
    let reason = request.and_then(|Json(r)| r.reason);
    Ok(Json(
        state
            .cancellations
            .cancel_order(order_id, user, reason)
            .await?,
    ))
}

async fn verify_payment(
    State(state): State<AppState>,
    UserId(user): UserId,
    Path(order_id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<Order>)> {
    let order = state.orders.verify_payment(user, order_id).await?;
    Ok((StatusCode::ACCEPTED, Json(order)))
}

async fn list_merchant_items(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
    Query(query): Query<MerchantItemsQuery>,
) -> ApiResult<Json<Vec<OrderItem>>> {
    Ok(Json(
        state
            .orders
            .list_merchant_items(merchant, query.status)
            .await?,
    ))
}

async fn transition_item(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
    Path(item_id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Json<ItemTransition>> {
    Ok(Json(
        state
            .fulfillment
            .transition_item(merchant, item_id, request.status)
            .await?,
    ))
}

async fn create_inventory(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
    Json(request): Json<CreateInventory>,
) -> ApiResult<(StatusCode, Json<InventoryView>)> {
    let view = state.inventory.create(merchant, request).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_inventory(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
    Path(inventory_id): Path<Uuid>,
) -> ApiResult<Json<InventoryView>> {
    Ok(Json(state.inventory.get(merchant, inventory_id).await?))
}

async fn adjust_inventory(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
    Path(inventory_id): Path<Uuid>,
    Json(request): Json<AdjustRequest>,
) -> ApiResult<Json<InventoryView>> {
    Ok(Json(
        state
            .inventory
            .adjust(merchant, inventory_id, request.delta)
            .await?,
    ))
}

async fn settlement_balance(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
) -> ApiResult<Json<MerchantBalance>> {
    Ok(Json(state.settlement.balance(merchant).await?))
}

async fn eligible_splits(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
) -> ApiResult<Json<Vec<OrderMerchantSplit>>> {
    Ok(Json(
        state
            .settlement
            .eligible_splits(merchant, Utc::now())
            .await?,
    ))
}

async fn request_payout(
    State(state): State<AppState>,
    MerchantId(merchant): MerchantId,
) -> ApiResult<Json<PayoutRequest>> {
    Ok(Json(state.settlement.request_payout(merchant).await?))
}

async fn mark_splits_paid(
    State(state): State<AppState>,
    Json(request): Json<MarkPaidRequest>,
) -> ApiResult<Json<Vec<OrderMerchantSplit>>> {
    Ok(Json(state.settlement.mark_paid(&request.split_ids).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::Checkout;
    use axum::body::Body;
    use axum::http::Request;
    use diesel_async::pooled_connection::AsyncDieselConnectionManager;
    use diesel_async::AsyncPgConnection;
    use shared::CheckoutData;
    use tower::ServiceExt;

    struct Unreachable;

    #[async_trait::async_trait]
    impl PaymentGateway for Unreachable {
        async fn initiate_checkout(&self, _: &CheckoutData) -> Result<Checkout, MarketError> {
            Err(MarketError::Payment("unreachable".into()))
        }
        async fn verify_payment(&self, _: Uuid, _: &str) -> Result<(), MarketError> {
            Err(MarketError::Payment("unreachable".into()))
        }
        async fn request_refund(&self, _: Uuid, _: &str) -> Result<(), MarketError> {
            Err(MarketError::Payment("unreachable".into()))
        }
    }

    // The pool never connects: every request here is rejected before touching the database.
    fn app() -> Router {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new("postgres://unused@localhost/unused");
        let pool = DbPool::builder().build_unchecked(manager);
        create_router(AppState::new(pool, EngineConfig::default(), Arc::new(Unreachable)))
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cart_requires_user_header() {
        let response = app()
            .oneshot(Request::get("/cart").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "missing_identity");
    }

    #[tokio::test]
    async fn bulk_add_route_requires_user_header() {
        let response = app()
            .oneshot(
                Request::post("/cart/items/bulk")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"items":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "missing_identity");
    }

    #[tokio::test]
    async fn merchant_routes_reject_malformed_ids() {
        let response = app()
            .oneshot(
                Request::get("/merchant/order-items")
                    .header("x-merchant-id", "not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "invalid_identity");
    }

    #[tokio::test]
    async fn market_errors_render_as_json() {
        use axum::response::IntoResponse;

        let response = MarketError::EmptyCart.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "empty_cart");
        assert_eq!(body["message"], "cart has no items");
    }
}
