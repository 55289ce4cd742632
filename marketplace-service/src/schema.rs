diesel::table! {
    products (id) {
        id -> Uuid,
        merchant_id -> Uuid,
        name -> Varchar,
        base_price -> Numeric,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    product_variants (id) {
        id -> Uuid,
        product_id -> Uuid,
        name -> Varchar,
        price -> Numeric,
        is_active -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    inventory (id) {
        id -> Uuid,
        product_id -> Nullable<Uuid>,
        variant_id -> Nullable<Uuid>,
        merchant_id -> Uuid,
        quantity -> Int4,
        reserved_quantity -> Int4,
        low_stock_threshold -> Int4,
        backorder_allowed -> Bool,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    carts (id) {
        id -> Uuid,
        user_id -> Uuid,
        status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    cart_items (id) {
        id -> Uuid,
        cart_id -> Uuid,
        product_id -> Uuid,
        variant_id -> Nullable<Uuid>,
        merchant_id -> Uuid,
        inventory_id -> Uuid,
        quantity -> Int4,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Uuid,
        user_id -> Uuid,
        sub_total -> Numeric,
        total_amount -> Numeric,
        currency -> Varchar,
        status -> Varchar,
        payment_reference -> Nullable<Varchar>,
        cancellation_reason -> Nullable<Text>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_items (id) {
        id -> Uuid,
        order_id -> Uuid,
        merchant_id -> Uuid,
        product_id -> Uuid,
        variant_id -> Nullable<Uuid>,
        inventory_id -> Uuid,
        quantity -> Int4,
        price -> Numeric,
        fulfillment_status -> Varchar,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    order_merchant_splits (id) {
        id -> Uuid,
        order_id -> Uuid,
        merchant_id -> Uuid,
        gross_amount -> Numeric,
        fee -> Numeric,
        amount_due -> Numeric,
        status -> Varchar,
        hold_until -> Timestamptz,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    outbox_events (id) {
        id -> Uuid,
        aggregate_id -> Uuid,
        event_type -> Varchar,
        event_data -> Jsonb,
        processed -> Nullable<Bool>,
        created_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    processed_commands (idempotency_key) {
        idempotency_key -> Varchar,
        command_id -> Uuid,
        result -> Nullable<Jsonb>,
        processed_at -> Nullable<Timestamptz>,
    }
}

diesel::joinable!(product_variants -> products (product_id));
diesel::joinable!(cart_items -> carts (cart_id));
diesel::joinable!(cart_items -> inventory (inventory_id));
diesel::joinable!(order_items -> orders (order_id));
diesel::joinable!(order_merchant_splits -> orders (order_id));

diesel::allow_tables_to_appear_in_same_query!(
    products,
    product_variants,
    inventory,
    carts,
    cart_items,
    orders,
    order_items,
    order_merchant_splits,
    outbox_events,
    processed_commands,
);
