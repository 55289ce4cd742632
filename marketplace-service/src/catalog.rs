//! Read-only lookups against the catalog tables.

use bigdecimal::BigDecimal;
use diesel::prelude::*;
use diesel_async::{AsyncPgConnection, RunQueryDsl};
use shared::InventoryTarget;
use std::collections::HashMap;
use uuid::Uuid;

use crate::error::{MarketError, MarketResult};
use crate::models::{Product, ProductVariant};
use crate::schema::{product_variants, products};

/// Loads a product that can still be put in a cart.
pub async fn sellable_product(conn: &mut AsyncPgConnection, product_id: Uuid) -> MarketResult<Product> {
    let product = products::table
        .find(product_id)
        .select(Product::as_select())
        .first(conn)
        .await
        .optional()?
        .filter(Product::is_sellable)
        .ok_or(MarketError::ProductNotFound(product_id))?;
    Ok(product)
}

/// The variant must be active and belong to `product_id`.
pub async fn sellable_variant(
    conn: &mut AsyncPgConnection,
    product_id: Uuid,
    variant_id: Uuid,
) -> MarketResult<ProductVariant> {
    let variant = product_variants::table
        .find(variant_id)
        .filter(product_variants::product_id.eq(product_id))
        .filter(product_variants::is_active.eq(true))
        .select(ProductVariant::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or(MarketError::VariantNotFound(variant_id))?;
    Ok(variant)
}

/// Finds the product an inventory target points at, whichever kind it is.
pub async fn owning_product(conn: &mut AsyncPgConnection, target: InventoryTarget) -> MarketResult<Product> {
    let product_id = match target {
        InventoryTarget::Product(id) => id,
        InventoryTarget::Variant(variant_id) => product_variants::table
            .find(variant_id)
            .select(product_variants::product_id)
            .first::<Uuid>(conn)
            .await
            .optional()?
            .ok_or(MarketError::VariantNotFound(variant_id))?,
    };

    products::table
        .find(product_id)
        .filter(products::deleted_at.is_null())
        .select(Product::as_select())
        .first(conn)
        .await
        .optional()?
        .ok_or(MarketError::ProductNotFound(product_id))
}

/// Unit prices for a set of cart lines: the variant price when there is one, else the base price.
#[derive(Debug, Default)]
pub struct PriceBook {
    products: HashMap<Uuid, BigDecimal>,
    variants: HashMap<Uuid, BigDecimal>,
}

impl PriceBook {
    /// Prices are read regardless of the active flag; a line already in a cart keeps its price source.
    pub async fn load<I>(conn: &mut AsyncPgConnection, lines: I) -> MarketResult<Self>
    where
        I: IntoIterator<Item = (Uuid, Option<Uuid>)>,
    {
        let (mut product_ids, mut variant_ids) = (Vec::new(), Vec::new());
        for (product_id, variant_id) in lines {
            match variant_id {
                Some(id) => variant_ids.push(id),
                None => product_ids.push(product_id),
            }
        }

        let mut book = PriceBook::default();
        if !product_ids.is_empty() {
            book.products = products::table
                .filter(products::id.eq_any(product_ids))
                .select((products::id, products::base_price))
                .load::<(Uuid, BigDecimal)>(conn)
                .await?
                .into_iter()
                .collect();
        }
        if !variant_ids.is_empty() {
            book.variants = product_variants::table
                .filter(product_variants::id.eq_any(variant_ids))
                .select((product_variants::id, product_variants::price))
                .load::<(Uuid, BigDecimal)>(conn)
                .await?
                .into_iter()
                .collect();
        }
        Ok(book)
    }

    pub fn price(&self, product_id: Uuid, variant_id: Option<Uuid>) -> MarketResult<BigDecimal> {
        match variant_id {
            Some(id) => self
                .variants
                .get(&id)
                .cloned()
                .ok_or(MarketError::VariantNotFound(id)),
            None => self
                .products
                .get(&product_id)
                .cloned()
                .ok_or(MarketError::ProductNotFound(product_id)),
        }
    }
}
