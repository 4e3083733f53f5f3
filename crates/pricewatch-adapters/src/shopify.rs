use async_trait::async_trait;
use pricewatch_core::Platform;
use pricewatch_storage::HttpFetcher;
use serde_json::Value as JsonValue;

use crate::{
    fetch_json, json_array, json_bool, json_id, json_money, json_str, json_text, require, variant_title,
    AdapterError, CatalogSource, FetchContext, ProductFacts, StoreTarget, VariantOffer, VendorLog,
};

const PAGE_LIMIT: usize = 250;

/// Shopify storefronts via the public `/products.json` listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShopifySource;

impl ShopifySource {
    pub fn page_url(base_url: &str, page: usize) -> String {
        format!("{base_url}/products.json?limit={PAGE_LIMIT}&page={page}")
    }
}

/// Shopify sends tags either as one comma-separated string or as an array.
fn shopify_tags(raw: &JsonValue) -> Vec<String> {
    match raw.get("tags") {
        Some(JsonValue::String(joined)) => joined
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect(),
        Some(JsonValue::Array(_)) => crate::json_string_vec(raw, &["tags"]),
        _ => Vec::new(),
    }
}

#[async_trait]
impl CatalogSource for ShopifySource {
    fn platform(&self) -> Platform {
        Platform::Shopify
    }

    async fn fetch_catalog(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        store: &StoreTarget,
        log: &mut VendorLog,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let mut products = Vec::new();
        for page in 1..=ctx.max_pages {
            let url = Self::page_url(&store.base_url, page);
            let body = fetch_json(http, ctx, store, &url).await?;
            let batch = json_array(&body, &["products"]);
            if batch.is_empty() {
                break;
            }
            log.info(format!("Page {page}: {} products", batch.len()));
            products.extend(batch.iter().cloned());
            if batch.len() < PAGE_LIMIT {
                break;
            }
            if page == ctx.max_pages {
                log.warn(format!("stopped at page limit {page}"));
            }
        }
        Ok(products)
    }

    fn describe(&self, raw: &JsonValue) -> Result<ProductFacts, AdapterError> {
        let title = require(json_text(raw, &["title"]), "title")?;
        Ok(ProductFacts {
            title,
            raw_categories: json_text(raw, &["product_type"]).into_iter().collect(),
            tags: shopify_tags(raw),
        })
    }

    fn offers(&self, store: &StoreTarget, raw: &JsonValue) -> Result<Vec<VariantOffer>, AdapterError> {
        let product_id = require(json_id(raw, &["id"]), "id")?;
        let title = require(json_text(raw, &["title"]), "title")?;
        let handle = json_text(raw, &["handle"]).unwrap_or_else(|| product_id.clone());
        let product_image = json_array(raw, &["images"])
            .first()
            .and_then(|img| json_text(img, &["src"]));

        let variants = json_array(raw, &["variants"]);
        if variants.is_empty() {
            return Err(AdapterError::Malformed(format!("product {product_id} has no variants")));
        }

        variants
            .iter()
            .map(|variant| {
                let variant_id = require(json_id(variant, &["id"]), "variant id")?;
                let price = require(json_money(variant, &["price"]), "variant price")?;
                let url = if variants.len() > 1 {
                    format!("{}/products/{handle}?variant={variant_id}", store.base_url)
                } else {
                    format!("{}/products/{handle}", store.base_url)
                };
                Ok(VariantOffer {
                    product_id: product_id.clone(),
                    sku: json_text(variant, &["sku"]),
                    title: variant_title(&title, json_str(variant, &["title"]), variants.len()),
                    price,
                    regular_price: json_money(variant, &["compare_at_price"]),
                    in_stock: json_bool(variant, &["available"]).unwrap_or(false),
                    url,
                    image: json_text(variant, &["featured_image", "src"]).or_else(|| product_image.clone()),
                    variant_id,
                })
            })
            .collect()
    }
}
