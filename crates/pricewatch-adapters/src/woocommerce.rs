use std::collections::HashMap;

use async_trait::async_trait;
use pricewatch_core::Platform;
use pricewatch_storage::HttpFetcher;
use scraper::Html;
use serde_json::Value as JsonValue;

use crate::{
    fetch_json, json_array, json_bool, json_id, json_str, json_text, require, AdapterError, CatalogSource,
    FetchContext, ProductFacts, StoreTarget, VariantOffer, VendorLog,
};

const PER_PAGE: usize = 100;
const API_PATHS: [&str; 2] = ["/wp-json/wc/store/v1/products", "/wp-json/wc/store/products"];

/// WooCommerce shops through the public Store API.
///
/// Variable products are replaced by their variations, which inherit the
/// parent's categories, tags and images when they carry none.
#[derive(Debug, Clone, Copy, Default)]
pub struct WooCommerceSource;

/// Store API names are HTML-escaped (`&#8211;`, `&amp;`).
fn decode_html_text(raw: &str) -> String {
    let fragment = Html::parse_fragment(raw);
    let text: String = fragment.root_element().text().collect();
    text.trim().to_string()
}

fn named_list(raw: &JsonValue, key: &str) -> Vec<String> {
    json_array(raw, &[key])
        .iter()
        .filter_map(|entry| json_text(entry, &["name"]))
        .map(|name| decode_html_text(&name))
        .collect()
}

/// Minor-unit price string (`"12995"`) scaled by `currency_minor_unit`.
fn minor_units(raw: &JsonValue, field: &str) -> Option<f64> {
    let minor_unit = raw
        .get("prices")
        .and_then(|p| p.get("currency_minor_unit"))
        .and_then(JsonValue::as_i64)
        .unwrap_or(2) as i32;
    let amount: i64 = json_str(raw, &["prices", field])?.trim().parse().ok()?;
    Some(amount as f64 / 10f64.powi(minor_unit))
}

fn is_empty_list(value: Option<&JsonValue>) -> bool {
    value
        .and_then(JsonValue::as_array)
        .map(Vec::is_empty)
        .unwrap_or(true)
}

/// Fills missing categories, tags and images of variations from their parents.
pub fn enrich_variations(parents: &[JsonValue], variations: Vec<JsonValue>) -> (Vec<JsonValue>, usize) {
    let parent_lookup: HashMap<String, &JsonValue> = parents
        .iter()
        .filter_map(|p| json_id(p, &["id"]).map(|id| (id, p)))
        .collect();
    let mut enriched = 0usize;
    let variations = variations
        .into_iter()
        .map(|mut variation| {
            let parent = json_id(&variation, &["parent"]).and_then(|id| parent_lookup.get(&id).copied());
            if let (Some(parent), Some(object)) = (parent, variation.as_object_mut()) {
                for key in ["categories", "tags", "images"] {
                    if is_empty_list(object.get(key)) {
                        if let Some(value) = parent.get(key) {
                            object.insert(key.to_string(), value.clone());
                        }
                    }
                }
                enriched += 1;
            }
            variation
        })
        .collect();
    (variations, enriched)
}

impl WooCommerceSource {
    async fn detect_api_path(
        &self,
        http: &HttpFetcher,
        store: &StoreTarget,
        log: &mut VendorLog,
    ) -> &'static str {
        for path in API_PATHS {
            let url = format!("{}{path}?per_page=1", store.base_url);
            match http.probe(&store.name, &url).await {
                Ok(status) if status.is_success() => return path,
                Ok(status) => log.info(format!("{path} answered {status}")),
                Err(err) => log.info(format!("{path} probe failed: {err}")),
            }
        }
        API_PATHS[0]
    }

    async fn fetch_pages(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        store: &StoreTarget,
        base: &str,
        label: &str,
        log: &mut VendorLog,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let separator = if base.contains('?') { '&' } else { '?' };
        let mut out = Vec::new();
        for page in 1..=ctx.max_pages {
            let url = format!("{base}{separator}per_page={PER_PAGE}&page={page}");
            let body = fetch_json(http, ctx, store, &url).await?;
            let batch = body.as_array().map(Vec::as_slice).unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            log.info(format!("{label} page {page}: {} items", batch.len()));
            out.extend(batch.iter().cloned());
            if batch.len() < PER_PAGE {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl CatalogSource for WooCommerceSource {
    fn platform(&self) -> Platform {
        Platform::WooCommerce
    }

    async fn fetch_catalog(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        store: &StoreTarget,
        log: &mut VendorLog,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let api_path = self.detect_api_path(http, store, log).await;
        let products_url = format!("{}{api_path}", store.base_url);
        let products = self
            .fetch_pages(http, ctx, store, &products_url, "Products", log)
            .await?;

        let (parents, mut simple): (Vec<JsonValue>, Vec<JsonValue>) = products
            .into_iter()
            .partition(|p| json_str(p, &["type"]) == Some("variable"));
        if parents.is_empty() {
            return Ok(simple);
        }

        log.info(format!("Found {} variable products, fetching variations", parents.len()));
        let variations_url = format!("{products_url}?type=variation");
        let variations = match self
            .fetch_pages(http, ctx, store, &variations_url, "Variations", log)
            .await
        {
            Ok(variations) => variations,
            Err(err) => {
                log.error(format!("variation fetch failed, keeping simple products only: {err}"));
                Vec::new()
            }
        };
        let (variations, enriched) = enrich_variations(&parents, variations);
        log.info(format!(
            "Total: {} simple + {} variations ({enriched} enriched)",
            simple.len(),
            variations.len()
        ));
        simple.extend(variations);
        Ok(simple)
    }

    fn describe(&self, raw: &JsonValue) -> Result<ProductFacts, AdapterError> {
        let title = require(json_text(raw, &["name"]).map(|n| decode_html_text(&n)), "name")?;
        Ok(ProductFacts {
            title,
            raw_categories: named_list(raw, "categories"),
            tags: named_list(raw, "tags"),
        })
    }

    fn offers(&self, store: &StoreTarget, raw: &JsonValue) -> Result<Vec<VariantOffer>, AdapterError> {
        let id = require(json_id(raw, &["id"]), "id")?;
        let title = require(json_text(raw, &["name"]).map(|n| decode_html_text(&n)), "name")?;
        let price = require(minor_units(raw, "price"), "prices.price")?;
        let product_id = json_id(raw, &["parent"])
            .filter(|parent| parent != "0")
            .unwrap_or_else(|| id.clone());
        let url = json_text(raw, &["permalink"])
            .unwrap_or_else(|| format!("{}/?p={id}", store.base_url));

        Ok(vec![VariantOffer {
            product_id,
            variant_id: id,
            sku: json_text(raw, &["sku"]),
            title,
            price,
            regular_price: minor_units(raw, "regular_price"),
            in_stock: json_bool(raw, &["is_in_stock"]).unwrap_or(false),
            url,
            image: json_array(raw, &["images"])
                .first()
                .and_then(|img| json_text(img, &["src"])),
        }])
    }
}
