use async_trait::async_trait;
use pricewatch_core::Platform;
use pricewatch_storage::HttpFetcher;
use serde_json::Value as JsonValue;

use crate::{
    fetch_json, json_array, json_bool, json_id, json_money, json_string_vec, json_text, require,
    variant_title, AdapterError, CatalogSource, FetchContext, ProductFacts, StoreTarget, VariantOffer,
    VendorLog,
};

const PAGE_SIZE: usize = 20;

/// Squarespace commerce pages through `/store?format=json`, paged by offset.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquarespaceSource;

impl SquarespaceSource {
    pub fn page_url(base_url: &str, offset: usize) -> String {
        format!("{base_url}/store?format=json&offset={offset}")
    }
}

/// Sale price applies only when it is positive and below the list price.
fn effective_prices(variant: &JsonValue) -> Option<(f64, Option<f64>)> {
    let list = json_money(variant, &["priceMoney", "value"])?;
    let sale = json_money(variant, &["salePriceMoney", "value"]).unwrap_or(0.0);
    if sale > 0.0 && sale < list {
        Some((sale, Some(list)))
    } else {
        Some((list, None))
    }
}

fn variant_label(variant: &JsonValue) -> Option<String> {
    let attributes = variant.get("attributes")?.as_object()?;
    let values: Vec<&str> = attributes.values().filter_map(JsonValue::as_str).collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(" / "))
    }
}

#[async_trait]
impl CatalogSource for SquarespaceSource {
    fn platform(&self) -> Platform {
        Platform::Squarespace
    }

    async fn fetch_catalog(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        store: &StoreTarget,
        log: &mut VendorLog,
    ) -> Result<Vec<JsonValue>, AdapterError> {
        let mut products = Vec::new();
        let mut offset = 0usize;
        for _ in 0..ctx.max_pages {
            let url = Self::page_url(&store.base_url, offset);
            let body = fetch_json(http, ctx, store, &url).await?;
            let batch = json_array(&body, &["items"]);
            if batch.is_empty() {
                break;
            }
            log.info(format!("Offset {offset}: {} products", batch.len()));
            products.extend(batch.iter().cloned());
            offset += PAGE_SIZE;
            if json_bool(&body, &["pagination", "nextPage"]) == Some(false) {
                break;
            }
        }
        Ok(products)
    }

    fn describe(&self, raw: &JsonValue) -> Result<ProductFacts, AdapterError> {
        let title = require(json_text(raw, &["title"]), "title")?;
        let categories = json_string_vec(raw, &["categories"]);
        Ok(ProductFacts {
            title,
            tags: categories.clone(),
            raw_categories: categories,
        })
    }

    fn offers(&self, store: &StoreTarget, raw: &JsonValue) -> Result<Vec<VariantOffer>, AdapterError> {
        let product_id = require(json_id(raw, &["id"]), "id")?;
        let title = require(json_text(raw, &["title"]), "title")?;
        let url = json_text(raw, &["urlId"])
            .map(|url_id| format!("{}/store/{url_id}", store.base_url))
            .or_else(|| json_text(raw, &["fullUrl"]).map(|path| format!("{}{path}", store.base_url)))
            .unwrap_or_else(|| format!("{}/store", store.base_url));
        let image = json_text(raw, &["assetUrl"]);

        let variants = json_array(raw, &["structuredContent", "variants"]);
        if variants.is_empty() {
            return Err(AdapterError::Malformed(format!("product {product_id} has no variants")));
        }

        variants
            .iter()
            .enumerate()
            .map(|(index, variant)| {
                let (price, regular_price) = require(effective_prices(variant), "variant priceMoney")?;
                let stock = variant.get("qtyInStock").and_then(JsonValue::as_i64).unwrap_or(0);
                let unlimited = json_bool(variant, &["unlimited"]).unwrap_or(false);
                let label = variant_label(variant);
                Ok(VariantOffer {
                    product_id: product_id.clone(),
                    variant_id: json_id(variant, &["id"]).unwrap_or_else(|| index.to_string()),
                    sku: json_text(variant, &["sku"]),
                    title: variant_title(&title, label.as_deref(), variants.len()),
                    price,
                    regular_price,
                    in_stock: unlimited || stock > 0,
                    url: url.clone(),
                    image: image.clone(),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture_products, query_param, serve_json, unpaced_fetcher};
    use serde_json::json;
    use uuid::Uuid;

    fn store() -> StoreTarget {
        StoreTarget::new("Square Shop", "https://square.example", Platform::Squarespace)
    }

    /// Serves `pages` full pages, then reports no next page.
    async fn crawl(pages: usize, max_pages: usize) -> (Vec<JsonValue>, Vec<String>) {
        let (base, requests) = serve_json(move |path| {
            let offset = query_param(path, "offset").unwrap_or(0);
            let page = offset / PAGE_SIZE + 1;
            let items: Vec<JsonValue> = if page <= pages {
                (0..PAGE_SIZE).map(|i| json!({ "id": format!("{offset}-{i}") })).collect()
            } else {
                Vec::new()
            };
            json!({ "items": items, "pagination": { "nextPage": page < pages } })
        })
        .await;
        let target = StoreTarget::new("Square Shop", &base, Platform::Squarespace);
        let ctx = FetchContext {
            run_id: Uuid::new_v4(),
            max_pages,
        };
        let mut log = VendorLog::new("Square Shop");
        let products = SquarespaceSource
            .fetch_catalog(&unpaced_fetcher(), &ctx, &target, &mut log)
            .await
            .unwrap();
        let seen = requests.lock().unwrap().clone();
        (products, seen)
    }

    #[tokio::test]
    async fn last_page_flag_ends_the_crawl() {
        let (products, requests) = crawl(2, 40).await;
        assert_eq!(products.len(), 2 * PAGE_SIZE);
        assert_eq!(
            requests,
            vec!["/store?format=json&offset=0".to_string(), "/store?format=json&offset=20".to_string()]
        );
    }

    #[tokio::test]
    async fn empty_store_yields_no_products() {
        let (products, requests) = crawl(0, 40).await;
        assert!(products.is_empty());
        assert_eq!(requests.len(), 1);
    }

    #[tokio::test]
    async fn crawl_stops_at_the_page_limit() {
        let (products, requests) = crawl(10, 3).await;
        assert_eq!(products.len(), 3 * PAGE_SIZE);
        assert_eq!(requests.len(), 3);
        assert_eq!(requests[2], "/store?format=json&offset=40");
    }

    #[test]
    fn page_urls_step_by_offset() {
        assert_eq!(
            SquarespaceSource::page_url("https://square.example", 40),
            "https://square.example/store?format=json&offset=40"
        );
    }

    #[test]
    fn sale_price_replaces_list_price_only_when_lower() {
        let on_sale = json!({"priceMoney": {"value": "100.00"}, "salePriceMoney": {"value": "80.00"}});
        assert_eq!(effective_prices(&on_sale), Some((80.0, Some(100.0))));
        let bogus_sale = json!({"priceMoney": {"value": "100.00"}, "salePriceMoney": {"value": "0.00"}});
        assert_eq!(effective_prices(&bogus_sale), Some((100.0, None)));
        assert_eq!(effective_prices(&json!({})), None);
    }

    #[test]
    fn stock_counts_unlimited_variants_as_available() {
        let raw = json!({
            "id": "abc", "title": "Gel Balls 10k", "urlId": "gel-balls",
            "categories": ["Ammo"],
            "structuredContent": {"variants": [
                {"id": "v1", "sku": "GB10K", "priceMoney": {"value": "9.99"}, "qtyInStock": 0, "unlimited": true,
                 "attributes": {"Colour": "Blue"}},
                {"id": "v2", "priceMoney": {"value": "9.99"}, "qtyInStock": 0,
                 "attributes": {"Colour": "Red"}}
            ]}
        });
        let offers = SquarespaceSource.offers(&store(), &raw).unwrap();
        assert_eq!(offers.len(), 2);
        assert!(offers[0].in_stock);
        assert!(!offers[1].in_stock);
        assert_eq!(offers[0].title, "Gel Balls 10k - Blue");
        assert_eq!(offers[0].url, "https://square.example/store/gel-balls");
        assert_eq!(offers[1].sku, None);
    }

    #[test]
    fn categories_double_as_tags() {
        let products = fixture_products("squarespace");
        let facts = SquarespaceSource.describe(&products[0]).unwrap();
        assert_eq!(facts.tags, facts.raw_categories);
    }
}
