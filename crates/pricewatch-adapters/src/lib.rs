//! Catalog source contracts, per-platform implementations and listing normalization.

use std::fmt::Display;

use async_trait::async_trait;
use chrono::Utc;
use pricewatch_core::snapshot::{FilteredProduct, LogEntry};
use pricewatch_core::{Listing, Platform};
use pricewatch_storage::{FetchError, HttpFetcher};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod rules;
mod shopify;
mod squarespace;
mod woocommerce;

pub use rules::CatalogRules;
pub use shopify::ShopifySource;
pub use squarespace::SquarespaceSource;
pub use woocommerce::WooCommerceSource;

pub const CRATE_NAME: &str = "pricewatch-adapters";

/// Variants priced below this are treated as placeholders and dropped.
pub const MIN_PRICE: f64 = 0.50;
pub const MAX_TAGS: usize = 10;

/// A configured vendor storefront.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreTarget {
    pub name: String,
    pub base_url: String,
    pub platform: Platform,
}

impl StoreTarget {
    pub fn new(name: impl Into<String>, base_url: impl AsRef<str>, platform: Platform) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.as_ref().trim_end_matches('/').to_string(),
            platform,
        }
    }

    /// Stable store id used as the first segment of item ids.
    pub fn store_id(&self) -> String {
        self.name.trim().to_lowercase().replace(' ', "-")
    }
}

#[derive(Debug, Clone)]
pub struct FetchContext {
    pub run_id: Uuid,
    pub max_pages: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid json from {url}: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed product: {0}")]
    Malformed(String),
}

/// Fields the exclusion filter and category mapper look at.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductFacts {
    pub title: String,
    pub raw_categories: Vec<String>,
    pub tags: Vec<String>,
}

impl ProductFacts {
    pub fn primary_category(&self) -> &str {
        self.raw_categories.first().map(String::as_str).unwrap_or_default()
    }
}

/// One sellable variant as the platform reports it, before category mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantOffer {
    pub product_id: String,
    pub variant_id: String,
    pub sku: Option<String>,
    pub title: String,
    pub price: f64,
    pub regular_price: Option<f64>,
    pub in_stock: bool,
    pub url: String,
    pub image: Option<String>,
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn platform(&self) -> Platform;

    /// Downloads the vendor's raw product documents.
    async fn fetch_catalog(
        &self,
        http: &HttpFetcher,
        ctx: &FetchContext,
        store: &StoreTarget,
        log: &mut VendorLog,
    ) -> Result<Vec<JsonValue>, AdapterError>;

    fn describe(&self, raw: &JsonValue) -> Result<ProductFacts, AdapterError>;

    fn offers(&self, store: &StoreTarget, raw: &JsonValue) -> Result<Vec<VariantOffer>, AdapterError>;
}

pub fn source_for_platform(platform: Platform) -> Box<dyn CatalogSource> {
    match platform {
        Platform::Shopify => Box::new(ShopifySource),
        Platform::WooCommerce => Box::new(WooCommerceSource),
        Platform::Squarespace => Box::new(SquarespaceSource),
    }
}

/// Log lines for one vendor, mirrored to `tracing` and kept for run statistics.
#[derive(Debug, Clone, Default)]
pub struct VendorLog {
    vendor: String,
    entries: Vec<LogEntry>,
}

impl VendorLog {
    pub fn new(vendor: impl Into<String>) -> Self {
        Self {
            vendor: vendor.into(),
            entries: Vec::new(),
        }
    }

    fn push(&mut self, level: &str, message: String) {
        self.entries.push(LogEntry {
            time: Utc::now().format("%H:%M:%S").to_string(),
            level: level.to_string(),
            message,
        });
    }

    pub fn info(&mut self, message: impl Display) {
        info!(vendor = %self.vendor, "{message}");
        self.push("INFO", message.to_string());
    }

    pub fn warn(&mut self, message: impl Display) {
        warn!(vendor = %self.vendor, "{message}");
        self.push("WARNING", message.to_string());
    }

    pub fn error(&mut self, message: impl Display) {
        error!(vendor = %self.vendor, "{message}");
        self.push("ERROR", message.to_string());
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

#[derive(Debug, Clone, Default)]
pub struct CatalogOutcome {
    pub listings: Vec<Listing>,
    pub fetched: usize,
    pub filtered: usize,
    pub malformed: usize,
    pub filtered_products: Vec<FilteredProduct>,
}

impl CatalogOutcome {
    pub fn in_stock(&self) -> usize {
        self.listings.iter().filter(|l| l.in_stock).count()
    }
}

/// Turns raw platform documents into cleaned listings.
///
/// Excluded products land in the audit list; malformed ones are counted and
/// skipped without failing the vendor.
pub fn process_catalog(
    source: &dyn CatalogSource,
    store: &StoreTarget,
    products: &[JsonValue],
    rules: &CatalogRules,
    log: &mut VendorLog,
) -> CatalogOutcome {
    let store_id = store.store_id();
    let mut outcome = CatalogOutcome {
        fetched: products.len(),
        ..Default::default()
    };

    for raw in products {
        let facts = match source.describe(raw) {
            Ok(facts) => facts,
            Err(err) => {
                outcome.malformed += 1;
                log.warn(format!("skipping product: {err}"));
                continue;
            }
        };

        if let Some(hit) = rules
            .exclusions
            .check(&facts.title, &facts.raw_categories, &facts.tags)
        {
            outcome.filtered += 1;
            outcome.filtered_products.push(hit.audit_record(&facts.title));
            continue;
        }

        let offers = match source.offers(store, raw) {
            Ok(offers) => offers,
            Err(err) => {
                outcome.malformed += 1;
                log.warn(format!("skipping '{}': {err}", facts.title));
                continue;
            }
        };
        let offers: Vec<VariantOffer> = offers.into_iter().filter(|o| o.price >= MIN_PRICE).collect();
        if offers.is_empty() {
            outcome.filtered += 1;
            continue;
        }

        let category = rules
            .categories
            .resolve(facts.primary_category(), &facts.title, &facts.tags);
        let tags: Vec<String> = facts.tags.iter().take(MAX_TAGS).cloned().collect();

        for offer in offers {
            outcome.listings.push(Listing {
                item_id: Listing::item_id_for(&store_id, &offer.product_id, &offer.variant_id),
                vendor: store.name.clone(),
                store_id: store_id.clone(),
                product_id: offer.product_id,
                variant_id: offer.variant_id,
                sku: offer.sku,
                title: offer.title,
                category: category.clone(),
                tags: tags.clone(),
                price: offer.price,
                regular_price: offer.regular_price.filter(|rp| *rp > offer.price),
                in_stock: offer.in_stock,
                url: offer.url,
                image: offer.image,
            });
        }
    }

    outcome.listings.sort_by(|a, b| a.item_id.cmp(&b.item_id));
    outcome.listings.dedup_by(|a, b| a.item_id == b.item_id);
    log.info(format!(
        "{} fetched, {} filtered, {} malformed, {} listings",
        outcome.fetched,
        outcome.filtered,
        outcome.malformed,
        outcome.listings.len()
    ));
    outcome
}

/// Parses a response body, ignoring any trailing content after the first JSON document.
pub fn parse_leading_json(url: &str, text: &str) -> Result<JsonValue, AdapterError> {
    let mut stream = serde_json::Deserializer::from_str(text.trim_start()).into_iter::<JsonValue>();
    match stream.next() {
        Some(Ok(value)) => Ok(value),
        Some(Err(source)) => Err(AdapterError::Json {
            url: url.to_string(),
            source,
        }),
        None => Err(AdapterError::Malformed(format!("empty response from {url}"))),
    }
}

pub(crate) async fn fetch_json(
    http: &HttpFetcher,
    ctx: &FetchContext,
    store: &StoreTarget,
    url: &str,
) -> Result<JsonValue, AdapterError> {
    let response = http.fetch_bytes(ctx.run_id, &store.name, url).await?;
    parse_leading_json(url, &response.text())
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Non-empty trimmed string.
pub(crate) fn json_text(value: &JsonValue, path: &[&str]) -> Option<String> {
    json_str(value, path)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Platform ids arrive as numbers or strings.
pub(crate) fn json_id(value: &JsonValue, path: &[&str]) -> Option<String> {
    match json_at(value, path)? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Money given as a JSON number or a decimal string.
pub(crate) fn json_money(value: &JsonValue, path: &[&str]) -> Option<f64> {
    match json_at(value, path)? {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

pub(crate) fn json_bool(value: &JsonValue, path: &[&str]) -> Option<bool> {
    json_at(value, path)?.as_bool()
}

pub(crate) fn json_array<'a>(value: &'a JsonValue, path: &[&str]) -> &'a [JsonValue] {
    json_at(value, path)
        .and_then(JsonValue::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

pub(crate) fn json_string_vec(value: &JsonValue, path: &[&str]) -> Vec<String> {
    json_array(value, path)
        .iter()
        .filter_map(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub(crate) fn require<T>(value: Option<T>, what: &str) -> Result<T, AdapterError> {
    value.ok_or_else(|| AdapterError::Malformed(format!("missing {what}")))
}

/// Combined title for one variant of a multi-variant product.
pub(crate) fn variant_title(product_title: &str, variant_label: Option<&str>, variant_count: usize) -> String {
    match variant_label.map(str::trim) {
        Some(label)
            if variant_count > 1 && !label.is_empty() && !label.eq_ignore_ascii_case("Default Title") =>
        {
            format!("{product_title} - {label}")
        }
        _ => product_title.to_string(),
    }
}
