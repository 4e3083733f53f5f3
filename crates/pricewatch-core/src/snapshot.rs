//! JSON documents published to the data directory.
//!
//! Shapes are stable across cycles; every map is a `BTreeMap` so the encoded
//! bytes only change when the content does.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{round_money, Listing, MatchKind, PricePoint, Product, UnixSeconds};

pub const PRODUCTS_FILE: &str = "products.json";
pub const ITEMS_FILE: &str = "items.json";
pub const PRICE_HISTORY_FILE: &str = "price-history.json";
pub const ITEM_HISTORY_FILE: &str = "item-history.json";
pub const STATS_FILE: &str = "stats.json";
pub const MATCHES_FILE: &str = "matches.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductsSnapshot {
    pub last_updated: DateTime<Utc>,
    pub store_count: usize,
    pub product_count: usize,
    pub products: Vec<ProductRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: String,
    pub title: String,
    pub image: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub vendors: Vec<VendorOffer>,
    pub lowest_price: f64,
    pub in_stock: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VendorOffer {
    pub name: String,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regular_price: Option<f64>,
    pub url: String,
    pub in_stock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
}

impl From<&Product> for ProductRecord {
    fn from(product: &Product) -> Self {
        Self {
            id: product.id.clone(),
            title: product.title.clone(),
            image: product.image.clone(),
            category: product.category.clone(),
            tags: product.tags.clone(),
            vendors: product
                .vendor_offers()
                .into_iter()
                .map(|listing| VendorOffer {
                    name: listing.vendor.clone(),
                    price: round_money(listing.price),
                    regular_price: listing.sale_regular_price(),
                    url: listing.url.clone(),
                    in_stock: listing.in_stock,
                    sku: listing.sku.clone(),
                })
                .collect(),
            lowest_price: round_money(product.lowest_price),
            in_stock: product.in_stock,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsSnapshot {
    pub last_updated: DateTime<Utc>,
    pub items: BTreeMap<String, ItemRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemRecord {
    pub id: String,
    pub store_id: String,
    pub product_id: String,
    pub variant_id: String,
    pub title: String,
    pub sku: Option<String>,
    pub price: f64,
    pub regular_price: Option<f64>,
    pub image: Option<String>,
    pub url: String,
    pub vendor: String,
    pub category: String,
    pub tags: Vec<String>,
    pub in_stock: bool,
}

impl From<&Listing> for ItemRecord {
    fn from(listing: &Listing) -> Self {
        Self {
            id: listing.item_id.clone(),
            store_id: listing.store_id.clone(),
            product_id: listing.product_id.clone(),
            variant_id: listing.variant_id.clone(),
            title: listing.title.clone(),
            sku: listing.sku.clone(),
            price: round_money(listing.price),
            regular_price: listing.sale_regular_price(),
            image: listing.image.clone(),
            url: listing.url.clone(),
            vendor: listing.vendor.clone(),
            category: listing.category.clone(),
            tags: listing.tags.clone(),
            in_stock: listing.in_stock,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductHistory {
    #[serde(default)]
    pub vendors: BTreeMap<String, Vec<PricePoint>>,
    #[serde(default)]
    pub lowest: Vec<PricePoint>,
}

impl ProductHistory {
    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty() && self.lowest.is_empty()
    }

    pub fn point_count(&self) -> usize {
        self.vendors.values().map(Vec::len).sum::<usize>() + self.lowest.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductHistoryDoc {
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: BTreeMap<String, ProductHistory>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemHistoryDoc {
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: BTreeMap<String, Vec<PricePoint>>,
}

/// Persisted identity registry: which product each item was resolved into.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchesDoc {
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub matches: Vec<MatchRecord>,
    /// Assignments of items that were not listed in the latest cycle.
    #[serde(default)]
    pub retained: BTreeMap<String, RetainedAssignment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub id: String,
    pub matched_by: MatchKind,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetainedAssignment {
    pub product_id: String,
    pub last_seen: UnixSeconds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: String,
    pub level: String,
    pub message: String,
}

/// Audit record for a raw product removed by the exclusion filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilteredProduct {
    pub title: String,
    pub reason: String,
    pub keyword: String,
    pub filter_category: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub name: String,
    pub url: String,
    pub platform: String,
    pub fetched: usize,
    pub filtered: usize,
    pub malformed: usize,
    #[serde(rename = "final")]
    pub final_count: usize,
    pub in_stock: usize,
    pub out_of_stock: usize,
    pub error: Option<String>,
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub filtered_products: Vec<FilteredProduct>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeCounts {
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackStats {
    pub items: ChangeCounts,
    pub vendors: ChangeCounts,
    pub lowest: ChangeCounts,
    pub skipped_stale: usize,
    pub stock_flips: usize,
    pub pruned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveStats {
    pub listings: usize,
    pub products: usize,
    pub sku_groups: usize,
    pub fuzzy_merges: usize,
    pub singletons: usize,
    pub multi_vendor: usize,
    pub refused_merges: usize,
    pub category_conflicts: usize,
    #[serde(default)]
    pub duplicate_items: usize,
    pub reused_ids: usize,
    pub new_ids: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunTotals {
    pub raw_products: usize,
    pub after_filter: usize,
    pub unique_products: usize,
    pub stale_products: usize,
    pub in_stock: usize,
    pub out_of_stock: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockChange {
    BackInStock,
    OutOfStock,
}

/// A listing whose stock flipped this cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockEvent {
    pub item_id: String,
    pub product_id: String,
    pub vendor: String,
    pub title: String,
    pub price: f64,
    pub change: StockChange,
    pub t: UnixSeconds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    DissimilarTitles,
    CategoryConflict,
    /// Two vendors produced the same item id; only the first listing was kept.
    DuplicateItemId,
}

/// A SKU group kept together despite signals that it may be wrong.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDiagnostic {
    pub product_id: String,
    pub kind: DiagnosticKind,
    pub detail: String,
    pub items: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatsDoc {
    pub last_updated: DateTime<Utc>,
    pub duration: f64,
    pub stores: Vec<StoreStats>,
    pub totals: RunTotals,
    pub price_history: TrackStats,
    pub resolution: ResolveStats,
    #[serde(default)]
    pub stock_events: Vec<StockEvent>,
    #[serde(default)]
    pub diagnostics: Vec<ResolveDiagnostic>,
}
