//! Core domain model for pricewatch: vendor listings, resolved products and price points.

use serde::{Deserialize, Serialize};

pub mod snapshot;

pub const CRATE_NAME: &str = "pricewatch-core";

pub const UNCATEGORIZED: &str = "Uncategorized";

/// Unix timestamp in seconds, as stored in history series.
pub type UnixSeconds = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Shopify,
    #[serde(rename = "woocommerce")]
    WooCommerce,
    Squarespace,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Shopify => "shopify",
            Platform::WooCommerce => "woocommerce",
            Platform::Squarespace => "squarespace",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price rounded to whole cents. All price comparisons go through this.
pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn round_money(amount: f64) -> f64 {
    to_cents(amount) as f64 / 100.0
}

pub fn same_money(a: f64, b: f64) -> bool {
    to_cents(a) == to_cents(b)
}

pub fn same_optional_money(a: Option<f64>, b: Option<f64>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => same_money(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Case-folded title with dashes/underscores as spaces, other punctuation removed
/// and whitespace collapsed.
pub fn normalize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut pending_space = false;
    for ch in title.chars().flat_map(char::to_lowercase) {
        let ch = match ch {
            '-' | '_' | '\u{2010}'..='\u{2015}' | '\u{2212}' => ' ',
            c if c.is_alphanumeric() || c.is_whitespace() => c,
            _ => continue,
        };
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }
    out
}

/// One vendor's offering of one item in a given cycle, already filtered and cleaned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub item_id: String,
    pub vendor: String,
    pub store_id: String,
    pub product_id: String,
    pub variant_id: String,
    pub sku: Option<String>,
    pub title: String,
    pub category: String,
    pub tags: Vec<String>,
    pub price: f64,
    pub regular_price: Option<f64>,
    pub in_stock: bool,
    pub url: String,
    pub image: Option<String>,
}

impl Listing {
    pub fn item_id_for(store_id: &str, product_id: &str, variant_id: &str) -> String {
        format!("{store_id}|{product_id}|{variant_id}")
    }

    /// Regular price only while the listing is actually discounted.
    pub fn sale_regular_price(&self) -> Option<f64> {
        self.regular_price
            .filter(|rp| to_cents(*rp) > to_cents(self.price))
            .map(round_money)
    }
}

/// Picks the listing that defines a product's lowest price.
///
/// In-stock listings win over out-of-stock ones; among the candidates the lowest
/// cent price wins, then the vendor name, then the item id.
pub fn lowest_offer<'a, I>(listings: I) -> Option<&'a Listing>
where
    I: IntoIterator<Item = &'a Listing>,
{
    let listings: Vec<&Listing> = listings.into_iter().collect();
    let any_in_stock = listings.iter().any(|l| l.in_stock);
    listings
        .into_iter()
        .filter(|l| l.in_stock || !any_in_stock)
        .min_by(|a, b| {
            to_cents(a.price)
                .cmp(&to_cents(b.price))
                .then_with(|| a.vendor.cmp(&b.vendor))
                .then_with(|| a.item_id.cmp(&b.item_id))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Sku,
    Title,
}

/// Resolved cross-vendor identity of one physical good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub title: String,
    pub image: Option<String>,
    pub category: String,
    pub tags: Vec<String>,
    pub matched_by: MatchKind,
    pub members: Vec<Listing>,
    pub lowest_price: f64,
    pub in_stock: bool,
}

impl Product {
    pub fn lowest_offer(&self) -> Option<&Listing> {
        lowest_offer(&self.members)
    }

    /// Best member per vendor, in-stock first, then by price and vendor name.
    pub fn vendor_offers(&self) -> Vec<&Listing> {
        let mut best: std::collections::BTreeMap<&str, &Listing> = std::collections::BTreeMap::new();
        for member in &self.members {
            best.entry(member.vendor.as_str())
                .and_modify(|current| {
                    if offer_rank(member) < offer_rank(current) {
                        *current = member;
                    }
                })
                .or_insert(member);
        }
        let mut offers: Vec<&Listing> = best.into_values().collect();
        offers.sort_by(|a, b| {
            offer_rank(a)
                .cmp(&offer_rank(b))
                .then_with(|| a.vendor.cmp(&b.vendor))
        });
        offers
    }
}

fn offer_rank(listing: &Listing) -> (bool, i64, &str) {
    (!listing.in_stock, to_cents(listing.price), listing.item_id.as_str())
}

/// One entry of a delta-encoded history series.
///
/// `s` is omitted from JSON while in stock; `prev` and `stockPrev` are only
/// present on points that changed the respective field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub t: UnixSeconds,
    pub p: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rp: Option<f64>,
    #[serde(default = "default_in_stock", skip_serializing_if = "is_in_stock")]
    pub s: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev: Option<f64>,
    #[serde(rename = "stockPrev", default, skip_serializing_if = "Option::is_none")]
    pub stock_prev: Option<bool>,
}

fn default_in_stock() -> bool {
    true
}

fn is_in_stock(s: &bool) -> bool {
    *s
}

impl PricePoint {
    pub fn is_stock_flip(&self) -> bool {
        self.stock_prev.is_some_and(|prev| prev != self.s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(vendor: &str, price: f64, in_stock: bool) -> Listing {
        Listing {
            item_id: Listing::item_id_for(&vendor.to_ascii_lowercase(), "1", "1"),
            vendor: vendor.to_string(),
            store_id: vendor.to_ascii_lowercase(),
            product_id: "1".into(),
            variant_id: "1".into(),
            sku: None,
            title: "Test Item".into(),
            category: "Pistols".into(),
            tags: vec![],
            price,
            regular_price: None,
            in_stock,
            url: format!("https://{}.example/item", vendor.to_ascii_lowercase()),
            image: None,
        }
    }

    #[test]
    fn lowest_offer_prefers_in_stock_listings() {
        let members = vec![
            listing("A", 50.0, true),
            listing("B", 45.0, false),
            listing("C", 48.0, true),
        ];
        let best = lowest_offer(&members).unwrap();
        assert_eq!(best.vendor, "C");
    }

    #[test]
    fn lowest_offer_falls_back_to_all_when_nothing_in_stock() {
        let members = vec![listing("A", 50.0, false), listing("B", 45.0, false)];
        assert_eq!(lowest_offer(&members).unwrap().vendor, "B");
    }

    #[test]
    fn lowest_offer_breaks_price_ties_by_vendor() {
        let members = vec![listing("Zed", 45.0, true), listing("Alpha", 45.004, true)];
        assert_eq!(lowest_offer(&members).unwrap().vendor, "Alpha");
    }

    #[test]
    fn sale_regular_price_only_when_discounted() {
        let mut l = listing("A", 45.0, true);
        l.regular_price = Some(45.001);
        assert_eq!(l.sale_regular_price(), None);
        l.regular_price = Some(50.0);
        assert_eq!(l.sale_regular_price(), Some(50.0));
    }

    #[test]
    fn title_normalization_folds_case_and_punctuation() {
        assert_eq!(normalize_title("  Glock 18C Gen-4 (GBB)! "), "glock 18c gen 4 gbb");
        assert_eq!(normalize_title("Hi_Capa\u{2013}5.1   Blaster"), "hi capa 51 blaster");
        assert_eq!(normalize_title("---"), "");
    }

    #[test]
    fn money_comparison_is_cent_level() {
        assert!(same_money(45.0, 45.004));
        assert!(!same_money(45.0, 45.01));
        assert!(same_optional_money(None, None));
        assert!(!same_optional_money(Some(1.0), None));
    }

    #[test]
    fn price_point_omits_in_stock_flag_and_restores_it() {
        let point = PricePoint {
            t: 1_700_000_000,
            p: 45.0,
            rp: None,
            s: true,
            v: None,
            prev: Some(50.0),
            stock_prev: None,
        };
        let json = serde_json::to_string(&point).unwrap();
        assert_eq!(json, r#"{"t":1700000000,"p":45.0,"prev":50.0}"#);
        let back: PricePoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, point);

        let flip = PricePoint {
            s: false,
            stock_prev: Some(true),
            prev: None,
            ..point
        };
        let json = serde_json::to_string(&flip).unwrap();
        assert_eq!(json, r#"{"t":1700000000,"p":45.0,"s":false,"stockPrev":true}"#);
        assert!(flip.is_stock_flip());
    }

    #[test]
    fn vendor_offers_keep_one_best_member_per_vendor() {
        let mut cheap_oos = listing("A", 10.0, false);
        cheap_oos.item_id = "a|1|2".into();
        let product = Product {
            id: "sku-ABC123".into(),
            title: "Test Item".into(),
            image: None,
            category: "Pistols".into(),
            tags: vec![],
            matched_by: MatchKind::Sku,
            members: vec![listing("A", 50.0, true), cheap_oos, listing("B", 45.0, true)],
            lowest_price: 45.0,
            in_stock: true,
        };
        let offers = product.vendor_offers();
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].vendor, "B");
        assert_eq!(offers[1].vendor, "A");
        assert!(offers[1].in_stock);
    }
}
