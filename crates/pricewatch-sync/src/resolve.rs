//! Identity resolution: partitions one cycle's listings into products with stable ids.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use pricewatch_core::snapshot::{DiagnosticKind, ResolveDiagnostic, ResolveStats};
use pricewatch_core::{lowest_offer, normalize_title, Listing, MatchKind, Product, UNCATEGORIZED};
use sha2::{Digest, Sha256};
use strsim::jaro_winkler;

#[derive(Debug)]
struct ItemCollision {
    item_id: String,
    kept_vendor: String,
    dropped_vendor: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverConfig {
    pub fuzzy_threshold: f64,
    /// SKU groups whose member titles score below this are reported for review.
    pub review_threshold: f64,
    pub min_sku_len: usize,
    pub min_title_tokens: usize,
    pub min_title_chars: usize,
    pub max_tags: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.90,
            review_threshold: 0.50,
            min_sku_len: 4,
            min_title_tokens: 2,
            min_title_chars: 6,
            max_tags: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Sorted by product id.
    pub products: Vec<Product>,
    pub assignments: BTreeMap<String, String>,
    pub diagnostics: Vec<ResolveDiagnostic>,
    pub stats: ResolveStats,
}

impl Resolution {
    pub fn product_of(&self, item_id: &str) -> Option<&str> {
        self.assignments.get(item_id).map(String::as_str)
    }
}

/// Upper-cased SKU with a trailing parenthetical removed, dashes unified and
/// whitespace dropped: `" g296a (Short) "` -> `"G296A"`.
pub fn normalize_sku(raw: &str) -> String {
    let mut sku = raw.trim().to_uppercase();
    if sku.ends_with(')') {
        if let Some(open) = sku.rfind('(') {
            if open > 0 && sku[..open].ends_with(char::is_whitespace) {
                sku.truncate(open);
            }
        }
    }
    sku.chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '_' | '\u{2010}'..='\u{2015}' | '\u{2212}' => '-',
            c => c,
        })
        .collect()
}

/// Normalized SKU when it is long enough and not a bare number.
pub fn usable_sku(raw: Option<&str>, min_len: usize) -> Option<String> {
    let sku = normalize_sku(raw?);
    (sku.chars().count() >= min_len && sku.chars().any(|c| c.is_ascii_alphabetic())).then_some(sku)
}

fn digit_runs(normalized: &str) -> Vec<&str> {
    normalized
        .split(|c: char| !c.is_ascii_digit())
        .filter(|run| !run.is_empty())
        .collect()
}

/// Similarity of two normalized titles in `[0, 1]`.
///
/// Jaro-Winkler over the titles with spaces removed, so `gen4` and `gen 4`
/// compare equal. Titles whose digit runs differ (model numbers, capacities)
/// score zero.
pub fn title_similarity(a: &str, b: &str) -> f64 {
    if digit_runs(a) != digit_runs(b) {
        return 0.0;
    }
    let ca: String = a.split_whitespace().collect();
    let cb: String = b.split_whitespace().collect();
    jaro_winkler(&ca, &cb)
}

struct Entry {
    listing: Listing,
    title: String,
    compact: String,
    digits: Vec<String>,
    sku: Option<String>,
    prior: Option<String>,
}

impl Entry {
    fn similarity(&self, other: &Entry) -> f64 {
        if self.digits != other.digits {
            return 0.0;
        }
        jaro_winkler(&self.compact, &other.compact)
    }
}

struct DisjointSet {
    parent: Vec<usize>,
    skus: Vec<BTreeSet<String>>,
    vendors: Vec<BTreeSet<String>>,
}

impl DisjointSet {
    fn new(entries: &[Entry]) -> Self {
        Self {
            parent: (0..entries.len()).collect(),
            skus: entries.iter().map(|e| e.sku.iter().cloned().collect()).collect(),
            vendors: entries
                .iter()
                .map(|e| BTreeSet::from([e.listing.vendor.clone()]))
                .collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// Keeps the smaller index as root so group order follows entry order.
    fn union(&mut self, a: usize, b: usize) -> usize {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return ra;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        let skus = std::mem::take(&mut self.skus[child]);
        self.skus[root].extend(skus);
        let vendors = std::mem::take(&mut self.vendors[child]);
        self.vendors[root].extend(vendors);
        root
    }

    /// Fuzzy merges may not join two SKU groups or two listings of one vendor.
    fn can_merge(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if !self.skus[ra].is_empty() && !self.skus[rb].is_empty() {
            return false;
        }
        self.vendors[ra].is_disjoint(&self.vendors[rb])
    }
}

struct Unit {
    members: Vec<usize>,
    has_sku: bool,
    prior: Option<String>,
}

struct Edge {
    score: f64,
    /// Both units carried the same product id last cycle.
    grouped_before: bool,
    /// Lowest product id either unit carried last cycle.
    prior: Option<String>,
    a: usize,
    b: usize,
}

/// Highest score first; equal scores prefer pairs that were already grouped,
/// then the lowest existing product id, then unit order.
fn edge_order(x: &Edge, y: &Edge) -> Ordering {
    y.score
        .total_cmp(&x.score)
        .then_with(|| y.grouped_before.cmp(&x.grouped_before))
        .then_with(|| match (&x.prior, &y.prior) {
            (Some(px), Some(py)) => px.cmp(py),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| (x.a, x.b).cmp(&(y.a, y.b)))
}

/// Most frequent non-`Uncategorized` category; ties go to the smallest name.
fn canonical_category<'a>(categories: impl Iterator<Item = &'a str>) -> (String, usize) {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for category in categories.filter(|c| *c != UNCATEGORIZED) {
        *counts.entry(category).or_default() += 1;
    }
    let distinct = counts.len();
    let best = counts
        .iter()
        .max_by(|(ca, na), (cb, nb)| na.cmp(nb).then_with(|| cb.cmp(ca)))
        .map(|(c, _)| c.to_string())
        .unwrap_or_else(|| UNCATEGORIZED.to_string());
    (best, distinct)
}

/// Content signature id of a title-matched group.
pub fn title_group_id(members: &[&Listing]) -> String {
    let mut lines: Vec<String> = members
        .iter()
        .map(|l| format!("{}|{}", l.vendor, normalize_title(&l.title)))
        .collect();
    lines.sort();
    let mut hasher = Sha256::new();
    hasher.update(lines.join("\n").as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("title-{}", &digest[..8])
}

pub struct IdentityResolver {
    config: ResolverConfig,
}

impl IdentityResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Groups listings into products, reusing ids from `prior` (item id -> product id).
    pub fn resolve(&self, listings: &[Listing], prior: &BTreeMap<String, String>) -> Resolution {
        let (entries, collisions) = self.prepare(listings, prior);
        let mut stats = ResolveStats {
            listings: entries.len(),
            duplicate_items: collisions.len(),
            ..Default::default()
        };
        let mut sets = DisjointSet::new(&entries);

        let mut sku_buckets: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            if let Some(sku) = &entry.sku {
                sku_buckets.entry(sku.as_str()).or_default().push(idx);
            }
        }
        stats.sku_groups = sku_buckets.len();
        for members in sku_buckets.values() {
            for &other in &members[1..] {
                sets.union(members[0], other);
            }
        }

        let mut categories: Vec<String> = entries.iter().map(|e| e.listing.category.clone()).collect();
        let mut sku_roots: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for members in sku_buckets.values() {
            let root = sets.find(members[0]);
            sku_roots.entry(root).or_default().extend(members.iter().copied());
        }
        // Keyed by the first member of the SKU group.
        let mut conflicts: BTreeMap<usize, String> = BTreeMap::new();
        for members in sku_roots.values_mut() {
            members.sort_unstable();
            let raw: Vec<&str> = members
                .iter()
                .map(|&i| entries[i].listing.category.as_str())
                .collect();
            let (category, distinct) = canonical_category(raw.iter().copied());
            if distinct > 1 {
                stats.category_conflicts += 1;
                let seen: BTreeSet<&str> = raw.into_iter().collect();
                let seen: Vec<&str> = seen.into_iter().collect();
                conflicts.insert(
                    members[0],
                    format!("categories {} resolved to {category}", seen.join(", ")),
                );
            }
            for &i in members.iter() {
                categories[i] = category.clone();
            }
        }

        let mut units: Vec<Unit> = Vec::new();
        for members in sku_roots.into_values() {
            let prior = members.iter().filter_map(|&i| entries[i].prior.clone()).min();
            units.push(Unit {
                members,
                has_sku: true,
                prior,
            });
        }
        for (idx, entry) in entries.iter().enumerate() {
            if entry.sku.is_some() {
                continue;
            }
            if self.is_fuzzy_eligible(entry) {
                units.push(Unit {
                    members: vec![idx],
                    has_sku: false,
                    prior: entry.prior.clone(),
                });
            } else {
                stats.singletons += 1;
            }
        }
        units.sort_by_key(|u| u.members[0]);

        let mut buckets: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (unit_idx, unit) in units.iter().enumerate() {
            buckets
                .entry(categories[unit.members[0]].as_str())
                .or_default()
                .push(unit_idx);
        }

        let mut edges = Vec::new();
        for unit_ids in buckets.values() {
            for (pos, &ua) in unit_ids.iter().enumerate() {
                for &ub in &unit_ids[pos + 1..] {
                    let (a, b) = (&units[ua], &units[ub]);
                    if a.has_sku && b.has_sku {
                        continue;
                    }
                    let score = a
                        .members
                        .iter()
                        .flat_map(|&i| b.members.iter().map(move |&j| (i, j)))
                        .map(|(i, j)| entries[i].similarity(&entries[j]))
                        .fold(0.0f64, f64::max);
                    if score >= self.config.fuzzy_threshold {
                        edges.push(Edge {
                            score,
                            grouped_before: a.prior.is_some() && a.prior == b.prior,
                            prior: a.prior.iter().chain(b.prior.iter()).min().cloned(),
                            a: ua,
                            b: ub,
                        });
                    }
                }
            }
        }
        edges.sort_by(edge_order);

        for edge in &edges {
            let (a, b) = (units[edge.a].members[0], units[edge.b].members[0]);
            if sets.find(a) == sets.find(b) {
                continue;
            }
            if sets.can_merge(a, b) {
                sets.union(a, b);
                stats.fuzzy_merges += 1;
            } else {
                stats.refused_merges += 1;
            }
        }

        let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for idx in 0..entries.len() {
            let root = sets.find(idx);
            groups.entry(root).or_default().push(idx);
        }
        let groups: Vec<Vec<usize>> = groups.into_values().collect();

        let ids = self.assign_ids(&entries, &groups, &mut stats);

        let mut resolution = Resolution::default();
        for (group, id) in groups.iter().zip(ids) {
            let product = self.assemble(&entries, group, &categories, id);
            for member in &product.members {
                resolution
                    .assignments
                    .insert(member.item_id.clone(), product.id.clone());
            }
            if product.matched_by == MatchKind::Sku {
                let conflict = group.iter().find_map(|i| conflicts.get(i));
                let found = self.diagnose(&entries, group, &product, conflict);
                resolution.diagnostics.extend(found);
            }
            resolution.products.push(product);
        }

        for collision in collisions {
            let product_id = resolution.product_of(&collision.item_id).unwrap_or_default().to_string();
            resolution.diagnostics.push(ResolveDiagnostic {
                product_id,
                kind: DiagnosticKind::DuplicateItemId,
                detail: format!(
                    "item id {} from {} dropped, already used by {}",
                    collision.item_id, collision.dropped_vendor, collision.kept_vendor
                ),
                items: vec![collision.item_id],
            });
        }

        resolution.products.sort_by(|a, b| a.id.cmp(&b.id));
        stats.products = resolution.products.len();
        stats.multi_vendor = resolution
            .products
            .iter()
            .filter(|p| {
                p.members
                    .iter()
                    .map(|m| m.vendor.as_str())
                    .collect::<BTreeSet<_>>()
                    .len()
                    > 1
            })
            .count();
        resolution.stats = stats;
        resolution
    }

    /// Entries in deterministic unit order, one per item id. Listings of a
    /// different vendor reusing an item id already taken are returned as collisions.
    fn prepare(&self, listings: &[Listing], prior: &BTreeMap<String, String>) -> (Vec<Entry>, Vec<ItemCollision>) {
        let mut entries: Vec<Entry> = listings
            .iter()
            .map(|listing| {
                let title = normalize_title(&listing.title);
                Entry {
                    compact: title.split_whitespace().collect(),
                    digits: digit_runs(&title).into_iter().map(str::to_string).collect(),
                    sku: usable_sku(listing.sku.as_deref(), self.config.min_sku_len),
                    prior: prior.get(&listing.item_id).cloned(),
                    title,
                    listing: listing.clone(),
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            a.listing
                .vendor
                .cmp(&b.listing.vendor)
                .then_with(|| a.title.cmp(&b.title))
                .then_with(|| a.listing.item_id.cmp(&b.listing.item_id))
        });
        let mut owners: BTreeMap<String, String> = BTreeMap::new();
        let mut collisions = Vec::new();
        entries.retain(|e| match owners.get(&e.listing.item_id) {
            None => {
                owners.insert(e.listing.item_id.clone(), e.listing.vendor.clone());
                true
            }
            Some(kept) => {
                if *kept != e.listing.vendor {
                    collisions.push(ItemCollision {
                        item_id: e.listing.item_id.clone(),
                        kept_vendor: kept.clone(),
                        dropped_vendor: e.listing.vendor.clone(),
                    });
                }
                false
            }
        });
        (entries, collisions)
    }

    fn is_fuzzy_eligible(&self, entry: &Entry) -> bool {
        entry.title.split_whitespace().count() >= self.config.min_title_tokens
            && entry.title.chars().count() >= self.config.min_title_chars
    }

    fn assign_ids(&self, entries: &[Entry], groups: &[Vec<usize>], stats: &mut ResolveStats) -> Vec<String> {
        let mut ids: Vec<Option<String>> = vec![None; groups.len()];
        let mut claimed: BTreeSet<String> = BTreeSet::new();

        for (gi, group) in groups.iter().enumerate() {
            if let Some(sku) = group.iter().filter_map(|&i| entries[i].sku.as_ref()).min() {
                let id = format!("sku-{sku}");
                if group.iter().any(|&i| entries[i].prior.as_deref() == Some(id.as_str())) {
                    stats.reused_ids += 1;
                } else {
                    stats.new_ids += 1;
                }
                claimed.insert(id.clone());
                ids[gi] = Some(id);
            }
        }

        // (member count, prior id, group index); most common prior wins, then lowest id.
        let mut candidates: Vec<(usize, &str, usize)> = Vec::new();
        for (gi, group) in groups.iter().enumerate() {
            if ids[gi].is_some() {
                continue;
            }
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for &i in group {
                if let Some(prior) = entries[i].prior.as_deref() {
                    *counts.entry(prior).or_default() += 1;
                }
            }
            candidates.extend(counts.into_iter().map(|(id, n)| (n, id, gi)));
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)).then_with(|| a.2.cmp(&b.2)));
        for (_, prior_id, gi) in candidates {
            if ids[gi].is_some() || claimed.contains(prior_id) {
                continue;
            }
            claimed.insert(prior_id.to_string());
            ids[gi] = Some(prior_id.to_string());
            stats.reused_ids += 1;
        }

        groups
            .iter()
            .zip(ids)
            .map(|(group, id)| match id {
                Some(id) => id,
                None => {
                    let members: Vec<&Listing> = group.iter().map(|&i| &entries[i].listing).collect();
                    let base = title_group_id(&members);
                    let mut id = base.clone();
                    let mut suffix = 2;
                    while claimed.contains(&id) {
                        id = format!("{base}-{suffix}");
                        suffix += 1;
                    }
                    claimed.insert(id.clone());
                    stats.new_ids += 1;
                    id
                }
            })
            .collect()
    }

    fn assemble(&self, entries: &[Entry], group: &[usize], categories: &[String], id: String) -> Product {
        let canonical = &entries[group[0]];
        let mut members: Vec<Listing> = group.iter().map(|&i| entries[i].listing.clone()).collect();
        members.sort_by(|a, b| a.vendor.cmp(&b.vendor).then_with(|| a.item_id.cmp(&b.item_id)));
        for member in &mut members {
            member.category = categories[group[0]].clone();
        }

        let tags: BTreeSet<&str> = members.iter().flat_map(|m| m.tags.iter().map(String::as_str)).collect();
        let lowest_price = lowest_offer(&members).map(|l| l.price).unwrap_or_default();
        Product {
            id,
            title: canonical.listing.title.clone(),
            image: members.iter().find_map(|m| m.image.clone()),
            category: categories[group[0]].clone(),
            tags: tags.into_iter().take(self.config.max_tags).map(str::to_string).collect(),
            matched_by: if group.iter().any(|&i| entries[i].sku.is_some()) {
                MatchKind::Sku
            } else {
                MatchKind::Title
            },
            in_stock: members.iter().any(|m| m.in_stock),
            lowest_price,
            members,
        }
    }

    fn diagnose(
        &self,
        entries: &[Entry],
        group: &[usize],
        product: &Product,
        category_conflict: Option<&String>,
    ) -> Vec<ResolveDiagnostic> {
        let items: Vec<String> = product.members.iter().map(|m| m.item_id.clone()).collect();
        let mut out = Vec::new();
        let sku_members: Vec<&Entry> = group
            .iter()
            .map(|&i| &entries[i])
            .filter(|e| e.sku.is_some())
            .collect();
        let worst = sku_members
            .iter()
            .enumerate()
            .flat_map(|(pos, a)| sku_members[pos + 1..].iter().map(move |b| a.similarity(b)))
            .fold(1.0f64, f64::min);
        if worst < self.config.review_threshold {
            out.push(ResolveDiagnostic {
                product_id: product.id.clone(),
                kind: DiagnosticKind::DissimilarTitles,
                detail: format!("lowest title similarity {worst:.2}"),
                items: items.clone(),
            });
        }
        if let Some(detail) = category_conflict {
            out.push(ResolveDiagnostic {
                product_id: product.id.clone(),
                kind: DiagnosticKind::CategoryConflict,
                detail: detail.clone(),
                items,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn listing(vendor: &str, id: &str, title: &str, sku: Option<&str>, category: &str, price: f64) -> Listing {
        let store = vendor.to_lowercase().replace(' ', "-");
        Listing {
            item_id: Listing::item_id_for(&store, id, id),
            vendor: vendor.to_string(),
            store_id: store,
            product_id: id.to_string(),
            variant_id: id.to_string(),
            sku: sku.map(str::to_string),
            title: title.to_string(),
            category: category.to_string(),
            tags: vec![],
            price,
            regular_price: None,
            in_stock: true,
            url: format!("https://{vendor}.example/{id}"),
            image: None,
        }
    }

    fn resolver() -> IdentityResolver {
        IdentityResolver::new(ResolverConfig::default())
    }

    fn no_prior() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    #[test]
    fn sku_normalization_handles_case_spacing_dashes_and_suffixes() {
        assert_eq!(normalize_sku(" g296a (Short) "), "G296A");
        assert_eq!(normalize_sku("at_glg\u{2013}02"), "AT-GLG-02");
        assert_eq!(normalize_sku("ab c 12"), "ABC12");
        assert_eq!(normalize_sku("(PROMO)"), "(PROMO)");
        assert_eq!(usable_sku(Some("123456"), 4), None);
        assert_eq!(usable_sku(Some("a1"), 4), None);
        assert_eq!(usable_sku(Some("  "), 4), None);
        assert_eq!(usable_sku(Some("abc123"), 4).as_deref(), Some("ABC123"));
    }

    #[test]
    fn shared_sku_groups_across_vendors_and_takes_lowest_price() {
        let listings = vec![
            listing("A", "1", "Tokyo Marui Hi-Capa", Some("ABC123"), "Pistols", 50.0),
            listing("B", "2", "Completely Different Name", Some("abc123"), "Pistols", 45.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 1);
        let product = &resolution.products[0];
        assert_eq!(product.id, "sku-ABC123");
        assert_eq!(product.matched_by, MatchKind::Sku);
        assert_eq!(product.lowest_price, 45.0);
        assert_eq!(resolution.stats.multi_vendor, 1);
        assert_eq!(resolution.diagnostics.len(), 1);
        assert_eq!(resolution.diagnostics[0].kind, DiagnosticKind::DissimilarTitles);
    }

    #[test]
    fn fuzzy_titles_merge_within_category() {
        assert!(title_similarity("glock 18c gen4 blaster", "glock 18c gen 4 gbb") >= 0.90);
        let listings = vec![
            listing("A", "1", "Glock 18C Gen4 Blaster", None, "Pistols", 120.0),
            listing("B", "2", "Glock 18C Gen 4 GBB", None, "Pistols", 110.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 1);
        assert_eq!(resolution.products[0].matched_by, MatchKind::Title);
        assert!(resolution.products[0].id.starts_with("title-"));
        assert_eq!(resolution.products[0].title, "Glock 18C Gen4 Blaster");
        assert_eq!(resolution.stats.fuzzy_merges, 1);
    }

    #[test]
    fn different_categories_and_model_numbers_never_merge() {
        let listings = vec![
            listing("A", "1", "Glock 18C Gen4 Blaster", None, "Pistols", 120.0),
            listing("B", "2", "Glock 18C Gen4 Blaster", None, "Parts", 110.0),
            listing("C", "3", "Gel Balls 10000 Pack", None, "Ammo", 10.0),
            listing("D", "4", "Gel Balls 20000 Pack", None, "Ammo", 18.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 4);
    }

    #[test]
    fn same_vendor_listings_are_not_fuzzy_merged() {
        let listings = vec![
            listing("A", "1", "Kublai P1 Gel Blaster Black", None, "Pistols", 100.0),
            listing("A", "2", "Kublai P1 Gel Blaster Blacks", None, "Pistols", 100.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 2);
        assert_eq!(resolution.stats.refused_merges, 1);
    }

    #[test]
    fn two_sku_groups_are_not_joined_through_a_fuzzy_listing() {
        let listings = vec![
            listing("A", "1", "Kublai P1 Gel Blaster", Some("KUB-P1-BK"), "Pistols", 100.0),
            listing("B", "2", "Kublai P1 Gel Blaster", Some("KUB-P1-TN"), "Pistols", 100.0),
            listing("C", "3", "Kublai P1 Gel Blaster", None, "Pistols", 95.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 2);
        let joined = resolution.product_of("c|3|3").unwrap();
        assert_eq!(joined, "sku-KUB-P1-BK");
        assert_eq!(resolution.stats.refused_merges, 1);
    }

    #[test]
    fn transitive_matches_form_one_group() {
        let listings = vec![
            listing("A", "1", "Kublai Vector Gel Blaster", None, "SMGs", 100.0),
            listing("B", "2", "Kublai Vector Gel Blaster Black", None, "SMGs", 100.0),
            listing("C", "3", "Kublai Vector Gel Blaster Black Edition", None, "SMGs", 100.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 1);
        assert_eq!(resolution.stats.fuzzy_merges, 2);
    }

    #[test]
    fn short_titles_stay_singletons() {
        let listings = vec![
            listing("A", "1", "Gels", None, "Ammo", 5.0),
            listing("B", "2", "Gels", None, "Ammo", 5.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 2);
        assert_eq!(resolution.stats.singletons, 2);
        assert_ne!(resolution.products[0].id, resolution.products[1].id);
    }

    #[test]
    fn sku_group_category_is_harmonized_and_reported() {
        let listings = vec![
            listing("A", "1", "Mag Pouch Triple", Some("MP-003"), "Tactical Gear", 20.0),
            listing("B", "2", "Mag Pouch Triple", Some("MP-003"), "Pouches", 22.0),
            listing("C", "3", "Mag Pouch Triple", Some("MP-003"), "Tactical Gear", 21.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.products.len(), 1);
        assert_eq!(resolution.products[0].category, "Tactical Gear");
        assert!(resolution.products[0].members.iter().all(|m| m.category == "Tactical Gear"));
        assert_eq!(resolution.stats.category_conflicts, 1);
        assert!(resolution
            .diagnostics
            .iter()
            .any(|d| d.kind == DiagnosticKind::CategoryConflict));
    }

    #[test]
    fn prior_ids_survive_membership_changes() {
        let first = vec![
            listing("A", "1", "Glock 18C Gen4 Blaster", None, "Pistols", 120.0),
            listing("B", "2", "Glock 18C Gen 4 GBB", None, "Pistols", 110.0),
        ];
        let r1 = resolver().resolve(&first, &no_prior());
        let id = r1.products[0].id.clone();

        let mut second = first.clone();
        second.remove(0);
        second.push(listing("C", "3", "Glock 18C Gen4 GBB", None, "Pistols", 105.0));
        let r2 = resolver().resolve(&second, &r1.assignments);
        assert_eq!(r2.products.len(), 1);
        assert_eq!(r2.products[0].id, id);
        assert_eq!(r2.stats.reused_ids, 1);
        assert_eq!(r2.stats.new_ids, 0);
    }

    #[test]
    fn split_group_keeps_id_on_larger_half_and_hashes_the_rest() {
        let mut prior = BTreeMap::new();
        prior.insert("a|1|1".to_string(), "title-legacy".to_string());
        prior.insert("b|2|2".to_string(), "title-legacy".to_string());
        prior.insert("c|3|3".to_string(), "title-legacy".to_string());
        let listings = vec![
            listing("A", "1", "Glock 18C Gen4 Blaster", None, "Pistols", 120.0),
            listing("B", "2", "Glock 18C Gen 4 GBB", None, "Pistols", 110.0),
            listing("C", "3", "Tactical Chest Rig", None, "Tactical Gear", 80.0),
        ];
        let resolution = resolver().resolve(&listings, &prior);
        assert_eq!(resolution.product_of("a|1|1"), Some("title-legacy"));
        assert_eq!(resolution.product_of("b|2|2"), Some("title-legacy"));
        assert_ne!(resolution.product_of("c|3|3"), Some("title-legacy"));
    }

    #[test]
    fn colliding_title_ids_get_suffixes() {
        let listings = vec![
            listing("A", "1", "Gels", None, "Ammo", 5.0),
            listing("A", "2", "Gels", None, "Ammo", 6.0),
        ];
        let resolution = resolver().resolve(&listings, &no_prior());
        let ids: Vec<&str> = resolution.products.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.iter().any(|id| id.ends_with("-2")));
    }

    #[test]
    fn tags_are_sorted_union_capped() {
        let mut a = listing("A", "1", "M4 Gel Blaster", Some("M4-STD"), "Rifles", 100.0);
        let mut b = listing("B", "2", "M4 Gel Blaster", Some("M4-STD"), "Rifles", 90.0);
        a.tags = (0..8).map(|i| format!("tag{i}")).collect();
        b.tags = vec!["aeg".into(), "tag1".into(), "zz".into(), "m4".into()];
        b.image = Some("https://b.example/m4.jpg".into());
        let resolution = resolver().resolve(&[a, b], &no_prior());
        let product = &resolution.products[0];
        assert_eq!(product.tags.len(), 10);
        assert_eq!(product.tags[0], "aeg");
        assert_eq!(product.image.as_deref(), Some("https://b.example/m4.jpg"));
    }

    #[test]
    fn item_ids_shared_by_two_vendors_are_reported() {
        let listings = vec![
            listing("gel depot", "1", "M4A1 Gel Blaster", None, "Rifles", 100.0),
            listing("Gel Depot", "1", "Kublai P1 Gel Blaster", None, "Pistols", 90.0),
        ];
        assert_eq!(listings[0].item_id, listings[1].item_id);

        let resolution = resolver().resolve(&listings, &no_prior());
        assert_eq!(resolution.stats.duplicate_items, 1);
        assert_eq!(resolution.stats.listings, 1);
        let kept = &resolution.products[0].members[0];
        assert_eq!(kept.vendor, "Gel Depot");
        let diagnostic = resolution
            .diagnostics
            .iter()
            .find(|d| d.kind == DiagnosticKind::DuplicateItemId)
            .expect("collision reported");
        assert_eq!(diagnostic.items, vec!["gel-depot|1|1".to_string()]);
        assert_eq!(diagnostic.product_id, resolution.products[0].id);
        assert!(diagnostic.detail.contains("from gel depot dropped"));
    }

    #[test]
    fn repeated_item_of_one_vendor_is_not_a_collision() {
        let a = listing("A", "1", "M4A1 Gel Blaster", None, "Rifles", 100.0);
        let resolution = resolver().resolve(&[a.clone(), a], &no_prior());
        assert_eq!(resolution.stats.duplicate_items, 0);
        assert_eq!(resolution.products.len(), 1);
        assert!(resolution.diagnostics.is_empty());
    }

    fn arb_listings() -> impl Strategy<Value = Vec<Listing>> {
        let one = (
            prop::sample::select(vec!["A", "B", "C", "D"]),
            prop::sample::select(vec![
                "Glock 18C Gen4 Blaster",
                "Glock 18C Gen 4 GBB",
                "M4A1 Gel Blaster",
                "Tactical Vest",
                "Gel Balls 10000",
                "Gels",
            ]),
            prop::option::of(prop::sample::select(vec!["ABC123", "abc-123", "XYZ999", "12345"])),
            prop::sample::select(vec!["Pistols", "Rifles", "Uncategorized"]),
            1u32..20_000,
        );
        prop::collection::vec(one, 1..24).prop_map(|rows| {
            rows.into_iter()
                .enumerate()
                .map(|(id, (vendor, title, sku, category, cents))| {
                    listing(vendor, &id.to_string(), title, sku, category, cents as f64 / 100.0)
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn equal_skus_always_share_a_product(listings in arb_listings()) {
            let resolution = resolver().resolve(&listings, &no_prior());
            for a in &listings {
                for b in &listings {
                    let (Some(sa), Some(sb)) = (usable_sku(a.sku.as_deref(), 4), usable_sku(b.sku.as_deref(), 4)) else {
                        continue;
                    };
                    if sa == sb {
                        prop_assert_eq!(resolution.product_of(&a.item_id), resolution.product_of(&b.item_id));
                    }
                }
            }
        }

        #[test]
        fn products_never_span_categories(listings in arb_listings()) {
            let resolution = resolver().resolve(&listings, &no_prior());
            for product in &resolution.products {
                prop_assert!(product.members.iter().all(|m| m.category == product.category));
            }
        }

        #[test]
        fn resolution_is_deterministic(listings in arb_listings()) {
            let first = resolver().resolve(&listings, &no_prior());
            let mut reversed = listings.clone();
            reversed.reverse();
            let second = resolver().resolve(&reversed, &no_prior());
            prop_assert_eq!(&first.assignments, &second.assignments);
            let again = resolver().resolve(&listings, &first.assignments);
            prop_assert_eq!(&first.assignments, &again.assignments);
        }

        #[test]
        fn lowest_price_prefers_in_stock(listings in arb_listings()) {
            let resolution = resolver().resolve(&listings, &no_prior());
            for product in &resolution.products {
                let in_stock: Vec<f64> = product.members.iter().filter(|m| m.in_stock).map(|m| m.price).collect();
                let pool: Vec<f64> = if in_stock.is_empty() {
                    product.members.iter().map(|m| m.price).collect()
                } else {
                    in_stock
                };
                let min = pool.into_iter().fold(f64::INFINITY, f64::min);
                prop_assert_eq!(product.lowest_price, min);
            }
        }
    }
}
