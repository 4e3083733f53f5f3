//! Delta-encoded price and stock history.
//!
//! A series only grows when the observed state differs from its last point at
//! cent precision, so re-running a cycle over identical listings writes nothing.

use std::collections::{BTreeMap, BTreeSet};

use pricewatch_core::snapshot::{ChangeCounts, ProductHistory, StockChange, StockEvent, TrackStats};
use pricewatch_core::{round_money, same_money, same_optional_money, Listing, PricePoint, Product, UnixSeconds};

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    pub retention_days: i64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { retention_days: 365 }
    }
}

/// Persisted series, item level and product level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryState {
    pub items: BTreeMap<String, Vec<PricePoint>>,
    pub products: BTreeMap<String, ProductHistory>,
}

/// What the tracker sees of one cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleObservation<'a> {
    pub products: &'a [Product],
    /// Vendors served from cache this cycle; their listings are not tracked.
    pub stale_vendors: &'a BTreeSet<String>,
    pub now: UnixSeconds,
}

#[derive(Debug, Clone, Default)]
pub struct TrackReport {
    pub stats: TrackStats,
    pub stock_events: Vec<StockEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    New,
    Changed,
    Unchanged,
}

fn count(counts: &mut ChangeCounts, outcome: Outcome) {
    match outcome {
        Outcome::New => counts.new += 1,
        Outcome::Changed => counts.changed += 1,
        Outcome::Unchanged => counts.unchanged += 1,
    }
}

fn next_timestamp(series: &[PricePoint], now: UnixSeconds) -> UnixSeconds {
    series.last().map_or(now, |last| now.max(last.t + 1))
}

/// Appends the offer state of a listing when price, sale price or stock moved.
fn record_offer(series: &mut Vec<PricePoint>, listing: &Listing, now: UnixSeconds) -> Outcome {
    let p = round_money(listing.price);
    let rp = listing.sale_regular_price();
    let s = listing.in_stock;
    let t = next_timestamp(series, now);
    let Some(last) = series.last() else {
        series.push(PricePoint {
            t,
            p,
            rp,
            s,
            v: None,
            prev: None,
            stock_prev: None,
        });
        return Outcome::New;
    };

    let price_moved = !same_money(last.p, p);
    let stock_moved = last.s != s;
    if !price_moved && !stock_moved && same_optional_money(last.rp, rp) {
        return Outcome::Unchanged;
    }
    let point = PricePoint {
        t,
        p,
        rp,
        s,
        v: None,
        prev: price_moved.then_some(last.p),
        stock_prev: stock_moved.then_some(last.s),
    };
    series.push(point);
    Outcome::Changed
}

/// Appends to the lowest-price line when the price, the contributing vendor
/// or its stock moved. `s` is the stock of the contributing offer, so a line
/// whose offers are all out of stock reads as out of stock.
fn record_lowest(series: &mut Vec<PricePoint>, offer: &Listing, now: UnixSeconds) -> Outcome {
    let p = round_money(offer.price);
    let t = next_timestamp(series, now);
    let Some(last) = series.last() else {
        series.push(PricePoint {
            t,
            p,
            rp: None,
            s: offer.in_stock,
            v: Some(offer.vendor.clone()),
            prev: None,
            stock_prev: None,
        });
        return Outcome::New;
    };

    let price_moved = !same_money(last.p, p);
    let stock_moved = last.s != offer.in_stock;
    if !price_moved && !stock_moved && last.v.as_deref() == Some(offer.vendor.as_str()) {
        return Outcome::Unchanged;
    }
    series.push(PricePoint {
        t,
        p,
        rp: None,
        s: offer.in_stock,
        v: Some(offer.vendor.clone()),
        prev: Some(last.p),
        stock_prev: stock_moved.then_some(last.s),
    });
    Outcome::Changed
}

/// Drops points older than `cutoff`; returns how many were removed.
fn prune_series(series: &mut Vec<PricePoint>, cutoff: UnixSeconds) -> usize {
    let before = series.len();
    series.retain(|point| point.t >= cutoff);
    before - series.len()
}

pub struct HistoryTracker {
    config: TrackerConfig,
}

impl HistoryTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self { config }
    }

    pub fn cutoff(&self, now: UnixSeconds) -> UnixSeconds {
        now.saturating_sub(self.config.retention_days.saturating_mul(SECONDS_PER_DAY))
    }

    /// Removes expired points from every series, dropping series left empty.
    pub fn prune(&self, state: &mut HistoryState, now: UnixSeconds) -> usize {
        let cutoff = self.cutoff(now);
        let mut pruned = 0;
        for series in state.items.values_mut() {
            pruned += prune_series(series, cutoff);
        }
        state.items.retain(|_, series| !series.is_empty());

        for history in state.products.values_mut() {
            for series in history.vendors.values_mut() {
                pruned += prune_series(series, cutoff);
            }
            history.vendors.retain(|_, series| !series.is_empty());
            pruned += prune_series(&mut history.lowest, cutoff);
        }
        state.products.retain(|_, history| !history.is_empty());
        pruned
    }

    /// Diffs one cycle against the persisted series and appends change points.
    pub fn track(&self, state: &mut HistoryState, cycle: CycleObservation<'_>) -> TrackReport {
        let mut report = TrackReport::default();
        report.stats.pruned = self.prune(state, cycle.now);
        let stale = cycle.stale_vendors;

        let mut members: BTreeMap<&str, (&Product, &Listing)> = BTreeMap::new();
        for product in cycle.products {
            for listing in &product.members {
                members.insert(listing.item_id.as_str(), (product, listing));
            }
        }

        for (item_id, (product, listing)) in members {
            if stale.contains(&listing.vendor) {
                report.stats.skipped_stale += 1;
                continue;
            }
            let series = state.items.entry(item_id.to_string()).or_default();
            let outcome = record_offer(series, listing, cycle.now);
            count(&mut report.stats.items, outcome);
            if let Some(point) = series.last().filter(|p| outcome == Outcome::Changed && p.is_stock_flip()) {
                report.stats.stock_flips += 1;
                report.stock_events.push(StockEvent {
                    item_id: item_id.to_string(),
                    product_id: product.id.clone(),
                    vendor: listing.vendor.clone(),
                    title: listing.title.clone(),
                    price: point.p,
                    change: if point.s {
                        StockChange::BackInStock
                    } else {
                        StockChange::OutOfStock
                    },
                    t: point.t,
                });
            }
        }

        for product in cycle.products {
            let live: Vec<&Listing> = product
                .members
                .iter()
                .filter(|m| !stale.contains(&m.vendor))
                .collect();
            if live.is_empty() {
                continue;
            }
            let history = state.products.entry(product.id.clone()).or_default();

            for offer in product.vendor_offers() {
                if stale.contains(&offer.vendor) {
                    continue;
                }
                let series = history.vendors.entry(offer.vendor.clone()).or_default();
                count(&mut report.stats.vendors, record_offer(series, offer, cycle.now));
            }

            if let Some(lowest) = pricewatch_core::lowest_offer(live) {
                count(&mut report.stats.lowest, record_lowest(&mut history.lowest, lowest, cycle.now));
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pricewatch_core::MatchKind;
    use proptest::prelude::*;

    const DAY: i64 = SECONDS_PER_DAY;

    fn offer(vendor: &str, price: f64, in_stock: bool) -> Listing {
        let store = vendor.to_lowercase();
        Listing {
            item_id: Listing::item_id_for(&store, "1", "1"),
            vendor: vendor.to_string(),
            store_id: store,
            product_id: "1".into(),
            variant_id: "1".into(),
            sku: Some("ABC123".into()),
            title: format!("{vendor} Hi-Capa"),
            category: "Pistols".into(),
            tags: vec![],
            price,
            regular_price: None,
            in_stock,
            url: format!("https://{vendor}.example/p/1"),
            image: None,
        }
    }

    fn product(members: Vec<Listing>) -> Product {
        let lowest_price = pricewatch_core::lowest_offer(&members).map(|l| l.price).unwrap_or_default();
        Product {
            id: "sku-ABC123".into(),
            title: "Hi-Capa".into(),
            image: None,
            category: "Pistols".into(),
            tags: vec![],
            matched_by: MatchKind::Sku,
            in_stock: members.iter().any(|m| m.in_stock),
            lowest_price,
            members,
        }
    }

    fn run(tracker: &HistoryTracker, state: &mut HistoryState, products: &[Product], now: i64) -> TrackReport {
        let stale = BTreeSet::new();
        tracker.track(
            state,
            CycleObservation {
                products,
                stale_vendors: &stale,
                now,
            },
        )
    }

    fn tracker() -> HistoryTracker {
        HistoryTracker::new(TrackerConfig::default())
    }

    #[test]
    fn price_drop_appends_one_item_point_and_moves_lowest_line() {
        let tracker = tracker();
        let mut state = HistoryState::default();
        let t0 = 1_767_225_600;
        run(&tracker, &mut state, &[product(vec![offer("A", 50.0, true), offer("B", 55.0, true)])], t0);

        let report = run(
            &tracker,
            &mut state,
            &[product(vec![offer("A", 45.0, true), offer("B", 55.0, true)])],
            t0 + 3600,
        );

        let a = &state.items["a|1|1"];
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].p, 45.0);
        assert_eq!(a[1].prev, Some(50.0));
        assert_eq!(a[1].stock_prev, None);
        assert_eq!(state.items["b|1|1"].len(), 1);

        let history = &state.products["sku-ABC123"];
        assert_eq!(history.vendors["A"].len(), 2);
        assert_eq!(history.vendors["B"].len(), 1);
        let lowest = history.lowest.last().unwrap();
        assert_eq!((lowest.p, lowest.prev, lowest.v.as_deref()), (45.0, Some(50.0), Some("A")));

        assert_eq!(report.stats.items.changed, 1);
        assert_eq!(report.stats.items.unchanged, 1);
        assert_eq!(report.stats.lowest.changed, 1);
    }

    #[test]
    fn stock_flip_round_trip_writes_two_points() {
        let tracker = tracker();
        let mut state = HistoryState::default();
        let t0 = 1_767_225_600;
        run(&tracker, &mut state, &[product(vec![offer("C", 30.0, true)])], t0);
        let out = run(&tracker, &mut state, &[product(vec![offer("C", 30.0, false)])], t0 + DAY);
        run(&tracker, &mut state, &[product(vec![offer("C", 30.0, false)])], t0 + 2 * DAY);
        let back = run(&tracker, &mut state, &[product(vec![offer("C", 30.0, true)])], t0 + 3 * DAY);

        let series = &state.items["c|1|1"];
        assert_eq!(series.len(), 3);
        assert_eq!((series[1].s, series[1].stock_prev, series[1].prev), (false, Some(true), None));
        assert_eq!((series[2].s, series[2].stock_prev), (true, Some(false)));
        assert_eq!(out.stock_events[0].change, StockChange::OutOfStock);
        assert_eq!(back.stock_events[0].change, StockChange::BackInStock);
        assert_eq!(back.stats.stock_flips, 1);
    }

    #[test]
    fn lowest_line_reads_out_of_stock_when_every_offer_is() {
        let tracker = tracker();
        let mut state = HistoryState::default();
        let t0 = 1_767_225_600;
        let sold_out = product(vec![offer("A", 30.0, false), offer("B", 35.0, false)]);
        run(&tracker, &mut state, &[sold_out], t0);
        let lowest = &state.products["sku-ABC123"].lowest;
        assert_eq!(lowest.len(), 1);
        assert!(!lowest[0].s);
        let json = serde_json::to_value(&lowest[0]).unwrap();
        assert_eq!(json["s"], false);

        let restocked = product(vec![offer("A", 30.0, true), offer("B", 35.0, false)]);
        let report = run(&tracker, &mut state, &[restocked], t0 + DAY);
        let lowest = &state.products["sku-ABC123"].lowest;
        assert_eq!(lowest.len(), 2);
        assert_eq!((lowest[1].s, lowest[1].stock_prev, lowest[1].v.as_deref()), (true, Some(false), Some("A")));
        assert_eq!(report.stats.lowest.changed, 1);
    }

    #[test]
    fn huge_retention_does_not_overflow_the_cutoff() {
        let tracker = HistoryTracker::new(TrackerConfig {
            retention_days: i64::MAX,
        });
        assert_eq!(tracker.cutoff(1_000), i64::MIN + 1_001);
        let mut state = HistoryState::default();
        run(&tracker, &mut state, &[product(vec![offer("A", 30.0, true)])], 1_000);
        assert_eq!(tracker.prune(&mut state, 2_000), 0);
        assert_eq!(state.items["a|1|1"].len(), 1);
    }

    #[test]
    fn identical_cycles_are_a_no_op() {
        let tracker = tracker();
        let mut state = HistoryState::default();
        let products = [product(vec![offer("A", 50.0, true), offer("B", 49.99, false)])];
        run(&tracker, &mut state, &products, 1_000_000);
        let snapshot = state.clone();
        let report = run(&tracker, &mut state, &products, 1_000_000);
        assert_eq!(state, snapshot);
        assert_eq!(report.stats.items.new + report.stats.items.changed, 0);
        assert_eq!(report.stats.lowest.unchanged, 1);
    }

    #[test]
    fn sub_cent_noise_is_ignored_and_sale_price_is_tracked() {
        let tracker = tracker();
        let mut state = HistoryState::default();
        run(&tracker, &mut state, &[product(vec![offer("A", 50.0, true)])], 1_000);
        run(&tracker, &mut state, &[product(vec![offer("A", 50.001, true)])], 2_000);
        assert_eq!(state.items["a|1|1"].len(), 1);

        let mut on_sale = offer("A", 50.0, true);
        on_sale.regular_price = Some(60.0);
        run(&tracker, &mut state, &[product(vec![on_sale])], 3_000);
        let series = &state.items["a|1|1"];
        assert_eq!(series.len(), 2);
        assert_eq!(series[1].rp, Some(60.0));
        assert_eq!(series[1].prev, None);
    }

    #[test]
    fn same_second_points_are_bumped_forward() {
        let tracker = tracker();
        let mut state = HistoryState::default();
        run(&tracker, &mut state, &[product(vec![offer("A", 50.0, true)])], 5_000);
        run(&tracker, &mut state, &[product(vec![offer("A", 40.0, true)])], 5_000);
        run(&tracker, &mut state, &[product(vec![offer("A", 30.0, true)])], 4_000);
        let ts: Vec<i64> = state.items["a|1|1"].iter().map(|p| p.t).collect();
        assert_eq!(ts, vec![5_000, 5_001, 5_002]);
    }

    #[test]
    fn stale_vendors_and_absent_listings_write_nothing() {
        let tracker = tracker();
        let mut state = HistoryState::default();
        run(&tracker, &mut state, &[product(vec![offer("A", 50.0, true), offer("B", 45.0, true)])], 1_000);

        let stale = BTreeSet::from(["B".to_string()]);
        let products = [product(vec![offer("A", 50.0, true), offer("B", 20.0, false)])];
        let report = tracker.track(
            &mut state,
            CycleObservation {
                products: &products,
                stale_vendors: &stale,
                now: 2_000,
            },
        );
        assert_eq!(report.stats.skipped_stale, 1);
        assert_eq!(state.items["b|1|1"].len(), 1);
        assert_eq!(state.products["sku-ABC123"].vendors["B"].len(), 1);
        // A alone is now the lowest live offer.
        let lowest = state.products["sku-ABC123"].lowest.last().unwrap();
        assert_eq!(lowest.v.as_deref(), Some("A"));

        run(&tracker, &mut state, &[product(vec![offer("A", 50.0, true)])], 3_000);
        assert_eq!(state.items["b|1|1"].len(), 1);
    }

    #[test]
    fn retention_drops_old_points_and_empty_series() {
        let tracker = HistoryTracker::new(TrackerConfig { retention_days: 30 });
        let mut state = HistoryState::default();
        run(&tracker, &mut state, &[product(vec![offer("A", 50.0, true)])], 0);
        state.items.insert("z|9|9".into(), vec![PricePoint {
            t: 0,
            p: 10.0,
            rp: None,
            s: true,
            v: None,
            prev: None,
            stock_prev: None,
        }]);

        let report = run(&tracker, &mut state, &[product(vec![offer("A", 45.0, true)])], 31 * DAY);
        assert!(!state.items.contains_key("z|9|9"));
        let a = &state.items["a|1|1"];
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].prev, None);
        assert!(report.stats.pruned >= 2);
    }

    fn arb_cycle() -> impl Strategy<Value = Vec<(u32, bool)>> {
        prop::collection::vec((1u32..200, any::<bool>()), 1..3)
    }

    proptest! {
        #[test]
        fn series_timestamps_strictly_increase(
            cycles in prop::collection::vec((arb_cycle(), 0i64..5), 1..12)
        ) {
            let tracker = tracker();
            let mut state = HistoryState::default();
            let mut now = 1_000_000;
            for (offers, step) in cycles {
                now += step;
                let vendors = ["A", "B", "C"];
                let members = offers
                    .iter()
                    .zip(vendors)
                    .map(|((price, stock), vendor)| offer(vendor, *price as f64, *stock))
                    .collect();
                run(&tracker, &mut state, &[product(members)], now);
            }
            let all = state
                .items
                .values()
                .chain(state.products.values().flat_map(|h| h.vendors.values().chain(std::iter::once(&h.lowest))));
            for series in all {
                for pair in series.windows(2) {
                    prop_assert!(pair[0].t < pair[1].t);
                }
            }
        }

        #[test]
        fn repeating_a_cycle_adds_no_points(offers in arb_cycle(), now in 0i64..10_000_000) {
            let tracker = tracker();
            let mut state = HistoryState::default();
            let members: Vec<Listing> = offers
                .iter()
                .zip(["A", "B", "C"])
                .map(|((price, stock), vendor)| offer(vendor, *price as f64, *stock))
                .collect();
            let products = [product(members)];
            run(&tracker, &mut state, &products, now);
            let before = state.clone();
            run(&tracker, &mut state, &products, now + 60);
            prop_assert_eq!(state, before);
        }
    }
}
