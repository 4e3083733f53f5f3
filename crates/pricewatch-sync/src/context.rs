//! State threaded through one cycle: the prior committed documents, the cycle
//! clock and what each vendor produced.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use pricewatch_core::snapshot::{
    ItemHistoryDoc, MatchesDoc, ProductHistoryDoc, StoreStats, ITEM_HISTORY_FILE, MATCHES_FILE,
    PRICE_HISTORY_FILE,
};
use pricewatch_core::{Listing, UnixSeconds};
use pricewatch_storage::SnapshotDir;
use uuid::Uuid;

use crate::history::HistoryState;

/// Source of the cycle timestamp.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Documents of the last committed cycle that the next cycle builds on.
#[derive(Debug, Clone, Default)]
pub struct PriorState {
    pub history: HistoryState,
    pub matches: MatchesDoc,
}

impl PriorState {
    pub async fn load(dir: &SnapshotDir) -> Result<Self> {
        let items: ItemHistoryDoc = dir.read_json(ITEM_HISTORY_FILE).await?.unwrap_or_default();
        let products: ProductHistoryDoc = dir.read_json(PRICE_HISTORY_FILE).await?.unwrap_or_default();
        let matches: MatchesDoc = dir.read_json(MATCHES_FILE).await?.unwrap_or_default();
        Ok(Self {
            history: HistoryState {
                items: items.history,
                products: products.history,
            },
            matches,
        })
    }

    /// Item id -> product id for every item the registry still remembers.
    pub fn assignments(&self) -> BTreeMap<String, String> {
        let mut out: BTreeMap<String, String> = self
            .matches
            .retained
            .iter()
            .map(|(item, retained)| (item.clone(), retained.product_id.clone()))
            .collect();
        for record in &self.matches.matches {
            for item in &record.items {
                out.insert(item.clone(), record.id.clone());
            }
        }
        out
    }

    pub fn last_updated(&self) -> Option<UnixSeconds> {
        self.matches.last_updated.map(|t| t.timestamp())
    }
}

/// What one store contributed to the cycle.
#[derive(Debug, Clone)]
pub struct VendorHarvest {
    pub stats: StoreStats,
    pub listings: Vec<Listing>,
    /// Served from the raw catalog cache after a failed fetch.
    pub stale: bool,
}

pub struct PipelineContext {
    pub run_id: Uuid,
    pub now: DateTime<Utc>,
    pub prior: PriorState,
    pub harvests: Vec<VendorHarvest>,
}

impl PipelineContext {
    pub fn new(run_id: Uuid, now: DateTime<Utc>, prior: PriorState) -> Self {
        Self {
            run_id,
            now,
            prior,
            harvests: Vec::new(),
        }
    }

    pub fn now_unix(&self) -> UnixSeconds {
        self.now.timestamp()
    }

    pub fn listings(&self) -> Vec<Listing> {
        self.harvests
            .iter()
            .flat_map(|h| h.listings.iter().cloned())
            .collect()
    }

    pub fn stale_vendors(&self) -> BTreeSet<String> {
        self.harvests
            .iter()
            .filter(|h| h.stale)
            .map(|h| h.stats.name.clone())
            .collect()
    }

    /// Vendors that contributed at least one listing.
    pub fn store_count(&self) -> usize {
        self.harvests.iter().filter(|h| !h.listings.is_empty()).count()
    }
}
