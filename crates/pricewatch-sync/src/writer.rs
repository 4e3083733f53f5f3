//! Builds the published documents of one cycle and stages them for commit.

use std::collections::BTreeMap;

use anyhow::Result;
use pricewatch_core::snapshot::{
    ItemHistoryDoc, ItemRecord, ItemsSnapshot, MatchRecord, MatchesDoc, ProductHistoryDoc, ProductRecord,
    ProductsSnapshot, RetainedAssignment, RunStatsDoc, ITEMS_FILE, ITEM_HISTORY_FILE, MATCHES_FILE,
    PRICE_HISTORY_FILE, PRODUCTS_FILE, STATS_FILE,
};
use pricewatch_core::{to_cents, Product, UnixSeconds};
use pricewatch_storage::{CommitSummary, SnapshotDir};
use tracing::info;

use crate::context::PipelineContext;
use crate::history::HistoryState;
use crate::resolve::Resolution;

pub struct CycleDocuments {
    pub products: ProductsSnapshot,
    pub items: ItemsSnapshot,
    pub price_history: ProductHistoryDoc,
    pub item_history: ItemHistoryDoc,
    pub matches: MatchesDoc,
    pub stats: RunStatsDoc,
}

/// Cheapest first; equal prices keep id order.
pub fn sort_products(products: &mut [ProductRecord]) {
    products.sort_by(|a, b| {
        to_cents(a.lowest_price)
            .cmp(&to_cents(b.lowest_price))
            .then_with(|| a.id.cmp(&b.id))
    });
}

pub fn products_snapshot(ctx: &PipelineContext, products: &[Product]) -> ProductsSnapshot {
    let mut records: Vec<ProductRecord> = products.iter().map(ProductRecord::from).collect();
    sort_products(&mut records);
    ProductsSnapshot {
        last_updated: ctx.now,
        store_count: ctx.store_count(),
        product_count: records.len(),
        products: records,
    }
}

/// Item records come from resolved members so they carry the product's
/// harmonised category.
pub fn items_snapshot(ctx: &PipelineContext, products: &[Product]) -> ItemsSnapshot {
    ItemsSnapshot {
        last_updated: ctx.now,
        items: products
            .iter()
            .flat_map(|p| p.members.iter())
            .map(|l| (l.item_id.clone(), ItemRecord::from(l)))
            .collect(),
    }
}

/// Identity registry for the next cycle.
///
/// Items missing this cycle keep their product id as a retained assignment
/// until they have been unseen for longer than `cutoff`.
pub fn matches_doc(ctx: &PipelineContext, resolution: &Resolution, cutoff: UnixSeconds) -> MatchesDoc {
    let matches: Vec<MatchRecord> = resolution
        .products
        .iter()
        .map(|p| MatchRecord {
            id: p.id.clone(),
            matched_by: p.matched_by,
            items: p.members.iter().map(|m| m.item_id.clone()).collect(),
        })
        .collect();

    let last_cycle = ctx.prior.last_updated().unwrap_or_else(|| ctx.now_unix());
    let mut retained: BTreeMap<String, RetainedAssignment> = ctx.prior.matches.retained.clone();
    for record in &ctx.prior.matches.matches {
        for item in &record.items {
            retained.insert(
                item.clone(),
                RetainedAssignment {
                    product_id: record.id.clone(),
                    last_seen: last_cycle,
                },
            );
        }
    }
    retained.retain(|item, entry| !resolution.assignments.contains_key(item) && entry.last_seen >= cutoff);

    MatchesDoc {
        last_updated: Some(ctx.now),
        matches,
        retained,
    }
}

pub fn history_docs(ctx: &PipelineContext, state: HistoryState) -> (ProductHistoryDoc, ItemHistoryDoc) {
    (
        ProductHistoryDoc {
            last_updated: Some(ctx.now),
            history: state.products,
        },
        ItemHistoryDoc {
            last_updated: Some(ctx.now),
            history: state.items,
        },
    )
}

impl CycleDocuments {
    /// Stages every document and swaps them into the data directory together.
    pub async fn commit(&self, dir: &SnapshotDir) -> Result<CommitSummary> {
        let mut txn = dir.begin().await?;
        let staged = async {
            txn.write_json(PRODUCTS_FILE, &self.products, false).await?;
            txn.write_json(ITEMS_FILE, &self.items, false).await?;
            txn.write_json(PRICE_HISTORY_FILE, &self.price_history, false).await?;
            txn.write_json(ITEM_HISTORY_FILE, &self.item_history, false).await?;
            txn.write_json(MATCHES_FILE, &self.matches, true).await?;
            txn.write_json(STATS_FILE, &self.stats, true).await
        }
        .await;
        if let Err(err) = staged {
            txn.abort().await?;
            return Err(err);
        }
        let summary = txn.commit().await?;
        info!(
            files = summary.files_written,
            bytes = summary.bytes_written,
            "committed snapshot"
        );
        Ok(summary)
    }
}
