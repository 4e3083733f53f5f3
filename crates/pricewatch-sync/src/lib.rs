//! Cycle orchestration: fetch every store, resolve identities, track history,
//! commit the published documents.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pricewatch_adapters::{
    process_catalog, source_for_platform, AdapterError, CatalogRules, CatalogSource, FetchContext, VendorLog,
};
use pricewatch_core::snapshot::{RunStatsDoc, RunTotals, StockChange, StoreStats, TrackStats, STATS_FILE};
use pricewatch_storage::{CatalogCache, HttpClientConfig, HttpFetcher, RawCatalog, SnapshotDir};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod context;
pub mod history;
pub mod resolve;
pub mod stores;
pub mod writer;

use context::{Clock, PipelineContext, PriorState, SystemClock, VendorHarvest};
use history::{CycleObservation, HistoryTracker, TrackerConfig};
use resolve::{IdentityResolver, ResolverConfig};
use stores::{ActiveStore, StoreRegistry};
use writer::CycleDocuments;

pub const CRATE_NAME: &str = "pricewatch-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pages: usize,
    pub request_delay_ms: u64,
    pub concurrency: usize,
    pub retention_days: i64,
    pub fuzzy_threshold: f64,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    /// Defaults with every path under `root`.
    pub fn with_workspace_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            data_dir: root.join("public").join("data"),
            cache_dir: root.join(".cache").join("raw"),
            workspace_root: root,
            user_agent: format!("pricewatch/{}", env!("CARGO_PKG_VERSION")),
            http_timeout_secs: 30,
            max_pages: 40,
            request_delay_ms: 1000,
            concurrency: 5,
            retention_days: 365,
            fuzzy_threshold: 0.90,
            scheduler_enabled: false,
            sync_cron: "0 * * * *".to_string(),
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::with_workspace_root(
            std::env::var("PRICEWATCH_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
        );
        Self {
            data_dir: std::env::var("PRICEWATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            cache_dir: std::env::var("PRICEWATCH_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.cache_dir),
            user_agent: std::env::var("PRICEWATCH_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("PRICEWATCH_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            max_pages: env_parse("PRICEWATCH_MAX_PAGES", defaults.max_pages),
            request_delay_ms: env_parse("PRICEWATCH_REQUEST_DELAY_MS", defaults.request_delay_ms),
            concurrency: env_parse("PRICEWATCH_CONCURRENCY", defaults.concurrency),
            retention_days: env_parse("PRICEWATCH_RETENTION_DAYS", defaults.retention_days),
            fuzzy_threshold: env_parse("PRICEWATCH_FUZZY_THRESHOLD", defaults.fuzzy_threshold),
            scheduler_enabled: std::env::var("PRICEWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            workspace_root: defaults.workspace_root,
        }
    }

    fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.concurrency,
            request_delay: Duration::from_millis(self.request_delay_ms),
            ..HttpClientConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Online,
    /// Reprocess cached raw catalogs without touching the network.
    Offline,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub stores: usize,
    pub stale_stores: Vec<String>,
    pub failed_stores: Vec<String>,
    pub listings: usize,
    pub products: usize,
    pub history: TrackStats,
    pub files_written: usize,
    pub data_dir: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    http: Arc<HttpFetcher>,
    cache: CatalogCache,
    snapshot: SnapshotDir,
    resolver: IdentityResolver,
    tracker: HistoryTracker,
    /// One cycle at a time writes the data directory.
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_config())?;
        Ok(Self {
            cache: CatalogCache::new(&config.cache_dir),
            snapshot: SnapshotDir::new(&config.data_dir),
            resolver: IdentityResolver::new(ResolverConfig {
                fuzzy_threshold: config.fuzzy_threshold,
                ..ResolverConfig::default()
            }),
            tracker: HistoryTracker::new(TrackerConfig {
                retention_days: config.retention_days,
            }),
            http: Arc::new(http),
            clock: Arc::new(SystemClock),
            run_lock: Mutex::new(()),
            config,
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self, mode: RunMode) -> Result<SyncRunSummary> {
        let _guard = self.run_lock.lock().await;
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        let now = self.clock.now();
        let span = info_span!("sync_cycle", %run_id, ?mode);
        self.run_cycle(run_id, now, mode, started).instrument(span).await
    }

    async fn run_cycle(
        &self,
        run_id: Uuid,
        now: DateTime<Utc>,
        mode: RunMode,
        started: Instant,
    ) -> Result<SyncRunSummary> {
        if self.snapshot.recover().await? {
            warn!(dir = %self.snapshot.root().display(), "restored data directory from interrupted commit");
        }
        let prior = PriorState::load(&self.snapshot).await?;
        let mut ctx = PipelineContext::new(run_id, now, prior);

        let registry = StoreRegistry::load(&self.config.workspace_root.join("stores.yaml")).await?;
        let (active, rejected) = registry.active();
        for store in &rejected {
            warn!(store = %store.name, reason = %store.reason, "store rejected");
        }
        let rules = Arc::new(CatalogRules::from_workspace_root(&self.config.workspace_root)?);

        ctx.harvests = self.harvest_all(active, rules, &ctx, mode).await?;

        let listings = ctx.listings();
        let prior_assignments = ctx.prior.assignments();
        let resolution = info_span!("resolve", listings = listings.len())
            .in_scope(|| self.resolver.resolve(&listings, &prior_assignments));
        for diagnostic in &resolution.diagnostics {
            warn!(
                product = %diagnostic.product_id,
                kind = ?diagnostic.kind,
                detail = %diagnostic.detail,
                "identity group needs review"
            );
        }
        info!(
            products = resolution.stats.products,
            fuzzy_merges = resolution.stats.fuzzy_merges,
            multi_vendor = resolution.stats.multi_vendor,
            "resolved identities"
        );

        let stale = ctx.stale_vendors();
        let mut history = std::mem::take(&mut ctx.prior.history);
        let tracked = info_span!("track").in_scope(|| {
            self.tracker.track(
                &mut history,
                CycleObservation {
                    products: &resolution.products,
                    stale_vendors: &stale,
                    now: ctx.now_unix(),
                },
            )
        });

        let (price_history, item_history) = writer::history_docs(&ctx, history);
        let stats = RunStatsDoc {
            last_updated: now,
            duration: round_secs(started.elapsed()),
            stores: ctx.harvests.iter().map(|h| h.stats.clone()).collect(),
            totals: run_totals(&ctx, &resolution.products),
            price_history: tracked.stats,
            resolution: resolution.stats,
            stock_events: tracked.stock_events,
            diagnostics: resolution.diagnostics.clone(),
        };
        let documents = CycleDocuments {
            products: writer::products_snapshot(&ctx, &resolution.products),
            items: writer::items_snapshot(&ctx, &resolution.products),
            price_history,
            item_history,
            matches: writer::matches_doc(&ctx, &resolution, self.tracker.cutoff(ctx.now_unix())),
            stats,
        };
        let commit = documents.commit(&self.snapshot).await?;

        Ok(SyncRunSummary {
            run_id,
            mode,
            started_at: now,
            duration_secs: round_secs(started.elapsed()),
            stores: ctx.harvests.len(),
            stale_stores: stale.into_iter().collect(),
            failed_stores: ctx
                .harvests
                .iter()
                .filter(|h| h.stats.error.is_some())
                .map(|h| h.stats.name.clone())
                .collect(),
            listings: listings.len(),
            products: resolution.products.len(),
            history: tracked.stats,
            files_written: commit.files_written,
            data_dir: self.snapshot.root().display().to_string(),
        })
    }

    /// Fetches all stores concurrently; results keep registry order.
    async fn harvest_all(
        &self,
        active: Vec<ActiveStore>,
        rules: Arc<CatalogRules>,
        ctx: &PipelineContext,
        mode: RunMode,
    ) -> Result<Vec<VendorHarvest>> {
        for store in &active {
            if let Some(delay) = store.request_delay {
                self.http.pacer().set_interval(&store.target.name, delay).await;
            }
        }

        let mut tasks = JoinSet::new();
        for (index, store) in active.into_iter().enumerate() {
            let http = Arc::clone(&self.http);
            let cache = self.cache.clone();
            let rules = Arc::clone(&rules);
            let fetch_ctx = FetchContext {
                run_id: ctx.run_id,
                max_pages: self.config.max_pages,
            };
            let now = ctx.now;
            let span = info_span!("vendor_fetch", vendor = %store.target.name, platform = %store.target.platform);
            tasks.spawn(
                async move {
                    let harvest = harvest_store(&http, &cache, &rules, &store, &fetch_ctx, mode, now).await;
                    (index, harvest)
                }
                .instrument(span),
            );
        }

        let mut harvests = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            harvests.push(joined.context("vendor fetch task failed")?);
        }
        harvests.sort_by_key(|(index, _)| *index);
        Ok(harvests.into_iter().map(|(_, harvest)| harvest).collect())
    }

    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let pipeline = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = Arc::clone(&pipeline);
            Box::pin(async move {
                match pipeline.run_once(RunMode::Online).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        products = summary.products,
                        "scheduled sync finished"
                    ),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

fn round_secs(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 100.0).round() / 100.0
}

fn run_totals(ctx: &PipelineContext, products: &[pricewatch_core::Product]) -> RunTotals {
    let in_stock = products.iter().filter(|p| p.in_stock).count();
    RunTotals {
        raw_products: ctx.harvests.iter().map(|h| h.stats.fetched).sum(),
        after_filter: ctx.harvests.iter().map(|h| h.listings.len()).sum(),
        unique_products: products.len(),
        stale_products: ctx
            .harvests
            .iter()
            .filter(|h| h.stale)
            .map(|h| h.listings.len())
            .sum(),
        in_stock,
        out_of_stock: products.len() - in_stock,
    }
}

async fn harvest_store(
    http: &HttpFetcher,
    cache: &CatalogCache,
    rules: &CatalogRules,
    store: &ActiveStore,
    fetch_ctx: &FetchContext,
    mode: RunMode,
    now: DateTime<Utc>,
) -> VendorHarvest {
    let started = Instant::now();
    let source = source_for_platform(store.target.platform);
    let mut log = VendorLog::new(store.target.name.clone());
    let fetched = match mode {
        RunMode::Online => {
            log.info(format!("Fetching {} catalog from {}", store.target.platform, store.target.base_url));
            Some(source.fetch_catalog(http, fetch_ctx, &store.target, &mut log).await)
        }
        RunMode::Offline => None,
    };
    settle_harvest(source.as_ref(), store, fetched, cache, rules, log, now, started).await
}

async fn load_cached(cache: &CatalogCache, store: &ActiveStore, log: &mut VendorLog) -> Option<RawCatalog> {
    match cache.load(&store.target.name).await {
        Ok(Some(catalog)) => {
            log.info(format!(
                "Using cached catalog from {} ({} products)",
                catalog.fetched_at.to_rfc3339(),
                catalog.products.len()
            ));
            Some(catalog)
        }
        Ok(None) => {
            log.warn("No cached catalog available");
            None
        }
        Err(err) => {
            log.error(format!("Cached catalog unreadable: {err:#}"));
            None
        }
    }
}

/// Turns a fetch result (or its absence in offline mode) into the vendor's contribution.
///
/// A failed fetch falls back to the cached raw catalog and marks the vendor
/// stale; without a cache the vendor contributes nothing this cycle.
#[allow(clippy::too_many_arguments)]
async fn settle_harvest(
    source: &dyn CatalogSource,
    store: &ActiveStore,
    fetched: Option<Result<Vec<JsonValue>, AdapterError>>,
    cache: &CatalogCache,
    rules: &CatalogRules,
    mut log: VendorLog,
    now: DateTime<Utc>,
    started: Instant,
) -> VendorHarvest {
    let mut error = None;
    let mut cached_at = None;
    let mut stale = false;

    let products = match fetched {
        Some(Ok(products)) => {
            let catalog = RawCatalog {
                store_name: store.target.name.clone(),
                platform: store.target.platform,
                fetched_at: now,
                products,
            };
            match cache.store(&catalog).await {
                Ok(stored) if stored.unchanged => log.info("Raw catalog unchanged since last fetch"),
                Ok(stored) => log.info(format!("Cached raw catalog ({} bytes)", stored.byte_size)),
                Err(err) => log.warn(format!("Could not cache raw catalog: {err:#}")),
            }
            Some(catalog.products)
        }
        Some(Err(err)) => {
            log.error(format!("Fetch failed: {err}"));
            error = Some(err.to_string());
            let cached = load_cached(cache, store, &mut log).await;
            stale = cached.is_some();
            cached.map(|catalog| {
                cached_at = Some(catalog.fetched_at);
                catalog.products
            })
        }
        None => {
            let cached = load_cached(cache, store, &mut log).await;
            if cached.is_none() {
                error = Some("offline run without a cached catalog".to_string());
            }
            cached.map(|catalog| {
                cached_at = Some(catalog.fetched_at);
                catalog.products
            })
        }
    };

    let outcome = products
        .map(|products| process_catalog(source, &store.target, &products, rules, &mut log))
        .unwrap_or_default();
    let in_stock = outcome.in_stock();
    let stats = StoreStats {
        name: store.target.name.clone(),
        url: store.url.clone(),
        platform: store.target.platform.as_str().to_string(),
        fetched: outcome.fetched,
        filtered: outcome.filtered,
        malformed: outcome.malformed,
        final_count: outcome.listings.len(),
        in_stock,
        out_of_stock: outcome.listings.len() - in_stock,
        error,
        duration: round_secs(started.elapsed()),
        cached_at,
        logs: log.into_entries(),
        filtered_products: outcome.filtered_products,
    };
    VendorHarvest {
        stats,
        listings: outcome.listings,
        stale,
    }
}

pub async fn run_sync_once_from_env(mode: RunMode) -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::new(config)?;
    pipeline.run_once(mode).await
}

/// Markdown summary of the last committed cycle.
pub fn render_daily_markdown(stats: &RunStatsDoc) -> String {
    let mut lines = vec!["# Pricewatch Report Daily".to_string(), String::new()];
    lines.push(format!("- updated: {}", stats.last_updated.to_rfc3339()));
    lines.push(format!("- duration: {:.2}s", stats.duration));
    lines.push(format!(
        "- products: {} ({} in stock, {} out of stock)",
        stats.totals.unique_products, stats.totals.in_stock, stats.totals.out_of_stock
    ));
    lines.push(format!(
        "- listings: {} of {} raw products kept",
        stats.totals.after_filter, stats.totals.raw_products
    ));
    if stats.totals.stale_products > 0 {
        lines.push(format!("- stale listings served from cache: {}", stats.totals.stale_products));
    }
    lines.push(String::new());

    lines.push("## Stores".to_string());
    lines.push("| store | platform | fetched | filtered | final | in stock | status |".to_string());
    lines.push("|---|---|---|---|---|---|---|".to_string());
    for store in &stats.stores {
        let status = match (&store.error, store.cached_at) {
            (Some(err), Some(cached)) => format!("stale since {} ({err})", cached.format("%Y-%m-%d %H:%M")),
            (Some(err), None) => format!("failed ({err})"),
            (None, _) => "ok".to_string(),
        };
        lines.push(format!(
            "| {} | {} | {} | {} | {} | {} | {} |",
            store.name, store.platform, store.fetched, store.filtered, store.final_count, store.in_stock, status
        ));
    }
    lines.push(String::new());

    let history = &stats.price_history;
    lines.push("## Price History".to_string());
    lines.push(format!(
        "- items: {} new, {} changed, {} unchanged",
        history.items.new, history.items.changed, history.items.unchanged
    ));
    lines.push(format!(
        "- lowest prices: {} new, {} changed",
        history.lowest.new, history.lowest.changed
    ));
    lines.push(format!("- pruned points: {}", history.pruned));
    lines.push(String::new());

    let resolution = &stats.resolution;
    lines.push("## Identity".to_string());
    lines.push(format!(
        "- {} listings -> {} products ({} multi-vendor)",
        resolution.listings, resolution.products, resolution.multi_vendor
    ));
    lines.push(format!(
        "- {} SKU groups, {} fuzzy merges, {} refused, {} singletons",
        resolution.sku_groups, resolution.fuzzy_merges, resolution.refused_merges, resolution.singletons
    ));
    lines.push(format!("- ids: {} reused, {} new", resolution.reused_ids, resolution.new_ids));
    if resolution.duplicate_items > 0 {
        lines.push(format!("- {} listings dropped for reusing another vendor's item id", resolution.duplicate_items));
    }
    for diagnostic in &stats.diagnostics {
        lines.push(format!("- review `{}`: {}", diagnostic.product_id, diagnostic.detail));
    }
    lines.push(String::new());

    for (heading, change) in [
        ("## Back In Stock", StockChange::BackInStock),
        ("## Out Of Stock", StockChange::OutOfStock),
    ] {
        let events: Vec<_> = stats.stock_events.iter().filter(|e| e.change == change).collect();
        if events.is_empty() {
            continue;
        }
        lines.push(heading.to_string());
        for event in events {
            lines.push(format!("- {} at {} (${:.2})", event.title, event.vendor, event.price));
        }
        lines.push(String::new());
    }

    lines.join("\n")
}

pub fn report_daily_markdown(data_dir: &Path) -> Result<String> {
    let path = data_dir.join(STATS_FILE);
    let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let stats: RunStatsDoc = serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(render_daily_markdown(&stats))
}
