//! Entity catalog: two independently loaded stores, the filter/pagination
//! engine, the derived search index and periodic refresh.

pub mod config;
pub mod filter;
pub mod index;
pub mod loaders;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vcat_adapters::dataset_source_for;
use vcat_core::{contains_ignore_case, CatalogEntity, Page, PortfolioCompany, VentureFirm};
use vcat_storage::{HttpFetcher, TtlCache};

pub use config::{CatalogConfig, DatasetConfig, DatasetRegistry};
pub use filter::{CatalogQuery, FilterSet, FilterWarning, PageRequest};
pub use index::{IndexSnapshot, IndexStats, SearchIndex};
pub use loaders::{FeedCatalog, FeedCompanyLoader, FeedFirmLoader, PgFirmLoader};
pub use store::{EntityLoader, EntityStore, LoadError, MemoryLoader, StoreError, StoreSnapshot};

use filter::{assemble_page, UpstreamCounts};

pub const CRATE_NAME: &str = "vcat-catalog";

/// A query answer. `error` carries the store's last load failure; the page is
/// still computed from whatever data the store holds.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult<T> {
    #[serde(flatten)]
    pub page: Page<T>,
    pub warnings: Vec<FilterWarning>,
    pub error: Option<StoreError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadOutcome {
    pub loaded: Option<usize>,
    pub error: Option<String>,
}

impl From<Result<usize, StoreError>> for LoadOutcome {
    fn from(result: Result<usize, StoreError>) -> Self {
        match result {
            Ok(count) => Self {
                loaded: Some(count),
                error: None,
            },
            Err(err) => Self {
                loaded: None,
                error: Some(err.message),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub firms: LoadOutcome,
    pub companies: LoadOutcome,
    pub index: IndexStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub items: usize,
    pub is_loading: bool,
    pub version: u64,
    pub last_loaded_at: Option<DateTime<Utc>>,
    pub error: Option<StoreError>,
    pub paginates_upstream: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedStatus {
    pub key: String,
    pub origin: String,
    pub fetched_at: Option<DateTime<Utc>>,
    pub age_secs: Option<u64>,
    pub fresh: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogStatus {
    pub firms: StoreStatus,
    pub companies: StoreStatus,
    pub index_initialized: bool,
    pub index: Option<IndexStats>,
    pub index_built_at: Option<DateTime<Utc>>,
    pub feed: Option<FeedStatus>,
}

pub struct Catalog {
    firms: Arc<EntityStore<VentureFirm>>,
    companies: Arc<EntityStore<PortfolioCompany>>,
    index: SearchIndex,
    feed: Option<Arc<FeedCatalog>>,
    max_age: Duration,
}

impl Catalog {
    pub fn new(
        firm_loader: Arc<dyn EntityLoader<VentureFirm>>,
        company_loader: Arc<dyn EntityLoader<PortfolioCompany>>,
    ) -> Self {
        Self {
            firms: Arc::new(EntityStore::new(firm_loader)),
            companies: Arc::new(EntityStore::new(company_loader)),
            index: SearchIndex::new(),
            feed: None,
            max_age: vcat_storage::DEFAULT_CACHE_TTL,
        }
    }

    /// Wire the feed (and Postgres for firms when `DATABASE_URL` is set) from
    /// configuration. A database that cannot be reached falls back to the feed.
    pub async fn from_config(config: &CatalogConfig) -> Result<Self> {
        let registry = config.load_registry().await.context("loading dataset registry")?;
        let dataset = registry
            .portfolio()
            .context("dataset registry has no enabled `portfolio` entry")?;
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let source = dataset_source_for(&dataset.key, &dataset.url, http);
        let cache = TtlCache::new(config.cache_ttl).with_single_flight(config.cache_single_flight);
        let feed = Arc::new(FeedCatalog::new(source, dataset.columns.clone(), cache));

        let firm_loader: Arc<dyn EntityLoader<VentureFirm>> = match connect_db(config).await {
            Some(pool) => Arc::new(PgFirmLoader::new(pool)),
            None => Arc::new(FeedFirmLoader::new(Arc::clone(&feed))),
        };
        let company_loader = Arc::new(FeedCompanyLoader::new(Arc::clone(&feed)));

        let mut catalog = Self::new(firm_loader, company_loader);
        catalog.feed = Some(feed);
        catalog.max_age = config.cache_ttl;
        Ok(catalog)
    }

    pub fn firms(&self) -> &Arc<EntityStore<VentureFirm>> {
        &self.firms
    }

    pub fn companies(&self) -> &Arc<EntityStore<PortfolioCompany>> {
        &self.companies
    }

    /// Load both stores concurrently, then rebuild the index.
    pub async fn refresh_all(&self) -> RefreshSummary {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("catalog_refresh", %run_id);
        async {
            let (firms, companies) = tokio::join!(self.firms.fetch_all(), self.companies.fetch_all());
            let index = self.search_index().await.stats();
            let summary = RefreshSummary {
                run_id,
                started_at,
                finished_at: Utc::now(),
                firms: firms.into(),
                companies: companies.into(),
                index,
            };
            info!(
                firms = ?summary.firms.loaded,
                companies = ?summary.companies.loaded,
                index_total = summary.index.total,
                "catalog refreshed"
            );
            summary
        }
        .instrument(span)
        .await
    }

    /// Refresh when either store is older than the cache TTL or never loaded.
    pub async fn ensure_fresh(&self) -> Option<RefreshSummary> {
        let stale = self.firms.is_stale(self.max_age).await || self.companies.is_stale(self.max_age).await;
        if stale {
            Some(self.refresh_all().await)
        } else {
            None
        }
    }

    /// Current index, rebuilt first if either store moved on.
    pub async fn search_index(&self) -> Arc<IndexSnapshot> {
        let firms = self.firms.snapshot().await;
        let companies = self.companies.snapshot().await;
        self.index.refresh(&firms, &companies).await
    }

    pub async fn query_companies(&self, query: &CatalogQuery) -> QueryResult<PortfolioCompany> {
        local_query(&self.companies.snapshot().await, query)
    }

    /// Firms come from upstream pages when the loader supports it and no free
    /// text is given; a failed upstream page falls back to local filtering
    /// with the error attached.
    pub async fn query_firms(&self, query: &CatalogQuery) -> QueryResult<VentureFirm> {
        if !self.firms.paginates_upstream() || query.text().is_some() {
            return local_query(&self.firms.snapshot().await, query);
        }

        let filter = query.filter_set();
        let (_, warnings) = filter.compile();
        match self.firms.fetch_page(query.page_request(), &filter).await {
            Ok(page) => {
                let counts = UpstreamCounts {
                    total_items: page.total_items,
                    total_pages: page.total_pages,
                    current_page: page.current_page,
                };
                QueryResult {
                    page: assemble_page(page.items, query.page_request(), Some(counts)),
                    warnings,
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %err.message, "upstream firm page failed; filtering locally");
                let mut result = local_query(&self.firms.snapshot().await, query);
                result.error = Some(err);
                result
            }
        }
    }

    pub async fn firm(&self, id: &str) -> Option<VentureFirm> {
        self.firms.snapshot().await.by_id(id).cloned()
    }

    pub async fn company(&self, id: &str) -> Option<PortfolioCompany> {
        self.companies.snapshot().await.by_id(id).cloned()
    }

    pub async fn companies_for_firm(&self, firm_id: &str) -> Vec<PortfolioCompany> {
        self.companies.snapshot().await.companies_for_firm(firm_id)
    }

    pub async fn status(&self) -> CatalogStatus {
        let index = self.index.snapshot().await;
        let feed = match &self.feed {
            Some(feed) => {
                let info = feed.cache_info().await;
                Some(FeedStatus {
                    key: feed.key().to_string(),
                    origin: feed.origin().to_string(),
                    fetched_at: info.as_ref().map(|i| i.fetched_at),
                    age_secs: info.as_ref().map(|i| i.age.as_secs()),
                    fresh: info.map(|i| i.fresh).unwrap_or(false),
                })
            }
            None => None,
        };
        CatalogStatus {
            firms: store_status(&self.firms).await,
            companies: store_status(&self.companies).await,
            index_initialized: index.is_some(),
            index: index.as_ref().map(|i| i.stats()),
            index_built_at: index.as_ref().map(|i| i.built_at),
            feed,
        }
    }
}

/// Cron-driven `refresh_all`, when enabled in configuration.
pub async fn maybe_build_scheduler(catalog: Arc<Catalog>, config: &CatalogConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let cron = config.refresh_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let catalog = Arc::clone(&catalog);
        Box::pin(async move {
            let summary = catalog.refresh_all().await;
            if summary.firms.error.is_some() || summary.companies.error.is_some() {
                warn!(run_id = %summary.run_id, "scheduled refresh finished with errors");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}

async fn connect_db(config: &CatalogConfig) -> Option<PgPool> {
    let url = config.database_url.as_deref()?;
    match PgPool::connect(url).await {
        Ok(pool) => Some(pool),
        Err(err) => {
            warn!(error = %err, "database unreachable; firms will come from the feed");
            None
        }
    }
}

async fn store_status<T: CatalogEntity>(store: &EntityStore<T>) -> StoreStatus {
    let snap = store.snapshot().await;
    StoreStatus {
        items: snap.len(),
        is_loading: snap.is_loading,
        version: snap.version,
        last_loaded_at: snap.last_loaded_at,
        error: snap.error,
        paginates_upstream: store.paginates_upstream(),
    }
}

/// Filter, optionally text-match, then paginate a full in-memory collection.
fn local_query<T: CatalogEntity>(snapshot: &StoreSnapshot<T>, query: &CatalogQuery) -> QueryResult<T> {
    let (compiled, warnings) = query.filter_set().compile();
    let mut items = compiled.apply(&snapshot.items);
    if let Some(text) = query.text() {
        items.retain(|item| {
            item.search_fields()
                .into_iter()
                .any(|field| contains_ignore_case(field, text))
        });
    }
    QueryResult {
        page: assemble_page(items, query.page_request(), None),
        warnings,
        error: snapshot.error.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use vcat_adapters::{ColumnMap, DatasetSource, IngestError, RawDataset, StaticDatasetSource};
    use vcat_core::slugify;

    const FEED: &str = "\
Investor Name,Investor City,Investor State,Company Name,City,State,Score,Round,Status,Company Status,End Market,Vertical
Acme Ventures,Austin,TX,Foo,Austin,TX,80,SERIES_A,Active,,Fintech,Payments
Acme Ventures,Austin,TX,Bar,Dallas,TX,40,SEED,,Active,\"Fintech, Health\",Insurance
Blue Harbor,Boston,MA,Baz,Boston,MA,55,SEED,Exited,,Climate,Energy
";

    fn feed_catalog() -> Catalog {
        catalog_over(Box::new(StaticDatasetSource::new("portfolio", FEED)))
    }

    fn catalog_over(source: Box<dyn DatasetSource>) -> Catalog {
        let feed = Arc::new(FeedCatalog::new(
            source,
            ColumnMap::default(),
            TtlCache::new(Duration::from_secs(300)),
        ));
        let mut catalog = Catalog::new(
            Arc::new(FeedFirmLoader::new(Arc::clone(&feed))),
            Arc::new(FeedCompanyLoader::new(Arc::clone(&feed))),
        );
        catalog.feed = Some(feed);
        catalog
    }

    fn query(pairs: &[(&str, &str)]) -> CatalogQuery {
        let mut q = CatalogQuery::default();
        for (key, value) in pairs {
            let value = Some(value.to_string());
            match *key {
                "page" => q.page = value.and_then(|v| v.parse().ok()),
                "limit" => q.limit = value.and_then(|v| v.parse().ok()),
                "location" => q.location = value,
                "round" => q.round = value,
                "status" => q.status = value,
                "end_market" => q.end_market = value,
                "q" => q.q = value,
                other => panic!("unknown key {other}"),
            }
        }
        q
    }

    #[tokio::test]
    async fn acme_scenario_groups_filters_and_pages() {
        let catalog = feed_catalog();
        let summary = catalog.refresh_all().await;
        assert_eq!(summary.firms.loaded, Some(2));
        assert_eq!(summary.companies.loaded, Some(3));
        assert_eq!(summary.index.total, 5);

        let firm = catalog.firm("acme-ventures").await.unwrap();
        assert_eq!(firm.portfolio_count, 2);
        let names: Vec<_> = catalog
            .companies_for_firm("acme-ventures")
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Foo", "Bar"]);

        let result = catalog
            .query_companies(&query(&[("location", "tx"), ("round", "Series A,Seed"), ("limit", "1"), ("page", "2")]))
            .await;
        assert_eq!(result.page.total_items, 2);
        assert_eq!(result.page.total_pages, 2);
        assert_eq!(result.page.current_page, 2);
        assert_eq!(result.page.items[0].name, "Bar");
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn seed_round_selects_foo_and_second_page_holds_bar() {
        let catalog = catalog_over(Box::new(StaticDatasetSource::new(
            "portfolio",
            "\
Investor Name,Investor City,Investor State,Company Name,Score,Round
Acme Ventures,Austin,TX,Foo,80,SEED
Acme Ventures,Austin,TX,Bar,40,SERIES_A
",
        )));
        catalog.refresh_all().await;

        let firm = catalog.firm("acme-ventures").await.unwrap();
        assert_eq!(firm.name, "Acme Ventures");
        let names: Vec<_> = catalog
            .companies_for_firm("acme-ventures")
            .await
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["Foo", "Bar"]);

        let seed = catalog.query_companies(&query(&[("round", "Seed")])).await;
        let names: Vec<_> = seed.page.items.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Foo"]);

        let second = catalog
            .query_companies(&query(&[("limit", "1"), ("page", "2")]))
            .await;
        let names: Vec<_> = second.page.items.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Bar"]);
        assert_eq!(second.page.total_items, 2);
        assert_eq!(second.page.total_pages, 2);
    }

    struct SlowSource {
        inner: StaticDatasetSource,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatasetSource for SlowSource {
        fn key(&self) -> &str {
            self.inner.key()
        }

        fn origin(&self) -> &str {
            self.inner.origin()
        }

        async fn fetch(&self, run_id: Uuid) -> Result<RawDataset, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.inner.fetch(run_id).await
        }
    }

    #[tokio::test]
    async fn refresh_all_downloads_the_feed_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let catalog = catalog_over(Box::new(SlowSource {
            inner: StaticDatasetSource::new("portfolio", FEED),
            calls: Arc::clone(&calls),
        }));
        let summary = catalog.refresh_all().await;
        assert_eq!(summary.firms.loaded, Some(2));
        assert_eq!(summary.companies.loaded, Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        catalog.feed.as_ref().unwrap().invalidate().await;
        catalog.refresh_all().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn legacy_status_and_unmapped_round_warning() {
        let catalog = feed_catalog();
        catalog.refresh_all().await;

        let active = catalog.query_companies(&query(&[("status", "active")])).await;
        let names: Vec<_> = active.page.items.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Foo", "Bar"]);

        let result = catalog
            .query_companies(&query(&[("round", "Series Z, Seed")]))
            .await;
        assert_eq!(result.page.total_items, 2);
        assert_eq!(
            result.warnings,
            vec![FilterWarning::UnmappedRound {
                label: "Series Z".into()
            }]
        );
    }

    #[tokio::test]
    async fn free_text_combines_with_filters() {
        let catalog = feed_catalog();
        catalog.refresh_all().await;
        let result = catalog
            .query_companies(&query(&[("q", "insur"), ("end_market", "fintech")]))
            .await;
        assert_eq!(result.page.items.len(), 1);
        assert_eq!(result.page.items[0].id, slugify("Bar"));
    }

    #[tokio::test]
    async fn ensure_fresh_only_loads_when_stale() {
        let catalog = feed_catalog();
        assert!(catalog.ensure_fresh().await.is_some());
        assert!(catalog.ensure_fresh().await.is_none());
        let status = catalog.status().await;
        assert!(status.index_initialized);
        assert_eq!(status.firms.version, 1);
        assert!(status.feed.unwrap().fresh);
    }

    #[tokio::test]
    async fn scheduler_is_opt_in() {
        let catalog = Arc::new(feed_catalog());
        let sched = maybe_build_scheduler(catalog, &CatalogConfig::default()).await.unwrap();
        assert!(sched.is_none());
    }

    struct FlakyUpstream {
        local: MemoryLoader<VentureFirm>,
    }

    #[async_trait]
    impl EntityLoader<VentureFirm> for FlakyUpstream {
        fn describe(&self) -> String {
            "flaky".into()
        }

        fn paginates_upstream(&self) -> bool {
            true
        }

        async fn load_all(&self, run_id: Uuid) -> Result<Vec<VentureFirm>, LoadError> {
            self.local.load_all(run_id).await
        }

        async fn load_page(
            &self,
            _run_id: Uuid,
            _request: PageRequest,
            _filter: &FilterSet,
        ) -> Result<store::Loaded<VentureFirm>, LoadError> {
            Err(LoadError::Unavailable("upstream timed out".into()))
        }
    }

    #[tokio::test]
    async fn failed_upstream_page_falls_back_to_local_rows() {
        let firms = vec![
            VentureFirm {
                id: "acme-ventures".into(),
                name: "Acme Ventures".into(),
                state: "TX".into(),
                ..Default::default()
            },
            VentureFirm {
                id: "blue-harbor".into(),
                name: "Blue Harbor".into(),
                state: "MA".into(),
                ..Default::default()
            },
        ];
        let catalog = Catalog::new(
            Arc::new(FlakyUpstream {
                local: MemoryLoader::new(firms),
            }),
            Arc::new(MemoryLoader::<PortfolioCompany>::new(Vec::new())),
        );
        catalog.refresh_all().await;

        let result = catalog.query_firms(&query(&[("location", "ma")])).await;
        assert_eq!(result.page.total_items, 1);
        assert_eq!(result.page.items[0].name, "Blue Harbor");
        assert!(result.error.unwrap().message.contains("upstream timed out"));
    }

    #[tokio::test]
    async fn upstream_counts_are_passed_through() {
        let firms: Vec<_> = (0..7)
            .map(|i| VentureFirm {
                id: format!("firm-{i}"),
                name: format!("Firm {i}"),
                state: "CA".into(),
                ..Default::default()
            })
            .collect();

        struct Upstream(MemoryLoader<VentureFirm>);

        #[async_trait]
        impl EntityLoader<VentureFirm> for Upstream {
            fn describe(&self) -> String {
                "upstream".into()
            }
            fn paginates_upstream(&self) -> bool {
                true
            }
            async fn load_all(&self, run_id: Uuid) -> Result<Vec<VentureFirm>, LoadError> {
                self.0.load_all(run_id).await
            }
        }

        let catalog = Catalog::new(
            Arc::new(Upstream(MemoryLoader::new(firms))),
            Arc::new(MemoryLoader::<PortfolioCompany>::new(Vec::new())),
        );
        let result = catalog
            .query_firms(&query(&[("location", "ca"), ("limit", "3"), ("page", "9")]))
            .await;
        assert_eq!(result.page.total_items, 7);
        assert_eq!(result.page.total_pages, 3);
        assert_eq!(result.page.current_page, 3);
        assert_eq!(result.page.items.len(), 1);
        assert!(catalog.firms().snapshot().await.is_empty());
    }
}
