//! Loaders that back the entity stores: the CSV feed and the Postgres firm table.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;
use vcat_adapters::{load_dataset, ColumnMap, DatasetSource, GroupedDataset, IngestError};
use vcat_core::{slugify, PortfolioCompany, VentureFirm};
use vcat_storage::{CacheEntryInfo, TtlCache};

use crate::filter::{FilterSet, PageRequest, UpstreamCounts};
use crate::store::{EntityLoader, LoadError, Loaded};

/// One grouped feed behind a TTL cache. Firm and company loaders share it, and
/// refreshes of the feed are serialized, so loading both stores at once costs a
/// single download.
pub struct FeedCatalog {
    source: Box<dyn DatasetSource>,
    columns: ColumnMap,
    cache: TtlCache<GroupedDataset>,
    refreshing: Mutex<()>,
    last_hash: Mutex<Option<String>>,
}

impl FeedCatalog {
    pub fn new(source: Box<dyn DatasetSource>, columns: ColumnMap, cache: TtlCache<GroupedDataset>) -> Self {
        Self {
            source,
            columns,
            cache,
            refreshing: Mutex::new(()),
            last_hash: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &str {
        self.source.key()
    }

    pub fn origin(&self) -> &str {
        self.source.origin()
    }

    pub async fn dataset(&self, run_id: Uuid) -> Result<Arc<GroupedDataset>, IngestError> {
        if let Some(dataset) = self.cache.get_fresh(self.source.key()).await {
            return Ok(dataset);
        }
        // Callers queued here find the entry fresh once the first one is done.
        let _refreshing = self.refreshing.lock().await;
        let source = self.source.as_ref();
        let columns = &self.columns;
        let last_hash = &self.last_hash;
        self.cache
            .get_or_refresh(source.key(), move || async move {
                let dataset = load_dataset(source, columns, run_id).await?;
                let mut last = last_hash.lock().await;
                let changed = last.as_deref() != Some(dataset.content_hash.as_str());
                info!(
                    %run_id,
                    dataset = source.key(),
                    changed,
                    content_hash = %dataset.content_hash,
                    "feed refreshed"
                );
                *last = Some(dataset.content_hash.clone());
                Ok::<_, IngestError>(dataset)
            })
            .await
    }

    pub async fn cache_info(&self) -> Option<CacheEntryInfo> {
        self.cache.info(self.source.key()).await
    }

    /// Force the next access to download again.
    pub async fn invalidate(&self) -> bool {
        self.cache.invalidate(self.source.key()).await
    }
}

pub struct FeedFirmLoader {
    feed: Arc<FeedCatalog>,
}

impl FeedFirmLoader {
    pub fn new(feed: Arc<FeedCatalog>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl EntityLoader<VentureFirm> for FeedFirmLoader {
    fn describe(&self) -> String {
        format!("feed:{}", self.feed.key())
    }

    async fn load_all(&self, run_id: Uuid) -> Result<Vec<VentureFirm>, LoadError> {
        Ok(self.feed.dataset(run_id).await?.firms())
    }
}

pub struct FeedCompanyLoader {
    feed: Arc<FeedCatalog>,
}

impl FeedCompanyLoader {
    pub fn new(feed: Arc<FeedCatalog>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl EntityLoader<PortfolioCompany> for FeedCompanyLoader {
    fn describe(&self) -> String {
        format!("feed:{}", self.feed.key())
    }

    async fn load_all(&self, run_id: Uuid) -> Result<Vec<PortfolioCompany>, LoadError> {
        Ok(self.feed.dataset(run_id).await?.companies())
    }
}

const FIRM_COLUMNS: &str = r#"
    COALESCE(id, '') AS id,
    name,
    COALESCE(city, '') AS city,
    COALESCE(state, '') AS state,
    COALESCE(website, '') AS website,
    COALESCE(score, 0)::float8 AS score,
    COALESCE(assets_under_management, '') AS assets_under_management,
    COALESCE(stage_distribution, '') AS stage_distribution,
    COALESCE(portfolio_count, 0)::int8 AS portfolio_count
"#;

const LOCATION_CLAUSE: &str = r#"
    (cardinality($1::text[]) = 0
     OR lower(trim(COALESCE(city, ''))) = ANY($1)
     OR lower(trim(COALESCE(state, ''))) = ANY($1))
"#;

/// Firms read from the `venture_firms` table. Location filtering and paging
/// run in the database; firms carry no round, status or end market, so any
/// such constraint yields an empty page.
pub struct PgFirmLoader {
    pool: PgPool,
}

impl PgFirmLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn firm_from_row(row: &sqlx::postgres::PgRow) -> Result<VentureFirm, sqlx::Error> {
        let name: String = row.try_get("name")?;
        let id: String = row.try_get("id")?;
        let portfolio_count: i64 = row.try_get("portfolio_count")?;
        Ok(VentureFirm {
            id: if id.is_empty() { slugify(&name) } else { id },
            name,
            city: row.try_get("city")?,
            state: row.try_get("state")?,
            website: row.try_get("website")?,
            score: row.try_get("score")?,
            assets_under_management: row.try_get("assets_under_management")?,
            stage_distribution: row.try_get("stage_distribution")?,
            portfolio_count: u32::try_from(portfolio_count).unwrap_or(0),
        })
    }
}

#[async_trait]
impl EntityLoader<VentureFirm> for PgFirmLoader {
    fn describe(&self) -> String {
        "postgres:venture_firms".to_string()
    }

    fn paginates_upstream(&self) -> bool {
        true
    }

    async fn load_all(&self, run_id: Uuid) -> Result<Vec<VentureFirm>, LoadError> {
        let span = info_span!("pg_load_firms", %run_id);
        let rows = sqlx::query(&format!(
            "SELECT {FIRM_COLUMNS} FROM venture_firms ORDER BY score DESC NULLS LAST, name"
        ))
        .fetch_all(&self.pool)
        .instrument(span)
        .await?;
        let firms = rows
            .iter()
            .map(Self::firm_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(firms)
    }

    async fn load_page(
        &self,
        run_id: Uuid,
        request: PageRequest,
        filter: &FilterSet,
    ) -> Result<Loaded<VentureFirm>, LoadError> {
        let (compiled, _) = filter.compile();
        if !compiled.location_only() {
            return Ok(Loaded {
                items: Vec::new(),
                upstream: Some(UpstreamCounts {
                    total_items: 0,
                    total_pages: 0,
                    current_page: 1,
                }),
            });
        }
        let span = info_span!("pg_load_firm_page", %run_id, page = request.page, limit = request.limit);
        self.location_page(compiled.locations().to_vec(), request)
            .instrument(span)
            .await
    }
}

impl PgFirmLoader {
    async fn location_page(
        &self,
        locations: Vec<String>,
        request: PageRequest,
    ) -> Result<Loaded<VentureFirm>, LoadError> {
        let total: i64 = sqlx::query(&format!(
            "SELECT COUNT(*) AS total FROM venture_firms WHERE {LOCATION_CLAUSE}"
        ))
        .bind(locations.clone())
        .fetch_one(&self.pool)
        .await?
        .try_get("total")?;

        let total_items = usize::try_from(total).unwrap_or(0);
        let limit = request.limit.max(1);
        let total_pages = total_items.div_ceil(limit);
        if total_pages == 0 {
            return Ok(Loaded {
                items: Vec::new(),
                upstream: Some(UpstreamCounts {
                    total_items: 0,
                    total_pages: 0,
                    current_page: 1,
                }),
            });
        }
        let current_page = request.page.clamp(1, total_pages);
        let offset = (current_page - 1) * limit;

        let rows = sqlx::query(&format!(
            "SELECT {FIRM_COLUMNS} FROM venture_firms WHERE {LOCATION_CLAUSE} \
             ORDER BY score DESC NULLS LAST, name LIMIT $2 OFFSET $3"
        ))
        .bind(locations)
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await?;
        let items = rows
            .iter()
            .map(Self::firm_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Loaded {
            items,
            upstream: Some(UpstreamCounts {
                total_items,
                total_pages,
                current_page,
            }),
        })
    }
}
