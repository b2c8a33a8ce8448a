//! Entity stores: one owned, in-memory collection per entity kind.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;
use vcat_adapters::IngestError;
use vcat_core::{contains_ignore_case, CatalogEntity, EntityKind, Page, PortfolioCompany};

use crate::filter::{paginate, FilterSet, PageRequest, UpstreamCounts};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("backend query failed: {0}")]
    Backend(#[from] sqlx::Error),
    #[error("loader unavailable: {0}")]
    Unavailable(String),
}

/// Last load failure as kept on the store. Data loaded before it stays visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreError {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// A page handed back by a loader; `upstream` is set when the loader
/// paginated server-side.
#[derive(Debug, Clone)]
pub struct Loaded<T> {
    pub items: Vec<T>,
    pub upstream: Option<UpstreamCounts>,
}

#[async_trait]
pub trait EntityLoader<T: CatalogEntity>: Send + Sync {
    fn describe(&self) -> String;

    async fn load_all(&self, run_id: Uuid) -> Result<Vec<T>, LoadError>;

    /// Whether [`EntityLoader::load_page`] is served by the backend rather
    /// than by slicing `load_all`.
    fn paginates_upstream(&self) -> bool {
        false
    }

    async fn load_page(
        &self,
        run_id: Uuid,
        request: PageRequest,
        filter: &FilterSet,
    ) -> Result<Loaded<T>, LoadError> {
        let (compiled, _) = filter.compile();
        let items = compiled.apply(&self.load_all(run_id).await?);
        let page = paginate(&items, request);
        Ok(Loaded {
            upstream: Some(UpstreamCounts {
                total_items: page.total_items,
                total_pages: page.total_pages,
                current_page: page.current_page,
            }),
            items: page.items,
        })
    }
}

#[derive(Debug)]
struct StoreState<T> {
    items: Arc<Vec<T>>,
    error: Option<StoreError>,
    upstream: Option<UpstreamCounts>,
    last_page: Option<Arc<Vec<T>>>,
    version: u64,
    last_loaded_at: Option<DateTime<Utc>>,
}

impl<T> Default for StoreState<T> {
    fn default() -> Self {
        Self {
            items: Arc::new(Vec::new()),
            error: None,
            upstream: None,
            last_page: None,
            version: 0,
            last_loaded_at: None,
        }
    }
}

/// Owns the full collection for one entity kind.
///
/// `fetch_all` swaps the collection wholesale on success. On failure only the
/// error is recorded, the previous collection is left in place. Concurrent
/// fetches are not coalesced; whichever finishes last wins.
pub struct EntityStore<T: CatalogEntity> {
    loader: Arc<dyn EntityLoader<T>>,
    state: RwLock<StoreState<T>>,
    in_flight: AtomicUsize,
}

/// Counts one running load; released on drop so a cancelled fetch does not
/// leave the store marked as loading.
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<T: CatalogEntity> EntityStore<T> {
    pub fn new(loader: Arc<dyn EntityLoader<T>>) -> Self {
        Self {
            loader,
            state: RwLock::new(StoreState::default()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    pub fn paginates_upstream(&self) -> bool {
        self.loader.paginates_upstream()
    }

    pub async fn fetch_all(&self) -> Result<usize, StoreError> {
        let run_id = Uuid::new_v4();
        let _loading = InFlight::enter(&self.in_flight);

        let result = self.loader.load_all(run_id).await;

        let mut state = self.state.write().await;
        match result {
            Ok(items) => {
                let count = items.len();
                state.items = Arc::new(items);
                state.error = None;
                state.version += 1;
                state.last_loaded_at = Some(Utc::now());
                info!(
                    %run_id,
                    kind = T::KIND.as_str(),
                    loader = %self.loader.describe(),
                    count,
                    version = state.version,
                    "store loaded"
                );
                Ok(count)
            }
            Err(err) => {
                let error = StoreError {
                    message: err.to_string(),
                    at: Utc::now(),
                };
                warn!(
                    %run_id,
                    kind = T::KIND.as_str(),
                    error = %error.message,
                    kept = state.items.len(),
                    "store load failed; keeping previous collection"
                );
                state.error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Load one upstream-paginated page. The full collection is untouched;
    /// the page and its counts are kept alongside it.
    pub async fn fetch_page(
        &self,
        request: PageRequest,
        filter: &FilterSet,
    ) -> Result<Page<T>, StoreError> {
        let run_id = Uuid::new_v4();
        let _loading = InFlight::enter(&self.in_flight);

        let result = self.loader.load_page(run_id, request, filter).await;

        let mut state = self.state.write().await;
        match result {
            Ok(loaded) => {
                let counts = loaded.upstream.unwrap_or(UpstreamCounts {
                    total_items: loaded.items.len(),
                    total_pages: usize::from(!loaded.items.is_empty()),
                    current_page: 1,
                });
                state.error = None;
                state.upstream = Some(counts);
                state.last_page = Some(Arc::new(loaded.items.clone()));
                Ok(Page {
                    items: loaded.items,
                    total_items: counts.total_items,
                    total_pages: counts.total_pages,
                    current_page: counts.current_page,
                })
            }
            Err(err) => {
                let error = StoreError {
                    message: err.to_string(),
                    at: Utc::now(),
                };
                warn!(%run_id, kind = T::KIND.as_str(), error = %error.message, "page load failed");
                state.error = Some(error.clone());
                Err(error)
            }
        }
    }

    /// Drop everything, including the error. Counts as a collection change.
    /// Loads already running keep their in-flight mark until they finish.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        let version = state.version + 1;
        *state = StoreState {
            version,
            ..StoreState::default()
        };
    }

    /// True when nothing has loaded yet or the last load is older than `max_age`.
    pub async fn is_stale(&self, max_age: Duration) -> bool {
        let state = self.state.read().await;
        match state.last_loaded_at {
            None => true,
            Some(at) => (Utc::now() - at).to_std().map(|age| age >= max_age).unwrap_or(false),
        }
    }

    pub async fn version(&self) -> u64 {
        self.state.read().await.version
    }

    pub async fn snapshot(&self) -> StoreSnapshot<T> {
        let state = self.state.read().await;
        StoreSnapshot {
            items: Arc::clone(&state.items),
            is_loading: self.in_flight.load(Ordering::SeqCst) > 0,
            error: state.error.clone(),
            upstream: state.upstream,
            last_page: state.last_page.clone(),
            version: state.version,
            last_loaded_at: state.last_loaded_at,
        }
    }
}

/// Point-in-time view of a store. All selectors are pure.
#[derive(Debug, Clone)]
pub struct StoreSnapshot<T> {
    pub items: Arc<Vec<T>>,
    pub is_loading: bool,
    pub error: Option<StoreError>,
    pub upstream: Option<UpstreamCounts>,
    pub last_page: Option<Arc<Vec<T>>>,
    pub version: u64,
    pub last_loaded_at: Option<DateTime<Utc>>,
}

impl<T: CatalogEntity> StoreSnapshot<T> {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn by_id(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    /// Case-insensitive substring match on each supplied field; both must hold
    /// when both are given.
    pub fn by_location(&self, city: Option<&str>, state: Option<&str>) -> Vec<T> {
        self.items
            .iter()
            .filter(|item| city.map_or(true, |c| contains_ignore_case(item.city(), c.trim())))
            .filter(|item| state.map_or(true, |s| contains_ignore_case(item.state(), s.trim())))
            .cloned()
            .collect()
    }

    pub fn text_search(&self, query: &str) -> Vec<T> {
        let query = query.trim();
        self.items
            .iter()
            .filter(|item| {
                item.search_fields()
                    .into_iter()
                    .any(|field| contains_ignore_case(field, query))
            })
            .cloned()
            .collect()
    }

    /// Plain 1-based slice of the collection, no filtering or clamping.
    pub fn for_page(&self, page: usize, page_size: usize) -> Vec<T> {
        let page_size = page_size.max(1);
        let start = page.saturating_sub(1).saturating_mul(page_size);
        self.items.iter().skip(start).take(page_size).cloned().collect()
    }
}

impl StoreSnapshot<PortfolioCompany> {
    /// Companies whose parent-firm key equals `firm_id`, in collection order.
    pub fn companies_for_firm(&self, firm_id: &str) -> Vec<PortfolioCompany> {
        self.items
            .iter()
            .filter(|c| c.parent_firm == firm_id)
            .cloned()
            .collect()
    }
}

/// Loader over a fixed, swappable collection, for callers that already hold
/// the data in memory.
pub struct MemoryLoader<T> {
    items: std::sync::Mutex<Result<Vec<T>, String>>,
}

impl<T: CatalogEntity> MemoryLoader<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: std::sync::Mutex::new(Ok(items)),
        }
    }

    pub fn set(&self, items: Vec<T>) {
        if let Ok(mut guard) = self.items.lock() {
            *guard = Ok(items);
        }
    }

    /// Make every following load fail with `message`.
    pub fn fail_with(&self, message: impl Into<String>) {
        if let Ok(mut guard) = self.items.lock() {
            *guard = Err(message.into());
        }
    }
}

#[async_trait]
impl<T: CatalogEntity> EntityLoader<T> for MemoryLoader<T> {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn load_all(&self, _run_id: Uuid) -> Result<Vec<T>, LoadError> {
        let guard = self
            .items
            .lock()
            .map_err(|_| LoadError::Unavailable("memory loader poisoned".into()))?;
        match &*guard {
            Ok(items) => Ok(items.clone()),
            Err(message) => Err(LoadError::Unavailable(message.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcat_core::VentureFirm;

    fn firm(name: &str, city: &str, state: &str) -> VentureFirm {
        VentureFirm {
            id: vcat_core::slugify(name),
            name: name.into(),
            city: city.into(),
            state: state.into(),
            website: format!("https://{}.vc", vcat_core::slugify(name)),
            ..Default::default()
        }
    }

    fn sample_firms() -> Vec<VentureFirm> {
        vec![
            firm("Acme Ventures", "Austin", "TX"),
            firm("Blue Harbor", "Boston", "MA"),
            firm("Cedar Capital", "San Francisco", "CA"),
            firm("Delta Partners", "South San Francisco", "CA"),
        ]
    }

    fn store_with(items: Vec<VentureFirm>) -> (Arc<MemoryLoader<VentureFirm>>, EntityStore<VentureFirm>) {
        let loader = Arc::new(MemoryLoader::new(items));
        let store = EntityStore::new(loader.clone() as Arc<dyn EntityLoader<VentureFirm>>);
        (loader, store)
    }

    #[tokio::test]
    async fn fetch_all_replaces_collection_and_clears_error() {
        let (loader, store) = store_with(sample_firms());
        loader.fail_with("feed offline");
        assert!(store.fetch_all().await.is_err());
        assert!(store.snapshot().await.error.is_some());

        loader.set(sample_firms());
        assert_eq!(store.fetch_all().await.unwrap(), 4);
        let snap = store.snapshot().await;
        assert!(snap.error.is_none());
        assert!(!snap.is_loading);
        assert_eq!(snap.len(), 4);
        assert_eq!(snap.version, 1);
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_collection() {
        let (loader, store) = store_with(sample_firms());
        store.fetch_all().await.unwrap();
        loader.fail_with("503 from feed");

        let err = store.fetch_all().await.expect_err("load fails");
        assert!(err.message.contains("503 from feed"));
        let snap = store.snapshot().await;
        assert_eq!(snap.len(), 4);
        assert_eq!(snap.version, 1);
        assert_eq!(snap.error.as_ref().map(|e| e.message.clone()), Some(err.message));
    }

    #[tokio::test]
    async fn fetch_all_is_idempotent_for_unchanged_upstream() {
        let (_loader, store) = store_with(sample_firms());
        store.fetch_all().await.unwrap();
        let first = store.snapshot().await.items;
        store.fetch_all().await.unwrap();
        let second = store.snapshot().await.items;
        assert_eq!(*first, *second);
    }

    #[tokio::test]
    async fn reset_clears_everything() {
        let (loader, store) = store_with(sample_firms());
        store.fetch_all().await.unwrap();
        loader.fail_with("boom");
        let _ = store.fetch_all().await;
        store.reset().await;
        let snap = store.snapshot().await;
        assert!(snap.is_empty());
        assert!(snap.error.is_none());
        assert_eq!(snap.version, 2);
        assert!(store.is_stale(Duration::from_secs(3600)).await);
    }

    #[tokio::test]
    async fn by_location_uses_substring_and_ands_fields() {
        let (_loader, store) = store_with(sample_firms());
        store.fetch_all().await.unwrap();
        let snap = store.snapshot().await;

        let sf = snap.by_location(Some("san francisco"), None);
        assert_eq!(sf.len(), 2);
        let ca_boston = snap.by_location(Some("boston"), Some("ca"));
        assert!(ca_boston.is_empty());
        let tx = snap.by_location(None, Some("tx"));
        assert_eq!(tx[0].name, "Acme Ventures");
        assert_eq!(snap.by_location(None, None).len(), 4);
    }

    #[tokio::test]
    async fn text_search_spans_website_and_company_fields() {
        let (_loader, store) = store_with(sample_firms());
        store.fetch_all().await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.text_search("HARBOR.vc").len(), 1);
        assert_eq!(snap.text_search("ca").len(), 3);

        let company_loader = Arc::new(MemoryLoader::new(vec![PortfolioCompany {
            id: "foo".into(),
            name: "Foo".into(),
            vertical: "Payments".into(),
            business_model: "B2B SaaS".into(),
            parent_firm: "acme-ventures".into(),
            ..Default::default()
        }]));
        let companies = EntityStore::new(company_loader as Arc<dyn EntityLoader<PortfolioCompany>>);
        companies.fetch_all().await.unwrap();
        let snap = companies.snapshot().await;
        assert_eq!(snap.text_search("saas").len(), 1);
        assert_eq!(snap.text_search("payments").len(), 1);
        assert_eq!(snap.companies_for_firm("acme-ventures").len(), 1);
    }

    #[tokio::test]
    async fn by_id_and_for_page() {
        let (_loader, store) = store_with(sample_firms());
        store.fetch_all().await.unwrap();
        let snap = store.snapshot().await;
        assert_eq!(snap.by_id("cedar-capital").map(|f| f.city.as_str()), Some("San Francisco"));
        assert!(snap.by_id("nope").is_none());

        let page2: Vec<_> = snap.for_page(2, 3).into_iter().map(|f| f.name).collect();
        assert_eq!(page2, vec!["Delta Partners"]);
        assert!(snap.for_page(5, 3).is_empty());
    }

    #[tokio::test]
    async fn fetch_page_keeps_upstream_counts_without_touching_collection() {
        let (_loader, store) = store_with(sample_firms());
        let filter = FilterSet {
            locations: vec!["CA".into()],
            ..Default::default()
        };
        let page = store
            .fetch_page(PageRequest { page: 2, limit: 1 }, &filter)
            .await
            .unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.total_items, 2);
        assert_eq!(page.total_pages, 2);
        assert_eq!(page.current_page, 2);

        let snap = store.snapshot().await;
        assert!(snap.is_empty());
        assert_eq!(snap.version, 0);
        assert_eq!(snap.upstream.map(|u| u.total_items), Some(2));
    }

    struct StalledLoader {
        started: Arc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl EntityLoader<VentureFirm> for StalledLoader {
        fn describe(&self) -> String {
            "stalled".into()
        }

        async fn load_all(&self, _run_id: Uuid) -> Result<Vec<VentureFirm>, LoadError> {
            self.started.notify_one();
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn cancelled_fetch_does_not_leave_store_loading() {
        let started = Arc::new(tokio::sync::Notify::new());
        let loader = StalledLoader {
            started: Arc::clone(&started),
        };
        let store = Arc::new(EntityStore::new(Arc::new(loader) as Arc<dyn EntityLoader<VentureFirm>>));

        let handle = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.fetch_all().await }
        });
        started.notified().await;
        assert!(store.snapshot().await.is_loading);
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert!(!store.snapshot().await.is_loading);

        let handle = tokio::spawn({
            let store = Arc::clone(&store);
            async move {
                store
                    .fetch_page(PageRequest::new(1, 10), &FilterSet::default())
                    .await
                    .map(|page| page.items.len())
            }
        });
        started.notified().await;
        assert!(store.snapshot().await.is_loading);
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());
        let snap = store.snapshot().await;
        assert!(!snap.is_loading);
        assert!(snap.error.is_none());
        assert_eq!(snap.version, 0);
    }
}
