//! Cross-entity search index derived from the firm and company stores.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;
use vcat_core::{contains_ignore_case, CatalogEntity, EntityKind, SearchIndexItem};

use crate::store::StoreSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub total: usize,
    pub firms: usize,
    pub companies: usize,
}

/// One complete projection of both stores. Never mutated after build.
#[derive(Debug, Clone)]
pub struct IndexSnapshot {
    pub items: Vec<SearchIndexItem>,
    pub firm_version: u64,
    pub company_version: u64,
    pub built_at: DateTime<Utc>,
}

impl IndexSnapshot {
    pub fn build<F: CatalogEntity, C: CatalogEntity>(
        firms: &StoreSnapshot<F>,
        companies: &StoreSnapshot<C>,
    ) -> Self {
        let items = firms
            .items
            .iter()
            .map(|firm| firm.to_index_item())
            .chain(companies.items.iter().map(|company| company.to_index_item()))
            .collect();
        Self {
            items,
            firm_version: firms.version,
            company_version: companies.version,
            built_at: Utc::now(),
        }
    }

    pub fn search(&self, text: &str) -> Vec<SearchIndexItem> {
        self.search_where(Some(text), None, None, None)
    }

    pub fn search_by_location(&self, city: Option<&str>, state: Option<&str>) -> Vec<SearchIndexItem> {
        self.search_where(None, None, city, state)
    }

    pub fn search_by_entity_type(&self, kind: EntityKind) -> Vec<SearchIndexItem> {
        self.search_where(None, Some(kind), None, None)
    }

    /// Every supplied criterion must hold: text as in [`Self::search`], kind,
    /// then city and state as in [`Self::search_by_location`].
    pub fn search_where(
        &self,
        text: Option<&str>,
        kind: Option<EntityKind>,
        city: Option<&str>,
        state: Option<&str>,
    ) -> Vec<SearchIndexItem> {
        self.items
            .iter()
            .filter(|item| text.map_or(true, |t| matches_text(item, t)))
            .filter(|item| kind.map_or(true, |k| item.entity_type == k))
            .filter(|item| matches_location(item, city, state))
            .cloned()
            .collect()
    }

    /// Firm and company ids live in separate namespaces, so an id alone may
    /// hit both kinds; without `kind` the first hit (firms first) wins.
    pub fn find_by_id(&self, id: &str, kind: Option<EntityKind>) -> Option<&SearchIndexItem> {
        self.items
            .iter()
            .find(|item| item.id == id && kind.map_or(true, |k| item.entity_type == k))
    }

    pub fn stats(&self) -> IndexStats {
        let firms = self
            .items
            .iter()
            .filter(|item| item.entity_type == EntityKind::Firm)
            .count();
        IndexStats {
            total: self.items.len(),
            firms,
            companies: self.items.len() - firms,
        }
    }
}

fn matches_text(item: &SearchIndexItem, text: &str) -> bool {
    let text = text.trim();
    [&item.name, &item.website, &item.city, &item.state]
        .into_iter()
        .any(|field| contains_ignore_case(field, text))
}

fn matches_location(item: &SearchIndexItem, city: Option<&str>, state: Option<&str>) -> bool {
    city.map_or(true, |c| contains_ignore_case(&item.city, c.trim()))
        && state.map_or(true, |s| contains_ignore_case(&item.state, s.trim()))
}

/// Memoized index: rebuilt in full whenever either store version moved since
/// the last build. Readers hold an `Arc` to whichever snapshot was current.
#[derive(Default)]
pub struct SearchIndex {
    current: RwLock<Option<Arc<IndexSnapshot>>>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild if stale and return the current snapshot. The first call always
    /// builds, even over two empty stores.
    pub async fn refresh<F: CatalogEntity, C: CatalogEntity>(
        &self,
        firms: &StoreSnapshot<F>,
        companies: &StoreSnapshot<C>,
    ) -> Arc<IndexSnapshot> {
        if let Some(current) = self.current.read().await.as_ref() {
            if current.firm_version == firms.version && current.company_version == companies.version {
                return Arc::clone(current);
            }
        }

        let mut slot = self.current.write().await;
        if let Some(current) = slot.as_ref() {
            if current.firm_version == firms.version && current.company_version == companies.version {
                return Arc::clone(current);
            }
        }
        let rebuilt = Arc::new(IndexSnapshot::build(firms, companies));
        debug!(
            items = rebuilt.items.len(),
            firm_version = rebuilt.firm_version,
            company_version = rebuilt.company_version,
            "search index rebuilt"
        );
        *slot = Some(Arc::clone(&rebuilt));
        rebuilt
    }

    pub async fn is_initialized(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn snapshot(&self) -> Option<Arc<IndexSnapshot>> {
        self.current.read().await.clone()
    }
}
