//! Core domain model for the venture catalog: firms, portfolio companies,
//! search index projections and page envelopes.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vcat-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Firm,
    Company,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Firm => "firm",
            EntityKind::Company => "company",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "firm" | "firms" => Some(EntityKind::Firm),
            "company" | "companies" => Some(EntityKind::Company),
            _ => None,
        }
    }
}

/// Lowercase slug with every run of non-alphanumeric characters collapsed to a
/// single hyphen. Used both for entity ids and for parent grouping keys.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_hyphen = false;
    for c in input.chars() {
        if c.is_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.extend(c.to_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

/// An investment firm as held by the firm store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VentureFirm {
    pub id: String,
    pub name: String,
    pub city: String,
    pub state: String,
    pub website: String,
    pub score: f64,
    pub assets_under_management: String,
    pub stage_distribution: String,
    pub portfolio_count: u32,
}

/// A company held in some firm's portfolio.
///
/// `parent_firm` is the slug of the investing firm's name as it appeared in
/// the feed. It usually matches a [`VentureFirm::id`] but nothing enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PortfolioCompany {
    pub id: String,
    pub name: String,
    pub website: String,
    pub city: String,
    pub state: String,
    pub score: f64,
    pub round: String,
    pub status: String,
    pub legacy_status: String,
    pub end_market: String,
    pub vertical: String,
    pub business_model: String,
    pub total_funding: f64,
    pub last_round_amount: f64,
    pub parent_firm: String,
}

/// Flattened cross-entity row held by the search index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchIndexItem {
    pub entity_type: EntityKind,
    pub id: String,
    pub name: String,
    pub website: String,
    pub city: String,
    pub state: String,
}

/// Common read surface shared by both entity kinds. Stores, the filter
/// engine and the search index are all generic over it.
pub trait CatalogEntity: Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
    fn name(&self) -> &str;
    fn website(&self) -> &str;
    fn city(&self) -> &str;
    fn state(&self) -> &str;

    /// Fields consulted by free-text search.
    fn search_fields(&self) -> Vec<&str> {
        vec![self.name(), self.website(), self.city(), self.state()]
    }

    fn round_code(&self) -> Option<&str> {
        None
    }

    /// Every status field that may carry a value, primary first.
    fn statuses(&self) -> Vec<&str> {
        Vec::new()
    }

    fn end_market(&self) -> Option<&str> {
        None
    }

    fn to_index_item(&self) -> SearchIndexItem {
        SearchIndexItem {
            entity_type: Self::KIND,
            id: self.id().to_string(),
            name: self.name().to_string(),
            website: self.website().to_string(),
            city: self.city().to_string(),
            state: self.state().to_string(),
        }
    }
}

impl CatalogEntity for VentureFirm {
    const KIND: EntityKind = EntityKind::Firm;

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn website(&self) -> &str {
        &self.website
    }
    fn city(&self) -> &str {
        &self.city
    }
    fn state(&self) -> &str {
        &self.state
    }
}

impl CatalogEntity for PortfolioCompany {
    const KIND: EntityKind = EntityKind::Company;

    fn id(&self) -> &str {
        &self.id
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn website(&self) -> &str {
        &self.website
    }
    fn city(&self) -> &str {
        &self.city
    }
    fn state(&self) -> &str {
        &self.state
    }

    fn search_fields(&self) -> Vec<&str> {
        vec![
            self.name.as_str(),
            self.website.as_str(),
            self.city.as_str(),
            self.state.as_str(),
            self.vertical.as_str(),
            self.business_model.as_str(),
        ]
    }

    fn round_code(&self) -> Option<&str> {
        Some(self.round.as_str())
    }

    fn statuses(&self) -> Vec<&str> {
        vec![self.status.as_str(), self.legacy_status.as_str()]
    }

    fn end_market(&self) -> Option<&str> {
        Some(self.end_market.as_str())
    }
}

/// One page of results together with the counts needed to render pagers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total_items: usize,
    pub total_pages: usize,
    pub current_page: usize,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_items: 0,
            total_pages: 0,
            current_page: 1,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total_items: self.total_items,
            total_pages: self.total_pages,
            current_page: self.current_page,
        }
    }
}

/// Case-insensitive substring test. An empty needle always matches.
pub fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation_runs() {
        assert_eq!(slugify("Acme Ventures"), "acme-ventures");
        assert_eq!(slugify("  Acme  &  Ventures, LLC. "), "acme-ventures-llc");
        assert_eq!(slugify("a16z"), "a16z");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn company_exposes_both_status_fields() {
        let company = PortfolioCompany {
            status: String::new(),
            legacy_status: "Active".into(),
            ..Default::default()
        };
        assert_eq!(company.statuses(), vec!["", "Active"]);
        assert_eq!(VentureFirm::default().statuses(), Vec::<&str>::new());
    }

    #[test]
    fn index_projection_carries_kind() {
        let firm = VentureFirm {
            id: "acme-ventures".into(),
            name: "Acme Ventures".into(),
            city: "Austin".into(),
            state: "TX".into(),
            ..Default::default()
        };
        let item = firm.to_index_item();
        assert_eq!(item.entity_type, EntityKind::Firm);
        assert_eq!(item.id, "acme-ventures");
        assert_eq!(
            serde_json::to_value(&item).unwrap()["entity_type"],
            serde_json::json!("firm")
        );
    }

    #[test]
    fn entity_kind_parses_plural_forms() {
        assert_eq!(EntityKind::parse("Companies"), Some(EntityKind::Company));
        assert_eq!(EntityKind::parse("firm"), Some(EntityKind::Firm));
        assert_eq!(EntityKind::parse("fund"), None);
    }
}
