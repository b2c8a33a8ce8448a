//! Multi-criteria filtering and pagination over catalog entities.
//!
//! Stages always run in the same order: location, round, status, end market.
//! Stages AND together and each stage ORs over its own requested values. A
//! stage with nothing requested passes every item.

use serde::{Deserialize, Serialize};
use vcat_core::{CatalogEntity, Page};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

/// Round labels as shown to users, mapped to the codes stored in the feed.
pub const ROUND_LABELS: &[(&str, &str)] = &[
    ("Pre-Seed", "PRE_SEED"),
    ("Seed", "SEED"),
    ("Series A", "SERIES_A"),
    ("Series B", "SERIES_B"),
    ("Series C", "SERIES_C"),
    ("Series D+", "SERIES_D_PLUS"),
    ("Growth", "GROWTH"),
    ("Bridge", "BRIDGE"),
    ("Venture Debt", "DEBT"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundLookup {
    Mapped(&'static str),
    Unmapped,
}

/// Translate a user-facing round label. Labels compare case-insensitively
/// after trimming; anything not in [`ROUND_LABELS`] is `Unmapped`.
pub fn translate_round(label: &str) -> RoundLookup {
    let label = label.trim();
    ROUND_LABELS
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(label))
        .map(|&(_, code)| RoundLookup::Mapped(code))
        .unwrap_or(RoundLookup::Unmapped)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterWarning {
    UnmappedRound { label: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_SIZE,
        }
    }
}

impl PageRequest {
    pub fn new(page: usize, limit: usize) -> Self {
        Self {
            page: page.max(1),
            limit: limit.clamp(1, MAX_PAGE_SIZE),
        }
    }
}

/// Counts reported by an upstream that already paginated its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamCounts {
    pub total_items: usize,
    pub total_pages: usize,
    pub current_page: usize,
}

/// Split a comma-separated parameter into trimmed, non-empty tokens.
pub fn split_tokens(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect()
    })
    .unwrap_or_default()
}

/// Query-string surface shared by list endpoints and the CLI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CatalogQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub location: Option<String>,
    pub round: Option<String>,
    pub status: Option<String>,
    pub end_market: Option<String>,
    pub q: Option<String>,
}

impl CatalogQuery {
    pub fn page_request(&self) -> PageRequest {
        PageRequest::new(
            self.page.unwrap_or(1),
            self.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }

    pub fn filter_set(&self) -> FilterSet {
        FilterSet {
            locations: split_tokens(self.location.as_deref()),
            rounds: split_tokens(self.round.as_deref()),
            statuses: split_tokens(self.status.as_deref()),
            end_markets: split_tokens(self.end_market.as_deref()),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }
}

/// Requested filter values before translation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    pub locations: Vec<String>,
    pub rounds: Vec<String>,
    pub statuses: Vec<String>,
    pub end_markets: Vec<String>,
}

impl FilterSet {
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
            && self.rounds.is_empty()
            && self.statuses.is_empty()
            && self.end_markets.is_empty()
    }

    /// Translate round labels and normalise every token for comparison.
    /// Unmapped round labels are dropped from the filter and reported.
    pub fn compile(&self) -> (CompiledFilter, Vec<FilterWarning>) {
        let mut warnings = Vec::new();
        let mut round_codes = Vec::new();
        for label in &self.rounds {
            match translate_round(label) {
                RoundLookup::Mapped(code) => {
                    if !round_codes.contains(&code) {
                        round_codes.push(code);
                    }
                }
                RoundLookup::Unmapped => warnings.push(FilterWarning::UnmappedRound {
                    label: label.clone(),
                }),
            }
        }

        let filter = CompiledFilter {
            locations: normalize_all(&self.locations),
            round_codes,
            statuses: normalize_all(&self.statuses),
            end_markets: normalize_all(&self.end_markets),
        };
        (filter, warnings)
    }
}

fn normalize(token: &str) -> String {
    token.trim().to_lowercase()
}

fn normalize_all(tokens: &[String]) -> Vec<String> {
    tokens
        .iter()
        .map(|t| normalize(t))
        .filter(|t| !t.is_empty())
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledFilter {
    locations: Vec<String>,
    round_codes: Vec<&'static str>,
    statuses: Vec<String>,
    end_markets: Vec<String>,
}

impl CompiledFilter {
    /// Lowercased location tokens, as handed to upstream queries.
    pub fn locations(&self) -> &[String] {
        &self.locations
    }

    /// True when no round, status or end-market constraint survived compiling.
    pub fn location_only(&self) -> bool {
        self.round_codes.is_empty() && self.statuses.is_empty() && self.end_markets.is_empty()
    }

    pub fn matches<T: CatalogEntity>(&self, item: &T) -> bool {
        self.location_matches(item)
            && self.round_matches(item)
            && self.status_matches(item)
            && self.end_market_matches(item)
    }

    /// Exact (trimmed, case-insensitive) membership of city OR state.
    fn location_matches<T: CatalogEntity>(&self, item: &T) -> bool {
        if self.locations.is_empty() {
            return true;
        }
        let city = normalize(item.city());
        let state = normalize(item.state());
        self.locations.iter().any(|l| *l == city || *l == state)
    }

    fn round_matches<T: CatalogEntity>(&self, item: &T) -> bool {
        if self.round_codes.is_empty() {
            return true;
        }
        let Some(code) = item.round_code() else {
            return false;
        };
        let code = code.trim();
        self.round_codes.iter().any(|c| c.eq_ignore_ascii_case(code))
    }

    /// Primary and legacy status fields are both consulted.
    fn status_matches<T: CatalogEntity>(&self, item: &T) -> bool {
        if self.statuses.is_empty() {
            return true;
        }
        item.statuses()
            .into_iter()
            .map(normalize)
            .filter(|s| !s.is_empty())
            .any(|s| self.statuses.contains(&s))
    }

    fn end_market_matches<T: CatalogEntity>(&self, item: &T) -> bool {
        if self.end_markets.is_empty() {
            return true;
        }
        let Some(raw) = item.end_market() else {
            return false;
        };
        raw.split(',')
            .map(normalize)
            .filter(|m| !m.is_empty())
            .any(|m| self.end_markets.contains(&m))
    }

    pub fn apply<T: CatalogEntity>(&self, items: &[T]) -> Vec<T> {
        items.iter().filter(|i| self.matches(*i)).cloned().collect()
    }
}

/// Slice a fully materialised, already filtered list.
///
/// The requested page is clamped into `[1, total_pages]`; an empty input
/// yields an empty page with `total_pages == 0`.
pub fn paginate<T: Clone>(items: &[T], request: PageRequest) -> Page<T> {
    let limit = request.limit.max(1);
    let total_items = items.len();
    let total_pages = total_items.div_ceil(limit);
    if total_pages == 0 {
        return Page::empty();
    }
    let current_page = request.page.clamp(1, total_pages);
    let start = (current_page - 1) * limit;
    Page {
        items: items.iter().skip(start).take(limit).cloned().collect(),
        total_items,
        total_pages,
        current_page,
    }
}

/// Build the response page. When upstream already paginated, its counts are
/// authoritative and the items are passed through without re-slicing.
pub fn assemble_page<T: Clone>(
    items: Vec<T>,
    request: PageRequest,
    upstream: Option<UpstreamCounts>,
) -> Page<T> {
    match upstream {
        Some(counts) => Page {
            items,
            total_items: counts.total_items,
            total_pages: counts.total_pages,
            current_page: counts.current_page,
        },
        None => paginate(&items, request),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vcat_core::PortfolioCompany;

    fn company(name: &str, city: &str, state: &str) -> PortfolioCompany {
        PortfolioCompany {
            id: vcat_core::slugify(name),
            name: name.into(),
            city: city.into(),
            state: state.into(),
            ..Default::default()
        }
    }

    fn filter(set: FilterSet) -> CompiledFilter {
        set.compile().0
    }

    #[test]
    fn every_round_label_translates() {
        for (label, code) in ROUND_LABELS {
            assert_eq!(translate_round(label), RoundLookup::Mapped(*code));
            assert_eq!(
                translate_round(&format!("  {}  ", label.to_uppercase())),
                RoundLookup::Mapped(*code)
            );
        }
        assert_eq!(translate_round("Series Z"), RoundLookup::Unmapped);
        assert_eq!(translate_round(""), RoundLookup::Unmapped);
    }

    #[test]
    fn unmapped_round_is_dropped_with_a_warning() {
        let set = FilterSet {
            rounds: vec!["Seed".into(), "Mezzanine".into()],
            ..Default::default()
        };
        let (compiled, warnings) = set.compile();
        assert_eq!(compiled.round_codes, vec!["SEED"]);
        assert_eq!(
            warnings,
            vec![FilterWarning::UnmappedRound {
                label: "Mezzanine".into()
            }]
        );
    }

    #[test]
    fn only_unmapped_rounds_leave_the_stage_open() {
        let set = FilterSet {
            rounds: vec!["Mezzanine".into()],
            ..Default::default()
        };
        let (compiled, warnings) = set.compile();
        assert_eq!(warnings.len(), 1);
        assert!(compiled.matches(&company("Foo", "", "")));
    }

    #[test]
    fn location_filter_is_sound_and_complete() {
        let items = vec![
            company("A", "Austin", "TX"),
            company("B", "Boston", "MA"),
            company("C", "Dallas", "TX"),
            company("D", "New York", "NY"),
            company("E", " austin ", "CA"),
            company("F", "Austinville", "OK"),
        ];
        let tokens = vec!["Austin".to_string(), "MA".to_string()];
        let compiled = filter(FilterSet {
            locations: tokens.clone(),
            ..Default::default()
        });
        let kept = compiled.apply(&items);
        let in_set = |s: &str| tokens.iter().any(|t| t.eq_ignore_ascii_case(s.trim()));

        for item in &kept {
            assert!(in_set(&item.city) || in_set(&item.state));
        }
        for item in &items {
            if in_set(&item.city) || in_set(&item.state) {
                assert!(kept.contains(item), "{} was excluded", item.name);
            }
        }
        let names: Vec<_> = kept.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "B", "E"]);
    }

    #[test]
    fn status_filter_consults_legacy_field() {
        let legacy_only = PortfolioCompany {
            name: "Legacy".into(),
            legacy_status: "Acquired".into(),
            ..Default::default()
        };
        let primary = PortfolioCompany {
            name: "Primary".into(),
            status: "Active".into(),
            ..Default::default()
        };
        let compiled = filter(FilterSet {
            statuses: vec!["acquired".into()],
            ..Default::default()
        });
        assert!(compiled.matches(&legacy_only));
        assert!(!compiled.matches(&primary));
    }

    #[test]
    fn end_market_matches_on_set_intersection() {
        let item = PortfolioCompany {
            end_market: "Fintech, Healthcare ,Insurance".into(),
            ..Default::default()
        };
        let hit = filter(FilterSet {
            end_markets: vec!["healthcare".into(), "Energy".into()],
            ..Default::default()
        });
        let miss = filter(FilterSet {
            end_markets: vec!["Health".into()],
            ..Default::default()
        });
        assert!(hit.matches(&item));
        assert!(!miss.matches(&item));
    }

    #[test]
    fn stages_and_together() {
        let item = PortfolioCompany {
            city: "Austin".into(),
            round: "SEED".into(),
            status: "Active".into(),
            end_market: "Fintech".into(),
            ..Default::default()
        };
        let mut set = FilterSet {
            locations: vec!["Austin".into()],
            rounds: vec!["Seed".into(), "Series A".into()],
            statuses: vec!["Active".into()],
            end_markets: vec!["Fintech".into()],
        };
        assert!(filter(set.clone()).matches(&item));
        set.end_markets = vec!["Energy".into()];
        assert!(!filter(set).matches(&item));
    }

    #[test]
    fn firms_never_match_company_only_stages() {
        let firm = vcat_core::VentureFirm {
            city: "Austin".into(),
            ..Default::default()
        };
        let compiled = filter(FilterSet {
            rounds: vec!["Seed".into()],
            ..Default::default()
        });
        assert!(!compiled.matches(&firm));
    }

    #[test]
    fn pages_reconstruct_the_input_without_overlap() {
        for len in 0..13usize {
            let items: Vec<usize> = (0..len).collect();
            for limit in 1..7usize {
                let first = paginate(&items, PageRequest { page: 1, limit });
                assert_eq!(first.total_pages, len.div_ceil(limit));
                let mut rebuilt = Vec::new();
                for page in 1..=first.total_pages {
                    let slice = paginate(&items, PageRequest { page, limit });
                    assert!(slice.items.len() <= limit);
                    assert_eq!(slice.current_page, page);
                    rebuilt.extend(slice.items);
                }
                assert_eq!(rebuilt, items, "len={len} limit={limit}");
            }
        }
    }

    #[test]
    fn out_of_range_pages_are_clamped() {
        let items = vec!["a", "b", "c"];
        let page = paginate(&items, PageRequest { page: 9, limit: 2 });
        assert_eq!(page.current_page, 2);
        assert_eq!(page.items, vec!["c"]);
        let page = paginate(&items, PageRequest { page: 0, limit: 2 });
        assert_eq!(page.current_page, 1);
    }

    #[test]
    fn empty_input_yields_zero_pages() {
        let page = paginate::<u8>(&[], PageRequest { page: 3, limit: 10 });
        assert_eq!(page.total_pages, 0);
        assert_eq!(page.total_items, 0);
        assert!(page.items.is_empty());
    }

    #[test]
    fn upstream_counts_win_over_local_pagination() {
        let upstream = UpstreamCounts {
            total_items: 95,
            total_pages: 5,
            current_page: 3,
        };
        let page = assemble_page(vec![1, 2, 3], PageRequest { page: 3, limit: 20 }, Some(upstream));
        assert_eq!(page.items, vec![1, 2, 3]);
        assert_eq!(page.total_items, 95);
        assert_eq!(page.total_pages, 5);
        assert_eq!(page.current_page, 3);

        let local = assemble_page(vec![1, 2, 3], PageRequest { page: 2, limit: 2 }, None);
        assert_eq!(local.items, vec![3]);
        assert_eq!(local.total_pages, 2);
    }

    #[test]
    fn query_parses_comma_separated_tokens() {
        let query = CatalogQuery {
            location: Some(" Austin, ,TX ".into()),
            round: Some("Seed,Series A".into()),
            limit: Some(10_000),
            q: Some("   ".into()),
            ..Default::default()
        };
        let set = query.filter_set();
        assert_eq!(set.locations, vec!["Austin", "TX"]);
        assert_eq!(set.rounds, vec!["Seed", "Series A"]);
        assert_eq!(query.page_request(), PageRequest { page: 1, limit: MAX_PAGE_SIZE });
        assert_eq!(query.text(), None);
    }
}
