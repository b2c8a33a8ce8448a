//! Dataset ingestion: fetch a tabular feed, map its columns onto catalog
//! entities and group portfolio rows under their investing firm.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;
use vcat_core::{slugify, PortfolioCompany, VentureFirm};
use vcat_storage::{sha256_hex, FetchError, HttpFetcher};

pub const CRATE_NAME: &str = "vcat-adapters";

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("dataset body is empty")]
    Empty,
    #[error("dataset header row is unreadable: {0}")]
    Header(#[source] csv::Error),
    #[error("dataset is missing required column `{0}`")]
    MissingColumn(String),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A row that was dropped during ingestion. Never fatal for the batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowSkip {
    pub line: u64,
    pub reason: String,
}

/// One data row keyed by exact header text. Cells are trimmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabularRow {
    pub line: u64,
    cells: HashMap<String, String>,
}

impl TabularRow {
    pub fn new(line: u64, cells: HashMap<String, String>) -> Self {
        Self { line, cells }
    }

    /// Cell text, or empty when the column is absent or the cell is blank.
    pub fn text(&self, column: &str) -> &str {
        self.cells.get(column).map(String::as_str).unwrap_or("")
    }

    /// Numeric cell with currency symbols, separators and whitespace removed.
    /// Anything unparseable reads as zero.
    pub fn number(&self, column: &str) -> f64 {
        parse_number(self.text(column))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedTable {
    pub headers: Vec<String>,
    pub rows: Vec<TabularRow>,
    pub skipped: Vec<RowSkip>,
}

pub fn parse_number(raw: &str) -> f64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '%' | ' ' | '_'))
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0)
}

/// Parse a CSV body with a header row. Individual unreadable records are
/// recorded as skips; only an empty body or an unreadable header fails.
pub fn parse_table(body: &[u8]) -> Result<ParsedTable, ParseError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ParseError::Empty);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(body);

    let headers: Vec<String> = reader
        .headers()
        .map_err(ParseError::Header)?
        .iter()
        .map(ToString::to_string)
        .collect();

    let mut table = ParsedTable {
        headers: headers.clone(),
        ..Default::default()
    };

    for (idx, record) in reader.records().enumerate() {
        // header is line 1
        let fallback_line = idx as u64 + 2;
        match record {
            Ok(record) => {
                let line = record.position().map(|p| p.line()).unwrap_or(fallback_line);
                let cells = headers
                    .iter()
                    .zip(record.iter())
                    .filter(|(_, value)| !value.is_empty())
                    .map(|(header, value)| (header.clone(), value.to_string()))
                    .collect();
                table.rows.push(TabularRow::new(line, cells));
            }
            Err(err) => {
                let line = err
                    .position()
                    .map(|p| p.line())
                    .unwrap_or(fallback_line);
                warn!(line, error = %err, "skipping unreadable row");
                table.skipped.push(RowSkip {
                    line,
                    reason: err.to_string(),
                });
            }
        }
    }

    Ok(table)
}

/// Header names for every mapped field. Matching is by exact header text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnMap {
    pub firm_name: String,
    pub firm_city: String,
    pub firm_state: String,
    pub firm_website: String,
    pub firm_score: String,
    pub assets_under_management: String,
    pub stage_distribution: String,
    pub company_name: String,
    pub company_website: String,
    pub company_city: String,
    pub company_state: String,
    pub company_score: String,
    pub round: String,
    pub status: String,
    pub legacy_status: String,
    pub end_market: String,
    pub vertical: String,
    pub business_model: String,
    pub total_funding: String,
    pub last_round_amount: String,
}

impl Default for ColumnMap {
    fn default() -> Self {
        Self {
            firm_name: "Investor Name".into(),
            firm_city: "Investor City".into(),
            firm_state: "Investor State".into(),
            firm_website: "Investor Website".into(),
            firm_score: "Investor Score".into(),
            assets_under_management: "AUM".into(),
            stage_distribution: "Stage Distribution".into(),
            company_name: "Company Name".into(),
            company_website: "Company Website".into(),
            company_city: "City".into(),
            company_state: "State".into(),
            company_score: "Score".into(),
            round: "Round".into(),
            status: "Status".into(),
            legacy_status: "Company Status".into(),
            end_market: "End Market".into(),
            vertical: "Vertical".into(),
            business_model: "Business Model".into(),
            total_funding: "Total Funding".into(),
            last_round_amount: "Last Round Amount".into(),
        }
    }
}

impl ColumnMap {
    fn firm_from_row(&self, id: String, row: &TabularRow) -> VentureFirm {
        VentureFirm {
            id,
            name: row.text(&self.firm_name).to_string(),
            city: row.text(&self.firm_city).to_string(),
            state: row.text(&self.firm_state).to_string(),
            website: row.text(&self.firm_website).to_string(),
            score: row.number(&self.firm_score),
            assets_under_management: row.text(&self.assets_under_management).to_string(),
            stage_distribution: row.text(&self.stage_distribution).to_string(),
            portfolio_count: 0,
        }
    }

    fn company_from_row(&self, parent_firm: &str, row: &TabularRow) -> PortfolioCompany {
        let name = row.text(&self.company_name);
        PortfolioCompany {
            id: slugify(name),
            name: name.to_string(),
            website: row.text(&self.company_website).to_string(),
            city: row.text(&self.company_city).to_string(),
            state: row.text(&self.company_state).to_string(),
            score: row.number(&self.company_score),
            round: row.text(&self.round).to_string(),
            status: row.text(&self.status).to_string(),
            legacy_status: row.text(&self.legacy_status).to_string(),
            end_market: row.text(&self.end_market).to_string(),
            vertical: row.text(&self.vertical).to_string(),
            business_model: row.text(&self.business_model).to_string(),
            total_funding: row.number(&self.total_funding),
            last_round_amount: row.number(&self.last_round_amount),
            parent_firm: parent_firm.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FirmGroup {
    pub firm: VentureFirm,
    pub companies: Vec<PortfolioCompany>,
}

/// A fully ingested feed. Groups keep first-seen order of their parent key.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupedDataset {
    pub groups: Vec<FirmGroup>,
    pub skipped: Vec<RowSkip>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl GroupedDataset {
    pub fn firms(&self) -> Vec<VentureFirm> {
        self.groups.iter().map(|g| g.firm.clone()).collect()
    }

    pub fn companies(&self) -> Vec<PortfolioCompany> {
        self.groups
            .iter()
            .flat_map(|g| g.companies.iter().cloned())
            .collect()
    }

    pub fn group(&self, firm_id: &str) -> Option<&FirmGroup> {
        self.groups.iter().find(|g| g.firm.id == firm_id)
    }
}

/// Why a row cannot be grouped, if it cannot. A name made only of punctuation
/// yields no id and is reported separately from an empty cell.
fn skip_reason(parent_name: &str, child_name: &str, columns: &ColumnMap) -> Option<String> {
    let unusable = |column: &str, name: &str| {
        if name.is_empty() {
            Some(format!("missing `{column}`"))
        } else if slugify(name).is_empty() {
            Some(format!("`{column}` value {name:?} has no letters or digits"))
        } else {
            None
        }
    };
    unusable(&columns.firm_name, parent_name).or_else(|| unusable(&columns.company_name, child_name))
}

/// Group rows under the slug of their parent-name column.
///
/// The first row for a parent fixes the firm's metadata; later rows only add
/// companies. Companies are ordered by descending score, ties in input order.
pub fn group_by_parent(table: ParsedTable, columns: &ColumnMap) -> (Vec<FirmGroup>, Vec<RowSkip>) {
    let mut skipped = table.skipped;
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, FirmGroup> = HashMap::new();

    for row in &table.rows {
        let parent_name = row.text(&columns.firm_name);
        let child_name = row.text(&columns.company_name);
        let parent_key = slugify(parent_name);
        if let Some(reason) = skip_reason(parent_name, child_name, columns) {
            warn!(line = row.line, %reason, "skipping row");
            skipped.push(RowSkip {
                line: row.line,
                reason,
            });
            continue;
        }

        let group = groups.entry(parent_key.clone()).or_insert_with(|| {
            order.push(parent_key.clone());
            FirmGroup {
                firm: columns.firm_from_row(parent_key.clone(), row),
                companies: Vec::new(),
            }
        });
        group
            .companies
            .push(columns.company_from_row(&parent_key, row));
    }

    let groups = order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|mut group| {
            group
                .companies
                .sort_by(|a, b| b.score.total_cmp(&a.score));
            group.firm.portfolio_count = group.companies.len() as u32;
            group
        })
        .collect();

    (groups, skipped)
}

/// Raw bytes as handed back by a [`DatasetSource`].
#[derive(Debug, Clone)]
pub struct RawDataset {
    pub origin: String,
    pub body: Vec<u8>,
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

impl RawDataset {
    pub fn from_bytes(origin: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            origin: origin.into(),
            content_hash: sha256_hex(&body),
            body,
            fetched_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DatasetSource: Send + Sync {
    fn key(&self) -> &str;
    fn origin(&self) -> &str;

    async fn fetch(&self, run_id: Uuid) -> Result<RawDataset, IngestError>;
}

pub struct HttpDatasetSource {
    key: String,
    url: String,
    http: Arc<HttpFetcher>,
}

impl HttpDatasetSource {
    pub fn new(key: impl Into<String>, url: impl Into<String>, http: Arc<HttpFetcher>) -> Self {
        Self {
            key: key.into(),
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl DatasetSource for HttpDatasetSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn origin(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, run_id: Uuid) -> Result<RawDataset, IngestError> {
        let resp = self.http.fetch_bytes(run_id, &self.key, &self.url).await?;
        Ok(RawDataset {
            origin: resp.final_url,
            body: resp.body,
            content_hash: resp.content_hash,
            fetched_at: resp.fetched_at,
        })
    }
}

/// Reads a feed from local disk; used for fixtures and offline runs.
pub struct FileDatasetSource {
    key: String,
    path: PathBuf,
    origin: String,
}

impl FileDatasetSource {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            key: key.into(),
            origin: path.display().to_string(),
            path,
        }
    }
}

#[async_trait]
impl DatasetSource for FileDatasetSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn origin(&self) -> &str {
        &self.origin
    }

    async fn fetch(&self, _run_id: Uuid) -> Result<RawDataset, IngestError> {
        let body = tokio::fs::read(&self.path)
            .await
            .map_err(|source| IngestError::Io {
                path: self.path.clone(),
                source,
            })?;
        Ok(RawDataset::from_bytes(self.origin.clone(), body))
    }
}

/// Fixed in-memory feed.
pub struct StaticDatasetSource {
    key: String,
    body: Vec<u8>,
}

impl StaticDatasetSource {
    pub fn new(key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            body: body.into(),
        }
    }
}

#[async_trait]
impl DatasetSource for StaticDatasetSource {
    fn key(&self) -> &str {
        &self.key
    }

    fn origin(&self) -> &str {
        "static"
    }

    async fn fetch(&self, _run_id: Uuid) -> Result<RawDataset, IngestError> {
        Ok(RawDataset::from_bytes("static", self.body.clone()))
    }
}

/// Pick a source implementation from the location's scheme.
pub fn dataset_source_for(
    key: &str,
    location: &str,
    http: Arc<HttpFetcher>,
) -> Box<dyn DatasetSource> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Box::new(HttpDatasetSource::new(key, location, http))
    } else {
        let path = location.strip_prefix("file://").unwrap_or(location);
        Box::new(FileDatasetSource::new(key, path))
    }
}

/// Fetch and parse a feed into rows without grouping.
pub async fn load_rows(source: &dyn DatasetSource, run_id: Uuid) -> Result<ParsedTable, IngestError> {
    let raw = source.fetch(run_id).await?;
    Ok(parse_table(&raw.body)?)
}

/// Fetch, parse and group one feed.
pub async fn load_dataset(
    source: &dyn DatasetSource,
    columns: &ColumnMap,
    run_id: Uuid,
) -> Result<GroupedDataset, IngestError> {
    let raw = source.fetch(run_id).await?;
    let table = parse_table(&raw.body)?;
    for required in [&columns.firm_name, &columns.company_name] {
        if !table.headers.iter().any(|h| h == required) {
            return Err(ParseError::MissingColumn(required.clone()).into());
        }
    }

    let rows = table.rows.len();
    let (groups, skipped) = group_by_parent(table, columns);
    info!(
        %run_id,
        dataset = source.key(),
        origin = %raw.origin,
        rows,
        firms = groups.len(),
        skipped = skipped.len(),
        content_hash = %raw.content_hash,
        "dataset ingested"
    );
    Ok(GroupedDataset {
        groups,
        skipped,
        content_hash: raw.content_hash,
        fetched_at: raw.fetched_at,
    })
}
