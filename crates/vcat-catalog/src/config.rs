//! Catalog configuration: environment settings and the dataset registry file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::fs;
use vcat_adapters::ColumnMap;
use vcat_storage::{HttpClientConfig, DEFAULT_CACHE_TTL};

pub const PORTFOLIO_DATASET: &str = "portfolio";
pub const DEFAULT_REFRESH_CRON: &str = "0 */15 * * * *";

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub datasets_path: PathBuf,
    pub portfolio_url: Option<String>,
    pub cache_ttl: Duration,
    pub cache_single_flight: bool,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub database_url: Option<String>,
    pub scheduler_enabled: bool,
    pub refresh_cron: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl CatalogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false)
        };
        Self {
            datasets_path: lookup("VCAT_DATASETS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("datasets.yaml")),
            portfolio_url: lookup("VCAT_PORTFOLIO_URL").filter(|v| !v.trim().is_empty()),
            cache_ttl: lookup("VCAT_CACHE_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CACHE_TTL),
            cache_single_flight: flag("VCAT_CACHE_SINGLE_FLIGHT"),
            http_timeout_secs: lookup("VCAT_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: lookup("VCAT_USER_AGENT").unwrap_or_else(|| "vcat/0.1".to_string()),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            scheduler_enabled: flag("VCAT_SCHEDULER_ENABLED"),
            refresh_cron: lookup("VCAT_REFRESH_CRON")
                .unwrap_or_else(|| DEFAULT_REFRESH_CRON.to_string()),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..HttpClientConfig::default()
        }
    }

    /// Registry from `datasets_path`; when that file does not exist, a
    /// single-entry registry built from `VCAT_PORTFOLIO_URL`.
    pub async fn load_registry(&self) -> Result<DatasetRegistry> {
        if fs::try_exists(&self.datasets_path).await.unwrap_or(false) {
            return DatasetRegistry::load(&self.datasets_path).await;
        }
        let url = self.portfolio_url.clone().with_context(|| {
            format!(
                "no dataset registry at {} and VCAT_PORTFOLIO_URL is unset",
                self.datasets_path.display()
            )
        })?;
        Ok(DatasetRegistry {
            datasets: vec![DatasetConfig {
                key: PORTFOLIO_DATASET.to_string(),
                url,
                enabled: true,
                columns: ColumnMap::default(),
            }],
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRegistry {
    pub datasets: Vec<DatasetConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub key: String,
    /// `http(s)://` URL, `file://` URL or plain filesystem path.
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub columns: ColumnMap,
}

fn default_enabled() -> bool {
    true
}

impl DatasetRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &DatasetConfig> {
        self.datasets.iter().filter(|d| d.enabled)
    }

    /// The enabled portfolio feed, if configured.
    pub fn portfolio(&self) -> Option<&DatasetConfig> {
        self.enabled().find(|d| d.key == PORTFOLIO_DATASET)
    }
}
