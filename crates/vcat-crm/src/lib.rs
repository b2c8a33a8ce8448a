//! Notes held in an external CRM, and the resolver that finds the CRM
//! organization behind a catalog entity's domain or display name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "vcat-crm";

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("CRM is not configured: {0}")]
    NotConfigured(&'static str),
    #[error("building CRM client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("CRM request to {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("CRM rejected credentials ({status}) for {path}")]
    Unauthorized { status: u16, path: String },
    #[error("CRM returned {status} for {path}: {body}")]
    Status { status: u16, path: String, body: String },
    #[error("decoding CRM response from {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub organization_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNote {
    pub organization_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Reduce a website or domain to a bare host: no scheme, credentials, port,
/// path, query, fragment or leading `www.`, all lowercase.
pub fn normalize_domain(raw: &str) -> String {
    let mut rest = raw.trim();
    if let Some((_, after)) = rest.split_once("://") {
        rest = after;
    }
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let mut host = &rest[..end];
    if let Some((_, after)) = host.rsplit_once('@') {
        host = after;
    }
    if let Some((name, _port)) = host.split_once(':') {
        host = name;
    }
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    match host.strip_prefix("www.") {
        Some(bare) => bare.to_string(),
        None => host,
    }
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn list_organizations(&self) -> Result<Vec<Organization>, CrmError>;
    async fn search_organizations(&self, term: &str) -> Result<Vec<Organization>, CrmError>;
    async fn list_notes(&self, organization_id: &str) -> Result<Vec<Note>, CrmError>;
    async fn create_note(&self, note: &NewNote) -> Result<Note, CrmError>;
    async fn update_note(&self, note_id: &str, update: &NoteUpdate) -> Result<Note, CrmError>;
    async fn delete_note(&self, note_id: &str) -> Result<(), CrmError>;
}

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub base_url: Option<String>,
    pub api_token: Option<String>,
    pub timeout: Duration,
}

impl CrmConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("CRM_BASE_URL").ok().filter(|v| !v.trim().is_empty()),
            api_token: std::env::var("CRM_API_TOKEN").ok().filter(|v| !v.trim().is_empty()),
            timeout: std::env::var("CRM_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(15)),
        }
    }
}

/// JSON-over-HTTP CRM client authenticating with a bearer token.
pub struct HttpCrmClient {
    http: Client,
    base_url: String,
    token: String,
}

impl HttpCrmClient {
    pub fn new(config: &CrmConfig) -> Result<Self, CrmError> {
        let base_url = config
            .base_url
            .clone()
            .ok_or(CrmError::NotConfigured("CRM_BASE_URL is not set"))?;
        let token = config
            .api_token
            .clone()
            .ok_or(CrmError::NotConfigured("CRM_API_TOKEN is not set"))?;
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(CrmError::Client)?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
    }

    async fn send(&self, path: &str, request: RequestBuilder) -> Result<reqwest::Response, CrmError> {
        let response = request.send().await.map_err(|source| CrmError::Request {
            path: path.to_string(),
            source,
        })?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CrmError::Unauthorized {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CrmError::Status {
                status: status.as_u16(),
                path: path.to_string(),
                body: body.chars().take(200).collect(),
            });
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(&self, path: &str, request: RequestBuilder) -> Result<T, CrmError> {
        self.send(path, request)
            .await?
            .json()
            .await
            .map_err(|source| CrmError::Decode {
                path: path.to_string(),
                source,
            })
    }
}

#[derive(Deserialize)]
struct OrganizationList {
    organizations: Vec<Organization>,
}

#[derive(Deserialize)]
struct NoteList {
    notes: Vec<Note>,
}

#[async_trait]
impl CrmClient for HttpCrmClient {
    async fn list_organizations(&self) -> Result<Vec<Organization>, CrmError> {
        let path = "/organizations";
        let list: OrganizationList = self.send_json(path, self.request(Method::GET, path)).await?;
        Ok(list.organizations)
    }

    async fn search_organizations(&self, term: &str) -> Result<Vec<Organization>, CrmError> {
        let path = "/organizations/search";
        let request = self.request(Method::GET, path).query(&[("term", term)]);
        let list: OrganizationList = self.send_json(path, request).await?;
        Ok(list.organizations)
    }

    async fn list_notes(&self, organization_id: &str) -> Result<Vec<Note>, CrmError> {
        let path = format!("/organizations/{organization_id}/notes");
        let list: NoteList = self.send_json(&path, self.request(Method::GET, &path)).await?;
        Ok(list.notes)
    }

    async fn create_note(&self, note: &NewNote) -> Result<Note, CrmError> {
        let path = "/notes";
        self.send_json(path, self.request(Method::POST, path).json(note)).await
    }

    async fn update_note(&self, note_id: &str, update: &NoteUpdate) -> Result<Note, CrmError> {
        let path = format!("/notes/{note_id}");
        self.send_json(&path, self.request(Method::PATCH, &path).json(update))
            .await
    }

    async fn delete_note(&self, note_id: &str) -> Result<(), CrmError> {
        let path = format!("/notes/{note_id}");
        self.send(&path, self.request(Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    ExactDomain,
    PartialDomain,
    SearchExact,
    SearchPartial,
    FirstCandidate,
    NotFound,
}

/// Outcome of a resolution. `NotFound` is an ordinary answer, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrganizationMatch {
    pub query: String,
    pub organization: Option<Organization>,
    pub tier: MatchTier,
}

impl OrganizationMatch {
    pub fn organization_id(&self) -> Option<&str> {
        self.organization.as_ref().map(|o| o.id.as_str())
    }

    fn not_found(query: String) -> Self {
        Self {
            query,
            organization: None,
            tier: MatchTier::NotFound,
        }
    }
}

/// One strategy in the resolver's chain.
pub trait OrganizationMatcher: Send + Sync {
    fn find<'a>(&self, query: &str, candidates: &'a [Organization]) -> Option<&'a Organization>;
}

fn org_domain(org: &Organization) -> Option<String> {
    org.domain
        .as_deref()
        .map(normalize_domain)
        .filter(|d| !d.is_empty())
}

pub struct ExactDomain;

impl OrganizationMatcher for ExactDomain {
    fn find<'a>(&self, query: &str, candidates: &'a [Organization]) -> Option<&'a Organization> {
        candidates
            .iter()
            .find(|org| org_domain(org).is_some_and(|d| d.eq_ignore_ascii_case(query)))
    }
}

/// Either domain contains the other.
pub struct PartialDomain;

impl OrganizationMatcher for PartialDomain {
    fn find<'a>(&self, query: &str, candidates: &'a [Organization]) -> Option<&'a Organization> {
        if query.is_empty() {
            return None;
        }
        candidates.iter().find(|org| {
            org_domain(org).is_some_and(|d| d.contains(query) || query.contains(d.as_str()))
        })
    }
}

pub struct ExactName;

impl OrganizationMatcher for ExactName {
    fn find<'a>(&self, query: &str, candidates: &'a [Organization]) -> Option<&'a Organization> {
        let query = query.trim().to_lowercase();
        candidates
            .iter()
            .find(|org| org.name.trim().to_lowercase() == query)
    }
}

pub struct PartialName;

impl OrganizationMatcher for PartialName {
    fn find<'a>(&self, query: &str, candidates: &'a [Organization]) -> Option<&'a Organization> {
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return None;
        }
        candidates.iter().find(|org| {
            let name = org.name.trim().to_lowercase();
            !name.is_empty() && (name.contains(&query) || query.contains(&name))
        })
    }
}

/// Walks the fallback chain: exact then partial domain over every
/// organization, then exact then partial over server-side search results,
/// then the first search candidate.
pub struct OrganizationResolver {
    client: Arc<dyn CrmClient>,
}

impl OrganizationResolver {
    pub fn new(client: Arc<dyn CrmClient>) -> Self {
        Self { client }
    }

    pub async fn resolve(&self, domain: Option<&str>, name: Option<&str>) -> Result<OrganizationMatch, CrmError> {
        let domain = domain.map(normalize_domain).filter(|d| !d.is_empty());
        let name = name.map(str::trim).filter(|n| !n.is_empty());

        let (term, exact, partial): (String, &dyn OrganizationMatcher, &dyn OrganizationMatcher) =
            match (&domain, name) {
                (Some(domain), _) => (domain.clone(), &ExactDomain, &PartialDomain),
                (None, Some(name)) => (name.to_string(), &ExactName, &PartialName),
                (None, None) => return Ok(OrganizationMatch::not_found(String::new())),
            };

        if domain.is_some() {
            let all = self.client.list_organizations().await?;
            for (matcher, tier) in [(exact, MatchTier::ExactDomain), (partial, MatchTier::PartialDomain)] {
                if let Some(org) = matcher.find(&term, &all) {
                    debug!(query = %term, org_id = %org.id, ?tier, "organization resolved");
                    return Ok(found(term, org, tier));
                }
            }
        }

        let candidates = self.client.search_organizations(&term).await?;
        for (matcher, tier) in [(exact, MatchTier::SearchExact), (partial, MatchTier::SearchPartial)] {
            if let Some(org) = matcher.find(&term, &candidates) {
                debug!(query = %term, org_id = %org.id, ?tier, "organization resolved");
                return Ok(found(term, org, tier));
            }
        }

        match candidates.first() {
            Some(org) => {
                warn!(
                    query = %term,
                    org_id = %org.id,
                    candidates = candidates.len(),
                    "no matching organization; using first search candidate"
                );
                Ok(found(term, org, MatchTier::FirstCandidate))
            }
            None => {
                info!(query = %term, "no CRM organization found");
                Ok(OrganizationMatch::not_found(term))
            }
        }
    }
}

fn found(query: String, org: &Organization, tier: MatchTier) -> OrganizationMatch {
    OrganizationMatch {
        query,
        organization: Some(org.clone()),
        tier,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EntityNotes {
    pub resolution: OrganizationMatch,
    pub notes: Vec<Note>,
}

pub struct NoteService {
    client: Arc<dyn CrmClient>,
    resolver: OrganizationResolver,
}

impl NoteService {
    pub fn new(client: Arc<dyn CrmClient>) -> Self {
        Self {
            resolver: OrganizationResolver::new(Arc::clone(&client)),
            client,
        }
    }

    pub fn resolver(&self) -> &OrganizationResolver {
        &self.resolver
    }

    /// Resolve the organization, then list its notes. Unresolved entities
    /// have no notes.
    pub async fn list(&self, domain: Option<&str>, name: Option<&str>) -> Result<EntityNotes, CrmError> {
        let resolution = self.resolver.resolve(domain, name).await?;
        let notes = match resolution.organization_id() {
            Some(id) => self.client.list_notes(id).await?,
            None => Vec::new(),
        };
        Ok(EntityNotes { resolution, notes })
    }

    pub async fn create(&self, note: NewNote) -> Result<Note, CrmError> {
        let created = self.client.create_note(&note).await?;
        info!(note_id = %created.id, org_id = %created.organization_id, "note created");
        Ok(created)
    }

    pub async fn update(&self, note_id: &str, update: NoteUpdate) -> Result<Note, CrmError> {
        self.client.update_note(note_id, &update).await
    }

    pub async fn delete(&self, note_id: &str) -> Result<(), CrmError> {
        self.client.delete_note(note_id).await?;
        info!(note_id, "note deleted");
        Ok(())
    }
}

/// In-process CRM used by tests and local runs without a CRM.
#[derive(Default)]
pub struct MemoryCrm {
    state: tokio::sync::Mutex<MemoryCrmState>,
}

#[derive(Default)]
struct MemoryCrmState {
    organizations: Vec<Organization>,
    notes: Vec<Note>,
    next_id: u64,
}

impl MemoryCrm {
    pub fn with_organizations(organizations: Vec<Organization>) -> Self {
        Self {
            state: tokio::sync::Mutex::new(MemoryCrmState {
                organizations,
                ..MemoryCrmState::default()
            }),
        }
    }
}

#[async_trait]
impl CrmClient for MemoryCrm {
    async fn list_organizations(&self) -> Result<Vec<Organization>, CrmError> {
        Ok(self.state.lock().await.organizations.clone())
    }

    /// Substring search over name and domain, like a typical CRM term search.
    async fn search_organizations(&self, term: &str) -> Result<Vec<Organization>, CrmError> {
        let term = term.to_lowercase();
        Ok(self
            .state
            .lock()
            .await
            .organizations
            .iter()
            .filter(|org| {
                org.name.to_lowercase().contains(&term)
                    || org
                        .domain
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&term))
            })
            .cloned()
            .collect())
    }

    async fn list_notes(&self, organization_id: &str) -> Result<Vec<Note>, CrmError> {
        Ok(self
            .state
            .lock()
            .await
            .notes
            .iter()
            .filter(|n| n.organization_id == organization_id)
            .cloned()
            .collect())
    }

    async fn create_note(&self, note: &NewNote) -> Result<Note, CrmError> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let now = Utc::now();
        let created = Note {
            id: format!("note-{}", state.next_id),
            organization_id: note.organization_id.clone(),
            title: note.title.clone(),
            content: note.content.clone(),
            created_at: Some(now),
            updated_at: Some(now),
        };
        state.notes.push(created.clone());
        Ok(created)
    }

    async fn update_note(&self, note_id: &str, update: &NoteUpdate) -> Result<Note, CrmError> {
        let mut state = self.state.lock().await;
        let note = state
            .notes
            .iter_mut()
            .find(|n| n.id == note_id)
            .ok_or_else(|| missing_note(note_id))?;
        if let Some(title) = &update.title {
            note.title = title.clone();
        }
        if let Some(content) = &update.content {
            note.content = content.clone();
        }
        note.updated_at = Some(Utc::now());
        Ok(note.clone())
    }

    async fn delete_note(&self, note_id: &str) -> Result<(), CrmError> {
        let mut state = self.state.lock().await;
        let before = state.notes.len();
        state.notes.retain(|n| n.id != note_id);
        if state.notes.len() == before {
            return Err(missing_note(note_id));
        }
        Ok(())
    }
}

fn missing_note(note_id: &str) -> CrmError {
    CrmError::Status {
        status: 404,
        path: format!("/notes/{note_id}"),
        body: "note not found".to_string(),
    }
}
