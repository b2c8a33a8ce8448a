//! JSON query surface over the catalog, plus CRM note endpoints.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};
use vcat_catalog::{maybe_build_scheduler, Catalog, CatalogConfig, CatalogQuery};
use vcat_core::{EntityKind, SearchIndexItem};
use vcat_crm::{CrmConfig, CrmError, HttpCrmClient, NewNote, NoteService, NoteUpdate};

pub const CRATE_NAME: &str = "vcat-web";

#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub notes: Option<Arc<NoteService>>,
}

impl AppState {
    pub fn new(catalog: Arc<Catalog>, notes: Option<Arc<NoteService>>) -> Self {
        Self { catalog, notes }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct SearchParams {
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub entity_type: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub items: Vec<SearchIndexItem>,
    pub total: usize,
}

#[derive(Debug, Deserialize, Default)]
pub struct NotesParams {
    pub domain: Option<String>,
    pub name: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/firms", get(list_firms_handler))
        .route("/api/firms/{id}", get(firm_detail_handler))
        .route("/api/firms/{id}/companies", get(firm_companies_handler))
        .route("/api/companies", get(list_companies_handler))
        .route("/api/companies/{id}", get(company_detail_handler))
        .route("/api/search", get(search_handler))
        .route("/api/status", get(status_handler))
        .route("/api/notes", get(list_notes_handler).post(create_note_handler))
        .route("/api/notes/{id}", patch(update_note_handler).delete(delete_note_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("VCAT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = CatalogConfig::from_env();
    let catalog = Arc::new(Catalog::from_config(&config).await.context("building catalog")?);
    let summary = catalog.refresh_all().await;
    info!(run_id = %summary.run_id, index_total = summary.index.total, "initial catalog load");

    let scheduler = maybe_build_scheduler(Arc::clone(&catalog), &config).await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
    }

    let notes = match HttpCrmClient::new(&CrmConfig::from_env()) {
        Ok(client) => Some(Arc::new(NoteService::new(Arc::new(client)))),
        Err(err) => {
            warn!(error = %err, "CRM notes disabled");
            None
        }
    };

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving");
    axum::serve(listener, app(AppState::new(catalog, notes))).await?;
    Ok(())
}

async fn list_firms_handler(State(state): State<Arc<AppState>>, Query(query): Query<CatalogQuery>) -> Response {
    state.catalog.ensure_fresh().await;
    Json(state.catalog.query_firms(&query).await).into_response()
}

async fn list_companies_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CatalogQuery>,
) -> Response {
    state.catalog.ensure_fresh().await;
    Json(state.catalog.query_companies(&query).await).into_response()
}

async fn firm_detail_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    state.catalog.ensure_fresh().await;
    match state.catalog.firm(&id).await {
        Some(firm) => Json(firm).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("firm {id} not found")),
    }
}

async fn firm_companies_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    state.catalog.ensure_fresh().await;
    if state.catalog.firm(&id).await.is_none() {
        return error_response(StatusCode::NOT_FOUND, format!("firm {id} not found"));
    }
    Json(state.catalog.companies_for_firm(&id).await).into_response()
}

async fn company_detail_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    state.catalog.ensure_fresh().await;
    match state.catalog.company(&id).await {
        Some(company) => Json(company).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("company {id} not found")),
    }
}

async fn search_handler(State(state): State<Arc<AppState>>, Query(params): Query<SearchParams>) -> Response {
    let kind = match params.entity_type.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        Some(raw) => match EntityKind::parse(raw) {
            Some(kind) => Some(kind),
            None => return error_response(StatusCode::BAD_REQUEST, format!("unknown entity type `{raw}`")),
        },
        None => None,
    };

    state.catalog.ensure_fresh().await;
    let index = state.catalog.search_index().await;
    let items = index.search_where(
        params.q.as_deref().map(str::trim).filter(|q| !q.is_empty()),
        kind,
        params.city.as_deref(),
        params.state.as_deref(),
    );
    Json(SearchResponse {
        total: items.len(),
        items,
    })
    .into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.catalog.status().await).into_response()
}

async fn list_notes_handler(State(state): State<Arc<AppState>>, Query(params): Query<NotesParams>) -> Response {
    let Some(notes) = &state.notes else {
        return notes_disabled();
    };
    match notes.list(params.domain.as_deref(), params.name.as_deref()).await {
        Ok(found) => Json(found).into_response(),
        Err(err) => crm_error(err),
    }
}

async fn create_note_handler(State(state): State<Arc<AppState>>, Json(note): Json<NewNote>) -> Response {
    let Some(notes) = &state.notes else {
        return notes_disabled();
    };
    if note.title.trim().is_empty() {
        return error_response(StatusCode::UNPROCESSABLE_ENTITY, "note title is required".into());
    }
    match notes.create(note).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => crm_error(err),
    }
}

async fn update_note_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(update): Json<NoteUpdate>,
) -> Response {
    let Some(notes) = &state.notes else {
        return notes_disabled();
    };
    match notes.update(&id, update).await {
        Ok(updated) => Json(updated).into_response(),
        Err(err) => crm_error(err),
    }
}

async fn delete_note_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Some(notes) = &state.notes else {
        return notes_disabled();
    };
    match notes.delete(&id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => crm_error(err),
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn notes_disabled() -> Response {
    error_response(StatusCode::SERVICE_UNAVAILABLE, "CRM notes are not configured".into())
}

fn crm_error(err: CrmError) -> Response {
    let status = match &err {
        CrmError::NotConfigured(_) => StatusCode::SERVICE_UNAVAILABLE,
        CrmError::Status { status: 404, .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::BAD_GATEWAY,
    };
    warn!(error = %err, "CRM call failed");
    error_response(status, err.to_string())
}
