use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use service_search::{DiscoveryKind, ServiceRecord, ServiceSearch};
use tokio::sync::watch;

#[derive(Clone)]
pub struct AppState {
    pub search: ServiceSearch,
    pub fingerprint_rx: watch::Receiver<String>,
    pub target_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(search: ServiceSearch, target_id: Option<String>) -> Self {
        Self {
            fingerprint_rx: search.fingerprint(),
            search,
            target_id,
            started_at: Utc::now(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub searching: bool,
    pub services: usize,
    pub fingerprint: String,
    pub target_id: Option<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    pub kind: Option<DiscoveryKind>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/status", get(get_status))
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/services/:id", get(get_service))
        .with_state(state)
}

async fn get_status(State(state): State<AppState>) -> Result<Json<StatusResponse>, StatusCode> {
    let searching = state.search.is_searching().await.map_err(unavailable)?;
    let services = state.search.services().await.map_err(unavailable)?;

    Ok(Json(StatusResponse {
        searching,
        services: services.len(),
        fingerprint: state.fingerprint_rx.borrow().clone(),
        target_id: state.target_id.clone(),
        started_at: state.started_at,
    }))
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<Vec<ServiceRecord>>, StatusCode> {
    let mut services = state.search.services().await.map_err(unavailable)?;
    if let Some(kind) = params.kind {
        services.retain(|s| s.kind == kind);
    }
    Ok(Json(services))
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.fingerprint_rx.borrow().clone()
}

async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<ServiceRecord>, StatusCode> {
    state
        .search
        .services()
        .await
        .map_err(unavailable)?
        .into_iter()
        .find(|s| s.id == id && params.kind.map_or(true, |kind| s.kind == kind))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

fn unavailable(e: service_search::SearchError) -> StatusCode {
    tracing::error!("Failed to query search: {}", e);
    StatusCode::SERVICE_UNAVAILABLE
}
