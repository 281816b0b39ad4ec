// 🌐 Query API - axum routes over the serving repository
//
// GET /api/health
// GET /api/operators?page&limit&search
// GET /api/operators/:entity_id
// GET /api/operators/:entity_id/expenses
// GET /api/statistics

use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, warn};

use crate::identifier::{format_identifier, normalize_identifier};
use crate::serving::{HistoryPoint, OperatorPage, OperatorView, Repository, Statistics};

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 200;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
}

impl AppState {
    pub fn new(repo: Repository) -> Self {
        AppState {
            repo: Arc::new(repo),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Failures a handler can report
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorBody { error: message })).into_response()
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub page: Option<i64>,
    pub limit: Option<i64>,
    pub search: Option<String>,
}

impl ListParams {
    /// (page, limit) with page >= 1 and limit in 1..=200
    pub fn clamped(&self) -> (usize, usize) {
        let page = self.page.unwrap_or(1).max(1) as usize;
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE as i64)
            .clamp(1, MAX_PAGE_SIZE as i64) as usize;
        (page, limit)
    }
}

// ============================================================================
// HANDLERS
// ============================================================================

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_operators(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Json<OperatorPage> {
    let (page, limit) = params.clamped();
    debug!("list operators page={} limit={} search={:?}", page, limit, params.search);
    Json(state.repo.list_operators(page, limit, params.search.as_deref()))
}

async fn get_operator(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Result<Json<OperatorView>, ApiError> {
    state
        .repo
        .get_operator(&entity_id)
        .map(Json)
        .ok_or_else(|| {
            let shown = format_identifier(&normalize_identifier(&entity_id)).unwrap_or(entity_id);
            ApiError::NotFound(format!("operator {} not found", shown))
        })
}

async fn get_history(
    State(state): State<AppState>,
    Path(entity_id): Path<String>,
) -> Json<Vec<HistoryPoint>> {
    Json(state.repo.get_history(&entity_id))
}

async fn get_statistics(State(state): State<AppState>) -> Json<Statistics> {
    Json(state.repo.get_statistics())
}

// ============================================================================
// ROUTER
// ============================================================================

/// CORS restricted to the configured origins. Unparsable origins are dropped.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any)
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/operators", get(list_operators))
        .route("/operators/:entity_id", get(get_operator))
        .route("/operators/:entity_id/expenses", get(get_history))
        .route("/statistics", get(get_statistics))
        .with_state(state);

    Router::new()
        .nest("/api", api_routes)
        .layer(cors_layer(cors_origins))
}
