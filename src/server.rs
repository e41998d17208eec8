//! HTTP front end for the chatbot.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chatbot/search` | Answer `{"query": "..."}` |
//! | `POST` | `/chatbot/refresh` | Rebuild the index from the knowledge directory |
//! | `GET`  | `/chatbot/status` | Index state, generation, and last build error |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! A successful search returns the tier under `type`:
//!
//! ```json
//! { "type": "faq", "results": [{ "text": "...", "source": "faq.md", "section": "Shipping", "confidence": 0.91 }] }
//! ```
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "empty_query", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `empty_query` (400), `index_not_ready` (503),
//! `search_failed` (500), `refresh_failed` (500), `configuration_missing` (500),
//! `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser widget can
//! call the API directly.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use kb_harness_core::models::{Answer, QueryResult, Tier};
use kb_harness_core::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::chatbot::Chatbot;
use crate::config::Config;

#[derive(Clone)]
struct AppState {
    chatbot: Arc<Chatbot>,
}

/// Build the chatbot from `config` and serve it on `[server].bind`.
///
/// The index is not built until the first query or refresh.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let chatbot = Arc::new(Chatbot::from_config(config)?);
    run_server_with(chatbot, &config.server.bind).await
}

/// Serve an already-constructed chatbot. Runs until the process exits.
pub async fn run_server_with(chatbot: Arc<Chatbot>, bind_addr: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "chatbot server listening");
    axum::serve(listener, router(chatbot)).await?;
    Ok(())
}

/// The route table, exposed so callers can embed or test it.
pub fn router(chatbot: Arc<Chatbot>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chatbot/search", post(handle_search))
        .route("/chatbot/refresh", post(handle_refresh))
        .route("/chatbot/status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { chatbot })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::EmptyQuery => StatusCode::BAD_REQUEST,
            Error::IndexNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        // Missing credentials get their own code so operators can tell them
        // apart from transient failures.
        let code = match err.root_cause() {
            root @ Error::ConfigurationMissing(_) => root.code(),
            _ => err.code(),
        };
        if status.is_server_error() {
            tracing::error!(code, error = %err, "request failed");
        }
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /chatbot/search ============

#[derive(Deserialize)]
struct SearchRequest {
    #[serde(default)]
    query: Option<String>,
}

#[derive(Serialize)]
struct SearchResponse {
    #[serde(rename = "type")]
    tier: Tier,
    results: Vec<Answer>,
}

impl From<QueryResult> for SearchResponse {
    fn from(result: QueryResult) -> Self {
        Self {
            tier: result.tier,
            results: result.results,
        }
    }
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let query = req.query.unwrap_or_default();
    let result = state.chatbot.search(&query).await?;
    Ok(Json(result.into()))
}

// ============ POST /chatbot/refresh ============

#[derive(Serialize)]
struct RefreshResponse {
    success: bool,
    message: String,
    generation: u64,
    passages: usize,
}

async fn handle_refresh(State(state): State<AppState>) -> Result<Json<RefreshResponse>, AppError> {
    let handle = state.chatbot.refresh().await?;
    Ok(Json(RefreshResponse {
        success: true,
        message: "Vector store refreshed".to_string(),
        generation: handle.generation(),
        passages: handle.passage_count(),
    }))
}

// ============ GET /chatbot/status ============

#[derive(Serialize)]
struct StatusResponse {
    state: &'static str,
    building: bool,
    generation: Option<u64>,
    passages: Option<usize>,
    built_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

async fn handle_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let builder = state.chatbot.builder();
    let active = builder.active();
    Json(StatusResponse {
        state: builder.state().as_str(),
        building: builder.is_building(),
        generation: active.as_ref().map(|h| h.generation()),
        passages: active.as_ref().map(|h| h.passage_count()),
        built_at: active.as_ref().map(|h| h.built_at()),
        last_error: builder.last_error().map(|e| e.to_string()),
    })
}
