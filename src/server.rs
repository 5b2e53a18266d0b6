//! HTTP API for the web frontend.
//!
//! Three JSON endpoints back the upload and chat flows, plus a health
//! check:
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/analyze` | Summary + pricing plans for a document (always 200) |
//! | `POST` | `/api/extract-url` | Fetch a web page and extract title + text |
//! | `POST` | `/api/chat` | Answer a question against the supplied sources |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `/api/analyze` and `/api/chat` tolerate an absent model credential and
//! upstream failures — they respond 200 with the deterministic local
//! fallback. Error responses are `{ "error": "<message>" }` with a 4xx
//! or 5xx status.
//!
//! All origins, methods, and headers are permitted to support
//! browser-based clients.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::analyze;
use crate::answer;
use crate::completion;
use crate::config::Config;
use crate::error::Error;
use crate::extract;
use crate::models::{PricingPlan, Source, SourceType};
use crate::normalize::normalize;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    client: reqwest::Client,
}

/// Start the HTTP API on the configured bind address.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let client = completion::http_client(config.model.timeout_secs)?;
    let state = AppState {
        config: Arc::new(config.clone()),
        client,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/analyze", post(handle_analyze))
        .route("/api/extract-url", post(handle_extract_url))
        .route("/api/chat", post(handle_chat))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("kachat API listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error responses ============

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

struct AppError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for AppError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::Validation(_) | Error::Fetch(_) | Error::Extraction(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Authorization(_) => StatusCode::FORBIDDEN,
            Error::RemoteService(_) => StatusCode::BAD_GATEWAY,
            Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError {
            status,
            message: e.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        message: message.into(),
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

// ============ POST /api/analyze ============

#[derive(Deserialize)]
struct AnalyzeRequest {
    #[serde(rename = "fileName")]
    file_name: String,
    text: String,
}

#[derive(Serialize)]
struct AnalyzeResponse {
    summary: String,
    plans: Vec<PricingPlan>,
}

/// Always 200: a missing credential or upstream failure degrades to the
/// local fallback inside [`analyze::analyze`].
async fn handle_analyze(
    State(state): State<AppState>,
    Json(req): Json<AnalyzeRequest>,
) -> Json<AnalyzeResponse> {
    let text = normalize(&req.text);
    let analysis =
        analyze::analyze(&state.config.model, &state.client, &req.file_name, &text).await;
    Json(AnalyzeResponse {
        summary: analysis.summary,
        plans: analysis.plans,
    })
}

// ============ POST /api/extract-url ============

#[derive(Deserialize)]
struct ExtractUrlRequest {
    url: String,
}

#[derive(Serialize)]
struct ExtractUrlResponse {
    title: String,
    text: String,
}

async fn handle_extract_url(
    State(state): State<AppState>,
    Json(req): Json<ExtractUrlRequest>,
) -> Result<Json<ExtractUrlResponse>, AppError> {
    if req.url.trim().is_empty() {
        return Err(bad_request("url must not be empty"));
    }
    let extracted = extract::extract_url(&state.client, &req.url).await?;
    Ok(Json(ExtractUrlResponse {
        title: extracted.title,
        text: extracted.text,
    }))
}

// ============ POST /api/chat ============

#[derive(Deserialize)]
struct ChatRequest {
    question: String,
    #[serde(rename = "selectedSourceName", default)]
    selected_source_name: Option<String>,
    #[serde(default)]
    sources: Vec<WireSource>,
}

/// Source payload as the frontend sends it — a projection of the stored
/// entity.
#[derive(Deserialize)]
struct WireSource {
    name: String,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(rename = "pricingPlans", default)]
    pricing_plans: Vec<PricingPlan>,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, AppError> {
    if req.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let candidates: Vec<Source> = req
        .sources
        .into_iter()
        .enumerate()
        .map(|(i, w)| Source {
            id: i.to_string(),
            name: w.name,
            text: w.text,
            summary: w.summary,
            pricing_plans: w.pricing_plans,
            storage_path: None,
            source_type: SourceType::Text,
            inherited_from: None,
            created_at: 0,
        })
        .collect();

    let selected = req
        .selected_source_name
        .as_deref()
        .and_then(|name| candidates.iter().find(|s| s.name == name));

    let reply = answer::answer(
        &state.config.model,
        &state.client,
        &req.question,
        selected,
        &candidates,
    )
    .await;

    Ok(Json(ChatResponse { answer: reply }))
}
