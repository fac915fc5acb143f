//! HTTP JSON surface for the vault, base path `/v1`.
//!
//! One route per public vault operation, optional bearer-token auth, and
//! error-kind → status-code mapping. Vault operations are synchronous, so
//! every handler goes through `spawn_blocking`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::config::VaultConfig;
use crate::error::EngramError;
use crate::memory::recall::RecallQuery;
use crate::memory::types::{MemoryStatus, MemoryType, Source, SourceKind};
use crate::vault::{RememberOptions, Vault};

#[derive(Clone)]
struct AppState {
    vault: Arc<Vault>,
    bearer_token: Option<String>,
}

/// Start the HTTP server and block until ctrl-c.
pub async fn serve(config: &VaultConfig, vault: Arc<Vault>) -> anyhow::Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let state = AppState {
        vault,
        bearer_token: config.server.bearer_token.clone(),
    };

    let router = Router::new()
        .route("/v1/memories", post(remember))
        .route("/v1/memories/recall", get(recall_get).post(recall_post))
        .route("/v1/ask", post(ask))
        .route("/v1/briefing", get(briefing_get).post(briefing_post))
        .route("/v1/surface", post(surface))
        .route("/v1/memories/:id", delete(forget))
        .route("/v1/memories/:id/neighbors", get(neighbors))
        .route("/v1/consolidate", post(consolidate))
        .route("/v1/stats", get(stats))
        .route("/v1/entities", get(entities))
        .route("/v1/contradictions", get(contradictions))
        .route("/health", get(health))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "engram API listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            tracing::info!("shutting down API server");
        })
        .await?;

    Ok(())
}

// ── Error mapping ────────────────────────────────────────────────────────────

struct ApiError(EngramError);

impl From<EngramError> for ApiError {
    fn from(e: EngramError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EngramError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            EngramError::NotFound(_) => StatusCode::NOT_FOUND,
            EngramError::Conflict(_) => StatusCode::CONFLICT,
            EngramError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = Result<Response, ApiError>;

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = &state.bearer_token else {
        return Ok(());
    };
    let provided = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if provided == Some(expected.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response())
    }
}

/// Run a blocking vault closure off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, EngramError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError(EngramError::Unavailable(format!("worker task failed: {e}"))))?
        .map_err(ApiError)
}

macro_rules! authorize {
    ($state:expr, $headers:expr) => {
        if let Err(resp) = check_auth(&$state, &$headers) {
            return Ok(resp);
        }
    };
}

// ── Request bodies ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RememberBody {
    content: String,
    #[serde(rename = "type")]
    memory_type: Option<String>,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    salience: Option<f64>,
    status: Option<String>,
    source: Option<SourceBody>,
}

#[derive(Deserialize)]
struct SourceBody {
    kind: Option<String>,
    reference: Option<String>,
    session: Option<String>,
}

#[derive(Deserialize, Default)]
struct RecallBody {
    context: String,
    #[serde(default)]
    entities: Vec<String>,
    #[serde(default)]
    topics: Vec<String>,
    #[serde(default)]
    types: Vec<String>,
    limit: Option<usize>,
    spread: Option<bool>,
    spread_hops: Option<usize>,
    spread_decay: Option<f64>,
    at: Option<String>,
}

#[derive(Deserialize)]
struct RecallParams {
    context: String,
    limit: Option<usize>,
    spread: Option<bool>,
    at: Option<String>,
}

#[derive(Deserialize, Default)]
struct AskBody {
    question: String,
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct BriefingBody {
    context: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct BriefingParams {
    context: Option<String>,
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct SurfaceBody {
    context: String,
    #[serde(default)]
    active_entities: Vec<String>,
    #[serde(default)]
    active_topics: Vec<String>,
    limit: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ForgetParams {
    hard: Option<bool>,
}

#[derive(Deserialize, Default)]
struct NeighborParams {
    depth: Option<usize>,
}

#[derive(Deserialize, Default)]
struct ConsolidateBody {
    budget_ms: Option<u64>,
}

#[derive(Deserialize, Default)]
struct LimitParams {
    limit: Option<usize>,
}

fn parse_remember(body: RememberBody) -> Result<(String, RememberOptions), EngramError> {
    let memory_type = body
        .memory_type
        .map(|t| t.parse::<MemoryType>())
        .transpose()
        .map_err(EngramError::InvalidPayload)?;
    let status = body
        .status
        .map(|s| s.parse::<MemoryStatus>())
        .transpose()
        .map_err(EngramError::InvalidPayload)?;
    let source = body
        .source
        .map(|s| {
            Ok::<_, EngramError>(Source {
                kind: s
                    .kind
                    .map(|k| k.parse::<SourceKind>())
                    .transpose()
                    .map_err(EngramError::InvalidPayload)?
                    .unwrap_or_default(),
                reference: s.reference,
                session: s.session,
            })
        })
        .transpose()?;

    Ok((
        body.content,
        RememberOptions {
            memory_type,
            entities: body.entities,
            topics: body.topics,
            salience: body.salience,
            status,
            source,
        },
    ))
}

fn parse_recall(body: RecallBody, default_limit: usize) -> Result<RecallQuery, EngramError> {
    let mut query = RecallQuery::new(body.context, body.limit.unwrap_or(default_limit));
    query.entities = body.entities;
    query.topics = body.topics;
    query.types = body
        .types
        .iter()
        .map(|t| t.parse::<MemoryType>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(EngramError::InvalidPayload)?;
    query.spread = body.spread.unwrap_or(false);
    query.spread_hops = body.spread_hops;
    query.spread_decay = body.spread_decay;
    query.at = body.at;
    Ok(query)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn remember(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RememberBody>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let id = blocking(move || {
        let (content, opts) = parse_remember(body)?;
        vault.remember(&content, opts)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"id": id}))).into_response())
}

async fn recall_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RecallBody>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let default_limit = state.vault.config().recall.default_limit;
    let results = blocking(move || {
        let query = parse_recall(body, default_limit)?;
        vault.recall(&query)
    })
    .await?;
    Ok(Json(serde_json::json!({"results": results})).into_response())
}

async fn recall_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<RecallParams>,
) -> ApiResult {
    authorize!(state, headers);
    let body = RecallBody {
        context: params.context,
        limit: params.limit,
        spread: params.spread,
        at: params.at,
        ..Default::default()
    };
    let vault = Arc::clone(&state.vault);
    let default_limit = state.vault.config().recall.default_limit;
    let results = blocking(move || {
        let query = parse_recall(body, default_limit)?;
        vault.recall(&query)
    })
    .await?;
    Ok(Json(serde_json::json!({"results": results})).into_response())
}

async fn ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AskBody>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let default_limit = state.vault.config().recall.default_limit;
    let answer = blocking(move || {
        vault.ask(&body.question, body.limit.unwrap_or(default_limit))
    })
    .await?;
    Ok(Json(answer).into_response())
}

async fn briefing_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<BriefingParams>,
) -> ApiResult {
    authorize!(state, headers);
    run_briefing(state, params.context, params.limit).await
}

async fn briefing_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<BriefingBody>,
) -> ApiResult {
    authorize!(state, headers);
    run_briefing(state, body.context, body.limit).await
}

async fn run_briefing(
    state: AppState,
    context: Option<String>,
    limit: Option<usize>,
) -> ApiResult {
    let vault = Arc::clone(&state.vault);
    let default_limit = state.vault.config().recall.default_limit;
    let briefing = blocking(move || {
        vault.briefing(context.as_deref(), limit.unwrap_or(default_limit))
    })
    .await?;
    Ok(Json(briefing).into_response())
}

async fn surface(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SurfaceBody>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let default_limit = state.vault.config().recall.default_limit;
    let surfaced = blocking(move || {
        vault.surface(
            &body.context,
            &body.active_entities,
            &body.active_topics,
            body.limit.unwrap_or(default_limit),
        )
    })
    .await?;
    Ok(Json(serde_json::json!({"results": surfaced})).into_response())
}

async fn forget(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<ForgetParams>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let hard = params.hard.unwrap_or(false);
    blocking(move || vault.forget(&id, hard)).await?;
    Ok(Json(serde_json::json!({"forgotten": true, "hard": hard})).into_response())
}

async fn neighbors(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(params): Query<NeighborParams>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let depth = params.depth.unwrap_or(2);
    let hits = blocking(move || vault.neighbors(&id, depth)).await?;
    Ok(Json(serde_json::json!({"neighbors": hits})).into_response())
}

async fn consolidate(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ConsolidateBody>>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let budget_ms = body.and_then(|Json(b)| b.budget_ms);
    let report = blocking(move || vault.consolidate(budget_ms)).await?;
    Ok(Json(report).into_response())
}

async fn stats(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let stats = blocking(move || vault.stats()).await?;
    Ok(Json(stats).into_response())
}

async fn entities(State(state): State<AppState>, headers: HeaderMap) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let entities = blocking(move || vault.entities()).await?;
    Ok(Json(serde_json::json!({"entities": entities})).into_response())
}

async fn contradictions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<LimitParams>,
) -> ApiResult {
    authorize!(state, headers);
    let vault = Arc::clone(&state.vault);
    let limit = params.limit.unwrap_or(50);
    let pairs = blocking(move || vault.contradictions(limit)).await?;
    Ok(Json(serde_json::json!({"contradictions": pairs})).into_response())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}
