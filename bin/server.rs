// AYUSH Terminology Bridge - Web Server
// REST API over the registry, mapping store and resolver

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use ayush_bridge::config::ENV_CONFIG;
use ayush_bridge::index::parse_property_filter;
use ayush_bridge::{
    apply_icd11_refresh, load_icd11_json, logging, BridgeConfig, BridgeError, CodeLookup, CodeEntry,
    CodeRegistry, CodeSystem, Deadline, EntryStatus, Icd11Module, MappingStats, MappingStore, MemoryCache,
    SearchQuery, SearchResult, ShadowCache, StorageContext, TranslationResolver, TranslationResponse,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
struct AppState {
    store: Arc<StorageContext>,
    cache: Option<Arc<MemoryCache>>,
    config: Arc<BridgeConfig>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl ToString) -> Self {
        ApiError {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        let status = match &err {
            BridgeError::NotFound { .. } => StatusCode::NOT_FOUND,
            // Never returned by the engine; forward references arrive as unresolved matches.
            BridgeError::UnresolvedReference { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::ValidationFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BridgeError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
        };
        if status == StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %err, "storage failure");
        }
        ApiError {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::err(self.message))).into_response()
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

/// Cancels the request deadline when the handler future is dropped
/// (client went away), which interrupts the running SQLite statement.
struct CancelOnDrop(Deadline);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

/// Run one engine call on the blocking pool under the configured deadline
async fn run_engine<T, F>(state: &AppState, call: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&StorageContext, Option<&dyn ShadowCache>, &Deadline) -> ayush_bridge::Result<T> + Send + 'static,
{
    let deadline = state.config.deadline();
    let _guard = CancelOnDrop(deadline.clone());
    let state = state.clone();

    let joined = tokio::task::spawn_blocking(move || {
        let cache = state.cache.as_deref().map(|cache| cache as &dyn ShadowCache);
        call(state.store.as_ref(), cache, &deadline)
    })
    .await;

    match joined {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            tracing::error!(error = %e, "engine task failed");
            Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                message: "internal error".to_string(),
            })
        }
    }
}

fn parse_system(raw: &str) -> Result<CodeSystem, ApiError> {
    raw.parse().map_err(ApiError::bad_request)
}

// ============================================================================
// API Handlers
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    revision: i64,
}

/// GET /api/health - Health check
async fn health_check(State(state): State<AppState>) -> ApiResult<HealthResponse> {
    let revision = run_engine(&state, |store, _, deadline| store.revision(deadline)).await?;
    Ok(Json(ApiResponse::ok(HealthResponse {
        status: "OK",
        version: ayush_bridge::VERSION,
        revision,
    })))
}

/// GET /api/codes/:system/:code - One code entry
async fn get_code(
    State(state): State<AppState>,
    Path((system, code)): Path<(String, String)>,
) -> ApiResult<CodeEntry> {
    let system = parse_system(&system)?;
    let max_page_size = state.config.max_page_size;
    let entry = run_engine(&state, move |store, cache, deadline| {
        let registry = CodeRegistry::new(store).with_max_page_size(max_page_size);
        match cache {
            Some(cache) => registry.with_cache(cache).get(system, &code, deadline),
            None => registry.get(system, &code, deadline),
        }
    })
    .await?;
    Ok(Json(ApiResponse::ok(entry)))
}

/// GET /api/codes/:system/:code/lookup - Entry with parent, children and mappings
async fn lookup_code(
    State(state): State<AppState>,
    Path((system, code)): Path<(String, String)>,
) -> ApiResult<CodeLookup> {
    let system = parse_system(&system)?;
    let lookup = run_engine(&state, move |store, _, deadline| {
        CodeRegistry::new(store).lookup(system, &code, deadline)
    })
    .await?;
    Ok(Json(ApiResponse::ok(lookup)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams {
    q: Option<String>,
    system: Option<String>,
    module: Option<String>,
    parent: Option<String>,
    category: Option<String>,
    status: Option<String>,
    /// Comma-separated code=value pairs
    property: Option<String>,
    page: Option<usize>,
    page_size: Option<usize>,
}

impl SearchParams {
    fn into_query(self) -> Result<SearchQuery, ApiError> {
        let defaults = SearchQuery::default();
        let mut query = SearchQuery::new().page(
            self.page.unwrap_or(defaults.page),
            self.page_size.unwrap_or(defaults.page_size),
        );
        query.text = self.q.filter(|q| !q.trim().is_empty());
        query.system = self.system.as_deref().map(parse_system).transpose()?;
        query.module = self
            .module
            .as_deref()
            .map(|raw| raw.parse::<Icd11Module>().map_err(ApiError::bad_request))
            .transpose()?;
        query.status = self
            .status
            .as_deref()
            .map(|raw| raw.parse::<EntryStatus>().map_err(ApiError::bad_request))
            .transpose()?;
        query.parent = self.parent;
        query.category = self.category;

        for raw in self.property.iter().flat_map(|p| p.split(',')) {
            let (code, value) = parse_property_filter(raw)
                .ok_or_else(|| ApiError::bad_request(format!("property filter must be code=value, got '{}'", raw)))?;
            query = query.property(code, value);
        }
        Ok(query)
    }
}

/// GET /api/search - Ranked, paginated code search
async fn search_codes(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<SearchResult> {
    let query = params.into_query()?;
    let max_page_size = state.config.max_page_size;
    let result = run_engine(&state, move |store, _, deadline| {
        CodeRegistry::new(store)
            .with_max_page_size(max_page_size)
            .search(&query, deadline)
    })
    .await?;
    Ok(Json(ApiResponse::ok(result)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranslateRequest {
    code: String,
    source_system: String,
    target_system: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchTranslateRequest {
    codes: Vec<String>,
    source_system: String,
    target_system: String,
}

/// POST /api/translate - Translate one code
async fn translate(
    State(state): State<AppState>,
    Json(request): Json<TranslateRequest>,
) -> ApiResult<TranslationResponse> {
    let source = parse_system(&request.source_system)?;
    let target = parse_system(&request.target_system)?;
    let code = request.code;

    let response = run_engine(&state, move |store, cache, deadline| {
        let resolver = TranslationResolver::new(store);
        match cache {
            Some(cache) => resolver.with_cache(cache).translate(&code, source, target, deadline),
            None => resolver.translate(&code, source, target, deadline),
        }
    })
    .await?;
    Ok(Json(ApiResponse::ok(response)))
}

/// POST /api/translate/batch - Translate many codes, results in input order
async fn translate_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchTranslateRequest>,
) -> ApiResult<Vec<TranslationResponse>> {
    let source = parse_system(&request.source_system)?;
    let target = parse_system(&request.target_system)?;
    let codes = request.codes;

    let responses = run_engine(&state, move |store, cache, deadline| {
        let resolver = TranslationResolver::new(store);
        match cache {
            Some(cache) => resolver.with_cache(cache).translate_batch(&codes, source, target, deadline),
            None => resolver.translate_batch(&codes, source, target, deadline),
        }
    })
    .await?;
    Ok(Json(ApiResponse::ok(responses)))
}

/// GET /api/mappings/stats - Mapping statistics
async fn mapping_stats(State(state): State<AppState>) -> ApiResult<MappingStats> {
    let stats = run_engine(&state, |store, _, deadline| MappingStore::new(store).stats(deadline)).await?;
    Ok(Json(ApiResponse::ok(stats)))
}

// ============================================================================
// Scheduled ICD-11 refresh
// ============================================================================

/// Re-apply the feed file on every tick. The remote fetch that produces the
/// file runs outside this process.
async fn icd11_sync_loop(state: AppState, feed: PathBuf) {
    let mut ticker = tokio::time::interval(state.config.icd11_sync_interval());

    loop {
        ticker.tick().await;

        let store = state.store.clone();
        let deadline = state.config.deadline();
        let path = feed.clone();
        let outcome = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
            let entries = load_icd11_json(&path)?;
            Ok(apply_icd11_refresh(&store, &entries, &deadline)?)
        })
        .await;

        match outcome {
            Ok(Ok(report)) => tracing::info!(
                feed = %feed.display(),
                inserted = report.inserted,
                updated = report.updated,
                unchanged = report.unchanged,
                rejected = report.rejected.len(),
                "ICD-11 refresh applied"
            ),
            Ok(Err(e)) => tracing::warn!(feed = %feed.display(), error = %e, "ICD-11 refresh failed"),
            Err(e) => tracing::error!(error = %e, "ICD-11 refresh task failed"),
        }
    }
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os(ENV_CONFIG).map(PathBuf::from);
    let config = BridgeConfig::load(config_path.as_deref())?;
    logging::init_logging(&config.log)?;

    println!("🌐 AYUSH Terminology Bridge - Web Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    let store = StorageContext::open(&config.database)
        .with_context(|| format!("Failed to open database: {}", config.database.display()))?;
    println!("✓ Database: {}", store.location());

    let cache = (config.cache_capacity > 0).then(|| Arc::new(MemoryCache::new(config.cache_capacity)));

    let state = AppState {
        store: Arc::new(store),
        cache,
        config: Arc::new(config),
    };

    if let Some(feed) = state.config.icd11_feed.clone() {
        println!(
            "✓ ICD-11 refresh every {}s from {}",
            state.config.icd11_sync_interval_secs,
            feed.display()
        );
        tokio::spawn(icd11_sync_loop(state.clone(), feed));
    }

    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/codes/:system/:code", get(get_code))
        .route("/codes/:system/:code/lookup", get(lookup_code))
        .route("/search", get(search_codes))
        .route("/translate", post(translate))
        .route("/translate/batch", post(translate_batch))
        .route("/mappings/stats", get(mapping_stats));

    let bind = state.config.bind.clone();
    let app = Router::new()
        .nest("/api", api_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind to {}", bind))?;

    println!("✓ Listening on http://{}", bind);
    tracing::info!(%bind, "server started");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
