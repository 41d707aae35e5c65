//! Axum JSON API over the grant store, vector search, summaries, and the ETL trigger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chrono::Utc;
use grantmatch_core::StoredGrant;
use grantmatch_storage::{GrantStore, DEFAULT_LIST_LIMIT};
use grantmatch_sync::{
    build_embedder, build_summarizer, Embedder, EtlOptions, EtlPipeline, EtlSettings, Summarizer,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "grantmatch-web";

const SEARCH_LIMIT: i64 = 20;
const SIMILAR_LIMIT: i64 = 10;

#[derive(Clone, Default)]
pub struct AppState {
    pub store: Option<GrantStore>,
    pub embedder: Option<Arc<dyn Embedder>>,
    pub summarizer: Option<Arc<dyn Summarizer>>,
    pub pipeline: Option<Arc<EtlPipeline>>,
}

impl AppState {
    pub fn from_settings(settings: &EtlSettings, store: Option<GrantStore>) -> anyhow::Result<Self> {
        let pipeline = EtlPipeline::from_settings(settings, store.clone())?;
        Ok(Self {
            store,
            embedder: build_embedder(settings)?,
            summarizer: build_summarizer(settings)?,
            pipeline: Some(Arc::new(pipeline)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityStatus {
    Excellent,
    Good,
    Fair,
    NoResults,
}

/// Buckets the best similarity score of a neighbour search.
pub fn similarity_status(top_score: Option<f64>) -> SimilarityStatus {
    match top_score {
        None => SimilarityStatus::NoResults,
        Some(s) if s >= 0.8 => SimilarityStatus::Excellent,
        Some(s) if s >= 0.6 => SimilarityStatus::Good,
        Some(_) => SimilarityStatus::Fair,
    }
}

#[derive(Debug, Serialize)]
pub struct ScoredGrant {
    #[serde(flatten)]
    pub grant: StoredGrant,
    pub similarity_score: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchMetadata {
    total_results: usize,
    query: String,
}

#[derive(Debug, Serialize)]
struct SearchResponse<T> {
    message: String,
    results: Vec<T>,
    metadata: SearchMetadata,
}

#[derive(Debug, Serialize)]
struct BaseGrant {
    id: i64,
    title: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimilarMetadata {
    total_results: usize,
    based_on_grant_id: i64,
    top_similarity_score: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SimilarResponse {
    message: String,
    status: SimilarityStatus,
    base_grant: BaseGrant,
    results: Vec<ScoredGrant>,
    metadata: SimilarMetadata,
}

#[derive(Debug, Deserialize, Default)]
struct SearchQuery {
    query: Option<String>,
}

/// Body of `POST /api/etl/run`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EtlRunRequest {
    #[serde(alias = "rows")]
    pub page_size: Option<usize>,
    pub agencies: Option<Vec<String>>,
    pub keywords: Option<Vec<String>>,
    pub classification_codes: Option<Vec<String>>,
    pub dry_run: bool,
    pub skip_embeddings: bool,
}

impl From<EtlRunRequest> for EtlOptions {
    fn from(req: EtlRunRequest) -> Self {
        EtlOptions {
            page_size: req.page_size,
            agencies: req.agencies,
            keywords: req.keywords,
            classification_codes: req.classification_codes,
            dry_run: req.dry_run,
            skip_embeddings: req.skip_embeddings,
            top_n: None,
        }
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/grants", get(list_grants_handler))
        .route("/api/grants/health", get(health_handler))
        .route("/api/grants/search", get(search_handler))
        .route("/api/grants/{id}/similar", get(similar_handler))
        .route("/api/grants/{id}/summarize", patch(summarize_handler))
        .route("/api/etl/run", post(etl_run_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let settings = EtlSettings::from_env();
    let store = match &settings.database_url {
        Some(url) => Some(GrantStore::connect(url).await?),
        None => {
            warn!("DATABASE_URL not set; grant routes will report the store as unavailable");
            None
        }
    };
    let state = AppState::from_settings(&settings, store)?;

    let scheduler = match &state.pipeline {
        Some(pipeline) => pipeline.maybe_build_scheduler(&settings).await?,
        None => None,
    };
    if let Some(scheduler) = &scheduler {
        scheduler.start().await.context("starting etl scheduler")?;
    }

    let listener = TcpListener::bind(("0.0.0.0", settings.web_port))
        .await
        .with_context(|| format!("binding port {}", settings.web_port))?;
    info!(port = settings.web_port, "grantmatch api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutting down");
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let timestamp = Utc::now();
    let check = match &state.store {
        Some(store) => store.health().await,
        None => Err(anyhow::anyhow!("database not configured")),
    };
    match check {
        Ok(()) => Json(json!({
            "status": "healthy",
            "database": "connected",
            "timestamp": timestamp,
        }))
        .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "unhealthy",
                "database": "disconnected",
                "error": format!("{err:#}"),
                "timestamp": timestamp,
            })),
        )
            .into_response(),
    }
}

async fn list_grants_handler(State(state): State<Arc<AppState>>) -> Response {
    let store = match require_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };
    match store.list_grants(DEFAULT_LIST_LIMIT).await {
        Ok(grants) => Json(grants).into_response(),
        Err(err) => server_error(err),
    }
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchQuery>,
) -> Response {
    let query = params.query.unwrap_or_default().trim().to_string();
    if query.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Search query is required.");
    }
    let store = match require_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };

    let results = match &state.embedder {
        Some(embedder) => {
            let vector = match embedder.embed(&query).await {
                Ok(vector) => vector,
                Err(err) => return server_error(anyhow::Error::new(err).context("embedding search query")),
            };
            store.search_by_embedding(&vector, SEARCH_LIMIT).await.map(|rows| {
                rows.into_iter()
                    .map(|(grant, similarity_score)| ScoredGrant {
                        grant,
                        similarity_score,
                    })
                    .collect::<Vec<_>>()
            })
        }
        None => store.search_text(&query, SEARCH_LIMIT).await.map(|rows| {
            rows.into_iter()
                .map(|grant| ScoredGrant {
                    grant,
                    similarity_score: 0.0,
                })
                .collect::<Vec<_>>()
        }),
    };

    match results {
        Ok(results) => Json(SearchResponse {
            message: format!("Found {} grants matching \"{}\"", results.len(), query),
            metadata: SearchMetadata {
                total_results: results.len(),
                query,
            },
            results,
        })
        .into_response(),
        Err(err) => server_error(err),
    }
}

async fn similar_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(grant_id) = id.trim().parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid grant ID format");
    };
    let store = match require_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };

    let base = match store.get_grant(grant_id).await {
        Ok(Some(grant)) => grant,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Grant not found"),
        Err(err) => return server_error(err),
    };
    let neighbours = match store.find_similar(grant_id, SIMILAR_LIMIT).await {
        Ok(rows) => rows,
        Err(err) => return server_error(err),
    };

    let results: Vec<ScoredGrant> = neighbours
        .into_iter()
        .map(|(grant, similarity_score)| ScoredGrant {
            grant,
            similarity_score,
        })
        .collect();
    let top = results.first().map(|r| r.similarity_score);
    let message = if results.is_empty() {
        format!("No similar grants found for \"{}\"", base.title)
    } else {
        format!("Found {} grants similar to \"{}\"", results.len(), base.title)
    };

    Json(SimilarResponse {
        message,
        status: similarity_status(top),
        base_grant: BaseGrant {
            id: base.id,
            title: base.title,
        },
        metadata: SimilarMetadata {
            total_results: results.len(),
            based_on_grant_id: grant_id,
            top_similarity_score: top,
        },
        results,
    })
    .into_response()
}

async fn summarize_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let Ok(grant_id) = id.trim().parse::<i64>() else {
        return error_response(StatusCode::BAD_REQUEST, "Invalid grant ID format");
    };
    let Some(summarizer) = &state.summarizer else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "Summarizer is not configured");
    };
    let store = match require_store(&state) {
        Ok(store) => store,
        Err(resp) => return resp,
    };

    let grant = match store.get_grant(grant_id).await {
        Ok(Some(grant)) => grant,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Grant not found"),
        Err(err) => return server_error(err),
    };
    let summary = match summarizer.summarize(&grant).await {
        Ok(summary) => summary,
        Err(err) => return server_error(err),
    };
    match store.update_summary(grant_id, &summary).await {
        Ok(Some(updated)) => Json(updated).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Grant not found"),
        Err(err) => server_error(err),
    }
}

async fn etl_run_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let request: EtlRunRequest = if body.iter().all(u8::is_ascii_whitespace) {
        EtlRunRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(req) => req,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, &format!("Invalid ETL options: {err}"))
            }
        }
    };
    let Some(pipeline) = &state.pipeline else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "ETL pipeline is not configured");
    };

    info!(?request, "etl run triggered via api");
    match pipeline.run(&EtlOptions::from(request)).await {
        Ok(summary) => Json(json!({
            "message": "ETL pipeline ran successfully.",
            "grantsProcessed": summary.grants_processed,
            "summary": summary,
        }))
        .into_response(),
        Err(err) => {
            error!(error = ?err, "etl run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "message": "ETL pipeline failed.",
                    "error": format!("{err:#}"),
                })),
            )
                .into_response()
        }
    }
}

fn require_store(state: &AppState) -> Result<&GrantStore, Response> {
    state
        .store
        .as_ref()
        .ok_or_else(|| error_response(StatusCode::SERVICE_UNAVAILABLE, "Database is not configured"))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({
            "error": "Internal server error",
            "details": format!("{err:#}"),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use grantmatch_adapters::{GrantSource, SourceError};
    use grantmatch_core::{Classification, OpportunityDetail, RawOpportunity, Synopsis};
    use grantmatch_sync::EtlRules;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tower::ServiceExt;

    struct OneGrantSource;

    #[async_trait]
    impl GrantSource for OneGrantSource {
        fn source_name(&self) -> &'static str {
            "fake"
        }

        async fn search_posted(
            &self,
            start_record: usize,
            _rows: usize,
        ) -> Result<Vec<RawOpportunity>, SourceError> {
            if start_record > 0 {
                return Ok(Vec::new());
            }
            Ok(vec![RawOpportunity {
                id: "1".into(),
                title: "AI Research Initiative".into(),
                agency_code: "NSF".into(),
                opp_status: "posted".into(),
                close_date: "12/31/2099".into(),
                ..Default::default()
            }])
        }

        async fn fetch_detail(&self, opportunity_id: &str) -> Result<OpportunityDetail, SourceError> {
            Ok(OpportunityDetail {
                id: opportunity_id.into(),
                synopsis: Some(Synopsis {
                    description: Some("Supports emerging technology.".into()),
                    ..Default::default()
                }),
                classifications: vec![Classification {
                    code: Some("47.041".into()),
                    title: Some("Engineering".into()),
                }],
                ..Default::default()
            })
        }
    }

    fn state_with_pipeline() -> AppState {
        AppState {
            pipeline: Some(Arc::new(EtlPipeline::new(
                Arc::new(OneGrantSource),
                EtlRules::default(),
            ))),
            ..Default::default()
        }
    }

    async fn send(app: Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn similarity_status_buckets() {
        assert_eq!(similarity_status(None), SimilarityStatus::NoResults);
        assert_eq!(similarity_status(Some(0.92)), SimilarityStatus::Excellent);
        assert_eq!(similarity_status(Some(0.8)), SimilarityStatus::Excellent);
        assert_eq!(similarity_status(Some(0.65)), SimilarityStatus::Good);
        assert_eq!(similarity_status(Some(0.2)), SimilarityStatus::Fair);
    }

    #[test]
    fn etl_request_accepts_camel_case_and_rows_alias() {
        let req: EtlRunRequest =
            serde_json::from_str(r#"{"rows": 25, "dryRun": true, "agencies": ["NSF"]}"#).unwrap();
        let options = EtlOptions::from(req);
        assert_eq!(options.page_size, Some(25));
        assert!(options.dry_run);
        assert_eq!(options.agencies, Some(vec!["NSF".to_string()]));
    }

    #[tokio::test]
    async fn handler_smoke_search_requires_query() {
        let (status, body) = send(app(AppState::default()), get("/api/grants/search?query=")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Search query is required.");
    }

    #[tokio::test]
    async fn handler_smoke_similar_rejects_bad_id() {
        let (status, body) = send(app(AppState::default()), get("/api/grants/abc/similar")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Invalid grant ID format");
    }

    #[tokio::test]
    async fn handler_smoke_health_reports_missing_database() {
        let (status, body) = send(app(AppState::default()), get("/api/grants/health")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["status"], "unhealthy");
        assert_eq!(body["database"], "disconnected");
    }

    #[tokio::test]
    async fn handler_smoke_list_without_store_is_unavailable() {
        let (status, _) = send(app(AppState::default()), get("/api/grants")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn handler_smoke_summarize_without_summarizer() {
        let req = Request::builder()
            .method("PATCH")
            .uri("/api/grants/7/summarize")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(app(AppState::default()), req).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn handler_smoke_etl_dry_run() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/etl/run")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"dryRun": true}"#))
            .unwrap();
        let (status, body) = send(app(state_with_pipeline()), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["grantsProcessed"], 1);
        assert_eq!(body["summary"]["final_stage"], "done");
    }

    #[tokio::test]
    async fn handler_smoke_etl_failure_is_500() {
        // A loading run with no store attached fails before fetching.
        let req = Request::builder()
            .method("POST")
            .uri("/api/etl/run")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(app(state_with_pipeline()), req).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["message"], "ETL pipeline failed.");
        assert!(body["error"].as_str().unwrap().contains("no grant store"));
    }

    #[tokio::test]
    async fn handler_smoke_etl_rejects_malformed_body() {
        let req = Request::builder()
            .method("POST")
            .uri("/api/etl/run")
            .body(Body::from("{not json"))
            .unwrap();
        let (status, _) = send(app(state_with_pipeline()), req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
