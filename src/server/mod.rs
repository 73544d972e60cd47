//! HTTP query server.
//!
//! Exposes the query service over JSON:
//!
//! - `POST /query` (also `/query/`): `{"prompt": "...", "top_k": 5}` →
//!   `{"results": [{"title", "abstract", "score", "url"}]}`, where `score` is
//!   the raw squared distance (lower is closer)
//! - `GET /health`: liveness plus whether a snapshot is loaded
//! - `GET /stats`: manifest of the live snapshot
//! - `POST /reload`: publish the generation named by `snapshots/CURRENT` if
//!   it is newer than the live one (only when the server has a reloader)
//!
//! Cross-origin requests are only accepted from the configured origins and
//! only for `GET`, `POST` and `OPTIONS`.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::ServerSettings;
use crate::embedding::EmbeddingProvider;
use crate::models::SearchResult;
use crate::query::{QueryError, QueryService};
use crate::snapshot::{ReloadOutcome, SnapshotReloader};

/// Errors that can occur while starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Bad listen address or CORS origin
    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// Socket error while binding or serving
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Request payload for the query endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    /// Free-text prompt
    pub prompt: String,

    /// Number of results; the configured default when absent
    #[serde(default)]
    pub top_k: Option<i64>,
}

/// Response payload for the query endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    /// Hits, closest first
    pub results: Vec<QueryHit>,
}

/// Data transfer object for a single hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryHit {
    pub title: String,

    #[serde(rename = "abstract")]
    pub abstract_text: String,

    /// Squared Euclidean distance between prompt and paper embeddings
    pub score: f32,

    pub url: Option<String>,
}

impl From<SearchResult> for QueryHit {
    fn from(result: SearchResult) -> Self {
        Self {
            title: result.title,
            abstract_text: result.abstract_text,
            score: result.distance,
            url: result.url,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub snapshot_loaded: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub generation: String,
    pub model_name: String,
    pub dimension: usize,
    pub count: usize,
    pub excluded: usize,
    pub built_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub snapshot: Option<SnapshotStats>,
    pub default_top_k: usize,
    pub max_top_k: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub reloaded: bool,
    /// Generation live after the call
    pub generation: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// A failed request, rendered as an `ErrorResponse` body.
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "INVALID_ARGUMENT",
            message: message.into(),
        }
    }
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        let (status, code) = match &err {
            QueryError::InvalidArgument(_) => (StatusCode::BAD_REQUEST, "INVALID_ARGUMENT"),
            QueryError::ModelVersionMismatch { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "MODEL_VERSION_MISMATCH")
            }
            QueryError::NoSnapshot => (StatusCode::SERVICE_UNAVAILABLE, "NO_SNAPSHOT"),
            QueryError::IndexCorruption(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INDEX_CORRUPTION"),
            QueryError::Embedding(_) | QueryError::Index(_) => {
                error!(error = %err, "query failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "QUERY_ERROR")
            }
        };
        Self {
            status,
            code,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
                code: self.code.to_string(),
            }),
        )
            .into_response()
    }
}

/// Listen address and request defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub default_top_k: usize,
}

impl From<&ServerSettings> for ServerConfig {
    fn from(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            allowed_origins: settings.allowed_origins.clone(),
            default_top_k: settings.default_top_k,
        }
    }
}

struct AppState<E> {
    service: Arc<QueryService<E>>,
    reloader: Option<SnapshotReloader>,
    default_top_k: usize,
}

pub struct SearchServer<E> {
    config: ServerConfig,
    service: Arc<QueryService<E>>,
    reloader: Option<SnapshotReloader>,
}

/// Bind the configured host and port. The host may be a name such as
/// `localhost`; it is resolved by the resolver, not parsed as an IP.
pub async fn bind_listener(config: &ServerConfig) -> ServerResult<TcpListener> {
    TcpListener::bind((config.host.as_str(), config.port))
        .await
        .map_err(|e| {
            ServerError::InitializationError(format!(
                "cannot listen on {}:{}: {}",
                config.host, config.port, e
            ))
        })
}

impl<E: EmbeddingProvider + 'static> SearchServer<E> {
    pub fn new(service: Arc<QueryService<E>>, config: ServerConfig) -> Self {
        Self {
            config,
            service,
            reloader: None,
        }
    }

    /// Serve `POST /reload` through `reloader`. The reloader must publish
    /// into the same handle the query service reads.
    pub fn with_reloader(mut self, reloader: SnapshotReloader) -> Self {
        self.reloader = Some(reloader);
        self
    }

    /// Routes with CORS and request tracing applied.
    ///
    /// # Errors
    /// `ServerError::InitializationError` if an allowed origin is not a valid
    /// header value
    pub fn build_router(&self) -> ServerResult<Router> {
        let origins = self
            .config
            .allowed_origins
            .iter()
            .map(|origin| {
                HeaderValue::from_str(origin.trim_end_matches('/')).map_err(|e| {
                    ServerError::InitializationError(format!("invalid origin '{}': {}", origin, e))
                })
            })
            .collect::<ServerResult<Vec<_>>>()?;

        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers(Any);

        let state = Arc::new(AppState {
            service: Arc::clone(&self.service),
            reloader: self.reloader.clone(),
            default_top_k: self.config.default_top_k,
        });

        let mut router = Router::new()
            .route("/query", post(query_handler::<E>))
            .route("/query/", post(query_handler::<E>))
            .route("/health", get(health_handler::<E>))
            .route("/stats", get(stats_handler::<E>));
        if self.reloader.is_some() {
            router = router.route("/reload", post(reload_handler::<E>));
        }

        Ok(router
            .with_state(state)
            .layer(cors)
            .layer(TraceLayer::new_for_http()))
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let router = self.build_router()?;

        let listener = bind_listener(&self.config).await?;
        info!(addr = %listener.local_addr()?, "query server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("query server stopped");
        Ok(())
    }
}

// Handler functions

async fn query_handler<E: EmbeddingProvider + 'static>(
    State(state): State<Arc<AppState<E>>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> Result<Json<QueryResponse>, ApiError> {
    let Json(request) = payload.map_err(|e| ApiError::bad_request(e.body_text()))?;

    let top_k = match request.top_k {
        None => state.default_top_k,
        Some(k) if k <= 0 => return Err(ApiError::bad_request("top_k must be at least 1")),
        Some(k) => usize::try_from(k).map_err(|_| ApiError::bad_request("top_k is too large"))?,
    };

    let results = state.service.query(&request.prompt, top_k).await?;
    Ok(Json(QueryResponse {
        results: results.into_iter().map(QueryHit::from).collect(),
    }))
}

async fn health_handler<E: EmbeddingProvider + 'static>(
    State(state): State<Arc<AppState<E>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        snapshot_loaded: state.service.status().is_some(),
    })
}

async fn stats_handler<E: EmbeddingProvider + 'static>(
    State(state): State<Arc<AppState<E>>>,
) -> Json<StatsResponse> {
    let snapshot = state.service.status().map(|manifest| SnapshotStats {
        generation: manifest.generation,
        model_name: manifest.model_name,
        dimension: manifest.dimension,
        count: manifest.count,
        excluded: manifest.excluded.len(),
        built_at: manifest.built_at.to_rfc3339(),
    });
    Json(StatsResponse {
        snapshot,
        default_top_k: state.default_top_k,
        max_top_k: state.service.max_top_k(),
    })
}

async fn reload_handler<E: EmbeddingProvider + 'static>(
    State(state): State<Arc<AppState<E>>>,
) -> Result<Json<ReloadResponse>, ApiError> {
    let Some(reloader) = &state.reloader else {
        return Err(ApiError {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: "reloading is not enabled".to_string(),
        });
    };

    match reloader.reload_async().await {
        Ok(ReloadOutcome::Rejected { generation, reason }) => Err(ApiError {
            status: StatusCode::CONFLICT,
            code: "MODEL_VERSION_MISMATCH",
            message: format!("snapshot {} not published: {}", generation, reason),
        }),
        Ok(outcome) => Ok(Json(ReloadResponse {
            reloaded: matches!(outcome, ReloadOutcome::Reloaded(_)),
            generation: state.service.status().map(|manifest| manifest.generation),
        })),
        Err(e) => {
            error!(error = %e, "snapshot reload failed");
            Err(ApiError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "RELOAD_FAILED",
                message: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::VectorIndex;
    use crate::models::RecordMetadata;
    use crate::snapshot::{Snapshot, SnapshotHandle, SnapshotManifest, SnapshotStore};
    use crate::test_support::MockEmbeddingProvider;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    const DOCS: &[(&str, &str)] = &[
        ("2101.00001", "attention is all you need"),
        ("2101.00002", "deep residual learning"),
        ("2101.00003", "generative adversarial networks"),
    ];

    fn snapshot(provider: &MockEmbeddingProvider, model_name: &str) -> Snapshot {
        snapshot_of(provider, model_name, "gen-http", DOCS)
    }

    fn snapshot_of(
        provider: &MockEmbeddingProvider,
        model_name: &str,
        generation: &str,
        docs: &[(&str, &str)],
    ) -> Snapshot {
        let mut index = VectorIndex::new(provider.dimension());
        let mut metadata = Vec::new();
        for (id, text) in docs {
            index.add(&provider.vector_for(text), *id).unwrap();
            metadata.push(RecordMetadata {
                record_id: id.to_string(),
                title: format!("Paper {}", id),
                abstract_text: text.to_string(),
                url: Some(format!("http://arxiv.org/abs/{}", id)),
            });
        }
        let manifest = SnapshotManifest {
            generation: generation.to_string(),
            model_name: model_name.to_string(),
            dimension: provider.dimension(),
            count: docs.len(),
            built_at: chrono::Utc::now(),
            excluded: vec!["2101.00004".to_string()],
        };
        Snapshot::new(manifest, index, metadata).unwrap()
    }

    fn router_with(handle: SnapshotHandle, provider: MockEmbeddingProvider) -> Router {
        let service = Arc::new(QueryService::new(provider, Arc::new(handle), 20));
        let config = ServerConfig::from(&ServerSettings::default());
        SearchServer::new(service, config).build_router().unwrap()
    }

    fn router() -> Router {
        let provider = MockEmbeddingProvider::new("mock", 4);
        let handle = SnapshotHandle::with_snapshot(snapshot(&provider, "mock"));
        router_with(handle, provider)
    }

    fn post_query(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_query_returns_ranked_results() {
        let response = router()
            .oneshot(post_query("/query", r#"{"prompt": "Deep residual learning", "top_k": 2}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = body_json(response).await;
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["title"], "Paper 2101.00002");
        assert_eq!(results[0]["abstract"], "deep residual learning");
        assert_eq!(results[0]["url"], "http://arxiv.org/abs/2101.00002");
        assert_eq!(results[0]["score"], 0.0);
    }

    #[tokio::test]
    async fn test_trailing_slash_and_default_top_k() {
        let response = router()
            .oneshot(post_query("/query/", r#"{"prompt": "networks"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: QueryResponse = body_json(response).await;
        assert_eq!(body.results.len(), DOCS.len(), "default of 5 is clamped to the index size");
    }

    #[tokio::test]
    async fn test_non_positive_top_k_is_bad_request() {
        for body in [r#"{"prompt": "x", "top_k": 0}"#, r#"{"prompt": "x", "top_k": -3}"#] {
            let response = router().oneshot(post_query("/query", body)).await.unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            let error: ErrorResponse = body_json(response).await;
            assert_eq!(error.code, "INVALID_ARGUMENT");
        }
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let response = router()
            .oneshot(post_query("/query", r#"{"top_k": 3}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_unavailable() {
        let response = router_with(SnapshotHandle::new(), MockEmbeddingProvider::new("mock", 4))
            .oneshot(post_query("/query", r#"{"prompt": "anything"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.code, "NO_SNAPSHOT");
    }

    #[tokio::test]
    async fn test_model_mismatch_is_unavailable() {
        let provider = MockEmbeddingProvider::new("mock", 4);
        let handle = SnapshotHandle::with_snapshot(snapshot(&provider, "older-model"));
        let response = router_with(handle, provider)
            .oneshot(post_query("/query", r#"{"prompt": "anything"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let app = router();

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let health: HealthResponse = body_json(response).await;
        assert!(health.snapshot_loaded);

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats: StatsResponse = body_json(response).await;
        let snapshot = stats.snapshot.unwrap();
        assert_eq!(snapshot.generation, "gen-http");
        assert_eq!(snapshot.count, 3);
        assert_eq!(snapshot.excluded, 1);
        assert_eq!(stats.max_top_k, 20);
    }

    #[tokio::test]
    async fn test_cors_allows_only_listed_origins() {
        let allowed = router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "http://localhost:3000")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            allowed.headers().get("access-control-allow-origin").unwrap(),
            "http://localhost:3000"
        );

        let denied = router()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("origin", "https://evil.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(denied.headers().get("access-control-allow-origin").is_none());
    }

    #[tokio::test]
    async fn test_preflight_rejects_other_methods() {
        let response = router()
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/query")
                    .header("origin", "http://localhost:3000")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let methods = response
            .headers()
            .get("access-control-allow-methods")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(methods.contains("POST"));
        assert!(!methods.contains("DELETE"));
    }

    #[test]
    fn test_invalid_origin_fails_router_build() {
        let provider = MockEmbeddingProvider::new("mock", 4);
        let service = Arc::new(QueryService::new(provider, Arc::new(SnapshotHandle::new()), 20));
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            allowed_origins: vec!["bad\norigin".to_string()],
            default_top_k: 5,
        };
        assert!(matches!(
            SearchServer::new(service, config).build_router(),
            Err(ServerError::InitializationError(_))
        ));
    }

    fn post_empty(uri: &str) -> Request<Body> {
        Request::builder().method("POST").uri(uri).body(Body::empty()).unwrap()
    }

    struct ReloadFixture {
        dir: tempfile::TempDir,
        provider: MockEmbeddingProvider,
        app: Router,
    }

    fn reload_fixture() -> ReloadFixture {
        let dir = tempfile::tempdir().unwrap();
        let provider = MockEmbeddingProvider::new("mock", 4);
        let store = SnapshotStore::open(dir.path()).unwrap();
        store
            .lock()
            .unwrap()
            .persist(&snapshot_of(&provider, "mock", "gen-1", &DOCS[..2]))
            .unwrap();

        let handle = Arc::new(SnapshotHandle::with_snapshot(store.load_current().unwrap().unwrap()));
        let reloader = SnapshotReloader::new(store, Arc::clone(&handle), provider.config());
        let service = Arc::new(QueryService::new(provider.clone(), handle, 20));
        let app = SearchServer::new(service, ServerConfig::from(&ServerSettings::default()))
            .with_reloader(reloader)
            .build_router()
            .unwrap();
        ReloadFixture { dir, provider, app }
    }

    #[tokio::test]
    async fn test_reload_serves_generation_built_elsewhere() {
        let f = reload_fixture();

        // A separate build-index run publishes a generation with a third paper.
        let builder_store = SnapshotStore::open(f.dir.path()).unwrap();
        builder_store
            .lock()
            .unwrap()
            .persist(&snapshot_of(&f.provider, "mock", "gen-2", DOCS))
            .unwrap();

        let response = f
            .app
            .clone()
            .oneshot(post_query("/query", r#"{"prompt": "generative adversarial networks", "top_k": 1}"#))
            .await
            .unwrap();
        let before: QueryResponse = body_json(response).await;
        assert_ne!(before.results[0].title, "Paper 2101.00003");

        let response = f.app.clone().oneshot(post_empty("/reload")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let reload: ReloadResponse = body_json(response).await;
        assert!(reload.reloaded);
        assert_eq!(reload.generation.as_deref(), Some("gen-2"));

        let response = f
            .app
            .clone()
            .oneshot(post_query("/query", r#"{"prompt": "generative adversarial networks", "top_k": 1}"#))
            .await
            .unwrap();
        let after: QueryResponse = body_json(response).await;
        assert_eq!(after.results[0].title, "Paper 2101.00003");

        let response = f.app.oneshot(post_empty("/reload")).await.unwrap();
        let again: ReloadResponse = body_json(response).await;
        assert!(!again.reloaded);
        assert_eq!(again.generation.as_deref(), Some("gen-2"));
    }

    #[tokio::test]
    async fn test_reload_refuses_other_model() {
        let f = reload_fixture();
        SnapshotStore::open(f.dir.path())
            .unwrap()
            .lock()
            .unwrap()
            .persist(&snapshot_of(&f.provider, "newer-model", "gen-2", DOCS))
            .unwrap();

        let response = f.app.clone().oneshot(post_empty("/reload")).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let error: ErrorResponse = body_json(response).await;
        assert_eq!(error.code, "MODEL_VERSION_MISMATCH");

        let response = f
            .app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let stats: StatsResponse = body_json(response).await;
        assert_eq!(stats.snapshot.unwrap().generation, "gen-1");
    }

    #[tokio::test]
    async fn test_reload_route_absent_without_reloader() {
        let response = router().oneshot(post_empty("/reload")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_resolves_host_names() {
        let config = ServerConfig {
            host: "localhost".to_string(),
            port: 0,
            allowed_origins: vec![],
            default_top_k: 5,
        };
        let listener = bind_listener(&config).await.unwrap();
        assert!(listener.local_addr().unwrap().ip().is_loopback());
    }
}
