//! JSON HTTP API over a [`CorpusService`].

use std::path::PathBuf;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::chunking::Chunker;
use crate::config::Settings;
use crate::error::CorpusError;
use crate::query::{ProjectionMethod, SearchHit};
use crate::service::CorpusService;
use crate::types::LayoutDims;

/// Serves the API on `settings.server.bind` until Ctrl-C.
pub async fn serve(settings: Settings) -> anyhow::Result<()> {
    let service = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || CorpusService::open(&settings)).await??
    };
    let app = router(service, settings.server.static_dir.clone());

    let listener = tokio::net::TcpListener::bind(&settings.server.bind).await?;
    info!(address = %listener.local_addr()?, "serving corpus API");

    let ct = CancellationToken::new();
    let shutdown = ct.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        shutdown.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await?;
    Ok(())
}

/// The API routes, plus `static_dir` served at `/` when given.
pub fn router(service: CorpusService, static_dir: Option<PathBuf>) -> Router {
    let mut app = Router::new()
        .route("/health", get(health_check))
        .route("/api/ingest_text", post(ingest_text))
        .route("/api/search", get(search))
        .route("/api/reset", post(reset))
        .route("/api/points", get(points))
        .route("/api/stats", get(stats))
        .with_state(service);

    if let Some(dir) = static_dir {
        let index = dir.join("index.html");
        let assets = ServeDir::new(dir)
            .append_index_html_on_directories(true)
            .fallback(ServeFile::new(index));
        app = app.fallback_service(assets);
    }

    app.layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// A [`CorpusError`] rendered as a JSON error body.
struct ApiError(CorpusError);

impl From<CorpusError> for ApiError {
    fn from(e: CorpusError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CorpusError::NotFound { .. } => StatusCode::NOT_FOUND,
            CorpusError::DimensionMismatch { .. } | CorpusError::Config { .. } => {
                StatusCode::BAD_REQUEST
            }
            CorpusError::EmbeddingUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            CorpusError::SettleAbandoned => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(code = %self.0.status_code(), error = %self.0, "request failed");
        let body = json!({
            "error": self.0.to_string(),
            "code": self.0.status_code(),
            "suggestions": self.0.recovery_suggestions(),
        });
        (status, Json(body)).into_response()
    }
}

async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct IngestTextRequest {
    filename: String,
    content: String,
    /// Overrides the configured policy with word windows
    tokens_per_chunk: Option<usize>,
    overlap: Option<usize>,
}

async fn ingest_text(
    State(service): State<CorpusService>,
    Json(body): Json<IngestTextRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let chunker = match (body.tokens_per_chunk, body.overlap, service.chunker()) {
        (None, None, _) => None,
        (size, overlap, Chunker::TokenOverlap { size: s, overlap: o }) => {
            Some(Chunker::TokenOverlap {
                size: size.unwrap_or(s),
                overlap: overlap.unwrap_or(o),
            })
        }
        (size, overlap, _) => Some(Chunker::TokenOverlap {
            size: size.unwrap_or(1000),
            overlap: overlap.unwrap_or(0),
        }),
    };
    let summary = service
        .ingest_text(body.filename, body.content, chunker)
        .await?;
    Ok(Json(summary))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    query: String,
    #[serde(default = "default_k")]
    k: usize,
    /// 2 or 3; defaults to the corpus layout
    dims: Option<usize>,
    /// `layout` (alias `umap`) or `pca`
    method: Option<String>,
}

fn default_k() -> usize {
    30
}

/// A search hit as plotted by a client: `z` only for 3-D coordinates.
#[derive(Debug, Serialize)]
struct SearchPoint {
    id: u32,
    source: String,
    chunk_index: u32,
    score: f32,
    text_preview: String,
    x: f32,
    y: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    z: Option<f32>,
}

impl From<SearchHit> for SearchPoint {
    fn from(hit: SearchHit) -> Self {
        let coord = |axis: usize| hit.coords.get(axis).copied();
        Self {
            id: hit.id.get(),
            x: coord(0).unwrap_or(0.0),
            y: coord(1).unwrap_or(0.0),
            z: coord(2),
            score: hit.score.get(),
            source: hit.source,
            chunk_index: hit.chunk_index,
            text_preview: hit.preview,
        }
    }
}

async fn search(
    State(service): State<CorpusService>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let method = match params.method.as_deref() {
        Some(name) => name.parse()?,
        None => ProjectionMethod::default(),
    };
    let dims = params.dims.map(LayoutDims::try_from).transpose()?;
    let hits = service
        .search_projected(params.query, params.k, method, dims)
        .await?;
    let points: Vec<SearchPoint> = hits.into_iter().map(SearchPoint::from).collect();
    Ok(Json(json!({ "points": points })))
}

async fn reset(State(service): State<CorpusService>) -> Result<impl IntoResponse, ApiError> {
    service.reset().await?;
    Ok(Json(json!({ "reset": true })))
}

async fn points(State(service): State<CorpusService>) -> Result<impl IntoResponse, ApiError> {
    let points = service.points().await?;
    Ok(Json(json!({ "points": points })))
}

async fn stats(State(service): State<CorpusService>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(service.stats().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::corpus::{Corpus, CorpusConfig};
    use crate::embedding::HashingEmbedder;
    use crate::types::EmbeddingDimension;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(dir: &TempDir) -> Router {
        let mut config = CorpusConfig::default();
        config.settle.background = false;
        config.settle.global_every = 0;
        let corpus = Corpus::open_at(dir.path(), config).unwrap();
        let embedder = Arc::new(HashingEmbedder::new(EmbeddingDimension::new(64).unwrap()));
        router(
            CorpusService::new(corpus, embedder, Chunker::Paragraphs, 2),
            None,
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let temp_dir = TempDir::new().unwrap();
        let response = app(&temp_dir)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_ingest_then_search() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);

        let request = Request::post("/api/ingest_text")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "filename": "sea.txt",
                    "content": "the whale swims in the sea\n\ncats sleep on mats"
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let summary = body_json(response).await;
        assert_eq!(summary["chunks"], 2);
        assert_eq!(summary["total_chunks"], 2);

        let response = app
            .oneshot(
                Request::get("/api/search?query=whale&k=1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["points"].as_array().unwrap().len(), 1);
        assert_eq!(body["points"][0]["source"], "sea.txt");
    }

    /// Point shape a 2-D plotting client deserializes.
    #[derive(Debug, Deserialize)]
    struct Point2D {
        id: i64,
        source: String,
        chunk_index: i64,
        score: f32,
        text_preview: String,
        x: f32,
        y: f32,
    }

    #[derive(Debug, Deserialize)]
    struct Points<P> {
        points: Vec<P>,
    }

    async fn ingest_sample(app: &Router) {
        let request = Request::post("/api/ingest_text")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({
                    "filename": "sea.txt",
                    "content": "the whale swims in the sea\n\nships sail the ocean\n\ncats sleep on mats"
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    async fn get(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_search_points_match_plot_shape() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);
        ingest_sample(&app).await;

        let response = get(&app, "/api/search?query=the%20whale%20swims%20in%20the%20sea&k=2&dims=2").await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Points<Point2D> = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(body.points.len(), 2);
        let top = &body.points[0];
        assert!(top.id > 0);
        assert_eq!(top.source, "sea.txt");
        assert_eq!(top.chunk_index, 0);
        assert_eq!(top.score, 1.0);
        assert_eq!(top.text_preview, "the whale swims in the sea");
        assert!(top.x.is_finite() && top.y.is_finite());

        let raw: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(raw["points"][0].get("z").is_none());
    }

    #[tokio::test]
    async fn test_layout_dims_mismatch_is_bad_request() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);
        ingest_sample(&app).await;

        let response = get(&app, "/api/search?query=whale&dims=3").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "CONFIG_ERROR");

        let response = get(&app, "/api/search?query=whale&dims=4&method=pca").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_pca_search_serves_three_dims() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);
        ingest_sample(&app).await;

        let response = get(&app, "/api/search?query=whale&k=3&dims=3&method=pca").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        let points = body["points"].as_array().unwrap();
        assert_eq!(points.len(), 3);
        assert!(points.iter().all(|p| p["z"].is_number()));
    }

    #[tokio::test]
    async fn test_unknown_method_is_bad_request() {
        let temp_dir = TempDir::new().unwrap();
        let app = app(&temp_dir);
        ingest_sample(&app).await;

        let response = get(&app, "/api/search?query=whale&method=tsne").await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_unembeddable_query_is_json_error() {
        let temp_dir = TempDir::new().unwrap();
        let response = app(&temp_dir)
            .oneshot(
                Request::get("/api/search?query=%21%21")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["code"], "EMBEDDING_UNAVAILABLE");
    }
}
