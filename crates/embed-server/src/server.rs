/// HTTP surface of the embedding service.
///
/// Routes:
/// - `POST /embed` (`{text}`) and `POST /query-embedding` (`{query}`): bearer token required,
///   both encode through the same shared model
/// - `GET /health`: unauthenticated liveness check, independent of model state
///
/// The auth middleware runs before any body extraction, so unauthenticated callers never
/// touch the model or have their payload parsed.
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use embed_common::api::{EmbedRequest, EmbeddingResponse, HealthResponse, QueryEmbeddingRequest};
use embed_common::auth::AuthGate;
use embed_common::lazy::LazyModel;

use crate::error::ServiceError;

/// Stateless request handling over the shared auth gate and lazily loaded model.
#[derive(Clone)]
pub struct EmbeddingService {
    auth: AuthGate,
    model: LazyModel,
}

impl EmbeddingService {
    pub fn new(auth: AuthGate, model: LazyModel) -> Self {
        Self { auth, model }
    }

    pub fn auth(&self) -> &AuthGate {
        &self.auth
    }

    pub fn model(&self) -> &LazyModel {
        &self.model
    }

    /// Encode a document-shaped text. Callers must have passed the auth gate.
    pub async fn embed(&self, text: String) -> Result<EmbeddingResponse, ServiceError> {
        let embedding = self.encode(text).await?;
        Ok(EmbeddingResponse { embedding })
    }

    /// Encode a query-shaped text. Same model and vector space as [`Self::embed`].
    pub async fn query_embedding(&self, query: String) -> Result<EmbeddingResponse, ServiceError> {
        let embedding = self.encode(query).await?;
        Ok(EmbeddingResponse { embedding })
    }

    pub fn health(&self) -> HealthResponse {
        HealthResponse::ok()
    }

    async fn encode(&self, text: String) -> Result<Vec<f32>, ServiceError> {
        let model = self.model.get_or_init().await?;
        debug!(chars = text.chars().count(), "encoding text");
        let embedding = tokio::task::spawn_blocking(move || model.encode(&text))
            .await
            .map_err(|e| ServiceError::Encoding(format!("spawn_blocking join error: {e}")))??;
        Ok(embedding)
    }
}

pub fn router(service: EmbeddingService) -> Router {
    let protected = Router::new()
        .route("/embed", post(embed))
        .route("/query-embedding", post(query_embedding))
        .route_layer(middleware::from_fn_with_state(
            service.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .with_state(service)
        .layer(TraceLayer::new_for_http())
}

async fn require_bearer(
    State(service): State<EmbeddingService>,
    request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    if let Err(e) = service.auth().authorize_header(header_value) {
        warn!(error = %e, path = %request.uri().path(), "rejected unauthorized request");
        return ServiceError::Unauthorized(e).into_response();
    }
    next.run(request).await
}

async fn embed(
    State(service): State<EmbeddingService>,
    Json(request): Json<EmbedRequest>,
) -> Result<Json<EmbeddingResponse>, ServiceError> {
    let response = service.embed(request.text).await.inspect_err(|e| {
        warn!(error = %e, "embed failed");
    })?;
    Ok(Json(response))
}

async fn query_embedding(
    State(service): State<EmbeddingService>,
    Json(request): Json<QueryEmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ServiceError> {
    let response = service.query_embedding(request.query).await.inspect_err(|e| {
        warn!(error = %e, "query embedding failed");
    })?;
    Ok(Json(response))
}

async fn health(State(service): State<EmbeddingService>) -> Json<HealthResponse> {
    Json(service.health())
}
