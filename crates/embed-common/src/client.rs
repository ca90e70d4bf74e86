/// HTTP client for the embedding API, used by batch jobs calling the service remotely.
///
/// Every request carries the configured bearer token and a per-request timeout. Transport
/// failures, 429 and 5xx responses are retried with capped exponential backoff plus jitter;
/// other statuses fail immediately.
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::api::{EmbedRequest, EmbeddingResponse, ErrorBody, HealthResponse, QueryEmbeddingRequest};
use crate::error::CommonError;

#[derive(Clone)]
pub struct EmbedApiClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_error_body_bytes: usize,
}

impl std::fmt::Debug for EmbedApiClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbedApiClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("max_error_body_bytes", &self.max_error_body_bytes)
            .finish()
    }
}

impl Default for EmbedApiClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8001".to_string(),
            api_key: None,
            timeout: Duration::from_secs(60),
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(5_000),
            max_error_body_bytes: 8 * 1024,
        }
    }
}

impl EmbedApiClientConfig {
    /// Build the settings from `lookup`, falling back to [`Default`] for absent variables.
    ///
    /// Values that do not parse are rejected rather than replaced by the default. A zero
    /// timeout would fail every call and is rejected too.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, CommonError> {
        let defaults = Self::default();

        let base_url = lookup("EMBED_API_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .unwrap_or(defaults.base_url);
        if base_url.is_empty() {
            return Err(CommonError::Config("EMBED_API_URL is empty".to_string()));
        }

        let api_key = lookup("EMBED_API_KEY").filter(|k| !k.trim().is_empty());

        let timeout = Duration::from_secs(parse_or(
            &lookup,
            "EMBED_TIMEOUT_SECS",
            defaults.timeout.as_secs(),
        )?);
        if timeout.is_zero() {
            return Err(CommonError::Config(
                "EMBED_TIMEOUT_SECS must be at least 1".to_string(),
            ));
        }

        let initial_backoff = Duration::from_millis(parse_or(
            &lookup,
            "EMBED_RETRY_INITIAL_MS",
            defaults.initial_backoff.as_millis() as u64,
        )?);
        let max_backoff = Duration::from_millis(parse_or(
            &lookup,
            "EMBED_RETRY_MAX_MS",
            defaults.max_backoff.as_millis() as u64,
        )?);
        if max_backoff < initial_backoff {
            return Err(CommonError::Config(format!(
                "EMBED_RETRY_MAX_MS ({}) is below EMBED_RETRY_INITIAL_MS ({})",
                max_backoff.as_millis(),
                initial_backoff.as_millis()
            )));
        }

        Ok(Self {
            base_url,
            api_key,
            timeout,
            max_retries: parse_or(&lookup, "EMBED_MAX_RETRIES", defaults.max_retries)?,
            initial_backoff,
            max_backoff,
            max_error_body_bytes: parse_or(
                &lookup,
                "EMBED_MAX_ERROR_BODY_BYTES",
                defaults.max_error_body_bytes,
            )?,
        })
    }

    fn backoff_for(&self, retry: u32) -> Duration {
        let doubled = self
            .initial_backoff
            .checked_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
            .unwrap_or(self.max_backoff);
        let delay = doubled.min(self.max_backoff);
        delay + jitter(delay / 4)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    default: T,
) -> Result<T, CommonError> {
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| CommonError::Config(format!("{name} has an invalid value: {raw:?}"))),
        None => Ok(default),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EmbedClientError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("invalid response JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("embedding service returned status={status} body={body}")]
    Status { status: StatusCode, body: String },

    #[error("EMBED_API_KEY is not configured")]
    MissingCredential,
}

#[derive(Clone)]
pub struct EmbedApiClient {
    config: EmbedApiClientConfig,
    http: reqwest::Client,
}

impl EmbedApiClient {
    pub fn new(config: EmbedApiClientConfig) -> Result<Self, EmbedClientError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("embed-common/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { config, http })
    }

    pub fn has_credential(&self) -> bool {
        self.config.api_key.is_some()
    }

    /// `POST /embed`.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedClientError> {
        let body = EmbedRequest {
            text: text.to_string(),
        };
        let response: EmbeddingResponse = self.post_authorized("/embed", &body).await?;
        Ok(response.embedding)
    }

    /// `POST /query-embedding`.
    pub async fn query_embedding(&self, query: &str) -> Result<Vec<f32>, EmbedClientError> {
        let body = QueryEmbeddingRequest {
            query: query.to_string(),
        };
        let response: EmbeddingResponse = self.post_authorized("/query-embedding", &body).await?;
        Ok(response.embedding)
    }

    /// `GET /health`. Not retried: callers use it as a quick reachability check.
    pub async fn health(&self) -> Result<HealthResponse, EmbedClientError> {
        let url = format!("{}/health", self.config.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(self.config.timeout)
            .send()
            .await?;
        Self::parse_json_response(resp, self.config.max_error_body_bytes).await
    }

    async fn post_authorized<B, T>(&self, path: &str, body: &B) -> Result<T, EmbedClientError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(EmbedClientError::MissingCredential)?;
        let url = format!("{}{path}", self.config.base_url);
        self.request_with_retry(|| async {
            let resp = self
                .http
                .post(&url)
                .bearer_auth(api_key)
                .timeout(self.config.timeout)
                .json(body)
                .send()
                .await?;
            Self::parse_json_response(resp, self.config.max_error_body_bytes).await
        })
        .await
    }

    async fn parse_json_response<T: DeserializeOwned>(
        resp: reqwest::Response,
        max_error_body_bytes: usize,
    ) -> Result<T, EmbedClientError> {
        let status = resp.status();
        if status.is_success() {
            let bytes = resp.bytes().await?;
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let body = error_excerpt(resp, max_error_body_bytes).await;
        let body = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => parsed.detail,
            Err(_) => body,
        };
        Err(EmbedClientError::Status { status, body })
    }

    /// Run `send` until it succeeds, fails with a non-transient error, or `max_retries`
    /// retries are spent.
    async fn request_with_retry<T, Fut, F>(&self, mut send: F) -> Result<T, EmbedClientError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, EmbedClientError>>,
    {
        let mut retries = 0;
        loop {
            let err = match send().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if retries >= self.config.max_retries || !err.is_transient() {
                return Err(err);
            }
            let delay = self.config.backoff_for(retries);
            retries += 1;
            warn!(
                retry = retries,
                of = self.config.max_retries,
                delay_ms = delay.as_millis(),
                error = %err,
                "embedding service call failed, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl EmbedClientError {
    /// Whether the same request may succeed if sent again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            Self::InvalidJson(_) | Self::MissingCredential => false,
        }
    }
}

/// Up to `max` of extra delay so that clients failing together do not retry in lockstep.
fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let seed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or_default();
    Duration::from_millis(seed % (max_ms + 1))
}

/// Collect at most `limit` bytes of an error body, chunk by chunk, so an oversized error page
/// is never buffered in full.
async fn error_excerpt(mut resp: reqwest::Response, limit: usize) -> String {
    let mut excerpt = Vec::with_capacity(limit.min(1024));
    while excerpt.len() < limit {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - excerpt.len());
                excerpt.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "error body could not be read");
                break;
            }
        }
    }
    String::from_utf8_lossy(&excerpt).into_owned()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;

    #[derive(Clone)]
    struct Upstream {
        hits: Arc<AtomicUsize>,
        failures_before_success: usize,
    }

    async fn embed(
        State(upstream): State<Upstream>,
        headers: HeaderMap,
        Json(req): Json<EmbedRequest>,
    ) -> Result<Json<EmbeddingResponse>, (axum::http::StatusCode, Json<ErrorBody>)> {
        let n = upstream.hits.fetch_add(1, Ordering::SeqCst);
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if auth != "Bearer test-key" {
            return Err((
                axum::http::StatusCode::UNAUTHORIZED,
                Json(ErrorBody {
                    detail: "invalid bearer token".to_string(),
                }),
            ));
        }
        if n < upstream.failures_before_success {
            return Err((
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorBody {
                    detail: "model unavailable".to_string(),
                }),
            ));
        }
        Ok(Json(EmbeddingResponse {
            embedding: vec![req.text.len() as f32; 4],
        }))
    }

    async fn query(Json(req): Json<QueryEmbeddingRequest>) -> Json<EmbeddingResponse> {
        Json(EmbeddingResponse {
            embedding: vec![req.query.len() as f32; 4],
        })
    }

    async fn garbage() -> &'static str {
        "not json"
    }

    async fn huge_error() -> (axum::http::StatusCode, String) {
        (axum::http::StatusCode::BAD_REQUEST, "x".repeat(64 * 1024))
    }

    async fn spawn_upstream(failures_before_success: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route("/embed", post(embed))
            .route("/query-embedding", post(query))
            .route("/health", get(|| async { Json(HealthResponse::ok()) }))
            .route("/garbage", post(garbage))
            .route("/huge-error", post(huge_error))
            .with_state(Upstream {
                hits: Arc::clone(&hits),
                failures_before_success,
            });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    fn client(base_url: String, api_key: Option<&str>, max_retries: u32) -> EmbedApiClient {
        EmbedApiClient::new(EmbedApiClientConfig {
            base_url,
            api_key: api_key.map(str::to_string),
            timeout: Duration::from_secs(5),
            max_retries,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            max_error_body_bytes: 1024,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_embed_success() {
        let (url, hits) = spawn_upstream(0).await;
        let client = client(url, Some("test-key"), 0);
        assert!(client.has_credential());
        assert_eq!(client.embed("abc").await.unwrap(), vec![3.0; 4]);
        assert_eq!(client.query_embedding("ab").await.unwrap(), vec![2.0; 4]);
        assert_eq!(client.health().await.unwrap(), HealthResponse::ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let (url, hits) = spawn_upstream(2).await;
        let client = client(url, Some("test-key"), 2);
        assert_eq!(client.embed("a").await.unwrap(), vec![1.0; 4]);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_status_error_after_retries_exhausted() {
        let (url, hits) = spawn_upstream(usize::MAX).await;
        let client = client(url, Some("test-key"), 1);
        match client.embed("a").await {
            Err(EmbedClientError::Status { status, body }) => {
                assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
                assert_eq!(body, "model unavailable");
            }
            other => panic!("expected status error, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unauthorized_is_not_retried() {
        let (url, hits) = spawn_upstream(0).await;
        let client = client(url, Some("wrong"), 3);
        match client.embed("a").await {
            Err(EmbedClientError::Status { status, .. }) => {
                assert_eq!(status, StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected 401, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_credential_makes_no_request() {
        let (url, hits) = spawn_upstream(0).await;
        let client = client(url, None, 3);
        assert!(matches!(
            client.embed("a").await,
            Err(EmbedClientError::MissingCredential)
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_json() {
        let (url, _) = spawn_upstream(0).await;
        let client = client(url, Some("test-key"), 3);
        let result: Result<EmbeddingResponse, _> = client
            .post_authorized("/garbage", &EmbedRequest { text: "a".into() })
            .await;
        assert!(matches!(result, Err(EmbedClientError::InvalidJson(_))));
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client(format!("http://{addr}"), Some("test-key"), 0);
        assert!(matches!(
            client.embed("a").await,
            Err(EmbedClientError::Request(_))
        ));
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let config = EmbedApiClientConfig {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_millis(1000),
            ..EmbedApiClientConfig::default()
        };
        let first = config.backoff_for(0);
        assert!(first >= Duration::from_millis(200) && first <= Duration::from_millis(250));
        let second = config.backoff_for(1);
        assert!(second >= Duration::from_millis(400) && second <= Duration::from_millis(500));
        for retry in [10, 31, 32, u32::MAX] {
            let d = config.backoff_for(retry);
            assert!(d >= Duration::from_millis(1000), "retry {retry}: {d:?}");
            assert!(d <= Duration::from_millis(1250), "retry {retry}: {d:?}");
        }
    }

    fn config_from(vars: &[(&str, &str)]) -> Result<EmbedApiClientConfig, CommonError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EmbedApiClientConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_config_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.base_url, "http://localhost:8001");
        assert_eq!(config.api_key, None);
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.max_error_body_bytes, 8 * 1024);
    }

    #[test]
    fn test_config_overrides() {
        let config = config_from(&[
            ("EMBED_API_URL", "http://embed:9000/ "),
            ("EMBED_API_KEY", "k"),
            ("EMBED_TIMEOUT_SECS", "5"),
            ("EMBED_MAX_RETRIES", "0"),
            ("EMBED_RETRY_INITIAL_MS", "10"),
            ("EMBED_RETRY_MAX_MS", "10"),
            ("EMBED_MAX_ERROR_BODY_BYTES", "64"),
        ])
        .unwrap();
        assert_eq!(config.base_url, "http://embed:9000");
        assert_eq!(config.api_key.as_deref(), Some("k"));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.initial_backoff, Duration::from_millis(10));
        assert_eq!(config.max_error_body_bytes, 64);
    }

    #[test]
    fn test_config_blank_key_is_absent() {
        let config = config_from(&[("EMBED_API_KEY", "  ")]).unwrap();
        assert_eq!(config.api_key, None);
    }

    #[test]
    fn test_config_rejects_invalid_numbers() {
        for (name, value) in [
            ("EMBED_TIMEOUT_SECS", "sixty"),
            ("EMBED_MAX_RETRIES", "-1"),
            ("EMBED_RETRY_INITIAL_MS", "1.5"),
            ("EMBED_RETRY_MAX_MS", ""),
            ("EMBED_MAX_ERROR_BODY_BYTES", "lots"),
        ] {
            let err = config_from(&[(name, value)]).unwrap_err();
            assert!(
                matches!(err, CommonError::Config(ref m) if m.contains(name)),
                "{name}={value:?} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_config_rejects_zero_timeout() {
        assert!(matches!(
            config_from(&[("EMBED_TIMEOUT_SECS", "0")]),
            Err(CommonError::Config(_))
        ));
    }

    #[test]
    fn test_config_rejects_inverted_backoff() {
        assert!(matches!(
            config_from(&[("EMBED_RETRY_INITIAL_MS", "500"), ("EMBED_RETRY_MAX_MS", "100")]),
            Err(CommonError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_error_body_is_truncated() {
        let (url, _) = spawn_upstream(0).await;
        let mut client = client(url, Some("test-key"), 0);
        client.config.max_error_body_bytes = 16;
        let result: Result<EmbeddingResponse, _> = client
            .post_authorized("/huge-error", &EmbedRequest { text: "a".into() })
            .await;
        match result {
            Err(EmbedClientError::Status { status, body }) => {
                assert_eq!(status, StatusCode::BAD_REQUEST);
                assert_eq!(body, "x".repeat(16));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn test_transient_errors() {
        let status = |status| EmbedClientError::Status {
            status,
            body: String::new(),
        };
        assert!(status(StatusCode::TOO_MANY_REQUESTS).is_transient());
        assert!(status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!status(StatusCode::UNAUTHORIZED).is_transient());
        assert!(!status(StatusCode::UNPROCESSABLE_ENTITY).is_transient());
        assert!(!EmbedClientError::MissingCredential.is_transient());
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = EmbedApiClientConfig {
            api_key: Some("hunter2".to_string()),
            ..EmbedApiClientConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
