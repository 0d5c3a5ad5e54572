use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::Instrument as _;

use super::config::{GatewayConfig, ProxyImageConfig};
use super::input::{decode_generation_body, decode_upload};
use crate::profile::Env;
use crate::registry::ProviderRegistry;
use crate::service::GenerationService;
use crate::types::{GenerationOutcome, PollOutcome, TaskRecord, TaskStatus};
use crate::{ImagegenError, Result};

const REQUEST_ID_HEADER: &str = "x-request-id";
const MAX_REQUEST_ID_LEN: usize = 128;
const PROXY_CACHE_CONTROL: &str = "public, max-age=3600";
const MAX_PROXY_REDIRECTS: usize = 5;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct GatewayHttpState {
    service: GenerationService,
    proxy_http: reqwest::Client,
    proxy_image: Arc<ProxyImageConfig>,
    api_prefix: String,
    max_body_bytes: usize,
}

impl std::fmt::Debug for GatewayHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHttpState")
            .field("service", &self.service)
            .field("proxy_image", &self.proxy_image)
            .field("api_prefix", &self.api_prefix)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

fn proxy_client(config: &ProxyImageConfig) -> Result<reqwest::Client> {
    let allowed = config.clone();
    let redirect = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_PROXY_REDIRECTS {
            return attempt.error("too many redirects");
        }
        let host_allowed = attempt
            .url()
            .host_str()
            .is_some_and(|host| allowed.allows_host(host));
        if host_allowed {
            attempt.follow()
        } else {
            attempt.stop()
        }
    });
    reqwest::Client::builder()
        .timeout(config.timeout())
        .redirect(redirect)
        .build()
        .map_err(ImagegenError::Http)
}

impl GatewayHttpState {
    pub fn new(service: GenerationService) -> Result<Self> {
        let proxy_image = ProxyImageConfig::default();
        Ok(Self {
            service,
            proxy_http: proxy_client(&proxy_image)?,
            proxy_image: Arc::new(proxy_image),
            api_prefix: super::config::DEFAULT_API_PREFIX.to_string(),
            max_body_bytes: super::config::DEFAULT_MAX_BODY_BYTES,
        })
    }

    /// Builds the registry and service described by `config`.
    pub fn from_config(config: &GatewayConfig, env: &Env) -> Result<Self> {
        config.validate()?;
        let registry = ProviderRegistry::builtin(config, env);
        if !registry.contains(&config.default_provider) {
            return Err(ImagegenError::InvalidConfig(format!(
                "default_provider {:?} is not one of: {}",
                config.default_provider,
                registry.provider_types().collect::<Vec<_>>().join(", ")
            )));
        }
        let service = GenerationService::new(Arc::new(registry), config.default_provider.clone());
        Ok(Self::new(service)?
            .with_api_prefix(config.normalized_api_prefix())
            .with_max_body_bytes(config.max_body_bytes)
            .with_proxy_image(config.proxy_image.clone())?)
    }

    pub fn with_api_prefix(mut self, api_prefix: impl Into<String>) -> Self {
        let api_prefix = api_prefix.into();
        let trimmed = api_prefix.trim().trim_matches('/');
        self.api_prefix = if trimmed.is_empty() {
            String::new()
        } else {
            format!("/{trimmed}")
        };
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes.max(1);
        self
    }

    pub fn with_proxy_image(mut self, config: ProxyImageConfig) -> Result<Self> {
        self.proxy_http = proxy_client(&config)?;
        self.proxy_image = Arc::new(config);
        Ok(self)
    }

    pub fn service(&self) -> &GenerationService {
        &self.service
    }

    fn proxy_path(&self, image_url: &str) -> Option<String> {
        let parsed = url::Url::parse(image_url).ok()?;
        let host = parsed.host_str()?;
        if !self.proxy_image.allows_host(host) {
            return None;
        }
        let query: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("url", image_url)
            .finish();
        Some(format!("{}/proxy-image?{query}", self.api_prefix))
    }
}

pub fn router(state: GatewayHttpState) -> Router {
    let api = Router::new()
        .route("/generate", post(handle_generate))
        .route("/status/:task_id", get(handle_status))
        .route("/providers", get(handle_providers))
        .route("/upload", post(handle_upload))
        .route("/proxy-image", get(handle_proxy_image));

    let root = Router::new()
        .route("/", get(handle_index))
        .route("/health", get(health));

    let router = if state.api_prefix.is_empty() {
        root.merge(api)
    } else {
        root.nest(&state.api_prefix, api)
    };

    router
        .fallback(handle_fallback)
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(middleware::from_fn(with_request_id))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct SuccessBody<T> {
    success: bool,
    data: T,
}

#[derive(Debug, Serialize)]
struct FailureBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_type: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

fn success<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(SuccessBody {
            success: true,
            data,
        }),
    )
        .into_response()
}

/// A failure envelope with its HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_type: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            message: message.into(),
        }
    }
}

impl From<ImagegenError> for ApiError {
    fn from(err: ImagegenError) -> Self {
        let (status, error_type) = match &err {
            ImagegenError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            ImagegenError::InvalidOptions { .. } => (StatusCode::BAD_REQUEST, "invalid_options"),
            ImagegenError::UnsupportedProvider(_) => {
                (StatusCode::BAD_REQUEST, "unsupported_provider")
            }
            ImagegenError::MissingCredential { .. } | ImagegenError::InvalidConfig(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            tracing::error!(error = %err, error_type, "request failed");
        }
        Self::new(status, error_type, err.to_string())
    }
}

impl From<BytesRejection> for ApiError {
    fn from(rejection: BytesRejection) -> Self {
        Self::new(rejection.status(), "invalid_request", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::Span::current().record("error_type", self.error_type);
        (
            self.status,
            Json(FailureBody {
                success: false,
                message: self.message,
                error_type: Some(self.error_type),
            }),
        )
            .into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("imagegen-{ts_ms}-{seq}")
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN)
        .map(str::to_string)
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let Ok(value) = HeaderValue::from_str(request_id) else {
        return;
    };
    headers.insert(REQUEST_ID_HEADER, value);
}

async fn with_request_id(request: Request, next: Next) -> Response {
    let request_id = extract_request_id(request.headers()).unwrap_or_else(generate_request_id);
    let span = tracing::info_span!(
        "imagegen.request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        provider_type = tracing::field::Empty,
        status = tracing::field::Empty,
        error_type = tracing::field::Empty,
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    span.record("status", response.status().as_u16());
    span.in_scope(|| {
        tracing::info!(status = response.status().as_u16(), "request finished");
    });
    insert_request_id(response.headers_mut(), &request_id);
    response
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn handle_index(State(state): State<GatewayHttpState>) -> Json<serde_json::Value> {
    let prefix = state.api_prefix.as_str();
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "default_provider": state.service.default_provider(),
        "endpoints": {
            "generate": format!("POST {prefix}/generate"),
            "status": format!("GET {prefix}/status/{{task_id}}"),
            "providers": format!("GET {prefix}/providers"),
            "upload": format!("POST {prefix}/upload"),
            "proxy_image": format!("GET {prefix}/proxy-image?url="),
            "health": "GET /health",
        }
    }))
}

async fn handle_fallback() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "not_found", "route not found")
}

async fn handle_generate(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> ApiResult {
    let body = body?;
    let input = decode_generation_body(content_type(&headers), &body)?;
    let provider_type = input
        .provider_type
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(state.service.default_provider())
        .to_string();
    tracing::Span::current().record("provider_type", provider_type.as_str());

    match state.service.generate(input).await? {
        GenerationOutcome::Completed {
            image_base64,
            format,
        } => Ok(success(json!({
            "image_base64": image_base64,
            "format": format,
        }))),
        GenerationOutcome::Submitted {
            task_id,
            polling_url,
        } => Ok(success(json!({
            "task_id": task_id,
            "polling_url": polling_url,
        }))),
        GenerationOutcome::Failed { message } => Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            "generation_failed",
            message,
        )),
    }
}

#[derive(Debug, Default, Deserialize)]
struct StatusQuery {
    #[serde(default)]
    provider_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResult {
    image_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusView {
    task_id: String,
    provider_type: String,
    status: TaskStatus,
    result: Option<StatusResult>,
    error: Option<String>,
}

impl StatusView {
    fn new(state: &GatewayHttpState, record: TaskRecord) -> Self {
        let result = record.result.map(|result| StatusResult {
            proxy_url: state.proxy_path(&result.image_url),
            image_url: result.image_url,
        });
        Self {
            task_id: record.task_id,
            provider_type: record.provider_type,
            status: record.status,
            result,
            error: record.error,
        }
    }
}

async fn handle_status(
    State(state): State<GatewayHttpState>,
    Path(task_id): Path<String>,
    Query(query): Query<StatusQuery>,
) -> ApiResult {
    if let Some(provider_type) = query.provider_type.as_deref() {
        tracing::Span::current().record("provider_type", provider_type);
    }
    match state
        .service
        .status(query.provider_type.as_deref(), &task_id)
        .await?
    {
        PollOutcome::Status(record) => Ok(success(StatusView::new(&state, record))),
        PollOutcome::Unsupported { provider } => Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "unsupported_operation",
            format!("{provider} completes synchronously and has no task status"),
        )),
        PollOutcome::Failed { message } => Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            "remote_error",
            message,
        )),
    }
}

async fn handle_providers(State(state): State<GatewayHttpState>) -> Response {
    success(state.service.providers().await)
}

async fn handle_upload(
    headers: HeaderMap,
    body: std::result::Result<Bytes, BytesRejection>,
) -> ApiResult {
    let body = body?;
    let uploaded = decode_upload(content_type(&headers), &body)?;
    tracing::info!(
        file_size = uploaded.file_size,
        content_type = %uploaded.content_type,
        "image uploaded"
    );
    Ok(success(uploaded))
}

#[derive(Debug, Default, Deserialize)]
struct ProxyQuery {
    #[serde(default)]
    url: Option<String>,
}

async fn handle_proxy_image(
    State(state): State<GatewayHttpState>,
    Query(query): Query<ProxyQuery>,
) -> ApiResult {
    let Some(raw_url) = query.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) else {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "url parameter is required",
        ));
    };
    let url = url::Url::parse(raw_url).map_err(|err| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            format!("invalid url: {err}"),
        )
    })?;
    let host_allowed = matches!(url.scheme(), "http" | "https")
        && url
            .host_str()
            .is_some_and(|host| state.proxy_image.allows_host(host));
    if !host_allowed {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "only images from allowed hosts can be proxied",
        ));
    }

    let upstream = state.proxy_http.get(url).send().await.map_err(|err| {
        tracing::warn!(error = %err, "image proxy request failed");
        ApiError::new(
            StatusCode::BAD_GATEWAY,
            "remote_error",
            format!("failed to fetch image: {err}"),
        )
    })?;
    let upstream_status = upstream.status().as_u16();
    if !upstream.status().is_success() {
        let status = StatusCode::from_u16(upstream_status)
            .ok()
            .filter(|status| status.is_client_error() || status.is_server_error())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        return Err(ApiError::new(
            status,
            "remote_error",
            format!("failed to fetch image: HTTP {upstream_status}"),
        ));
    }

    let content_type = upstream
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| HeaderValue::from_str(value).ok())
        .unwrap_or_else(|| HeaderValue::from_static("image/jpeg"));
    let body = Body::from_stream(upstream.bytes_stream());

    let mut response = (StatusCode::OK, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static(PROXY_CACHE_CONTROL),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_unique_and_bounded() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
        assert!(a.starts_with("imagegen-"));

        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("  abc  "));
        assert_eq!(extract_request_id(&headers).as_deref(), Some("abc"));

        let long = "x".repeat(MAX_REQUEST_ID_LEN + 1);
        headers.insert(
            REQUEST_ID_HEADER,
            HeaderValue::from_str(&long).expect("ascii header"),
        );
        assert_eq!(extract_request_id(&headers), None);
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        let cases = [
            (ImagegenError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                ImagegenError::invalid_options("p", "x"),
                StatusCode::BAD_REQUEST,
            ),
            (
                ImagegenError::UnsupportedProvider("x".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                ImagegenError::MissingCredential {
                    provider: "p".into(),
                    tried: "K".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ImagegenError::InvalidResponse("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status, expected);
        }
    }
}
