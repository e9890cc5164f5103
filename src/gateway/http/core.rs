use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::Router;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use super::{ChatRequest, Gateway, GatewayError, GraphPoint, StatsSnapshot, redact_credential};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub const REQUEST_ID_HEADER: &str = "x-nexus-request-id";
pub const CACHE_HEADER: &str = "x-cache";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Payment-session creation, reached through `POST /api/checkout` after the
/// credential has been authenticated.
#[async_trait]
pub trait CheckoutHandler: Send + Sync {
    async fn checkout(
        &self,
        credential: &str,
        payload: Value,
    ) -> Result<Value, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Arc<Gateway>,
    admin_token: Option<String>,
    upgrade_limit: i64,
    checkout: Option<Arc<dyn CheckoutHandler>>,
}

impl std::fmt::Debug for GatewayHttpState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayHttpState")
            .field("gateway", &self.gateway)
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("upgrade_limit", &self.upgrade_limit)
            .field("checkout", &self.checkout.is_some())
            .finish()
    }
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway) -> Self {
        Self::from_shared(Arc::new(gateway))
    }

    pub fn from_shared(gateway: Arc<Gateway>) -> Self {
        Self {
            gateway,
            admin_token: None,
            upgrade_limit: super::config::DEFAULT_UPGRADE_LIMIT,
            checkout: None,
        }
    }

    /// Mounts the admin routes.
    pub fn with_admin_token(mut self, token: impl Into<String>) -> Self {
        self.admin_token = Some(token.into());
        self
    }

    pub fn with_upgrade_limit(mut self, limit: i64) -> Self {
        self.upgrade_limit = limit;
        self
    }

    pub fn with_checkout_handler(mut self, handler: Arc<dyn CheckoutHandler>) -> Self {
        self.checkout = Some(handler);
        self
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    snapshot: StatsSnapshot,
    graph_data: Vec<GraphPoint>,
}

/// Browser clients call the `/api` routes cross-origin; `/health` and the
/// admin surface stay same-origin.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::POST,
            Method::GET,
            Method::OPTIONS,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers([
            header::ACCEPT,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            HeaderName::from_static("x-csrf-token"),
            header::AUTHORIZATION,
        ])
        .expose_headers([
            HeaderName::from_static(CACHE_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ])
}

pub fn router(state: GatewayHttpState) -> Router {
    let api = Router::new()
        .route("/api/stats", get(stats))
        .route("/api/chat", post(handle_chat))
        .route("/api/checkout", post(handle_checkout))
        .layer(cors_layer());

    let mut router = Router::new().route("/health", get(health)).merge(api);

    if state.admin_token.is_some() {
        router = router.route(
            "/admin/credentials/:credential/upgrade",
            post(upgrade_credential),
        );
    }

    router.with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn stats(
    State(state): State<GatewayHttpState>,
) -> Result<Json<StatsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let snapshot = state.gateway.stats().await.map_err(|err| {
        tracing::warn!(operation = "stats.snapshot", error = %err, "stats unavailable");
        error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "stats_unavailable",
            err.to_string(),
        )
    })?;
    // The graph is decoration; a failing usage store leaves it empty.
    let graph_data = state.gateway.graph().await.unwrap_or_else(|err| {
        tracing::warn!(operation = "usage.graph", error = %err, "usage graph unavailable");
        Vec::new()
    });
    Ok(Json(StatsResponse {
        snapshot,
        graph_data,
    }))
}

// Header helpers shared by the chat, checkout and admin routes.

/// Trimmed, non-empty value of `name`.
fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Token from `Authorization: Bearer <token>` (or lowercase `bearer`).
fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?
        .trim()
        .to_string();
    let rest = auth
        .strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))?;
    let token = rest.trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// First hop of `x-forwarded-for`, else the socket peer without its port.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = extract_header(headers, "x-forwarded-for") {
        if let Some(first) = forwarded
            .split(',')
            .map(str::trim)
            .find(|hop| !hop.is_empty())
        {
            return first.to_string();
        }
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `nexus-<unix ms>-<seq>`, used when the client sends no `x-request-id`.
fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("nexus-{ts_ms}-{seq}")
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    let value = match HeaderValue::from_str(value) {
        Ok(value) => value,
        Err(_) => return,
    };
    headers.insert(name, value);
}

fn map_gateway_error(err: &GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let message = match err {
        GatewayError::RateLimited { .. } => "Too Many Requests".to_string(),
        GatewayError::MissingCredential => "Unauthorized: missing API key".to_string(),
        GatewayError::InvalidCredential => "Unauthorized: invalid API key".to_string(),
        GatewayError::QuotaExceeded { .. } => "Quota Exceeded".to_string(),
        other => other.to_string(),
    };
    error_response(status, err.code(), message)
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
            },
        }),
    )
}
