//! HTTP surface
//!
//! Thin axum layer over the orchestrator: provisioning, retry, repair,
//! status polling, SSE progress, and operational self-checks. All
//! domain decisions live in the pipeline; handlers only translate
//! between HTTP and `Result`.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tower_http::cors::CorsLayer;
use tracing::info;
use uuid::Uuid;

use crate::pipeline::{Orchestrator, ProvisionRequest, SandboxStatus};
use crate::provider::ProviderKind;
use crate::store::{CodeFiles, SandboxRecord};
use crate::{Error, Result};

/// Decides whether a bearer token may act on sandboxes
pub trait Authorizer: Send + Sync {
    fn authorize(&self, token: Option<&str>) -> Result<()>;
}

/// Single shared token from config. No token configured means the
/// surface is open, which is the local-development default.
pub struct StaticTokenAuthorizer {
    token: Option<SecretString>,
}

impl StaticTokenAuthorizer {
    pub fn new(token: Option<SecretString>) -> Self {
        StaticTokenAuthorizer { token }
    }
}

impl Authorizer for StaticTokenAuthorizer {
    fn authorize(&self, token: Option<&str>) -> Result<()> {
        let Some(expected) = &self.token else {
            return Ok(());
        };
        match token {
            Some(presented) if presented == expected.expose_secret() => Ok(()),
            Some(_) => Err(Error::Unauthorized("invalid bearer token".to_string())),
            None => Err(Error::Unauthorized("missing bearer token".to_string())),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    authorizer: Arc<dyn Authorizer>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, authorizer: Arc<dyn Authorizer>) -> Self {
        AppState {
            orchestrator,
            authorizer,
            started_at: Utc::now(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sandbox/provision", post(provision))
        .route("/sandbox/test", get(provider_check))
        .route("/sandbox/smoke-test", post(smoke_test))
        .route("/sandbox/{id}/status", get(sandbox_status))
        .route("/sandbox/{id}/events", get(sandbox_events))
        .route("/sandbox/{id}/retry", post(retry))
        .route("/sandbox/{id}/repair", post(repair))
        .route("/sandbox/{id}/terminate", delete(terminate))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Error wrapper mapping domain errors to HTTP responses
struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) | Error::Busy(_) | Error::RetryExhausted(_) => {
                StatusCode::CONFLICT
            }
            Error::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.0.to_string(),
            "message": self.0.user_message(),
        });
        (status, Json(body)).into_response()
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

#[derive(Debug, Deserialize)]
struct ProvisionBody {
    tool_id: String,
    generation_id: String,
    code: CodeFiles,
    #[serde(default)]
    supersede: bool,
}

async fn provision(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ProvisionBody>,
) -> std::result::Result<impl IntoResponse, AppError> {
    state.authorizer.authorize(bearer_token(&headers))?;
    info!(tool = %body.tool_id, generation = %body.generation_id, "Provision requested");

    let outcome = state
        .orchestrator
        .provision(ProvisionRequest {
            tool_id: body.tool_id,
            generation_id: body.generation_id,
            code: body.code,
            supersede: body.supersede,
        })
        .await?;
    Ok(Json(outcome))
}

async fn retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, AppError> {
    state.authorizer.authorize(bearer_token(&headers))?;
    let outcome = state.orchestrator.retry(id).await?;
    Ok(Json(outcome))
}

async fn repair(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, AppError> {
    state.authorizer.authorize(bearer_token(&headers))?;
    let outcome = state.orchestrator.repair(id).await?;
    Ok(Json(outcome))
}

async fn terminate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, AppError> {
    state.authorizer.authorize(bearer_token(&headers))?;
    state.orchestrator.terminate(id).await?;
    Ok(Json(serde_json::json!({ "terminated": true, "sandbox_id": id })))
}

/// Poll view of a sandbox. Provider-internal identifiers stay out of
/// the response.
#[derive(Debug, Serialize)]
struct StatusResponse {
    sandbox_id: Uuid,
    tool_id: String,
    generation_id: String,
    status: SandboxStatus,
    percent: u8,
    url: Option<String>,
    provider: Option<ProviderKind>,
    retry_count: i32,
    max_retries: i32,
    repair_count: i32,
    max_repairs: i32,
    build_passed: Option<bool>,
    tests_passed: Option<bool>,
    health_check_passed: Option<bool>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl StatusResponse {
    fn from_record(record: SandboxRecord) -> Self {
        let percent = record.percent();
        StatusResponse {
            sandbox_id: record.id,
            tool_id: record.tool_id,
            generation_id: record.generation_id,
            status: record.status,
            percent,
            url: record.url,
            provider: record.provider,
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            repair_count: record.repair_count,
            max_repairs: record.max_repairs,
            build_passed: record.build_passed,
            tests_passed: record.tests_passed,
            health_check_passed: record.health_check_passed,
            last_error: record.last_error,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

async fn sandbox_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, AppError> {
    state.authorizer.authorize(bearer_token(&headers))?;
    let record = state
        .orchestrator
        .store()
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("sandbox {}", id)))?;

    Ok((
        [(header::CACHE_CONTROL, "no-store")],
        Json(StatusResponse::from_record(record)),
    ))
}

/// SSE stream of progress events for one sandbox. Dropping the client
/// connection only drops this receiver; the pipeline keeps running.
async fn sandbox_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, AppError>
{
    // Authorize before the stream opens; an SSE response is already 200
    state.authorizer.authorize(bearer_token(&headers))?;
    let receiver = state.orchestrator.progress().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(move |item| async move {
        match item {
            Ok(event) if event.sandbox_id == id => {
                let data = serde_json::to_string(&event).unwrap_or_default();
                Some(Ok(Event::default().event("progress").data(data)))
            }
            // Lagged receivers skip missed events rather than erroring
            _ => None,
        }
    });

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keepalive"),
    ))
}

async fn provider_check(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<impl IntoResponse, AppError> {
    state.authorizer.authorize(bearer_token(&headers))?;
    let providers = state.orchestrator.configured_providers();
    Ok(Json(serde_json::json!({
        "providers": providers,
        "count": providers.len(),
    })))
}

async fn smoke_test(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<impl IntoResponse, AppError> {
    state.authorizer.authorize(bearer_token(&headers))?;
    let report = state.orchestrator.smoke_test().await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    Ok((status, Json(report)))
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.orchestrator.store().health_check().await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if store_ok { "healthy" } else { "degraded" },
            "service": crate::NAME,
            "version": crate::VERSION,
            "uptime_secs": (Utc::now() - state.started_at).num_seconds(),
            "timestamp": Utc::now().to_rfc3339(),
        })),
    )
}
