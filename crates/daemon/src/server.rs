//! HTTP API

use axum::{
    extract::{rejection::JsonRejection, Path, Query, Request, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use testrunner_common::{Error as CommonError, RunState, TestRunRequest};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::RunError;
use crate::orchestrator::{GeneratedFileRequest, Orchestrator};

/// Header carrying the shared API key
pub const API_KEY_HEADER: &str = "x-api-key";

/// Errors surfaced to HTTP callers
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    Internal { message: String, details: String },
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = match &self {
            ApiError::Internal { message, details } => {
                json!({ "error": message, "details": details })
            }
            other => json!({ "error": other.to_string() }),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        match e {
            RunError::Validation { message } => ApiError::BadRequest(message),
            other => ApiError::Internal {
                message: "Test run failed".to_string(),
                details: other.to_string(),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

/// HTTP front of the orchestrator
#[derive(Clone)]
pub struct ApiServer {
    state: Arc<ApiState>,
}

struct ApiState {
    orchestrator: Arc<Orchestrator>,
    api_key: String,
}

impl ApiServer {
    pub fn new(orchestrator: Arc<Orchestrator>, api_key: impl Into<String>) -> Self {
        Self {
            state: Arc::new(ApiState {
                orchestrator,
                api_key: api_key.into(),
            }),
        }
    }

    pub fn router(&self) -> Router {
        let state = self.state.clone();
        let auth_layer = middleware::from_fn(move |req, next| {
            let state = state.clone();
            async move { auth_middleware(state, req, next).await }
        });

        let protected_routes = Router::new()
            .route("/run", post(run_handler))
            .route("/run-tests", post(run_tests_handler))
            .route("/run-generated-file", post(run_generated_file_handler))
            .route("/status/:run_id", get(status_handler))
            .route("/cancel/:run_id", post(cancel_handler))
            .layer(auth_layer)
            .with_state(self.state.clone());

        Router::new()
            .route("/health", get(health_handler))
            .merge(protected_routes)
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind `addr` and serve until `shutdown` resolves
    pub async fn serve<F>(self, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("TestRunner API listening on http://{}", listener.local_addr()?);

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}

async fn auth_middleware(state: Arc<ApiState>, req: Request, next: middleware::Next) -> Response {
    let authorized = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|key| key == state.api_key);

    if !authorized {
        warn!(path = %req.uri().path(), "Rejected request without a valid API key");
        return ApiError::Unauthorized.into_response();
    }
    next.run(req).await
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "TestRunner"
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunTrigger {
    #[serde(default)]
    test_suite_id: Option<String>,
}

async fn run_handler(
    State(state): State<Arc<ApiState>>,
    body: Option<Json<RunTrigger>>,
) -> impl IntoResponse {
    let trigger = body.map(|Json(t)| t).unwrap_or_default();
    let run_id = state
        .orchestrator
        .register_run(trigger.test_suite_id.as_deref().unwrap_or_default());
    Json(json!({ "runId": run_id }))
}

#[derive(Debug, Deserialize)]
struct RunTestsQuery {
    #[serde(default = "default_wait")]
    wait: bool,
}

fn default_wait() -> bool {
    true
}

async fn run_tests_handler(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<RunTestsQuery>,
    body: Result<Json<TestRunRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;

    if !query.wait {
        let run_id = state.orchestrator.spawn_run(request)?;
        return Ok(Json(json!({
            "runId": run_id,
            "status": "started",
            "message": "Test execution started",
        }))
        .into_response());
    }

    let status = state.orchestrator.submit(request).await?;
    if status.status == RunState::Failed {
        if let Some(err) = &status.error {
            error!(run_id = %status.run_id, error = %err.message, "Run ended with an error");
        }
    }
    Ok(Json(status).into_response())
}

async fn run_generated_file_handler(
    State(state): State<Arc<ApiState>>,
    body: Result<Json<GeneratedFileRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let response = state
        .orchestrator
        .run_generated_file(request)
        .await
        .map_err(|e| match e {
            RunError::Validation { message } => ApiError::BadRequest(message),
            other => ApiError::Internal {
                message: "Failed to run generated TestCafe file".to_string(),
                details: other.to_string(),
            },
        })?;
    Ok(Json(response).into_response())
}

async fn status_handler(
    State(state): State<Arc<ApiState>>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    state
        .orchestrator
        .get_status(&run_id)
        .map(|status| Json(status).into_response())
        .ok_or_else(|| ApiError::NotFound("Run not found".to_string()))
}

async fn cancel_handler(
    State(state): State<Arc<ApiState>>,
    Path(run_id): Path<String>,
) -> Result<Response, ApiError> {
    match state.orchestrator.try_cancel(&run_id) {
        Ok(_) => Ok(Json(json!({ "success": true })).into_response()),
        Err(CommonError::NotFound { .. }) => Err(ApiError::NotFound("Run not found".to_string())),
        Err(CommonError::InvalidStateTransition { from, .. }) => Err(ApiError::Conflict(format!(
            "Run cannot be cancelled in state {}",
            from
        ))),
        Err(e) => Err(ApiError::Internal {
            message: "Cancel failed".to_string(),
            details: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_status_codes() {
        assert_eq!(ApiError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ApiError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(ApiError::Conflict("x".into()).status(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_run_error_mapping() {
        let validation: ApiError = RunError::validation("No test suites or test cases provided").into();
        assert!(matches!(validation, ApiError::BadRequest(ref m) if m.contains("No test")));

        let execution: ApiError = RunError::Execution {
            source: testrunner_executor::ExecutorError::TestCafeNotFound,
        }
        .into();
        assert_eq!(execution.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
