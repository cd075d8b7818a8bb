use crate::config::AppState;
use anyhow::Result;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ruleflow_core::{EngineError, Rejection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

mod handlers;
pub mod links;

/// Start the API server
pub async fn serve(addr: &str, state: AppState, path_prefix: &str) -> Result<()> {
    let app = create_router(state, path_prefix);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("API server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the API router; resource routes live under `path_prefix`
fn create_router(state: AppState, path_prefix: &str) -> Router {
    let api = Router::new()
        .route("/", get(handlers::root))
        .route(
            "/workflows",
            get(handlers::list_workflows).post(handlers::create_workflow),
        )
        .route("/workflows/stats", get(handlers::workflow_stats))
        .route(
            "/workflows/{workflow_id}",
            get(handlers::get_workflow).delete(handlers::delete_workflow),
        )
        .route("/workflows/{workflow_id}/apply", post(handlers::apply_rules))
        .route("/workflows/{workflow_id}/submit", post(handlers::submit_nodes))
        .route(
            "/workflows/{workflow_id}/nodes/{node_id}/result",
            post(handlers::report_result),
        )
        .route("/workflows/{workflow_id}/files", get(handlers::list_files))
        .route("/workflows/{workflow_id}/events", get(handlers::get_workflow_events))
        .route("/files/{workflow_id}/{*path}", get(handlers::download_file));

    // nest("") panics, an empty prefix mounts at the root
    let router = Router::new().route("/api/health", get(health_check));
    let router = if path_prefix.is_empty() {
        router.merge(api)
    } else {
        router.nest(path_prefix, api)
    };

    router
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state))
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "ruleflow",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Custom error type for API handlers
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        let Some(err) = self.0.downcast_ref::<EngineError>() else {
            return StatusCode::INTERNAL_SERVER_ERROR;
        };
        match err {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            EngineError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Rejected(Rejection::InvalidPath(_)) => StatusCode::BAD_REQUEST,
            EngineError::Rejected(_) | EngineError::Malformed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::InvalidTemplate(_) | EngineError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::error!(error = %format!("{:#}", self.0), "Request failed");
        }

        let error_msg = self.0.to_string();
        let details = self.0.chain().skip(1).map(|e| e.to_string()).collect::<Vec<_>>().join(": ");

        let response = if details.is_empty() {
            ErrorResponse::new(error_msg)
        } else {
            ErrorResponse::with_details(error_msg, details)
        };

        (status, Json(response)).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
