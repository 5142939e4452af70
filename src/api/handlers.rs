//! API handlers.

use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;

use super::AppState;
use crate::core::accept::Accept;
use crate::core::error::Error;
use crate::core::reconciler::{AddOutcome, DeleteOutcome};
use crate::validators::{parse_port_param, validate_accept};

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error returned from a handler, rendered as a JSON body.
#[derive(Debug)]
pub enum ApiError {
    /// Request could not be decoded or failed validation
    BadRequest(String),
    /// Reconciler or gateway failure
    Internal(Error),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation { .. } => Self::BadRequest(err.to_string()),
            other => Self::Internal(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => {
                tracing::debug!("Rejected request: {message}");
                (StatusCode::BAD_REQUEST, Json(json!({ "err": message }))).into_response()
            }
            Self::Internal(err) => {
                tracing::error!("Request failed: {err}");
                let hint = match &err {
                    Error::Gateway(g) => {
                        let translation = g.translation();
                        translation
                            .suggestions
                            .first()
                            .cloned()
                            .unwrap_or(translation.user_message)
                    }
                    _ => "Check the service logs".to_string(),
                };
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "err": err.to_string(), "hint": hint })),
                )
                    .into_response()
            }
        }
    }
}

/// Runs a reconciler operation on its own task.
///
/// hyper drops the handler future when the client disconnects; the spawned
/// task still finishes both the kernel change and the registry update.
async fn run_to_completion<T, F>(op: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: Future<Output = Result<T, Error>> + Send + 'static,
{
    tokio::spawn(op)
        .await
        .map_err(|e| Error::Internal(format!("reconciler task failed: {e}")))?
}

fn empty(status: StatusCode) -> Response {
    (status, Json(json!({}))).into_response()
}

/// `GET /`: registry snapshot.
pub async fn list_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.reconciler.list())
}

/// `POST /`: add an entry.
pub async fn add_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<Accept>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(accept) = body?;
    validate_accept(&accept)?;

    let reconciler = Arc::clone(&state.reconciler);
    let outcome = run_to_completion(async move { reconciler.add(accept).await }).await?;

    let status = match outcome {
        AddOutcome::Created => StatusCode::CREATED,
        AddOutcome::AlreadyExists => StatusCode::FOUND,
    };
    Ok(empty(status))
}

/// `DELETE /:dest_port/:source_ip_range`: remove an entry.
///
/// The source range is matched verbatim against the registry, so a range that
/// was never added simply yields 404.
pub async fn delete_handler(
    State(state): State<Arc<AppState>>,
    Path((dest_port, source_ip_range)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    delete_entry(&state, &dest_port, &source_ip_range).await
}

/// `DELETE /:dest_port`: remove an "any source" entry.
pub async fn delete_any_source_handler(
    State(state): State<Arc<AppState>>,
    Path(dest_port): Path<String>,
) -> Result<Response, ApiError> {
    delete_entry(&state, &dest_port, "").await
}

async fn delete_entry(
    state: &AppState,
    dest_port: &str,
    source_ip_range: &str,
) -> Result<Response, ApiError> {
    let port = parse_port_param(dest_port)?;

    let reconciler = Arc::clone(&state.reconciler);
    let source_ip_range = source_ip_range.to_string();
    let outcome =
        run_to_completion(async move { reconciler.delete(port, &source_ip_range).await }).await?;

    let status = match outcome {
        DeleteOutcome::Deleted => StatusCode::OK,
        DeleteOutcome::NotFound | DeleteOutcome::Healed => StatusCode::NOT_FOUND,
    };
    Ok(empty(status))
}

/// Health check handler.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
