/*
 *  Copyright 2025 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Route definitions and handlers.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use purgeline::{Accepted, IngestError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use super::state::AppState;
use crate::metrics::metrics_handler;

/// Default request body size limit (64 KiB). A path is at most a few KiB.
pub const DEFAULT_BODY_LIMIT: usize = 64 * 1024;

/// Body of `POST /invalidate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidateBody {
    pub path: String,
}

/// JSON error body: `{ "code": ..., "message": ... }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    #[serde(skip)]
    status: StatusCode,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        // Body limit violations keep their 413; everything else is a bad request.
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            return ApiError::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                rejection.body_text(),
            );
        }
        ApiError::new(StatusCode::BAD_REQUEST, "invalid_request", rejection.body_text())
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(e) => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_path", e.to_string())
            }
            IngestError::QueueUnavailable(e) => {
                error!(error = %e, "Queue unavailable during ingestion");
                ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "queue_unavailable",
                    "The invalidation queue is unavailable, retry later",
                )
            }
            IngestError::Encoding(e) => {
                error!(error = %e, "Failed to encode invalidation request");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    "Failed to encode the request",
                )
            }
        }
    }
}

/// Creates the router with the given body size limit.
pub fn create_router(state: AppState, body_limit: usize) -> Router {
    let metrics = state.metrics.clone();
    let shared_state = Arc::new(state);

    let api_router = Router::new()
        .route("/invalidate", post(invalidate))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .with_state(shared_state);

    let router = match metrics {
        Some(metrics) => api_router.merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(metrics),
        ),
        None => api_router,
    };

    router.layer(TraceLayer::new_for_http())
}

/// Validates and enqueues one path. Returns once the queue stored it.
async fn invalidate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<InvalidateBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let Json(body) = payload?;
    let accepted = state.ingestion.submit(&body.path).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Returns 200 when the queue answers, 503 otherwise. Error details are
/// logged, not returned.
async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.queue.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "checks": { "queue": "ok" }
            })),
        ),
        Err(e) => {
            error!("Readiness check failed: queue unavailable: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "checks": { "queue": "unavailable" }
                })),
            )
        }
    }
}
