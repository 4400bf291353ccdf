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

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use purgeline::{
    Delivery, IngestionService, InvalidationQueue, MemoryQueue, MessageId, QueueError,
    QueueStats, ReceiptHandle,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for oneshot

use super::{create_router, AppState, DEFAULT_BODY_LIMIT};
use crate::metrics::MetricsState;

struct DownQueue;

#[async_trait]
impl InvalidationQueue for DownQueue {
    async fn enqueue(&self, _body: String) -> Result<MessageId, QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }
    async fn receive(&self, _: usize, _: Duration) -> Result<Vec<Delivery>, QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }
    async fn acknowledge(&self, _: &ReceiptHandle) -> Result<(), QueueError> {
        Ok(())
    }
    async fn extend(&self, _: &ReceiptHandle, _: Duration) -> Result<(), QueueError> {
        Ok(())
    }
    async fn dead_letter(&self, _: &ReceiptHandle, _: &str) -> Result<(), QueueError> {
        Ok(())
    }
    async fn stats(&self) -> Result<QueueStats, QueueError> {
        Err(QueueError::Unavailable("connection refused".into()))
    }
}

fn app_with(queue: Arc<dyn InvalidationQueue>) -> Router {
    let state = AppState::new(IngestionService::new(queue.clone()), queue)
        .with_metrics(MetricsState::detached());
    create_router(state, DEFAULT_BODY_LIMIT)
}

fn post_invalidate(body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/invalidate")
        .header(CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = app_with(Arc::new(MemoryQueue::default()));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
}

#[tokio::test]
async fn test_invalidate_accepts_and_enqueues() {
    let queue = Arc::new(MemoryQueue::default());
    let app = app_with(queue.clone());

    let response = app
        .oneshot(post_invalidate(r#"{"path":"images//logo.png"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = json_body(response).await;
    assert_eq!(json["accepted"], true);
    assert_eq!(json["path"], "/images/logo.png");
    assert!(json["deliveryId"].as_str().is_some_and(|id| !id.is_empty()));
    assert!(json["correlationId"].is_string());
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_invalid_path_is_rejected_without_enqueue() {
    let queue = Arc::new(MemoryQueue::default());
    let app = app_with(queue.clone());

    let response = app
        .oneshot(post_invalidate(r#"{"path":"/a/*/b"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["code"], "invalid_path");
    assert!(json["message"].as_str().unwrap().contains("Wildcard"));
    assert!(queue.is_empty());
}

#[tokio::test]
async fn test_malformed_json_is_a_bad_request() {
    let app = app_with(Arc::new(MemoryQueue::default()));

    let response = app.oneshot(post_invalidate("{\"path\": 42}")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "invalid_request");
}

#[tokio::test]
async fn test_queue_outage_is_service_unavailable() {
    let app = app_with(Arc::new(DownQueue));

    let response = app
        .oneshot(post_invalidate(r#"{"path":"/a"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = json_body(response).await;
    assert_eq!(json["code"], "queue_unavailable");
    // Internal details stay in the logs.
    assert!(!json["message"].as_str().unwrap().contains("refused"));
}

#[tokio::test]
async fn test_oversized_body_is_rejected() {
    let app = app_with(Arc::new(MemoryQueue::default()));
    let body = format!(r#"{{"path":"/{}"}}"#, "a".repeat(DEFAULT_BODY_LIMIT));

    let response = app.oneshot(post_invalidate(body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_readiness_reflects_queue_health() {
    let ready = app_with(Arc::new(MemoryQueue::default()))
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);

    let not_ready = app_with(Arc::new(DownQueue))
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(not_ready.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json_body(not_ready).await["checks"]["queue"], "unavailable");
}

#[tokio::test]
async fn test_metrics_endpoint_is_prometheus_text() {
    let app = app_with(Arc::new(MemoryQueue::default()));

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[CONTENT_TYPE].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn test_metrics_route_absent_without_recorder() {
    let queue: Arc<dyn InvalidationQueue> = Arc::new(MemoryQueue::default());
    let app = create_router(
        AppState::new(IngestionService::new(queue.clone()), queue),
        DEFAULT_BODY_LIMIT,
    );

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
