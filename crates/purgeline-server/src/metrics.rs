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

//! Prometheus metrics exposition.
//!
//! The pipeline records through the `metrics` facade; this module installs the
//! Prometheus recorder and renders it for `/metrics`.

use axum::{extract::State, http::header::CONTENT_TYPE, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Prometheus exposition format content type.
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Shared handle for rendering the recorder's current state.
#[derive(Clone)]
pub struct MetricsState {
    handle: Arc<PrometheusHandle>,
}

impl MetricsState {
    pub fn new(handle: PrometheusHandle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// A recorder that is not installed globally, for tests.
    pub fn detached() -> Self {
        Self::new(PrometheusBuilder::new().build_recorder().handle())
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("failed to install Prometheus recorder: recorder already installed")]
    AlreadyInstalled,
}

/// Installs the global Prometheus recorder. Call once at startup.
pub fn init_metrics() -> Result<MetricsState, MetricsError> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|_| MetricsError::AlreadyInstalled)?;

    describe_metrics();
    Ok(MetricsState::new(handle))
}

fn describe_metrics() {
    metrics::describe_counter!(
        "purgeline_requests_accepted_total",
        "Invalidation requests accepted and enqueued"
    );
    metrics::describe_counter!(
        "purgeline_requests_rejected_total",
        "Invalidation requests rejected at ingestion, by reason"
    );
    metrics::describe_counter!(
        "purgeline_batches_closed_total",
        "Batches closed, by trigger (size or window)"
    );
    metrics::describe_histogram!("purgeline_batch_paths", "Distinct paths per closed batch");
    metrics::describe_counter!(
        "purgeline_provider_calls_total",
        "Provider calls, by provider and outcome"
    );
    metrics::describe_histogram!(
        "purgeline_provider_call_seconds",
        "Provider call duration in seconds"
    );
    metrics::describe_counter!(
        "purgeline_messages_acknowledged_total",
        "Queue messages acknowledged after a successful invalidation"
    );
    metrics::describe_counter!(
        "purgeline_messages_dead_lettered_total",
        "Queue messages moved to the dead-letter store, by reason"
    );
    metrics::describe_counter!(
        "purgeline_messages_redelivered_total",
        "Queue messages scheduled for redelivery after a transient failure"
    );
}

/// Handler for the `/metrics` endpoint.
pub async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    ([(CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], state.render())
}
