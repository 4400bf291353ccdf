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

//! Process wiring: builds the queue, provider and pipeline from configuration
//! and runs the HTTP endpoint, the workers, or both.

use anyhow::{bail, Context, Result};
use purgeline::{
    InvalidationPipeline, InvalidationProvider, InvalidationQueue, MemoryQueue, QueueSettings,
    RecordingProvider,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::{ProviderKind, PurgelineConfig};
use crate::http::{create_router, AppState};
use crate::metrics::MetricsState;

/// Calls kept in memory by the noop provider.
const NOOP_HISTORY_LIMIT: usize = 1000;

/// Which halves of the pipeline this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Ingestion endpoint and workers in one process.
    All,
    /// Ingestion endpoint only.
    Api,
    /// Workers only.
    Worker,
}

impl Role {
    pub fn serves_http(self) -> bool {
        matches!(self, Role::All | Role::Api)
    }

    pub fn runs_workers(self) -> bool {
        matches!(self, Role::All | Role::Worker)
    }
}

/// Opens the queue named by `url`.
pub async fn build_queue(url: &str, settings: QueueSettings) -> Result<Arc<dyn InvalidationQueue>> {
    if url == "memory" {
        return Ok(Arc::new(MemoryQueue::new(settings)));
    }

    #[cfg(feature = "sqlite")]
    {
        if url.starts_with("sqlite://") {
            let queue = purgeline::SqliteQueue::connect(url, settings)
                .await
                .with_context(|| format!("Failed to open queue at {}", url))?;
            return Ok(Arc::new(queue));
        }
    }

    bail!("Unsupported queue URL: {}", url)
}

/// Builds the provider selected in configuration.
pub fn build_provider(config: &PurgelineConfig) -> Result<Arc<dyn InvalidationProvider>> {
    match config.provider.kind {
        ProviderKind::Noop => {
            warn!("Using the noop provider: invalidations are accepted but not sent anywhere");
            Ok(Arc::new(
                RecordingProvider::accepting().with_history_limit(NOOP_HISTORY_LIMIT),
            ))
        }
        #[cfg(feature = "webhook")]
        ProviderKind::Webhook => {
            let endpoint = config
                .provider
                .endpoint
                .clone()
                .context("provider.endpoint is required for the webhook provider")?;
            let timeout = Duration::from_secs(config.pipeline.provider_timeout_secs);
            let mut provider = purgeline::WebhookProvider::new(endpoint, timeout)
                .context("Failed to build webhook provider")?;
            if let Some(token) = &config.provider.bearer_token {
                provider = provider.with_bearer_token(token.clone());
            }
            Ok(Arc::new(provider))
        }
        #[cfg(not(feature = "webhook"))]
        ProviderKind::Webhook => bail!("webhook provider support is not compiled in"),
    }
}

/// Runs the server until SIGINT or SIGTERM.
pub async fn run(config: PurgelineConfig, role: Role, metrics: Option<MetricsState>) -> Result<()> {
    if role != Role::All && config.queue.url == "memory" {
        bail!("The in-memory queue is process-local; use --role all or a durable queue URL");
    }

    let pipeline_config = config.pipeline_config();
    let queue = build_queue(&config.queue.url, pipeline_config.queue_settings()).await?;
    let provider = build_provider(&config)?;
    let pipeline = InvalidationPipeline::new(pipeline_config, queue.clone(), provider)
        .context("Invalid pipeline configuration")?;

    if role.runs_workers() {
        pipeline.start().await?;
    }

    if role.serves_http() {
        let mut state = AppState::new(pipeline.ingestion(), queue);
        if let Some(metrics) = metrics {
            state = state.with_metrics(metrics);
        }
        let router = create_router(state, config.server.body_limit_bytes);

        let address = format!("{}:{}", config.server.bind_address, config.server.port);
        let listener = TcpListener::bind(&address)
            .await
            .with_context(|| format!("Failed to bind {}", address))?;
        info!(%address, ?role, "Listening for invalidation requests");

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP server failed")?;
    } else {
        info!(?role, "Workers running");
        shutdown_signal().await;
    }

    info!("Shutting down");
    if pipeline.is_running().await {
        let timeout = config.graceful_shutdown_timeout();
        match tokio::time::timeout(timeout, pipeline.shutdown()).await {
            Ok(result) => result?,
            Err(_) => warn!(
                ?timeout,
                "Workers did not stop in time; unacknowledged messages will be redelivered"
            ),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
