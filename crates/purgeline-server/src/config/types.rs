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

use purgeline::{PipelineConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgelineConfig {
    pub server: ServerConfig,
    pub queue: QueueConfig,
    pub pipeline: PipelineSection,
    pub provider: ProviderConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub body_limit_bytes: usize,
    pub graceful_shutdown_timeout_secs: u64,
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// `memory` or a `sqlite://` URL.
    pub url: String,
    pub visibility_timeout_secs: u64,
    pub max_receive_count: u32,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub distribution_id: String,
    pub max_batch_size: usize,
    pub max_batch_window_ms: u64,
    pub max_redeliveries: u32,
    pub worker_count: usize,
    pub max_in_flight: usize,
    pub in_flight_hold_ms: u64,
    pub provider_timeout_secs: u64,
    pub max_path_length: usize,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Accepts every call without contacting anything.
    Noop,
    /// Posts invalidations to an HTTP control plane.
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl PurgelineConfig {
    /// Create a new configuration with defaults for the compiled backends
    pub fn with_defaults() -> Self {
        Self::default()
    }

    /// Library configuration for the pipeline this server runs.
    pub fn pipeline_config(&self) -> PipelineConfig {
        let pipeline = &self.pipeline;
        PipelineConfig::builder()
            .distribution_id(pipeline.distribution_id.clone())
            .max_batch_size(pipeline.max_batch_size)
            .max_batch_window(Duration::from_millis(pipeline.max_batch_window_ms))
            .max_redeliveries(pipeline.max_redeliveries)
            .visibility_timeout(Duration::from_secs(self.queue.visibility_timeout_secs))
            .max_receive_count(self.queue.max_receive_count)
            .queue_poll_interval(Duration::from_millis(self.queue.poll_interval_ms))
            .provider_timeout(Duration::from_secs(pipeline.provider_timeout_secs))
            .worker_count(pipeline.worker_count)
            .max_in_flight(pipeline.max_in_flight)
            .in_flight_hold(Duration::from_millis(pipeline.in_flight_hold_ms))
            .max_path_length(pipeline.max_path_length)
            .retry_policy(RetryPolicy {
                initial_delay: Duration::from_millis(pipeline.retry.initial_delay_ms),
                max_delay: Duration::from_millis(pipeline.retry.max_delay_ms),
                multiplier: pipeline.retry.multiplier,
                jitter: pipeline.retry.jitter,
            })
            .build()
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.graceful_shutdown_timeout_secs)
    }
}
