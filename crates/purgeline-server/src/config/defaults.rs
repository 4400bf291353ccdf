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

use crate::config::types::*;

#[cfg(feature = "sqlite")]
const DEFAULT_QUEUE_URL: &str = "sqlite://purgeline.db";
#[cfg(not(feature = "sqlite"))]
const DEFAULT_QUEUE_URL: &str = "memory";

impl Default for PurgelineConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            queue: QueueConfig::default(),
            pipeline: PipelineSection::default(),
            provider: ProviderConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            body_limit_bytes: 64 * 1024,
            graceful_shutdown_timeout_secs: 30,
            metrics_enabled: true,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_QUEUE_URL.to_string(),
            visibility_timeout_secs: 30,
            max_receive_count: 10,
            poll_interval_ms: 500,
        }
    }
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            // Required; usually supplied through PURGELINE_DISTRIBUTION_ID
            distribution_id: String::new(),
            max_batch_size: 100,
            max_batch_window_ms: 5_000,
            max_redeliveries: 5,
            worker_count: 1,
            max_in_flight: 15,
            in_flight_hold_ms: 0,
            provider_timeout_secs: 10,
            max_path_length: purgeline::path::DEFAULT_MAX_PATH_LENGTH,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2_000,
            max_delay_ms: 300_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Noop,
            endpoint: None,
            bearer_token: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            directory: None,
            file_prefix: "purgeline.log".to_string(),
        }
    }
}
