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

//! Configuration for the invalidation pipeline.
//!
//! Use [`PipelineConfig::builder()`] to create a configuration:
//!
//! ```rust
//! use std::time::Duration;
//! use purgeline::PipelineConfig;
//!
//! let config = PipelineConfig::builder()
//!     .distribution_id("E2EXAMPLE")
//!     .max_batch_size(100)
//!     .max_batch_window(Duration::from_secs(5))
//!     .build();
//! assert!(config.validate().is_ok());
//! ```

use std::time::Duration;

use crate::backoff::RetryPolicy;
use crate::error::PipelineError;
use crate::path::DEFAULT_MAX_PATH_LENGTH;
use crate::queue::QueueSettings;

/// Most paths the provider accepts in one invalidation call.
pub const PROVIDER_MAX_PATHS_PER_CALL: usize = 3000;

/// Configuration for the batch assembler, executor and workers.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PipelineConfig {
    distribution_id: String,
    max_batch_size: usize,
    max_batch_window: Duration,
    max_redeliveries: u32,
    visibility_timeout: Duration,
    max_receive_count: u32,
    queue_poll_interval: Duration,
    provider_timeout: Duration,
    worker_count: usize,
    max_in_flight: usize,
    in_flight_hold: Duration,
    retry_policy: RetryPolicy,
    max_path_length: usize,
}

impl PipelineConfig {
    /// Creates a new configuration builder with default values.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Distribution every invalidation targets.
    pub fn distribution_id(&self) -> &str {
        &self.distribution_id
    }

    /// Most distinct paths in one provider call.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Longest time a batch stays open after its first member arrived.
    pub fn max_batch_window(&self) -> Duration {
        self.max_batch_window
    }

    /// Failed deliveries after which a message is dead-lettered.
    pub fn max_redeliveries(&self) -> u32 {
        self.max_redeliveries
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Receives after which the queue itself dead-letters a message.
    pub fn max_receive_count(&self) -> u32 {
        self.max_receive_count
    }

    pub fn queue_poll_interval(&self) -> Duration {
        self.queue_poll_interval
    }

    /// Longest a provider call may take before it counts as a transient failure.
    pub fn provider_timeout(&self) -> Duration {
        self.provider_timeout
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Provider invalidations allowed in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// How long a successful invalidation keeps counting against `max_in_flight`.
    pub fn in_flight_hold(&self) -> Duration {
        self.in_flight_hold
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn max_path_length(&self) -> usize {
        self.max_path_length
    }

    /// Queue settings derived from this configuration.
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            visibility_timeout: self.visibility_timeout,
            max_receive_count: self.max_receive_count,
            poll_interval: self.queue_poll_interval,
        }
    }

    /// Checks the values against each other and against provider limits.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let fail = |message: String| Err(PipelineError::Configuration { message });

        if self.distribution_id.trim().is_empty() {
            return fail("distribution_id is required".to_string());
        }
        if self.max_batch_size == 0 || self.max_batch_size > PROVIDER_MAX_PATHS_PER_CALL {
            return fail(format!(
                "max_batch_size must be between 1 and {}, got {}",
                PROVIDER_MAX_PATHS_PER_CALL, self.max_batch_size
            ));
        }
        if self.max_batch_window.is_zero() {
            return fail("max_batch_window must be greater than zero".to_string());
        }
        if self.max_receive_count <= self.max_redeliveries {
            return fail(format!(
                "max_receive_count ({}) must exceed max_redeliveries ({})",
                self.max_receive_count, self.max_redeliveries
            ));
        }
        // A lease covers the open window, the first call and one resubmit.
        let longest_lease = self
            .max_batch_window
            .saturating_add(self.provider_timeout.saturating_mul(2));
        if self.visibility_timeout <= longest_lease {
            return fail(format!(
                "visibility_timeout ({:?}) must exceed max_batch_window plus twice provider_timeout ({:?})",
                self.visibility_timeout, longest_lease
            ));
        }
        if self.retry_policy.initial_delay.is_zero() {
            return fail("retry initial_delay must be greater than zero".to_string());
        }
        let multiplier = self.retry_policy.multiplier;
        if multiplier.is_nan() || multiplier < 1.0 {
            return fail(format!(
                "retry multiplier must be at least 1.0, got {}",
                multiplier
            ));
        }
        if self.retry_policy.max_delay < self.retry_policy.initial_delay {
            return fail("retry max_delay must not be shorter than initial_delay".to_string());
        }
        if self.worker_count == 0 {
            return fail("worker_count must be at least 1".to_string());
        }
        if self.max_in_flight == 0 {
            return fail("max_in_flight must be at least 1".to_string());
        }
        if self.max_path_length == 0 {
            return fail("max_path_length must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Clone)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl Default for PipelineConfigBuilder {
    fn default() -> Self {
        Self {
            config: PipelineConfig {
                distribution_id: String::new(),
                max_batch_size: 100,
                max_batch_window: Duration::from_secs(5),
                max_redeliveries: 5,
                visibility_timeout: Duration::from_secs(30),
                max_receive_count: 10,
                queue_poll_interval: Duration::from_millis(500),
                provider_timeout: Duration::from_secs(10),
                worker_count: 1,
                max_in_flight: 15,
                in_flight_hold: Duration::ZERO,
                retry_policy: RetryPolicy::default(),
                max_path_length: DEFAULT_MAX_PATH_LENGTH,
            },
        }
    }
}

impl PipelineConfigBuilder {
    pub fn distribution_id(mut self, value: impl Into<String>) -> Self {
        self.config.distribution_id = value.into();
        self
    }

    pub fn max_batch_size(mut self, value: usize) -> Self {
        self.config.max_batch_size = value;
        self
    }

    pub fn max_batch_window(mut self, value: Duration) -> Self {
        self.config.max_batch_window = value;
        self
    }

    pub fn max_redeliveries(mut self, value: u32) -> Self {
        self.config.max_redeliveries = value;
        self
    }

    pub fn visibility_timeout(mut self, value: Duration) -> Self {
        self.config.visibility_timeout = value;
        self
    }

    pub fn max_receive_count(mut self, value: u32) -> Self {
        self.config.max_receive_count = value;
        self
    }

    pub fn queue_poll_interval(mut self, value: Duration) -> Self {
        self.config.queue_poll_interval = value;
        self
    }

    pub fn provider_timeout(mut self, value: Duration) -> Self {
        self.config.provider_timeout = value;
        self
    }

    pub fn worker_count(mut self, value: usize) -> Self {
        self.config.worker_count = value;
        self
    }

    pub fn max_in_flight(mut self, value: usize) -> Self {
        self.config.max_in_flight = value;
        self
    }

    pub fn in_flight_hold(mut self, value: Duration) -> Self {
        self.config.in_flight_hold = value;
        self
    }

    pub fn retry_policy(mut self, value: RetryPolicy) -> Self {
        self.config.retry_policy = value;
        self
    }

    pub fn max_path_length(mut self, value: usize) -> Self {
        self.config.max_path_length = value;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfigBuilder::default().build()
    }
}
