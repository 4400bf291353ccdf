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

//! Error types for the invalidation pipeline.
//!
//! Errors are split by the component that raises them:
//!
//! - [`QueueError`]: the durable queue failed or rejected a lease operation
//! - [`ProviderError`]: the invalidation provider refused or failed a call
//! - [`IngestError`]: a caller-facing ingestion failure
//! - [`PipelineError`]: configuration and lifecycle failures of the runner

use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;

pub use crate::path::PathError;

/// Errors raised by an [`InvalidationQueue`](crate::queue::InvalidationQueue) backend.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue could not be reached or could not serve the request.
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    /// The receipt handle does not identify a live lease. The lease expired
    /// and the message was handed to another consumer, or the message is gone.
    #[error("Receipt handle not found or expired: {0}")]
    ReceiptNotFound(String),

    /// A message or dead letter addressed by id does not exist.
    #[error("Message not found: {0}")]
    NotFound(String),

    /// The storage layer reported an error.
    #[error("Queue storage error: {0}")]
    Storage(String),
}

#[cfg(feature = "sqlite")]
impl From<diesel::result::Error> for QueueError {
    fn from(err: diesel::result::Error) -> Self {
        QueueError::Storage(err.to_string())
    }
}

/// Errors raised by an [`InvalidationProvider`](crate::provider::InvalidationProvider).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// The provider throttled the call.
    #[error("Provider rate limited the request")]
    RateLimited { retry_after: Option<Duration> },

    /// The provider refused the whole call because of these paths. Nothing
    /// in the call was applied.
    #[error("Provider rejected {} path(s) as invalid", failed_paths.len())]
    Rejected { failed_paths: BTreeSet<String> },

    /// The call did not complete in time.
    #[error("Provider call timed out after {0:?}")]
    Timeout(Duration),

    /// The distribution already has the maximum number of invalidations in progress.
    #[error("Too many invalidations in progress for the distribution")]
    TooManyInFlight,

    /// Network or server-side failure.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Whether the whole call may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::Rejected { .. })
    }

    /// Delay the provider asked for before the next call, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Rejected { .. } => "rejected",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::TooManyInFlight => "too_many_in_flight",
            ProviderError::Unavailable(_) => "unavailable",
        }
    }
}

/// Errors surfaced synchronously to ingestion callers.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The path failed validation and was not enqueued.
    #[error("Invalid path: {0}")]
    Validation(#[from] PathError),

    /// The queue could not accept the request. Nothing was enqueued.
    #[error("Queue unavailable: {0}")]
    QueueUnavailable(#[from] QueueError),

    /// The request could not be encoded as a queue message.
    #[error("Failed to encode invalidation request: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Errors raised while configuring or running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Pipeline is already running")]
    AlreadyRunning,

    #[error("Worker task failed: {0}")]
    Worker(String),
}
