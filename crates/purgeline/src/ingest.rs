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

//! Ingestion: validate a path and enqueue it.
//!
//! [`IngestionService::submit`] performs exactly one enqueue per accepted
//! call and returns as soon as the queue has stored the message. It never
//! waits for batching or for the provider.

use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::{InvalidationRequest, MessageId};
use crate::path::{NormalizedPath, PathValidator};
use crate::queue::InvalidationQueue;

/// Acknowledgment returned to a caller whose request was enqueued.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    /// Always `true`; the request is queued and will be invalidated or dead-lettered.
    pub accepted: bool,
    pub delivery_id: MessageId,
    pub correlation_id: Uuid,
    pub path: NormalizedPath,
}

/// Stateless front door of the pipeline.
#[derive(Clone)]
pub struct IngestionService {
    queue: Arc<dyn InvalidationQueue>,
    validator: PathValidator,
}

impl IngestionService {
    pub fn new(queue: Arc<dyn InvalidationQueue>) -> Self {
        Self {
            queue,
            validator: PathValidator::default(),
        }
    }

    pub fn with_validator(mut self, validator: PathValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    /// Validates `raw_path` and enqueues it.
    ///
    /// # Errors
    ///
    /// - [`IngestError::Validation`] when the path is malformed; nothing is enqueued
    /// - [`IngestError::QueueUnavailable`] when the queue did not store the message
    pub async fn submit(&self, raw_path: &str) -> Result<Accepted, IngestError> {
        let path = match self.validator.validate(raw_path) {
            Ok(path) => path,
            Err(err) => {
                counter!("purgeline_requests_rejected_total", "reason" => "validation").increment(1);
                debug!(error = %err, "Rejected invalidation request");
                return Err(err.into());
            }
        };

        let request = InvalidationRequest::new(path.clone());
        let body = request.to_body()?;
        let delivery_id = match self.queue.enqueue(body).await {
            Ok(id) => id,
            Err(err) => {
                counter!("purgeline_requests_rejected_total", "reason" => "queue_unavailable")
                    .increment(1);
                warn!(error = %err, path = %path, "Failed to enqueue invalidation request");
                return Err(err.into());
            }
        };

        counter!("purgeline_requests_accepted_total").increment(1);
        debug!(
            delivery_id = %delivery_id,
            correlation_id = %request.correlation_id,
            path = %path,
            "Accepted invalidation request"
        );

        Ok(Accepted {
            accepted: true,
            delivery_id,
            correlation_id: request.correlation_id,
            path,
        })
    }
}
