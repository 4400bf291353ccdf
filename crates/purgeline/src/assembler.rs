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

//! Batch assembly: drain the queue into deduplicated batches.
//!
//! One call to [`BatchAssembler::next_batch`] is one poll cycle. It keeps
//! receiving until the batch holds `max_batch_size` distinct paths or until
//! `max_batch_window` has passed since its first member was ingested,
//! whichever comes first. Each receive asks for at most the remaining
//! capacity, so a batch can never exceed the size limit even when every
//! received message carries a new path.
//!
//! The assembler holds no durable state. Dropping it (or the stream from
//! [`BatchAssembler::into_stream`]) loses nothing: leased messages reappear
//! once their visibility timeout passes.

use chrono::Utc;
use futures::stream::{self, Stream};
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::QueueError;
use crate::models::{Batch, BatchMember, Delivery, InvalidationRequest};
use crate::path::PathValidator;
use crate::queue::InvalidationQueue;

/// Builds batches from queue deliveries using a size and a time trigger.
#[derive(Clone)]
pub struct BatchAssembler {
    queue: Arc<dyn InvalidationQueue>,
    validator: PathValidator,
    max_batch_size: usize,
    max_batch_window: Duration,
}

impl BatchAssembler {
    pub fn new(queue: Arc<dyn InvalidationQueue>, config: &PipelineConfig) -> Self {
        Self {
            queue,
            validator: PathValidator::new(config.max_path_length()),
            max_batch_size: config.max_batch_size().max(1),
            max_batch_window: config.max_batch_window(),
        }
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn max_batch_window(&self) -> Duration {
        self.max_batch_window
    }

    /// Runs one poll cycle.
    ///
    /// Returns `Ok(None)` when a whole window passed without a single valid
    /// message. A returned batch is never empty.
    pub async fn next_batch(&self) -> Result<Option<Batch>, QueueError> {
        let idle_deadline = Instant::now() + self.max_batch_window;
        let mut close_at: Option<Instant> = None;
        let mut batch = Batch::new();

        loop {
            // Until the first member arrives the cycle is bounded by one idle window.
            let deadline = close_at.unwrap_or(idle_deadline);
            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let capacity = self.max_batch_size - batch.len();
            let deliveries = self
                .queue
                .receive(capacity, deadline.saturating_duration_since(now))
                .await?;

            for delivery in deliveries {
                let Some(member) = self.admit(delivery).await else {
                    continue;
                };
                if close_at.is_none() {
                    close_at = Some(self.window_close(&member));
                }
                batch.push(member);
            }

            if batch.len() >= self.max_batch_size {
                counter!("purgeline_batches_closed_total", "trigger" => "size").increment(1);
                return Ok(Some(self.finish(batch)));
            }
        }

        if batch.is_empty() {
            return Ok(None);
        }
        counter!("purgeline_batches_closed_total", "trigger" => "window").increment(1);
        Ok(Some(self.finish(batch)))
    }

    /// Turns the assembler into the endless sequence of batches it produces.
    ///
    /// Empty windows are skipped; queue errors are yielded and the stream
    /// keeps going.
    pub fn into_stream(self) -> impl Stream<Item = Result<Batch, QueueError>> {
        stream::unfold(self, |assembler| async move {
            loop {
                match assembler.next_batch().await {
                    Ok(Some(batch)) => return Some((Ok(batch), assembler)),
                    Ok(None) => continue,
                    Err(err) => return Some((Err(err), assembler)),
                }
            }
        })
    }

    /// Instant at which a batch opened by `member` must close.
    ///
    /// The window counts from ingestion, so a member that waited in a backlog
    /// longer than the window closes the batch right after the current receive.
    fn window_close(&self, member: &BatchMember) -> Instant {
        let age = (Utc::now() - member.received_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Instant::now() + self.max_batch_window.saturating_sub(age)
    }

    /// Decodes and re-checks a delivery. Messages that can never succeed are
    /// dead-lettered here without consuming a retry.
    async fn admit(&self, delivery: Delivery) -> Option<BatchMember> {
        let request = match InvalidationRequest::from_body(&delivery.body) {
            Ok(request) => request,
            Err(err) => {
                self.reject(&delivery, format!("malformed message body: {}", err))
                    .await;
                return None;
            }
        };

        let path = match self.validator.revalidate(&request.path) {
            Ok(path) => path,
            Err(err) => {
                self.reject(&delivery, format!("invalid path: {}", err)).await;
                return None;
            }
        };

        Some(BatchMember {
            message_id: delivery.message_id,
            receipt: delivery.receipt,
            receive_count: delivery.receive_count,
            path,
            received_at: request.received_at,
            correlation_id: request.correlation_id,
        })
    }

    async fn reject(&self, delivery: &Delivery, reason: String) {
        warn!(message_id = %delivery.message_id, %reason, "Dead-lettering unusable message");
        counter!("purgeline_messages_dead_lettered_total", "reason" => "invalid_message")
            .increment(1);
        if let Err(err) = self.queue.dead_letter(&delivery.receipt, &reason).await {
            // Left to the queue's redrive policy.
            warn!(message_id = %delivery.message_id, error = %err, "Failed to dead-letter message");
        }
    }

    fn finish(&self, batch: Batch) -> Batch {
        histogram!("purgeline_batch_paths").record(batch.len() as f64);
        debug!(
            batch_id = %batch.id(),
            paths = batch.len(),
            members = batch.member_count(),
            "Closed batch"
        );
        batch
    }
}
