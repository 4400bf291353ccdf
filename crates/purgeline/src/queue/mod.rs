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

//! Durable work queue adapter.
//!
//! The queue is the only authoritative store of pending work. Consumers lease
//! messages with [`InvalidationQueue::receive`]; a leased message stays
//! invisible to other consumers for the visibility timeout and becomes
//! visible again unless it is acknowledged or dead-lettered first. The lease,
//! not a lock, decides which worker owns a message.
//!
//! Two backends are provided:
//!
//! - [`MemoryQueue`]: process-local, for tests and single-node development
//! - [`SqliteQueue`]: durable, backed by SQLite through diesel (feature `sqlite`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

use crate::error::QueueError;
use crate::models::{Delivery, MessageId, ReceiptHandle};

pub mod memory;
pub mod signal;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryQueue;
pub use signal::WorkSignal;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteQueue;

/// Reason recorded when the queue's own redrive policy dead-letters a message.
pub const MAX_RECEIVE_COUNT_REASON: &str = "maximum receive count exceeded";

/// Lease and redrive settings shared by all queue backends.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// How long a received message stays invisible to other consumers.
    pub visibility_timeout: Duration,
    /// Deliveries after which the queue moves a message to the dead-letter store.
    pub max_receive_count: u32,
    /// Fallback interval for backends that cannot push wake-ups.
    pub poll_interval: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 10,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Point-in-time message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Messages a consumer could receive right now.
    pub visible: u64,
    /// Messages leased to a consumer or delayed by backoff.
    pub in_flight: u64,
    pub dead_lettered: u64,
}

/// A message parked in the dead-letter store.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub message_id: MessageId,
    pub body: String,
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

/// At-least-once message channel holding pending invalidation requests.
#[async_trait]
pub trait InvalidationQueue: Send + Sync {
    /// Stores a message body and returns its stable id.
    async fn enqueue(&self, body: String) -> Result<MessageId, QueueError>;

    /// Leases up to `max_messages` visible messages.
    ///
    /// Returns as soon as at least one message is available, or an empty
    /// vector once `wait` has elapsed.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Removes a leased message permanently.
    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Makes a leased message visible again `visible_after` from now.
    async fn extend(&self, receipt: &ReceiptHandle, visible_after: Duration)
        -> Result<(), QueueError>;

    /// Moves a leased message to the dead-letter store.
    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Cheap liveness check used by readiness probes.
    async fn ping(&self) -> Result<(), QueueError> {
        self.stats().await.map(|_| ())
    }
}

/// Operator access to dead-lettered messages.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Most recently dead-lettered messages first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError>;

    /// Returns one dead letter to the queue with a fresh receive count.
    async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError>;

    /// Returns every dead letter to the queue. Returns how many were moved.
    async fn redrive_all(&self) -> Result<usize, QueueError>;

    /// Deletes dead letters parked before `older_than`. Returns how many were deleted.
    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError>;
}
