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

//! # Purgeline
//!
//! Batched edge-cache invalidation pipeline.
//!
//! Callers submit paths (or trailing-wildcard patterns) through an ingestion
//! service that validates them and places them on a durable, at-least-once
//! queue. Consumer workers drain the queue into deduplicated batches closed by
//! a dual size/time trigger and submit each batch to a rate-limited
//! invalidation provider, acknowledging, redelivering or dead-lettering every
//! message according to its own outcome.
//!
//! ## Components
//!
//! - [`path`]: normalization and validation of cache paths
//! - [`queue`]: the queue adapter contract and its in-memory and SQLite backends
//! - [`ingest`]: the ingestion service behind `POST /invalidate`
//! - [`assembler`]: batch assembly with size/time triggers
//! - [`executor`]: provider calls and per-message acknowledgment
//! - [`admission`]: in-flight throttle ahead of the provider
//! - [`worker`]: consumer workers and the pipeline runner
//!
//! ## Example
//!
//! ```rust,ignore
//! use purgeline::{InvalidationPipeline, PipelineConfig, MemoryQueue, RecordingProvider};
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::builder().distribution_id("E2EXAMPLE").build();
//! let queue = Arc::new(MemoryQueue::new(config.queue_settings()));
//! let provider = Arc::new(RecordingProvider::accepting());
//!
//! let pipeline = InvalidationPipeline::new(config, queue, provider)?;
//! pipeline.start().await?;
//!
//! let accepted = pipeline.ingestion().submit("/images/*").await?;
//! println!("queued as {}", accepted.delivery_id);
//!
//! pipeline.shutdown().await?;
//! ```

pub mod admission;
pub mod assembler;
pub mod backoff;
pub mod config;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod models;
pub mod path;
pub mod provider;
pub mod queue;
pub mod worker;

pub use admission::{AdmissionController, AdmissionPermit};
pub use assembler::BatchAssembler;
pub use backoff::RetryPolicy;
pub use config::{PipelineConfig, PipelineConfigBuilder};
pub use error::{IngestError, PipelineError, ProviderError, QueueError};
pub use executor::{ExecutionReport, InvalidationExecutor};
pub use ingest::{Accepted, IngestionService};
pub use models::{
    Batch, BatchMember, Delivery, InvalidationId, InvalidationOutcome, InvalidationRequest,
    MessageId, ReceiptHandle,
};
pub use path::{NormalizedPath, PathError, PathValidator};
pub use provider::{InvalidationProvider, ProviderReceipt, RecordingProvider, RejectionMode};
pub use queue::{
    DeadLetter, DeadLetterStore, InvalidationQueue, MemoryQueue, QueueSettings, QueueStats,
    WorkSignal,
};
pub use worker::{InvalidationPipeline, InvalidationWorker};

#[cfg(feature = "sqlite")]
pub use queue::SqliteQueue;

#[cfg(feature = "webhook")]
pub use provider::WebhookProvider;
