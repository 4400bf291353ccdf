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

//! Consumer workers and the pipeline runner.
//!
//! Each [`InvalidationWorker`] loops over admission, batch assembly and
//! execution. Workers share the queue, the provider and one
//! [`AdmissionController`], and coordinate with each other only through
//! queue leases.
//!
//! Shutdown is cooperative: a worker that is waiting for admission or
//! assembling a batch stops at once (leases it holds expire and the messages
//! are redelivered), while a batch that is already executing is settled first.

use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::admission::AdmissionController;
use crate::assembler::BatchAssembler;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::InvalidationExecutor;
use crate::ingest::IngestionService;
use crate::path::PathValidator;
use crate::provider::InvalidationProvider;
use crate::queue::InvalidationQueue;

/// One assembler/executor pair.
pub struct InvalidationWorker {
    id: usize,
    assembler: BatchAssembler,
    executor: InvalidationExecutor,
    error_backoff: Duration,
}

impl InvalidationWorker {
    pub fn new(id: usize, assembler: BatchAssembler, executor: InvalidationExecutor) -> Self {
        Self {
            id,
            assembler,
            executor,
            error_backoff: Duration::from_secs(1),
        }
    }

    /// Delay before polling again after the queue failed.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Runs until `shutdown` fires or its sender is dropped.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(worker = self.id, "Invalidation worker started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.executor.admission().acquire() => permit,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(err) => {
                    error!(worker = self.id, error = %err, "Admission failed");
                    break;
                }
            };

            let next = tokio::select! {
                _ = shutdown.recv() => break,
                next = self.assembler.next_batch() => next,
            };

            match next {
                Ok(Some(batch)) => {
                    counter!("purgeline_batches_executed_total").increment(1);
                    self.executor.execute_admitted(batch, permit).await;
                }
                Ok(None) => {}
                Err(err) => {
                    drop(permit);
                    warn!(worker = self.id, error = %err, "Queue receive failed");
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker = self.id, "Invalidation worker stopped");
    }
}

struct RuntimeHandles {
    workers: Vec<JoinHandle<()>>,
    shutdown_sender: Option<broadcast::Sender<()>>,
}

/// Owns the workers of one pipeline.
///
/// ```rust,ignore
/// let pipeline = InvalidationPipeline::new(config, queue, provider)?;
/// let ingestion = pipeline.ingestion();
/// pipeline.start().await?;
/// ingestion.submit("/images/*").await?;
/// pipeline.shutdown().await?;
/// ```
pub struct InvalidationPipeline {
    config: PipelineConfig,
    queue: Arc<dyn InvalidationQueue>,
    provider: Arc<dyn InvalidationProvider>,
    admission: Arc<AdmissionController>,
    runtime_handles: RwLock<RuntimeHandles>,
}

impl InvalidationPipeline {
    /// Validates `config` and wires the components together. Workers start
    /// with [`start`](Self::start).
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn InvalidationQueue>,
        provider: Arc<dyn InvalidationProvider>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let admission = Arc::new(AdmissionController::new(
            config.max_in_flight(),
            config.in_flight_hold(),
        ));
        Ok(Self {
            config,
            queue,
            provider,
            admission,
            runtime_handles: RwLock::new(RuntimeHandles {
                workers: Vec::new(),
                shutdown_sender: None,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<dyn InvalidationQueue> {
        &self.queue
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Ingestion front door feeding this pipeline's queue.
    pub fn ingestion(&self) -> IngestionService {
        IngestionService::new(self.queue.clone())
            .with_validator(PathValidator::new(self.config.max_path_length()))
    }

    pub async fn is_running(&self) -> bool {
        self.runtime_handles.read().await.shutdown_sender.is_some()
    }

    /// Spawns `worker_count` workers.
    pub async fn start(&self) -> Result<(), PipelineError> {
        let mut handles = self.runtime_handles.write().await;
        if handles.shutdown_sender.is_some() {
            return Err(PipelineError::AlreadyRunning);
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        for id in 0..self.config.worker_count() {
            let worker = InvalidationWorker::new(
                id,
                BatchAssembler::new(self.queue.clone(), &self.config),
                InvalidationExecutor::new(
                    self.queue.clone(),
                    self.provider.clone(),
                    self.admission.clone(),
                    &self.config,
                ),
            )
            .with_error_backoff(self.config.queue_poll_interval());
            handles.workers.push(tokio::spawn(worker.run(shutdown_tx.subscribe())));
        }
        handles.shutdown_sender = Some(shutdown_tx);

        info!(
            workers = self.config.worker_count(),
            distribution_id = self.config.distribution_id(),
            provider = self.provider.name(),
            "Invalidation pipeline started"
        );
        Ok(())
    }

    /// Signals every worker and waits for them to stop.
    pub async fn shutdown(&self) -> Result<(), PipelineError> {
        let mut handles = self.runtime_handles.write().await;

        if let Some(sender) = handles.shutdown_sender.take() {
            let _ = sender.send(());
        }

        let mut failures = Vec::new();
        for handle in handles.workers.drain(..) {
            if let Err(err) = handle.await {
                failures.push(err.to_string());
            }
        }

        info!("Invalidation pipeline stopped");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Worker(failures.join("; ")))
        }
    }
}
