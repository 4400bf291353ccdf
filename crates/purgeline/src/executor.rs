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

//! Batch execution: one provider call per batch and per-message settlement.
//!
//! Settlement rules, per member of a batch:
//!
//! - provider accepted the call: members of accepted paths are acknowledged,
//!   members of paths listed in the receipt's `failed_paths` are dead-lettered
//! - provider rejected the whole call naming some paths: those members are
//!   dead-lettered and the remaining paths are submitted once more
//! - transient failure (rate limit, timeout, network): every member is
//!   redelivered after a backoff delay, or dead-lettered once it has used up
//!   its redeliveries
//!
//! Nothing is acknowledged on a transient failure, so the queue redelivers
//! every member. A failed acknowledge or dead-letter is logged and left to the
//! queue: the lease expires and the message comes back.
//!
//! Every member's lease is renewed to a full visibility timeout right before
//! each provider call. Waiting for admission while holding leases is bounded
//! by one provider timeout, and a penalty in force hands the members back to
//! the queue instead of being waited out.

use metrics::{counter, histogram};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionPermit};
use crate::backoff::RetryPolicy;
use crate::config::PipelineConfig;
use crate::error::{ProviderError, QueueError};
use crate::models::{Batch, BatchMember, InvalidationId, InvalidationOutcome};
use crate::provider::InvalidationProvider;
use crate::queue::InvalidationQueue;

/// What happened to the members of one executed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub batch_id: Uuid,
    /// Id of the invalidation that carried the batch's paths, if any call succeeded.
    pub invalidation_id: Option<InvalidationId>,
    pub provider_calls: usize,
    pub acknowledged: usize,
    pub dead_lettered: usize,
    pub redelivered: usize,
    /// Last whole-call error, if any call failed.
    pub provider_error: Option<ProviderError>,
}

impl ExecutionReport {
    fn new(batch_id: Uuid) -> Self {
        Self {
            batch_id,
            invalidation_id: None,
            provider_calls: 0,
            acknowledged: 0,
            dead_lettered: 0,
            redelivered: 0,
            provider_error: None,
        }
    }
}

/// Calls the provider for a batch and settles every member.
#[derive(Clone)]
pub struct InvalidationExecutor {
    queue: Arc<dyn InvalidationQueue>,
    provider: Arc<dyn InvalidationProvider>,
    admission: Arc<AdmissionController>,
    distribution_id: String,
    provider_timeout: Duration,
    visibility_timeout: Duration,
    max_redeliveries: u32,
    retry_policy: RetryPolicy,
}

impl InvalidationExecutor {
    pub fn new(
        queue: Arc<dyn InvalidationQueue>,
        provider: Arc<dyn InvalidationProvider>,
        admission: Arc<AdmissionController>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            queue,
            provider,
            admission,
            distribution_id: config.distribution_id().to_string(),
            provider_timeout: config.provider_timeout(),
            visibility_timeout: config.visibility_timeout(),
            max_redeliveries: config.max_redeliveries(),
            retry_policy: config.retry_policy().clone(),
        }
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    /// Waits for admission, then executes `batch`.
    ///
    /// The members are already leased, so the wait is bounded by one provider
    /// timeout and skipped entirely while a penalty is in force.
    pub async fn execute(&self, batch: Batch) -> ExecutionReport {
        let span = self.batch_span(&batch);
        self.run(batch, None).instrument(span).await
    }

    /// Executes `batch` under an already acquired admission permit.
    pub async fn execute_admitted(&self, batch: Batch, permit: AdmissionPermit) -> ExecutionReport {
        let span = self.batch_span(&batch);
        self.run(batch, Some(permit)).instrument(span).await
    }

    fn batch_span(&self, batch: &Batch) -> tracing::Span {
        info_span!(
            "batch",
            batch_id = %batch.id(),
            paths = batch.len(),
            members = batch.member_count()
        )
    }

    async fn run(&self, batch: Batch, mut permit: Option<AdmissionPermit>) -> ExecutionReport {
        let mut report = ExecutionReport::new(batch.id());
        let mut pending = batch.path_set();
        let mut resubmitted = false;

        for member in batch.members() {
            debug!(
                correlation_id = %member.correlation_id,
                message_id = %member.message_id,
                path = %member.path,
                "Batch member"
            );
        }

        loop {
            let caller_reference = if resubmitted {
                format!("{}-resubmit", batch.id())
            } else {
                batch.id().to_string()
            };

            let admitted = match permit.take() {
                Some(permit) => permit,
                None => match self.acquire_while_leased(&batch, &mut pending).await {
                    Ok(permit) => permit,
                    Err(min_delay) => {
                        let cause = match &report.provider_error {
                            Some(err) => err.to_string(),
                            None => "provider admission deferred".to_string(),
                        };
                        self.redeliver(&batch, &pending, &cause, min_delay, &mut report)
                            .await;
                        break;
                    }
                },
            };

            self.renew_leases(&batch, &mut pending).await;
            if pending.is_empty() {
                drop(admitted);
                break;
            }

            let outcome = self.call(&pending, &caller_reference, admitted).await;
            report.provider_calls += 1;

            match outcome.provider_error {
                None => {
                    info!(
                        invalidation_id = ?outcome.invalidation_id,
                        paths = pending.len(),
                        failed = outcome.failed_paths.len(),
                        "Invalidation created"
                    );
                    report.invalidation_id = outcome.invalidation_id;
                    for path in &pending {
                        if outcome.failed_paths.contains(path) {
                            self.dead_letter_path(&batch, path, "provider rejected path", &mut report)
                                .await;
                        } else {
                            self.acknowledge_path(&batch, path, &mut report).await;
                        }
                    }
                    break;
                }
                Some(ProviderError::Rejected { failed_paths }) => {
                    let rejected: BTreeSet<String> =
                        pending.intersection(&failed_paths).cloned().collect();
                    let err = ProviderError::Rejected {
                        failed_paths: failed_paths.clone(),
                    };

                    if rejected.is_empty() {
                        // Nothing in this batch was named; retry the call later.
                        warn!("Provider rejected the call without naming any submitted path");
                        self.redeliver(&batch, &pending, &err, Duration::ZERO, &mut report)
                            .await;
                        report.provider_error = Some(err);
                        break;
                    }

                    warn!(rejected = rejected.len(), "Provider rejected paths; call not applied");
                    for path in &rejected {
                        self.dead_letter_path(&batch, path, "provider rejected path", &mut report)
                            .await;
                        pending.remove(path);
                    }
                    report.provider_error = Some(err.clone());

                    if pending.is_empty() {
                        break;
                    }
                    if resubmitted {
                        self.redeliver(&batch, &pending, &err, Duration::ZERO, &mut report)
                            .await;
                        break;
                    }
                    resubmitted = true;
                }
                Some(err) => {
                    warn!(error = %err, "Invalidation failed transiently");
                    if matches!(
                        err,
                        ProviderError::RateLimited { .. } | ProviderError::TooManyInFlight
                    ) {
                        self.admission.penalize(
                            err.retry_after()
                                .unwrap_or(self.retry_policy.initial_delay),
                        );
                    }
                    let hint = err.retry_after().unwrap_or(Duration::ZERO);
                    self.redeliver(&batch, &pending, &err, hint, &mut report).await;
                    report.provider_error = Some(err);
                    break;
                }
            }
        }

        info!(
            acknowledged = report.acknowledged,
            dead_lettered = report.dead_lettered,
            redelivered = report.redelivered,
            "Batch settled"
        );
        report
    }

    /// Acquires a permit for members that are already leased.
    ///
    /// Returns the shortest delay before the members may be retried when the
    /// permit cannot be had within one provider timeout, or when a penalty is
    /// in force.
    async fn acquire_while_leased(
        &self,
        batch: &Batch,
        pending: &mut BTreeSet<String>,
    ) -> Result<AdmissionPermit, Duration> {
        if let Some(remaining) = self.admission.paused_for() {
            debug!(?remaining, "Provider calls paused; returning members to the queue");
            return Err(remaining);
        }

        self.renew_leases(batch, pending).await;
        if pending.is_empty() {
            return Err(Duration::ZERO);
        }

        match tokio::time::timeout(self.provider_timeout, self.admission.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(err)) => {
                warn!(error = %err, "Admission failed");
                Err(Duration::ZERO)
            }
            Err(_) => {
                warn!(waited = ?self.provider_timeout, "Timed out waiting for admission");
                Err(self.admission.paused_for().unwrap_or(Duration::ZERO))
            }
        }
    }

    /// Pushes every member lease of `paths` a full visibility timeout out.
    ///
    /// A path whose members were all re-leased by another consumer is removed
    /// from `paths`; the new owner invalidates it.
    async fn renew_leases(&self, batch: &Batch, paths: &mut BTreeSet<String>) {
        let mut lost = Vec::new();
        for path in paths.iter() {
            let mut held = false;
            for member in batch.members_for(path) {
                match self.queue.extend(&member.receipt, self.visibility_timeout).await {
                    Ok(()) => held = true,
                    Err(QueueError::ReceiptNotFound(_)) => {
                        warn!(message_id = %member.message_id, "Lease lost before provider call");
                    }
                    Err(err) => {
                        // Settlement still tries the receipt.
                        held = true;
                        warn!(message_id = %member.message_id, error = %err, "Failed to renew lease");
                    }
                }
            }
            if !held {
                lost.push(path.clone());
            }
        }
        for path in lost {
            counter!("purgeline_leases_lost_total").increment(1);
            paths.remove(&path);
        }
    }

    /// One admitted provider call, bounded by the provider timeout.
    async fn call(
        &self,
        paths: &BTreeSet<String>,
        caller_reference: &str,
        permit: AdmissionPermit,
    ) -> InvalidationOutcome {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.provider_timeout,
            self.provider
                .create_invalidation(&self.distribution_id, paths, caller_reference),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.provider_timeout)),
        };

        histogram!("purgeline_provider_call_seconds").record(started.elapsed().as_secs_f64());
        let label = match &result {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        counter!("purgeline_provider_calls_total", "provider" => self.provider.name(), "outcome" => label)
            .increment(1);

        match &result {
            Ok(_) => permit.release_after_success(),
            Err(_) => drop(permit),
        }
        InvalidationOutcome::from_provider_result(result)
    }

    async fn acknowledge_path(&self, batch: &Batch, path: &str, report: &mut ExecutionReport) {
        for member in batch.members_for(path) {
            match self.queue.acknowledge(&member.receipt).await {
                Ok(()) => {
                    report.acknowledged += 1;
                    counter!("purgeline_messages_acknowledged_total").increment(1);
                }
                Err(err) => {
                    warn!(message_id = %member.message_id, error = %err, "Failed to acknowledge message");
                }
            }
        }
    }

    async fn dead_letter_path(
        &self,
        batch: &Batch,
        path: &str,
        reason: &str,
        report: &mut ExecutionReport,
    ) {
        for member in batch.members_for(path) {
            self.dead_letter_member(member, reason, "rejected_path", report)
                .await;
        }
    }

    async fn dead_letter_member(
        &self,
        member: &BatchMember,
        reason: &str,
        label: &'static str,
        report: &mut ExecutionReport,
    ) {
        match self.queue.dead_letter(&member.receipt, reason).await {
            Ok(()) => {
                report.dead_lettered += 1;
                counter!("purgeline_messages_dead_lettered_total", "reason" => label).increment(1);
                warn!(
                    message_id = %member.message_id,
                    correlation_id = %member.correlation_id,
                    path = %member.path,
                    reason,
                    "Message dead-lettered"
                );
            }
            Err(err) => {
                error!(message_id = %member.message_id, error = %err, "Failed to dead-letter message");
            }
        }
    }

    /// Returns the members of `paths` to the queue after a backoff delay of at
    /// least `min_delay`, or dead-letters those that used up their redeliveries.
    async fn redeliver(
        &self,
        batch: &Batch,
        paths: &BTreeSet<String>,
        cause: &(dyn fmt::Display + Sync),
        min_delay: Duration,
        report: &mut ExecutionReport,
    ) {
        for path in paths {
            for member in batch.members_for(path) {
                if member.redeliveries() >= self.max_redeliveries {
                    let reason = format!(
                        "redelivery limit exhausted after {} attempts: {}",
                        member.receive_count, cause
                    );
                    self.dead_letter_member(member, &reason, "redelivery_exhausted", report)
                        .await;
                    continue;
                }

                let delay = self
                    .retry_policy
                    .delay_for_attempt(member.receive_count)
                    .max(min_delay);
                match self.queue.extend(&member.receipt, delay).await {
                    Ok(()) => {
                        report.redelivered += 1;
                        counter!("purgeline_messages_redelivered_total").increment(1);
                        debug!(message_id = %member.message_id, ?delay, "Message scheduled for redelivery");
                    }
                    Err(err) => {
                        // The lease expires on its own and the message comes back anyway.
                        warn!(message_id = %member.message_id, error = %err, "Failed to delay redelivery");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::BatchAssembler;
    use crate::backoff::RetryPolicy;
    use crate::models::InvalidationRequest;
    use crate::path::validate;
    use crate::provider::{RecordingProvider, RejectionMode};
    use crate::queue::MemoryQueue;

    struct Harness {
        queue: Arc<MemoryQueue>,
        provider: Arc<RecordingProvider>,
        assembler: BatchAssembler,
        executor: InvalidationExecutor,
    }

    fn harness(provider: RecordingProvider, max_redeliveries: u32) -> Harness {
        let config = PipelineConfig::builder()
            .distribution_id("E1")
            .max_batch_window(Duration::from_millis(100))
            .max_redeliveries(max_redeliveries)
            .retry_policy(RetryPolicy::fixed_schedule(
                Duration::from_secs(2),
                Duration::from_secs(60),
                2.0,
            ))
            .build();
        let queue = Arc::new(MemoryQueue::new(config.queue_settings()));
        let provider = Arc::new(provider);
        let admission = Arc::new(AdmissionController::new(
            config.max_in_flight(),
            config.in_flight_hold(),
        ));
        Harness {
            assembler: BatchAssembler::new(queue.clone(), &config),
            executor: InvalidationExecutor::new(queue.clone(), provider.clone(), admission, &config),
            queue,
            provider,
        }
    }

    impl Harness {
        async fn submit(&self, paths: &[&str]) {
            for path in paths {
                let body = InvalidationRequest::new(validate(path).unwrap())
                    .to_body()
                    .unwrap();
                self.queue.enqueue(body).await.unwrap();
            }
        }

        /// Executes the next batch, waiting through empty windows.
        async fn run_once(&self) -> ExecutionReport {
            loop {
                if let Some(batch) = self.assembler.next_batch().await.unwrap() {
                    return self.executor.execute(batch).await;
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_acknowledges_every_member() {
        let h = harness(RecordingProvider::accepting(), 5);
        h.submit(&["/a", "/a", "/b"]).await;

        let report = h.run_once().await;
        assert_eq!(report.acknowledged, 3);
        assert!(report.invalidation_id.is_some());
        assert_eq!(h.provider.call_count(), 1);
        assert_eq!(h.provider.calls()[0].paths.len(), 2);
        assert_eq!(h.provider.calls()[0].caller_reference, report.batch_id.to_string());
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_failure_dead_letters_only_the_failed_path() {
        let h = harness(RecordingProvider::accepting(), 5);
        h.provider.reject_paths(["/b"]);
        h.submit(&["/a", "/b", "/c"]).await;

        let report = h.run_once().await;
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.dead_lettered, 1);
        assert!(h.queue.is_empty());

        let letters = h.queue.dead_letters();
        assert_eq!(letters.len(), 1);
        let request = InvalidationRequest::from_body(&letters[0].body).unwrap();
        assert_eq!(request.path, "/b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_whole_call_rejection_resubmits_remaining_paths() {
        let h = harness(
            RecordingProvider::accepting().with_rejection_mode(RejectionMode::WholeCall),
            5,
        );
        h.provider.reject_paths(["/b"]);
        h.submit(&["/a", "/b", "/c"]).await;

        let report = h.run_once().await;
        assert_eq!(report.provider_calls, 2);
        assert_eq!(report.acknowledged, 2);
        assert_eq!(report.dead_lettered, 1);
        assert!(report.invalidation_id.is_some());

        let calls = h.provider.calls();
        assert_eq!(calls[1].paths, ["/a".to_string(), "/c".to_string()].into_iter().collect());
        assert_ne!(calls[0].caller_reference, calls[1].caller_reference);
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_acknowledges_nothing_and_backs_off() {
        let h = harness(RecordingProvider::accepting(), 5);
        h.provider.push_error(ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        });
        h.submit(&["/a", "/b"]).await;

        let report = h.run_once().await;
        assert_eq!(report.acknowledged, 0);
        assert_eq!(report.redelivered, 2);
        assert!(matches!(
            report.provider_error,
            Some(ProviderError::RateLimited { .. })
        ));
        assert!(h.executor.admission().paused_for().is_some());

        // Not visible before the provider's retry-after hint
        let stats = h.queue.stats().await.unwrap();
        assert_eq!(stats.visible, 0);
        assert_eq!(stats.in_flight, 2);

        let start = Instant::now();
        let report = h.run_once().await;
        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(report.acknowledged, 2);
        assert_eq!(h.provider.calls()[1].paths, h.provider.calls()[0].paths);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_redeliveries_are_dead_lettered() {
        let h = harness(RecordingProvider::accepting(), 1);
        h.provider.push_error(ProviderError::Unavailable("reset".into()));
        h.provider.push_error(ProviderError::Unavailable("reset".into()));
        h.submit(&["/a"]).await;

        let first = h.run_once().await;
        assert_eq!(first.redelivered, 1);

        let second = h.run_once().await;
        assert_eq!(second.redelivered, 0);
        assert_eq!(second.dead_lettered, 1);

        let letters = h.queue.dead_letters();
        assert!(letters[0].reason.starts_with("redelivery limit exhausted"));
        assert!(h.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_is_a_transient_failure() {
        let h = harness(
            RecordingProvider::accepting().with_latency(Duration::from_secs(60)),
            5,
        );
        h.submit(&["/a"]).await;

        let report = h.run_once().await;
        assert_eq!(
            report.provider_error,
            Some(ProviderError::Timeout(Duration::from_secs(10)))
        );
        assert_eq!(report.acknowledged, 0);
        assert_eq!(report.redelivered, 1);
        assert_eq!(h.provider.peak_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leases_are_renewed_before_the_provider_call() {
        let h = harness(
            RecordingProvider::accepting().with_latency(Duration::from_secs(9)),
            5,
        );
        h.submit(&["/slow"]).await;
        let batch = loop {
            if let Some(batch) = h.assembler.next_batch().await.unwrap() {
                break batch;
            }
        };

        // Most of the 30s lease is gone before execution starts
        tokio::time::sleep(Duration::from_secs(25)).await;
        let executor = h.executor.clone();
        let running = tokio::spawn(async move { executor.execute(batch).await });

        // Past the original lease, while the call is still in progress
        tokio::time::sleep(Duration::from_secs(7)).await;
        let competing = h.queue.receive(10, Duration::ZERO).await.unwrap();
        assert!(competing.is_empty());

        let report = running.await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(h.provider.call_count(), 1);
        assert!(h.queue.is_empty());
        assert!(h.queue.dead_letters().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubmit_under_penalty_returns_members_instead_of_waiting() {
        let h = harness(
            RecordingProvider::accepting().with_rejection_mode(RejectionMode::WholeCall),
            5,
        );
        h.provider.reject_paths(["/bad"]);
        h.submit(&["/bad", "/good"]).await;
        let batch = loop {
            if let Some(batch) = h.assembler.next_batch().await.unwrap() {
                break batch;
            }
        };

        // Another worker was rate limited while this batch held its permit
        let permit = h.executor.admission().acquire().await.unwrap();
        h.executor.admission().penalize(Duration::from_secs(30));

        let start = Instant::now();
        let report = h.executor.execute_admitted(batch, permit).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(report.provider_calls, 1);
        assert_eq!(report.dead_lettered, 1);
        assert_eq!(report.redelivered, 1);
        assert_eq!(report.acknowledged, 0);

        // Back on the queue once the penalty has passed, not before
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(h.queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_secs(2)).await;
        let redelivered = h.queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        let request = InvalidationRequest::from_body(&redelivered[0].body).unwrap();
        assert_eq!(request.path, "/good");
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_under_penalty_makes_no_call() {
        let h = harness(RecordingProvider::accepting(), 5);
        h.submit(&["/a"]).await;
        let batch = loop {
            if let Some(batch) = h.assembler.next_batch().await.unwrap() {
                break batch;
            }
        };
        h.executor.admission().penalize(Duration::from_secs(20));

        let report = h.executor.execute(batch).await;
        assert_eq!(report.provider_calls, 0);
        assert_eq!(report.redelivered, 1);
        assert_eq!(h.provider.call_count(), 0);
        assert_eq!(h.queue.stats().await.unwrap().in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    #[tracing_test::traced_test]
    async fn test_dead_letter_is_logged_with_its_reason() {
        let h = harness(RecordingProvider::accepting(), 5);
        h.provider.reject_paths(["/gone"]);
        h.submit(&["/gone"]).await;

        h.run_once().await;
        assert!(logs_contain("Message dead-lettered"));
        assert!(logs_contain("provider rejected path"));
        assert!(logs_contain("/gone"));
    }
}
