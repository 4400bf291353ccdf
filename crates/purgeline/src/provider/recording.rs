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

//! Scriptable in-memory provider.
//!
//! [`RecordingProvider`] accepts every call unless told otherwise and keeps a
//! log of the calls it saw. It backs the `noop` provider mode of the server
//! and is the provider used throughout the test suites.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::{InvalidationProvider, ProviderReceipt};
use crate::error::ProviderError;
use crate::models::InvalidationId;

/// One call observed by a [`RecordingProvider`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub distribution_id: String,
    pub paths: BTreeSet<String>,
    pub caller_reference: String,
    /// When the call started, on tokio's clock.
    pub at: Instant,
}

/// How the provider answers a call that contains an invalid path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionMode {
    /// Accept the call and report the invalid paths in the receipt.
    #[default]
    Partial,
    /// Fail the whole call with [`ProviderError::Rejected`].
    WholeCall,
}

/// In-memory [`InvalidationProvider`] with scripted failures.
#[derive(Debug, Default)]
pub struct RecordingProvider {
    calls: Mutex<Vec<RecordedCall>>,
    script: Mutex<VecDeque<ProviderError>>,
    invalid_paths: Mutex<BTreeSet<String>>,
    rejection_mode: RejectionMode,
    latency: Option<Duration>,
    history_limit: Option<usize>,
    total_calls: AtomicUsize,
    next_id: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingProvider {
    /// A provider that accepts every call.
    pub fn accepting() -> Self {
        Self::default()
    }

    /// Sets how calls containing invalid paths are answered.
    pub fn with_rejection_mode(mut self, mode: RejectionMode) -> Self {
        self.rejection_mode = mode;
        self
    }

    /// Delays every call by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Keeps only the most recent `limit` calls in the log.
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = Some(limit);
        self
    }

    /// Marks paths the provider will never accept.
    pub fn reject_paths<I, S>(&self, paths: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.invalid_paths
            .lock()
            .extend(paths.into_iter().map(Into::into));
    }

    /// Fails the next unanswered call with `error`. Scripted errors are used in
    /// the order they were pushed and take precedence over path rejection.
    pub fn push_error(&self, error: ProviderError) {
        self.script.lock().push_back(error);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Calls received so far, including those dropped from the log.
    pub fn call_count(&self) -> usize {
        self.total_calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in progress at the same time.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn answer(&self, paths: &BTreeSet<String>) -> Result<ProviderReceipt, ProviderError> {
        if let Some(error) = self.script.lock().pop_front() {
            return Err(error);
        }

        let failed_paths: BTreeSet<String> = {
            let invalid = self.invalid_paths.lock();
            paths.intersection(&invalid).cloned().collect()
        };
        if !failed_paths.is_empty() && self.rejection_mode == RejectionMode::WholeCall {
            return Err(ProviderError::Rejected { failed_paths });
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderReceipt {
            invalidation_id: InvalidationId::from(format!("I{:013}", n)),
            failed_paths,
        })
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InvalidationProvider for RecordingProvider {
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &BTreeSet<String>,
        caller_reference: &str,
    ) -> Result<ProviderReceipt, ProviderError> {
        {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                distribution_id: distribution_id.to_string(),
                paths: paths.clone(),
                caller_reference: caller_reference.to_string(),
                at: Instant::now(),
            });
            if let Some(limit) = self.history_limit {
                let excess = calls.len().saturating_sub(limit);
                calls.drain(..excess);
            }
        }
        self.total_calls.fetch_add(1, Ordering::SeqCst);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        // Decrements even when the caller drops the call on timeout.
        let _guard = InFlightGuard(&self.in_flight);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let result = self.answer(paths);
        debug!(
            distribution_id,
            paths = paths.len(),
            ok = result.is_ok(),
            "Recorded invalidation call"
        );
        result
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}
