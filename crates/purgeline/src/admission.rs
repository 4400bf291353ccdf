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

//! Admission control ahead of the provider.
//!
//! Invalidation APIs usually cap how many invalidations a distribution may
//! have in progress, and throttle callers that exceed their request rate.
//! [`AdmissionController`] keeps the executor inside both limits: a provider
//! call needs an [`AdmissionPermit`], at most `max_in_flight` permits exist,
//! and after a rate-limit or in-flight rejection the controller stops handing
//! out permits until the penalty has passed.
//!
//! A permit for a successful call can be kept for a `hold` period after the
//! call returns, approximating the time the provider needs to finish the
//! invalidation before it stops counting against the in-flight cap.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::ProviderError;

/// Caps concurrent provider invalidations for one distribution.
#[derive(Debug)]
pub struct AdmissionController {
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    hold: Duration,
    paused_until: Mutex<Option<Instant>>,
}

impl AdmissionController {
    /// `max_in_flight` must be at least 1.
    pub fn new(max_in_flight: usize, hold: Duration) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            hold,
            paused_until: Mutex::new(None),
        }
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Remaining time of the current penalty, if any.
    pub fn paused_for(&self) -> Option<Duration> {
        let now = Instant::now();
        self.paused_until
            .lock()
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    /// Stops admitting calls for `delay`. Overlapping penalties keep the later end.
    pub fn penalize(&self, delay: Duration) {
        let until = Instant::now() + delay;
        let mut paused = self.paused_until.lock();
        if paused.map_or(true, |current| current < until) {
            info!(?delay, "Pausing provider calls");
            *paused = Some(until);
        }
    }

    /// Waits for a free permit and for any penalty to pass.
    pub async fn acquire(&self) -> Result<AdmissionPermit, ProviderError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProviderError::Unavailable("admission controller closed".into()))?;

        // A penalty can be applied while this caller waited for the permit.
        while let Some(remaining) = self.paused_for() {
            debug!(?remaining, "Waiting for provider penalty to pass");
            tokio::time::sleep(remaining).await;
        }

        Ok(AdmissionPermit {
            permit: Some(permit),
            hold: self.hold,
        })
    }
}

/// Permission to make one provider call.
///
/// Dropping the permit frees its slot immediately. Call
/// [`release_after_success`](Self::release_after_success) after an accepted
/// invalidation to keep the slot for the configured hold period.
#[derive(Debug)]
pub struct AdmissionPermit {
    permit: Option<OwnedSemaphorePermit>,
    hold: Duration,
}

impl AdmissionPermit {
    pub fn release_after_success(mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };
        if self.hold.is_zero() {
            drop(permit);
            return;
        }
        let hold = self.hold;
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            drop(permit);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_limits_permits() {
        let admission = Arc::new(AdmissionController::new(2, Duration::ZERO));
        let first = admission.acquire().await.unwrap();
        let _second = admission.acquire().await.unwrap();
        assert_eq!(admission.available(), 0);

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.acquire().await.unwrap() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let _third = waiter.await.unwrap();
        assert_eq!(admission.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_keeps_slot_after_success() {
        let admission = AdmissionController::new(1, Duration::from_secs(3));
        admission.acquire().await.unwrap().release_after_success();
        assert_eq!(admission.available(), 0);

        let start = Instant::now();
        let _permit = admission.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_after_success_without_hold_is_immediate() {
        let admission = AdmissionController::new(1, Duration::ZERO);
        admission.acquire().await.unwrap().release_after_success();
        assert_eq!(admission.available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_penalty_delays_admission() {
        let admission = AdmissionController::new(4, Duration::ZERO);
        admission.penalize(Duration::from_secs(10));
        admission.penalize(Duration::from_secs(2));
        assert!(admission.paused_for().unwrap() > Duration::from_secs(9));

        let start = Instant::now();
        let _permit = admission.acquire().await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(admission.paused_for().is_none());
    }
}
