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

//! Invalidation provider capability.
//!
//! The edge cache's control plane is an external collaborator reached through
//! a single call, [`InvalidationProvider::create_invalidation`]. The call is
//! atomic for the paths it carries: either the provider accepts the call
//! (possibly reporting some paths it could not apply) or it fails as a whole.

use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::error::ProviderError;
use crate::models::InvalidationId;

pub mod recording;
#[cfg(feature = "webhook")]
pub mod webhook;

pub use recording::{RecordedCall, RecordingProvider, RejectionMode};
#[cfg(feature = "webhook")]
pub use webhook::WebhookProvider;

/// A provider's acceptance of an invalidation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderReceipt {
    pub invalidation_id: InvalidationId,
    /// Paths the provider could not apply. Empty when everything was accepted.
    pub failed_paths: BTreeSet<String>,
}

impl ProviderReceipt {
    /// A receipt for a call whose paths were all accepted.
    pub fn accepted(invalidation_id: impl Into<InvalidationId>) -> Self {
        Self {
            invalidation_id: invalidation_id.into(),
            failed_paths: BTreeSet::new(),
        }
    }
}

/// Creates invalidations against one edge-cache distribution.
#[async_trait]
pub trait InvalidationProvider: Send + Sync {
    /// Submits `paths` as one invalidation.
    ///
    /// `caller_reference` identifies the batch so a provider that
    /// de-duplicates by caller reference can absorb replays of the same call.
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &BTreeSet<String>,
        caller_reference: &str,
    ) -> Result<ProviderReceipt, ProviderError>;

    /// Short name used in logs and metrics labels.
    fn name(&self) -> &'static str;
}
