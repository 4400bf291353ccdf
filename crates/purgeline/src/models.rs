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

//! Domain types shared by the pipeline components.
//!
//! An [`InvalidationRequest`] is the JSON body of one queue message. The queue
//! hands it out as a [`Delivery`] carrying a per-lease [`ReceiptHandle`]; the
//! assembler turns deliveries into [`BatchMember`]s of a [`Batch`], and the
//! executor reduces the provider's answer to an [`InvalidationOutcome`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::path::NormalizedPath;
use crate::provider::ProviderReceipt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Stable identifier assigned by the queue at enqueue time. Returned to
    /// ingestion callers as `deliveryId`.
    MessageId
);

string_id!(
    /// Per-lease token. Acknowledge, extend and dead-letter operate on it; a
    /// new handle is issued every time the message is received.
    ReceiptHandle
);

string_id!(
    /// Identifier the provider returns for an accepted invalidation.
    InvalidationId
);

impl MessageId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl ReceiptHandle {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// One caller-submitted unit of work, serialized as the queue message body.
///
/// `path` is normalized at ingestion and re-checked by the assembler before
/// it joins a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRequest {
    pub path: String,
    pub received_at: DateTime<Utc>,
    pub correlation_id: Uuid,
}

impl InvalidationRequest {
    pub fn new(path: NormalizedPath) -> Self {
        Self {
            path: path.into_string(),
            received_at: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    pub fn to_body(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_body(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// A leased message as returned by [`InvalidationQueue::receive`](crate::queue::InvalidationQueue::receive).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: MessageId,
    pub receipt: ReceiptHandle,
    pub body: String,
    /// Number of times the message has been received, including this one.
    pub receive_count: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl Delivery {
    /// Number of earlier deliveries that ended without acknowledgment.
    pub fn redeliveries(&self) -> u32 {
        self.receive_count.saturating_sub(1)
    }
}

/// A validated delivery that contributed a path to a [`Batch`].
#[derive(Debug, Clone)]
pub struct BatchMember {
    pub message_id: MessageId,
    pub receipt: ReceiptHandle,
    pub receive_count: u32,
    pub path: NormalizedPath,
    pub received_at: DateTime<Utc>,
    pub correlation_id: Uuid,
}

impl BatchMember {
    pub fn redeliveries(&self) -> u32 {
        self.receive_count.saturating_sub(1)
    }
}

/// A deduplicated set of paths submitted together in one provider call.
///
/// `paths` maps each distinct path to the indices of every member that
/// requested it, so all contributing messages can be settled together.
#[derive(Debug, Clone)]
pub struct Batch {
    id: Uuid,
    paths: BTreeMap<NormalizedPath, Vec<usize>>,
    members: Vec<BatchMember>,
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

impl Batch {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            paths: BTreeMap::new(),
            members: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Adds a member. Returns `true` when its path was not in the batch yet.
    pub fn push(&mut self, member: BatchMember) -> bool {
        let index = self.members.len();
        let is_new = match self.paths.get_mut(&member.path) {
            Some(indices) => {
                indices.push(index);
                false
            }
            None => {
                self.paths.insert(member.path.clone(), vec![index]);
                true
            }
        };
        self.members.push(member);
        is_new
    }

    /// Number of distinct paths.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains_key(path)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn members(&self) -> &[BatchMember] {
        &self.members
    }

    pub fn paths(&self) -> impl Iterator<Item = &NormalizedPath> {
        self.paths.keys()
    }

    /// The distinct paths as plain strings, in the shape the provider takes.
    pub fn path_set(&self) -> BTreeSet<String> {
        self.paths.keys().map(|p| p.as_str().to_string()).collect()
    }

    /// Every member that requested `path`.
    pub fn members_for<'a>(&'a self, path: &str) -> impl Iterator<Item = &'a BatchMember> + 'a {
        self.paths
            .get(path)
            .into_iter()
            .flatten()
            .map(move |&index| &self.members[index])
    }

    /// Ingestion time of the oldest member.
    pub fn first_received_at(&self) -> Option<DateTime<Utc>> {
        self.members.iter().map(|m| m.received_at).min()
    }
}

/// Result of one provider call for a batch.
///
/// Exactly one of two shapes occurs: a successful call carries an
/// `invalidation_id` and possibly some `failed_paths`; a failed call carries
/// a `provider_error` and no id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationOutcome {
    pub invalidation_id: Option<InvalidationId>,
    pub failed_paths: BTreeSet<String>,
    pub provider_error: Option<ProviderError>,
}

impl InvalidationOutcome {
    pub fn from_provider_result(result: Result<ProviderReceipt, ProviderError>) -> Self {
        match result {
            Ok(receipt) => Self {
                invalidation_id: Some(receipt.invalidation_id),
                failed_paths: receipt.failed_paths,
                provider_error: None,
            },
            Err(ProviderError::Rejected { failed_paths }) => Self {
                invalidation_id: None,
                failed_paths: failed_paths.clone(),
                provider_error: Some(ProviderError::Rejected { failed_paths }),
            },
            Err(err) => Self {
                invalidation_id: None,
                failed_paths: BTreeSet::new(),
                provider_error: Some(err),
            },
        }
    }

    /// Whether the whole call failed in a way that may succeed later.
    pub fn is_transient_failure(&self) -> bool {
        self.provider_error
            .as_ref()
            .map(ProviderError::is_transient)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::validate;

    fn member(path: &str) -> BatchMember {
        BatchMember {
            message_id: MessageId::generate(),
            receipt: ReceiptHandle::generate(),
            receive_count: 1,
            path: validate(path).unwrap(),
            received_at: Utc::now(),
            correlation_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_batch_deduplicates_paths_but_keeps_members() {
        let mut batch = Batch::new();
        assert!(batch.push(member("/a")));
        assert!(batch.push(member("/b")));
        assert!(!batch.push(member("/a")));

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.member_count(), 3);
        assert_eq!(batch.members_for("/a").count(), 2);
        assert_eq!(batch.members_for("/b").count(), 1);
        assert_eq!(batch.members_for("/c").count(), 0);
        assert_eq!(
            batch.path_set(),
            ["/a".to_string(), "/b".to_string()].into_iter().collect()
        );
    }

    #[test]
    fn test_empty_batch() {
        let batch = Batch::new();
        assert!(batch.is_empty());
        assert!(batch.first_received_at().is_none());
    }

    #[test]
    fn test_request_body_round_trip() {
        let request = InvalidationRequest::new(validate("/img/*").unwrap());
        let body = request.to_body().unwrap();
        assert!(body.contains("\"path\":\"/img/*\""));
        assert_eq!(InvalidationRequest::from_body(&body).unwrap(), request);
    }

    #[test]
    fn test_outcome_from_partial_success() {
        let outcome = InvalidationOutcome::from_provider_result(Ok(ProviderReceipt {
            invalidation_id: InvalidationId::from("I1"),
            failed_paths: ["/bad".to_string()].into_iter().collect(),
        }));
        assert_eq!(outcome.invalidation_id, Some(InvalidationId::from("I1")));
        assert!(outcome.failed_paths.contains("/bad"));
        assert!(!outcome.is_transient_failure());
    }

    #[test]
    fn test_outcome_from_rate_limit() {
        let outcome = InvalidationOutcome::from_provider_result(Err(
            ProviderError::RateLimited { retry_after: None },
        ));
        assert!(outcome.invalidation_id.is_none());
        assert!(outcome.is_transient_failure());
    }

    #[test]
    fn test_delivery_redeliveries() {
        let delivery = Delivery {
            message_id: MessageId::generate(),
            receipt: ReceiptHandle::generate(),
            body: String::new(),
            receive_count: 3,
            enqueued_at: Utc::now(),
        };
        assert_eq!(delivery.redeliveries(), 2);
    }
}
