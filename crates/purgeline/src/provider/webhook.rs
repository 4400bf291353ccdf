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

//! HTTP webhook provider.
//!
//! Posts each invalidation to an edge-cache control plane that speaks a small
//! JSON protocol:
//!
//! ```text
//! POST {endpoint}/distributions/{distribution_id}/invalidations
//! { "caller_reference": "...", "paths": ["/a", "/b/*"] }
//!
//! 2xx      { "invalidation_id": "...", "failed_paths": [] }
//! 400/422  { "failed_paths": ["/b/*"], "message": "..." }
//! 409      too many invalidations in progress
//! 429      rate limited, optional Retry-After (seconds)
//! ```

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, warn};

use super::{InvalidationProvider, ProviderReceipt};
use crate::error::ProviderError;
use crate::models::InvalidationId;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
struct CreateInvalidationRequest<'a> {
    caller_reference: &'a str,
    paths: &'a BTreeSet<String>,
}

#[derive(Debug, Deserialize)]
struct CreateInvalidationResponse {
    invalidation_id: String,
    #[serde(default)]
    failed_paths: BTreeSet<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    failed_paths: BTreeSet<String>,
    #[serde(default)]
    message: Option<String>,
}

/// [`InvalidationProvider`] backed by an HTTP control plane.
#[derive(Debug, Clone)]
pub struct WebhookProvider {
    client: Client,
    endpoint: String,
    bearer_token: Option<String>,
    request_timeout: Duration,
}

impl WebhookProvider {
    /// Creates a provider posting to `endpoint` (scheme and host, optionally a
    /// base path). Requests that take longer than `request_timeout` fail with
    /// [`ProviderError::Timeout`].
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT.min(request_timeout))
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProviderError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            bearer_token: None,
            request_timeout,
        })
    }

    /// Sends `Authorization: Bearer <token>` with every call.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn url(&self, distribution_id: &str) -> String {
        format!(
            "{}/distributions/{}/invalidations",
            self.endpoint,
            urlencoding::encode(distribution_id)
        )
    }
}

/// Parses a `Retry-After` header given in delta-seconds.
fn parse_retry_after(value: Option<&header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl InvalidationProvider for WebhookProvider {
    async fn create_invalidation(
        &self,
        distribution_id: &str,
        paths: &BTreeSet<String>,
        caller_reference: &str,
    ) -> Result<ProviderReceipt, ProviderError> {
        let url = self.url(distribution_id);
        let mut request = self.client.post(&url).json(&CreateInvalidationRequest {
            caller_reference,
            paths,
        });
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(self.request_timeout)
            } else {
                ProviderError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        debug!(%url, %status, paths = paths.len(), "Provider responded");

        if status.is_success() {
            let body: CreateInvalidationResponse = response
                .json()
                .await
                .map_err(|e| ProviderError::Unavailable(format!("Malformed provider response: {}", e)))?;
            return Ok(ProviderReceipt {
                invalidation_id: InvalidationId::from(body.invalidation_id),
                failed_paths: body.failed_paths,
            });
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(ProviderError::RateLimited {
                retry_after: parse_retry_after(response.headers().get(header::RETRY_AFTER)),
            }),
            StatusCode::CONFLICT => Err(ProviderError::TooManyInFlight),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                let body: ErrorResponse = response.json().await.unwrap_or_default();
                if body.failed_paths.is_empty() {
                    // Without a path list nothing can be singled out; retry the call.
                    warn!(%status, message = ?body.message, "Provider refused the call without naming paths");
                    Err(ProviderError::Unavailable(format!(
                        "Provider returned {}: {}",
                        status,
                        body.message.unwrap_or_default()
                    )))
                } else {
                    Err(ProviderError::Rejected {
                        failed_paths: body.failed_paths,
                    })
                }
            }
            _ => Err(ProviderError::Unavailable(format!(
                "Provider returned {}",
                status
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}
