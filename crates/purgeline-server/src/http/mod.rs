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

//! HTTP surface: the ingestion endpoint and operational probes.
//!
//! | Route             | Purpose                                        |
//! |-------------------|------------------------------------------------|
//! | `POST /invalidate`| validate and enqueue one path (`202`)          |
//! | `GET /health`     | liveness                                       |
//! | `GET /ready`      | readiness, pings the queue                     |
//! | `GET /metrics`    | Prometheus exposition, when metrics are enabled|

pub mod routes;
pub mod state;

#[cfg(test)]
mod tests;

pub use routes::{create_router, ApiError, InvalidateBody, DEFAULT_BODY_LIMIT};
pub use state::AppState;
