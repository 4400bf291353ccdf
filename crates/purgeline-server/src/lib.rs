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

//! # purgeline-server
//!
//! Runs the invalidation pipeline as a service: the `POST /invalidate`
//! ingestion endpoint, the consumer workers, or both, configured from a TOML
//! file and `PURGELINE_*` environment variables.

pub mod config;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod server;

pub use config::{ConfigLoader, PurgelineConfig, Validate};
pub use server::{run, Role};
