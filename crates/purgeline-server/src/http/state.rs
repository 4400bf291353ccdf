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

use purgeline::{IngestionService, InvalidationQueue};
use std::sync::Arc;

use crate::metrics::MetricsState;

/// Dependencies shared by the HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub ingestion: IngestionService,
    pub queue: Arc<dyn InvalidationQueue>,
    pub metrics: Option<MetricsState>,
}

impl AppState {
    pub fn new(ingestion: IngestionService, queue: Arc<dyn InvalidationQueue>) -> Self {
        Self {
            ingestion,
            queue,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsState) -> Self {
        self.metrics = Some(metrics);
        self
    }
}
