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

//! The pipeline over the durable SQLite queue, on the real clock.

use purgeline::{
    DeadLetterStore, IngestionService, InvalidationPipeline, InvalidationQueue, MessageId,
    PipelineConfig, RecordingProvider, SqliteQueue,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::fixtures::{config, wait_for};

fn fast_config() -> PipelineConfig {
    config()
        .max_batch_size(10)
        .max_batch_window(Duration::from_millis(200))
        .queue_poll_interval(Duration::from_millis(20))
        .build()
}

async fn open(dir: &TempDir, config: &PipelineConfig) -> Arc<SqliteQueue> {
    let url = format!("sqlite://{}", dir.path().join("queue.db").display());
    Arc::new(
        SqliteQueue::connect(&url, config.queue_settings())
            .await
            .expect("queue opens"),
    )
}

fn delivered(provider: &RecordingProvider) -> BTreeSet<String> {
    provider
        .calls()
        .into_iter()
        .flat_map(|call| call.paths)
        .collect()
}

#[tokio::test]
async fn drains_the_durable_queue() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();
    let queue = open(&dir, &config).await;
    let provider = Arc::new(RecordingProvider::accepting());
    let pipeline = InvalidationPipeline::new(config, queue.clone(), provider.clone()).unwrap();
    pipeline.start().await.unwrap();

    let ingestion = pipeline.ingestion();
    for i in 0..25 {
        ingestion.submit(&format!("/docs/{i}")).await.unwrap();
    }

    assert!(wait_for(Duration::from_secs(10), || delivered(&provider).len() == 25).await);
    assert!(provider.calls().iter().all(|call| call.paths.len() <= 10));

    let mut drained = false;
    for _ in 0..100 {
        let stats = queue.stats().await.unwrap();
        if stats.in_flight == 0 && stats.visible == 0 {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(drained);
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn accepted_requests_survive_a_restart() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();

    {
        // Ingest with no workers running, then drop the queue.
        let queue = open(&dir, &config).await;
        let ingestion = IngestionService::new(queue.clone());
        ingestion.submit("/survivor").await.unwrap();
        assert_eq!(queue.stats().await.unwrap().visible, 1);
    }

    let queue = open(&dir, &config).await;
    let provider = Arc::new(RecordingProvider::accepting());
    let pipeline = InvalidationPipeline::new(config, queue.clone(), provider.clone()).unwrap();
    pipeline.start().await.unwrap();

    assert!(wait_for(Duration::from_secs(10), || provider.call_count() == 1).await);
    assert_eq!(
        delivered(&provider),
        ["/survivor".to_string()].into_iter().collect()
    );
    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_path_can_be_redriven() {
    let dir = TempDir::new().unwrap();
    let config = fast_config();
    let queue = open(&dir, &config).await;

    let provider = Arc::new(RecordingProvider::accepting());
    provider.reject_paths(["/retired"]);
    let pipeline =
        InvalidationPipeline::new(config.clone(), queue.clone(), provider.clone()).unwrap();
    pipeline.start().await.unwrap();
    pipeline.ingestion().submit("/retired").await.unwrap();

    let mut letters = Vec::new();
    for _ in 0..200 {
        letters = queue.list_dead_letters(10).await.unwrap();
        if !letters.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, "provider rejected path");
    pipeline.shutdown().await.unwrap();

    // Redrive into a pipeline whose provider accepts the path.
    let message_id: MessageId = letters[0].message_id.clone();
    queue.redrive(&message_id).await.unwrap();
    assert!(queue.list_dead_letters(10).await.unwrap().is_empty());

    let accepting = Arc::new(RecordingProvider::accepting());
    let pipeline = InvalidationPipeline::new(config, queue.clone(), accepting.clone()).unwrap();
    pipeline.start().await.unwrap();
    assert!(wait_for(Duration::from_secs(10), || accepting.call_count() == 1).await);
    pipeline.shutdown().await.unwrap();

    assert_eq!(queue.stats().await.unwrap().dead_lettered, 0);
}
