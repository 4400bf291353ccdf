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

//! End-to-end behavior of the pipeline over the in-memory queue.
//!
//! These tests run on a paused tokio clock, so window and backoff timings are
//! observed exactly rather than slept through.

use purgeline::{
    DeadLetterStore, InvalidationPipeline, InvalidationQueue, InvalidationRequest, MemoryQueue,
    PipelineError, ProviderError, QueueStats, RecordingProvider, RejectionMode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::fixtures::{config, wait_for, TestPipeline, DISTRIBUTION_ID};

#[tokio::test(start_paused = true)]
async fn burst_of_150_paths_becomes_two_calls() {
    let test = TestPipeline::start(config().build(), RecordingProvider::accepting()).await;
    let start = Instant::now();

    test.submit_all((0..150).map(|i| format!("/assets/{i}.js")))
        .await;
    tokio::time::sleep(Duration::from_secs(20)).await;

    let calls = test.provider.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].paths.len(), 100);
    assert_eq!(calls[1].paths.len(), 50);
    assert!(calls[0].paths.is_disjoint(&calls[1].paths));
    for call in &calls {
        assert_eq!(call.distribution_id, DISTRIBUTION_ID);
        // One timer tick of slack on top of the window.
        assert!(
            call.at - start <= Duration::from_millis(5010),
            "{:?}",
            call.at - start
        );
    }
    assert!(test.queue.is_empty());
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn single_request_is_sent_when_the_window_closes() {
    let test = TestPipeline::start(config().build(), RecordingProvider::accepting()).await;
    // Let the worker settle into its idle wait first.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let submitted = Instant::now();
    test.submit_all(["/index.html"]).await;

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(test.provider.call_count(), 0);

    tokio::time::sleep(Duration::from_secs(10)).await;
    let calls = test.provider.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(test.call_paths()[0], vec!["/index.html".to_string()]);

    let latency = calls[0].at - submitted;
    assert!(latency >= Duration::from_millis(4995), "{latency:?}");
    assert!(latency <= Duration::from_millis(5050), "{latency:?}");
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_batch_is_redelivered_unacknowledged() {
    let provider = RecordingProvider::accepting();
    provider.push_error(ProviderError::RateLimited { retry_after: None });
    let test = TestPipeline::start(config().build(), provider).await;

    test.submit_all(["/a", "/b", "/c"]).await;
    assert!(wait_for(Duration::from_secs(10), || test.provider.call_count() == 1).await);

    // Nothing acknowledged: all three messages are still held by the queue.
    assert_eq!(test.queue.len(), 3);
    assert!(test.queue.dead_letters().is_empty());

    assert!(wait_for(Duration::from_secs(60), || test.provider.call_count() == 2).await);
    let calls = test.provider.calls();
    assert_eq!(calls[0].paths, calls[1].paths);
    assert!(calls[1].at - calls[0].at >= Duration::from_secs(2));

    assert!(wait_for(Duration::from_secs(1), || test.queue.is_empty()).await);
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_paths_in_one_window_share_one_entry() {
    let test = TestPipeline::start(config().build(), RecordingProvider::accepting()).await;

    test.submit_all(["/logo.png", "/logo.png", "//logo.png"]).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(test.call_paths(), vec![vec!["/logo.png".to_string()]]);
    // Every originating message was acknowledged.
    assert!(test.queue.is_empty());
    assert_eq!(test.queue.stats().await.unwrap(), QueueStats::default());
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rejected_path_is_dead_lettered_and_the_rest_acknowledged() {
    let provider = RecordingProvider::accepting();
    provider.reject_paths(["/B"]);
    let test = TestPipeline::start(config().build(), provider).await;

    test.submit_all(["/A", "/B", "/C"]).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(test.provider.call_count(), 1);
    assert!(test.queue.is_empty());
    let letters = test.queue.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    let request = InvalidationRequest::from_body(&letters[0].body).unwrap();
    assert_eq!(request.path, "/B");
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn whole_call_rejection_still_delivers_valid_paths() {
    let provider = RecordingProvider::accepting().with_rejection_mode(RejectionMode::WholeCall);
    provider.reject_paths(["/B"]);
    let test = TestPipeline::start(config().build(), provider).await;

    test.submit_all(["/A", "/B", "/C"]).await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    let paths = test.call_paths();
    assert_eq!(paths.len(), 2);
    assert_eq!(paths[1], vec!["/A".to_string(), "/C".to_string()]);
    assert!(test.queue.is_empty());
    assert_eq!(test.queue.dead_letters().len(), 1);
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn persistent_failure_ends_in_the_dead_letter_store() {
    let provider = RecordingProvider::accepting();
    for _ in 0..20 {
        provider.push_error(ProviderError::Unavailable("503".into()));
    }
    let test = TestPipeline::start(config().max_redeliveries(2).build(), provider).await;

    test.submit_all(["/flaky"]).await;
    assert!(wait_for(Duration::from_secs(600), || test.queue.is_empty()).await);

    // One first attempt plus two redeliveries.
    assert_eq!(test.provider.call_count(), 3);
    let letters = test.queue.dead_letters();
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.contains("redelivery limit exhausted"));
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn every_request_is_eventually_settled() {
    let provider = RecordingProvider::accepting();
    provider.push_error(ProviderError::Timeout(Duration::from_secs(10)));
    provider.push_error(ProviderError::TooManyInFlight);
    provider.push_error(ProviderError::RateLimited {
        retry_after: Some(Duration::from_secs(30)),
    });
    provider.reject_paths(["/broken"]);
    let test = TestPipeline::start(
        config().max_batch_size(7).worker_count(3).build(),
        provider,
    )
    .await;

    let mut paths: Vec<String> = (0..40).map(|i| format!("/page/{i}")).collect();
    paths.push("/broken".into());
    paths.push("/page/3".into());
    test.submit_all(&paths).await;

    assert!(wait_for(Duration::from_secs(900), || test.queue.is_empty()).await);

    let delivered: std::collections::BTreeSet<String> = test
        .provider
        .calls()
        .into_iter()
        .flat_map(|call| call.paths)
        .collect();
    for path in &paths {
        assert!(delivered.contains(path), "{path} never reached the provider");
    }
    assert!(test
        .provider
        .calls()
        .iter()
        .all(|call| call.paths.len() <= 7));
    assert_eq!(test.queue.dead_letters().len(), 1);
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn open_batch_survives_a_restart() {
    let settings_config = config().visibility_timeout(Duration::from_secs(30)).build();
    let test = TestPipeline::start(settings_config, RecordingProvider::accepting()).await;

    test.submit_all(["/restart"]).await;
    tokio::time::sleep(Duration::from_secs(1)).await;
    // The worker holds the lease on an open batch when it is stopped.
    test.pipeline.shutdown().await.unwrap();
    assert_eq!(test.provider.call_count(), 0);
    assert_eq!(test.queue.len(), 1);

    test.pipeline.start().await.unwrap();
    assert!(wait_for(Duration::from_secs(60), || test.provider.call_count() == 1).await);
    assert!(wait_for(Duration::from_secs(1), || test.queue.is_empty()).await);
    test.stop().await;
}

fn slow_provider_config() -> purgeline::PipelineConfigBuilder {
    config()
        .provider_timeout(Duration::from_secs(5))
        .visibility_timeout(Duration::from_secs(16))
        .worker_count(2)
}

#[tokio::test(start_paused = true)]
async fn lease_shorter_than_window_and_call_is_refused() {
    let config = slow_provider_config()
        .visibility_timeout(Duration::from_secs(6))
        .build();
    let queue = Arc::new(MemoryQueue::new(config.queue_settings()));
    let result =
        InvalidationPipeline::new(config, queue, Arc::new(RecordingProvider::accepting()));
    assert!(matches!(result, Err(PipelineError::Configuration { .. })));
}

#[tokio::test(start_paused = true)]
async fn slow_provider_with_two_workers_invalidates_once() {
    let test = TestPipeline::start(
        slow_provider_config().build(),
        RecordingProvider::accepting().with_latency(Duration::from_secs(4)),
    )
    .await;

    test.submit_all(["/once"]).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(test.provider.call_count(), 1);
    assert!(test.queue.is_empty());
    assert!(test.queue.dead_letters().is_empty());
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn slow_resubmit_with_two_workers_acknowledges_once() {
    let provider = RecordingProvider::accepting()
        .with_latency(Duration::from_secs(4))
        .with_rejection_mode(RejectionMode::WholeCall);
    provider.reject_paths(["/broken"]);
    let test = TestPipeline::start(slow_provider_config().build(), provider).await;

    test.submit_all(["/broken", "/fine"]).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    let calls = test.call_paths();
    assert_eq!(calls.len(), 2);
    assert!(calls.contains(&vec!["/fine".to_string()]));
    assert!(test.queue.is_empty());
    let letters = test.queue.dead_letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(
        InvalidationRequest::from_body(&letters[0].body).unwrap().path,
        "/broken"
    );
    test.stop().await;
}
