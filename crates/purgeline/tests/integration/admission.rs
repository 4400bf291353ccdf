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

//! Provider-facing throttling across several workers.

use purgeline::{ProviderError, RecordingProvider};
use std::time::Duration;

use crate::fixtures::{config, wait_for, TestPipeline};

#[tokio::test(start_paused = true)]
async fn in_flight_calls_never_exceed_the_limit() {
    let provider = RecordingProvider::accepting().with_latency(Duration::from_secs(1));
    let test = TestPipeline::start(
        config()
            .max_batch_size(10)
            .worker_count(4)
            .max_in_flight(2)
            .build(),
        provider,
    )
    .await;

    test.submit_all((0..80).map(|i| format!("/static/{i}.css")))
        .await;
    assert!(wait_for(Duration::from_secs(120), || test.queue.is_empty()).await);

    assert_eq!(test.provider.call_count(), 8);
    assert!(test.provider.peak_in_flight() <= 2);
    assert!(test.provider.peak_in_flight() >= 1);
    test.stop().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limit_pauses_every_worker() {
    let provider = RecordingProvider::accepting();
    provider.push_error(ProviderError::RateLimited {
        retry_after: Some(Duration::from_secs(20)),
    });
    let test = TestPipeline::start(
        config().max_batch_size(5).worker_count(3).build(),
        provider,
    )
    .await;

    test.submit_all((0..15).map(|i| format!("/feed/{i}.xml")))
        .await;
    assert!(wait_for(Duration::from_secs(10), || test.provider.call_count() >= 1).await);
    let limited_at = test.provider.calls()[0].at;

    assert!(wait_for(Duration::from_secs(120), || test.queue.is_empty()).await);
    let calls = test.provider.calls();
    // Calls that raced the throttled one may land before the penalty took
    // effect; every call started afterwards waits it out.
    let late: Vec<_> = calls
        .iter()
        .skip(1)
        .filter(|call| call.at > limited_at)
        .collect();
    assert!(!late.is_empty());
    for call in late {
        assert!(call.at - limited_at >= Duration::from_secs(20), "{:?}", call.at - limited_at);
    }
    test.stop().await;
}
