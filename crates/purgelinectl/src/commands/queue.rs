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

//! Implementation of the `queue stats` command.

use anyhow::{Context, Result};
use purgeline::{InvalidationQueue, QueueStats};

pub async fn stats<Q: InvalidationQueue>(queue: &Q, json: bool) -> Result<QueueStats> {
    let stats = queue.stats().await.context("Failed to read queue stats")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!("visible:        {}", stats.visible);
        println!("in flight:      {}", stats.in_flight);
        println!("dead-lettered:  {}", stats.dead_lettered);
    }
    Ok(stats)
}
