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

//! Exponential backoff for redelivered batches.

use rand::Rng;
use std::time::Duration;

/// Backoff applied to messages whose batch failed transiently.
///
/// The delay for attempt `n` (1-based) is
/// `initial_delay * multiplier^(n-1)`, capped at `max_delay`, plus up to 25%
/// random jitter when enabled. Jitter never pushes a delay past `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy without jitter, for deterministic schedules.
    pub fn fixed_schedule(initial_delay: Duration, max_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter: false,
        }
    }

    /// Delay before the given attempt. Attempt 0 is treated as attempt 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max = self.max_delay.as_secs_f64();
        let base = (self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent)).min(max);
        if base <= 0.0 {
            return Duration::ZERO;
        }

        let delay = if self.jitter {
            let factor = 1.0 + rand::thread_rng().gen_range(0.0..0.25);
            (base * factor).min(max)
        } else {
            base
        };
        Duration::from_secs_f64(delay)
    }
}
