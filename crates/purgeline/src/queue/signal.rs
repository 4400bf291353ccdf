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

//! Wake-up signal for long-polling receivers.
//!
//! Producers call [`WorkSignal::notify`] after making a message visible.
//! Receivers take a [`Notified`] future *before* checking for messages and
//! then [`wait`](WorkSignal::wait) on it, so a notification that lands between
//! the check and the wait is not lost. A poll fallback bounds every wait for
//! backends where visibility can change without a notification (lease expiry,
//! another process writing to the same database).
//!
//! ```rust,ignore
//! let deadline = Instant::now() + wait;
//! loop {
//!     let notified = signal.notified();
//!     let found = try_receive()?;
//!     if !found.is_empty() || Instant::now() >= deadline {
//!         return Ok(found);
//!     }
//!     signal.wait(notified, deadline).await;
//! }
//! ```

use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Notification channel with a poll fallback.
#[derive(Debug)]
pub struct WorkSignal {
    notify: Notify,
    poll_interval: Duration,
}

impl WorkSignal {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            notify: Notify::new(),
            poll_interval,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Wakes every receiver currently waiting.
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }

    /// Registers interest in the next notification.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }

    /// Waits for `notified`, the poll interval or `deadline`, whichever comes first.
    pub async fn wait(&self, notified: Notified<'_>, deadline: Instant) {
        let wake_at = deadline.min(Instant::now() + self.poll_interval);
        tokio::select! {
            _ = notified => {
                trace!("Receiver woken by notification");
            }
            _ = tokio::time::sleep_until(wake_at) => {
                trace!("Receiver woken by poll interval");
            }
        }
    }
}

impl Default for WorkSignal {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
