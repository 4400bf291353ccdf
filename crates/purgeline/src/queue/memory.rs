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

//! Process-local queue backend.
//!
//! [`MemoryQueue`] keeps messages in a mutex-guarded map and uses tokio's
//! clock for lease deadlines, so tests running with a paused clock observe
//! visibility timeouts and backoff delays deterministically. Messages do not
//! survive a restart.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{
    DeadLetter, DeadLetterStore, InvalidationQueue, QueueSettings, QueueStats, WorkSignal,
    MAX_RECEIVE_COUNT_REASON,
};
use crate::error::QueueError;
use crate::models::{Delivery, MessageId, ReceiptHandle};

#[derive(Debug)]
struct StoredMessage {
    id: MessageId,
    body: String,
    enqueued_at: DateTime<Utc>,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<ReceiptHandle>,
}

#[derive(Debug, Default)]
struct State {
    /// Keyed by insertion sequence so receives are roughly FIFO.
    messages: BTreeMap<u64, StoredMessage>,
    dead_letters: Vec<DeadLetter>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, message: StoredMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.messages.insert(seq, message);
    }

    fn find_leased(&self, receipt: &ReceiptHandle) -> Option<u64> {
        self.messages
            .iter()
            .find(|(_, m)| m.receipt.as_ref() == Some(receipt))
            .map(|(seq, _)| *seq)
    }

    fn park(&mut self, message: StoredMessage, reason: &str) {
        self.dead_letters.push(DeadLetter {
            message_id: message.id,
            body: message.body,
            receive_count: message.receive_count,
            enqueued_at: message.enqueued_at,
            dead_lettered_at: Utc::now(),
            reason: reason.to_string(),
        });
    }
}

/// In-memory [`InvalidationQueue`] with SQS-style leases.
#[derive(Debug)]
pub struct MemoryQueue {
    state: Mutex<State>,
    settings: QueueSettings,
    signal: WorkSignal,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl MemoryQueue {
    pub fn new(settings: QueueSettings) -> Self {
        let signal = WorkSignal::new(settings.poll_interval);
        Self {
            state: Mutex::new(State::default()),
            settings,
            signal,
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Total messages held, leased or not. Dead letters are not counted.
    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the dead-letter store, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().dead_letters.clone()
    }

    /// Leases visible messages. Also returns the earliest instant at which a
    /// currently invisible message becomes visible.
    fn try_receive(&self, max_messages: usize, now: Instant) -> (Vec<Delivery>, Option<Instant>) {
        let mut state = self.state.lock();
        let mut deliveries = Vec::new();
        let mut next_visible: Option<Instant> = None;
        let mut exhausted = Vec::new();

        for (seq, message) in state.messages.iter_mut() {
            if message.visible_at > now {
                next_visible = Some(match next_visible {
                    Some(at) => at.min(message.visible_at),
                    None => message.visible_at,
                });
                continue;
            }
            if deliveries.len() >= max_messages {
                break;
            }
            if message.receive_count >= self.settings.max_receive_count {
                exhausted.push(*seq);
                continue;
            }

            let receipt = ReceiptHandle::generate();
            message.receive_count += 1;
            message.visible_at = now + self.settings.visibility_timeout;
            message.receipt = Some(receipt.clone());

            deliveries.push(Delivery {
                message_id: message.id.clone(),
                receipt,
                body: message.body.clone(),
                receive_count: message.receive_count,
                enqueued_at: message.enqueued_at,
            });
        }

        for seq in exhausted {
            if let Some(message) = state.messages.remove(&seq) {
                warn!(
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    "Moving message to dead letters after too many receives"
                );
                state.park(message, MAX_RECEIVE_COUNT_REASON);
            }
        }

        (deliveries, next_visible)
    }
}

#[async_trait]
impl InvalidationQueue for MemoryQueue {
    async fn enqueue(&self, body: String) -> Result<MessageId, QueueError> {
        let id = MessageId::generate();
        self.state.lock().insert(StoredMessage {
            id: id.clone(),
            body,
            enqueued_at: Utc::now(),
            visible_at: Instant::now(),
            receive_count: 0,
            receipt: None,
        });
        self.signal.notify();
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<Delivery>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            let notified = self.signal.notified();
            let now = Instant::now();
            let (deliveries, next_visible) = self.try_receive(max_messages, now);
            if !deliveries.is_empty() || now >= deadline {
                return Ok(deliveries);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            self.signal.wait(notified, wake_at).await;
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let seq = state
            .find_leased(receipt)
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt.to_string()))?;
        state.messages.remove(&seq);
        Ok(())
    }

    async fn extend(
        &self,
        receipt: &ReceiptHandle,
        visible_after: Duration,
    ) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let seq = state
                .find_leased(receipt)
                .ok_or_else(|| QueueError::ReceiptNotFound(receipt.to_string()))?;
            if let Some(message) = state.messages.get_mut(&seq) {
                message.visible_at = Instant::now() + visible_after;
            }
        }
        // Receivers sleeping until the old deadline must recompute theirs.
        self.signal.notify();
        Ok(())
    }

    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let seq = state
            .find_leased(receipt)
            .ok_or_else(|| QueueError::ReceiptNotFound(receipt.to_string()))?;
        if let Some(message) = state.messages.remove(&seq) {
            debug!(message_id = %message.id, reason, "Dead-lettering message");
            state.park(message, reason);
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Instant::now();
        let state = self.state.lock();
        let visible = state
            .messages
            .values()
            .filter(|m| m.visible_at <= now)
            .count() as u64;
        Ok(QueueStats {
            visible,
            in_flight: state.messages.len() as u64 - visible,
            dead_lettered: state.dead_letters.len() as u64,
        })
    }
}

#[async_trait]
impl DeadLetterStore for MemoryQueue {
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let state = self.state.lock();
        Ok(state.dead_letters.iter().rev().take(limit).cloned().collect())
    }

    async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError> {
        {
            let mut state = self.state.lock();
            let index = state
                .dead_letters
                .iter()
                .position(|d| &d.message_id == message_id)
                .ok_or_else(|| QueueError::NotFound(message_id.to_string()))?;
            let letter = state.dead_letters.remove(index);
            state.insert(StoredMessage {
                id: letter.message_id,
                body: letter.body,
                enqueued_at: letter.enqueued_at,
                visible_at: Instant::now(),
                receive_count: 0,
                receipt: None,
            });
        }
        self.signal.notify();
        Ok(())
    }

    async fn redrive_all(&self) -> Result<usize, QueueError> {
        let moved = {
            let mut state = self.state.lock();
            let letters = std::mem::take(&mut state.dead_letters);
            let now = Instant::now();
            let moved = letters.len();
            for letter in letters {
                state.insert(StoredMessage {
                    id: letter.message_id,
                    body: letter.body,
                    enqueued_at: letter.enqueued_at,
                    visible_at: now,
                    receive_count: 0,
                    receipt: None,
                });
            }
            moved
        };
        if moved > 0 {
            self.signal.notify();
        }
        Ok(moved)
    }

    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut state = self.state.lock();
        let before = state.dead_letters.len();
        state
            .dead_letters
            .retain(|letter| letter.dead_lettered_at >= older_than);
        Ok(before - state.dead_letters.len())
    }
}
