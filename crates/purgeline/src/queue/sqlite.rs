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

//! SQLite-backed queue.
//!
//! Messages live in the `queue_messages` table and dead letters in
//! `dead_letters`. A lease is a row whose `visible_at` lies in the future and
//! whose `receipt_handle` is set; receiving rewrites both inside an
//! `IMMEDIATE` transaction so two consumers sharing the database never lease
//! the same row. Timestamps are stored as epoch milliseconds.
//!
//! SQLite has no change notification, so receivers in other processes fall
//! back to polling at [`QueueSettings::poll_interval`]. Receivers in the same
//! process are woken directly on enqueue and redrive.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_diesel::sqlite::{Manager, Pool, Runtime};
use diesel::prelude::*;
use diesel::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{
    DeadLetter, DeadLetterStore, InvalidationQueue, QueueSettings, QueueStats, WorkSignal,
    MAX_RECEIVE_COUNT_REASON,
};
use crate::error::QueueError;
use crate::models::{Delivery, MessageId, ReceiptHandle};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations/sqlite");

mod schema {
    diesel::table! {
        queue_messages (id) {
            id -> Text,
            body -> Text,
            enqueued_at -> BigInt,
            visible_at -> BigInt,
            receive_count -> Integer,
            receipt_handle -> Nullable<Text>,
        }
    }

    diesel::table! {
        dead_letters (id) {
            id -> Text,
            body -> Text,
            enqueued_at -> BigInt,
            dead_lettered_at -> BigInt,
            receive_count -> Integer,
            reason -> Text,
        }
    }
}

use schema::{dead_letters, queue_messages};

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = queue_messages)]
struct MessageRow {
    id: String,
    body: String,
    enqueued_at: i64,
    visible_at: i64,
    receive_count: i32,
    receipt_handle: Option<String>,
}

#[derive(Debug, Queryable, Insertable)]
#[diesel(table_name = dead_letters)]
struct DeadLetterRow {
    id: String,
    body: String,
    enqueued_at: i64,
    dead_lettered_at: i64,
    receive_count: i32,
    reason: String,
}

impl From<DeadLetterRow> for DeadLetter {
    fn from(row: DeadLetterRow) -> Self {
        DeadLetter {
            message_id: MessageId::from(row.id),
            body: row.body,
            receive_count: row.receive_count.max(0) as u32,
            enqueued_at: from_millis(row.enqueued_at),
            dead_lettered_at: from_millis(row.dead_lettered_at),
            reason: row.reason,
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Durable [`InvalidationQueue`] stored in a SQLite database file.
pub struct SqliteQueue {
    pool: Pool,
    settings: QueueSettings,
    signal: WorkSignal,
}

impl std::fmt::Debug for SqliteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteQueue")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SqliteQueue {
    /// Opens (or creates) the database at `url` and applies pending migrations.
    ///
    /// `url` may be a bare file path or carry a `sqlite://` prefix.
    pub async fn connect(url: &str, settings: QueueSettings) -> Result<Self, QueueError> {
        let path = url.strip_prefix("sqlite://").unwrap_or(url);
        let manager = Manager::new(path, Runtime::Tokio1);
        // SQLite serializes writers; one pooled connection avoids lock contention.
        let pool = Pool::builder(manager)
            .max_size(1)
            .build()
            .map_err(|e| QueueError::Unavailable(format!("Failed to build pool: {}", e)))?;

        let queue = Self {
            pool,
            signal: WorkSignal::new(settings.poll_interval),
            settings,
        };
        queue.run_migrations().await?;
        info!(path, "SQLite queue ready");
        Ok(queue)
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    async fn run_migrations(&self) -> Result<(), QueueError> {
        self.interact(|conn| {
            diesel::sql_query("PRAGMA journal_mode=WAL;").execute(conn)?;
            diesel::sql_query("PRAGMA busy_timeout=30000;").execute(conn)?;
            conn.run_pending_migrations(MIGRATIONS)
                .map(|_| ())
                .map_err(|e| QueueError::Storage(format!("Failed to run migrations: {}", e)))
        })
        .await
    }

    /// Runs `f` on the pooled connection in the blocking pool.
    async fn interact<F, R>(&self, f: F) -> Result<R, QueueError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<R, QueueError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Unavailable(e.to_string()))?;
        conn.interact(f)
            .await
            .map_err(|e| QueueError::Unavailable(format!("Connection task failed: {}", e)))?
    }

    async fn try_receive(&self, max_messages: usize) -> Result<Vec<Delivery>, QueueError> {
        let limit = i64::try_from(max_messages).unwrap_or(i64::MAX);
        let visibility = duration_millis(self.settings.visibility_timeout);
        let max_receive_count = i32::try_from(self.settings.max_receive_count).unwrap_or(i32::MAX);

        self.interact(move |conn| {
            conn.immediate_transaction(|conn| {
                let now = now_millis();
                let rows: Vec<MessageRow> = queue_messages::table
                    .filter(queue_messages::visible_at.le(now))
                    .order((queue_messages::visible_at.asc(), queue_messages::enqueued_at.asc()))
                    .limit(limit)
                    .load(conn)?;

                let mut deliveries = Vec::with_capacity(rows.len());
                for row in rows {
                    if row.receive_count >= max_receive_count {
                        warn!(
                            message_id = %row.id,
                            receive_count = row.receive_count,
                            "Moving message to dead letters after too many receives"
                        );
                        park(conn, row, now, MAX_RECEIVE_COUNT_REASON)?;
                        continue;
                    }

                    let receipt = ReceiptHandle::generate();
                    let receive_count = row.receive_count + 1;
                    diesel::update(queue_messages::table.find(&row.id))
                        .set((
                            queue_messages::visible_at.eq(now + visibility),
                            queue_messages::receive_count.eq(receive_count),
                            queue_messages::receipt_handle.eq(Some(receipt.as_str())),
                        ))
                        .execute(conn)?;

                    deliveries.push(Delivery {
                        message_id: MessageId::from(row.id),
                        receipt,
                        body: row.body,
                        receive_count: receive_count as u32,
                        enqueued_at: from_millis(row.enqueued_at),
                    });
                }
                Ok(deliveries)
            })
        })
        .await
    }
}

/// Moves a message row into `dead_letters`. Must run inside a transaction.
fn park(
    conn: &mut SqliteConnection,
    row: MessageRow,
    now: i64,
    reason: &str,
) -> Result<(), QueueError> {
    diesel::delete(queue_messages::table.find(&row.id)).execute(conn)?;
    diesel::replace_into(dead_letters::table)
        .values(DeadLetterRow {
            id: row.id,
            body: row.body,
            enqueued_at: row.enqueued_at,
            dead_lettered_at: now,
            receive_count: row.receive_count,
            reason: reason.to_string(),
        })
        .execute(conn)?;
    Ok(())
}

/// Moves a dead letter back into `queue_messages` with a fresh receive count.
fn unpark(conn: &mut SqliteConnection, letter: DeadLetterRow, now: i64) -> Result<(), QueueError> {
    diesel::delete(dead_letters::table.find(&letter.id)).execute(conn)?;
    diesel::insert_into(queue_messages::table)
        .values(MessageRow {
            id: letter.id,
            body: letter.body,
            enqueued_at: letter.enqueued_at,
            visible_at: now,
            receive_count: 0,
            receipt_handle: None,
        })
        .execute(conn)?;
    Ok(())
}

#[async_trait]
impl InvalidationQueue for SqliteQueue {
    async fn enqueue(&self, body: String) -> Result<MessageId, QueueError> {
        let id = MessageId::generate();
        let row_id = id.as_str().to_string();
        self.interact(move |conn| {
            let now = now_millis();
            diesel::insert_into(queue_messages::table)
                .values(MessageRow {
                    id: row_id,
                    body,
                    enqueued_at: now,
                    visible_at: now,
                    receive_count: 0,
                    receipt_handle: None,
                })
                .execute(conn)?;
            Ok(())
        })
        .await?;
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
            let deliveries = self.try_receive(max_messages).await?;
            if !deliveries.is_empty() || Instant::now() >= deadline {
                return Ok(deliveries);
            }
            self.signal.wait(notified, deadline).await;
        }
    }

    async fn acknowledge(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let handle = receipt.as_str().to_string();
        let deleted = self
            .interact(move |conn| {
                Ok(diesel::delete(
                    queue_messages::table.filter(queue_messages::receipt_handle.eq(&handle)),
                )
                .execute(conn)?)
            })
            .await?;
        if deleted == 0 {
            return Err(QueueError::ReceiptNotFound(receipt.to_string()));
        }
        Ok(())
    }

    async fn extend(
        &self,
        receipt: &ReceiptHandle,
        visible_after: Duration,
    ) -> Result<(), QueueError> {
        let handle = receipt.as_str().to_string();
        let delay = duration_millis(visible_after);
        let updated = self
            .interact(move |conn| {
                Ok(diesel::update(
                    queue_messages::table.filter(queue_messages::receipt_handle.eq(&handle)),
                )
                .set(queue_messages::visible_at.eq(now_millis().saturating_add(delay)))
                .execute(conn)?)
            })
            .await?;
        if updated == 0 {
            return Err(QueueError::ReceiptNotFound(receipt.to_string()));
        }
        Ok(())
    }

    async fn dead_letter(&self, receipt: &ReceiptHandle, reason: &str) -> Result<(), QueueError> {
        let handle = receipt.as_str().to_string();
        let reason = reason.to_string();
        let parked = self
            .interact(move |conn| {
                conn.immediate_transaction(|conn| {
                    let row: Option<MessageRow> = queue_messages::table
                        .filter(queue_messages::receipt_handle.eq(&handle))
                        .first(conn)
                        .optional()?;
                    match row {
                        Some(row) => {
                            debug!(message_id = %row.id, reason = %reason, "Dead-lettering message");
                            park(conn, row, now_millis(), &reason)?;
                            Ok(true)
                        }
                        None => Ok(false),
                    }
                })
            })
            .await?;
        if !parked {
            return Err(QueueError::ReceiptNotFound(receipt.to_string()));
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.interact(|conn| {
            let now = now_millis();
            let total: i64 = queue_messages::table.count().get_result(conn)?;
            let visible: i64 = queue_messages::table
                .filter(queue_messages::visible_at.le(now))
                .count()
                .get_result(conn)?;
            let dead_lettered: i64 = dead_letters::table.count().get_result(conn)?;
            Ok(QueueStats {
                visible: visible as u64,
                in_flight: (total - visible).max(0) as u64,
                dead_lettered: dead_lettered as u64,
            })
        })
        .await
    }

    async fn ping(&self) -> Result<(), QueueError> {
        self.interact(|conn| {
            diesel::sql_query("SELECT 1").execute(conn)?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl DeadLetterStore for SqliteQueue {
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<DeadLetterRow> = self
            .interact(move |conn| {
                Ok(dead_letters::table
                    .order(dead_letters::dead_lettered_at.desc())
                    .limit(limit)
                    .load(conn)?)
            })
            .await?;
        Ok(rows.into_iter().map(DeadLetter::from).collect())
    }

    async fn redrive(&self, message_id: &MessageId) -> Result<(), QueueError> {
        let id = message_id.as_str().to_string();
        let found = self
            .interact(move |conn| {
                conn.immediate_transaction(|conn| {
                    let letter: Option<DeadLetterRow> =
                        dead_letters::table.find(&id).first(conn).optional()?;
                    match letter {
                        Some(letter) => {
                            unpark(conn, letter, now_millis())?;
                            Ok(true)
                        }
                        None => Ok(false),
                    }
                })
            })
            .await?;
        if !found {
            return Err(QueueError::NotFound(message_id.to_string()));
        }
        self.signal.notify();
        Ok(())
    }

    async fn redrive_all(&self) -> Result<usize, QueueError> {
        let moved = self
            .interact(|conn| {
                conn.immediate_transaction(|conn| {
                    let letters: Vec<DeadLetterRow> = dead_letters::table.load(conn)?;
                    let now = now_millis();
                    let moved = letters.len();
                    for letter in letters {
                        unpark(conn, letter, now)?;
                    }
                    Ok(moved)
                })
            })
            .await?;
        if moved > 0 {
            info!(moved, "Redrove dead letters");
            self.signal.notify();
        }
        Ok(moved)
    }

    async fn purge_dead_letters(&self, older_than: DateTime<Utc>) -> Result<usize, QueueError> {
        let cutoff = older_than.timestamp_millis();
        self.interact(move |conn| {
            Ok(
                diesel::delete(dead_letters::table.filter(dead_letters::dead_lettered_at.lt(cutoff)))
                    .execute(conn)?,
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open(dir: &TempDir, settings: QueueSettings) -> SqliteQueue {
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());
        SqliteQueue::connect(&url, settings).await.unwrap()
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            visibility_timeout: Duration::from_secs(30),
            max_receive_count: 2,
            poll_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_enqueue_receive_acknowledge() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, settings()).await;

        let id = queue.enqueue("{\"path\":\"/a\"}".into()).await.unwrap();
        let deliveries = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].message_id, id);
        assert_eq!(deliveries[0].receive_count, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.visible, 0);
        assert_eq!(stats.in_flight, 1);

        queue.acknowledge(&deliveries[0].receipt).await.unwrap();
        assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
        assert!(matches!(
            queue.acknowledge(&deliveries[0].receipt).await,
            Err(QueueError::ReceiptNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let id = {
            let queue = open(&dir, settings()).await;
            queue.enqueue("durable".into()).await.unwrap()
        };

        let queue = open(&dir, settings()).await;
        let deliveries = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(deliveries[0].message_id, id);
        assert_eq!(deliveries[0].body, "durable");
    }

    #[tokio::test]
    async fn test_extend_makes_message_visible_again() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, settings()).await;
        queue.enqueue("a".into()).await.unwrap();

        let first = queue.receive(1, Duration::ZERO).await.unwrap();
        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());

        queue.extend(&first[0].receipt, Duration::ZERO).await.unwrap();
        let second = queue.receive(1, Duration::from_secs(1)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].receive_count, 2);

        // The first receipt no longer names a lease
        assert!(matches!(
            queue.extend(&first[0].receipt, Duration::ZERO).await,
            Err(QueueError::ReceiptNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_redrives_after_max_receive_count() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, settings()).await;
        let id = queue.enqueue("poison".into()).await.unwrap();

        for _ in 0..2 {
            let lease = queue.receive(1, Duration::ZERO).await.unwrap();
            queue.extend(&lease[0].receipt, Duration::ZERO).await.unwrap();
        }
        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());

        let letters = queue.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].message_id, id);
        assert_eq!(letters[0].reason, MAX_RECEIVE_COUNT_REASON);
    }

    #[tokio::test]
    async fn test_dead_letter_redrive_and_purge() {
        let dir = TempDir::new().unwrap();
        let queue = open(&dir, settings()).await;
        let id = queue.enqueue("a".into()).await.unwrap();
        queue.enqueue("b".into()).await.unwrap();

        for lease in queue.receive(2, Duration::ZERO).await.unwrap() {
            queue.dead_letter(&lease.receipt, "invalid").await.unwrap();
        }
        assert_eq!(queue.stats().await.unwrap().dead_lettered, 2);

        queue.redrive(&id).await.unwrap();
        let again = queue.receive(2, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].message_id, id);
        assert_eq!(again[0].receive_count, 1);

        let purged = queue
            .purge_dead_letters(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(matches!(
            queue.redrive(&MessageId::from("gone")).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_waits_for_enqueue() {
        let dir = TempDir::new().unwrap();
        let queue = std::sync::Arc::new(open(&dir, settings()).await);

        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            producer.enqueue("late".into()).await.unwrap();
        });

        let deliveries = queue.receive(5, Duration::from_secs(5)).await.unwrap();
        assert_eq!(deliveries.len(), 1);
        handle.await.unwrap();
        queue.ping().await.unwrap();
    }
}
