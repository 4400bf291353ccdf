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

//! Implementation of the `dead-letters` commands.
//!
//! Messages land in the dead-letter store when the provider rejects their
//! path, when they exhaust their redeliveries, or when their body cannot be
//! decoded. These commands are the operator's way back in.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use purgeline::{DeadLetter, DeadLetterStore, InvalidationRequest, MessageId};
use std::fmt::Write as _;
use tracing::info;

use super::duration::parse_duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Print up to `limit` dead letters, most recent first.
pub async fn list<S: DeadLetterStore>(store: &S, limit: usize, format: OutputFormat) -> Result<()> {
    let letters = store
        .list_dead_letters(limit)
        .await
        .context("Failed to list dead letters")?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&letters)?),
        OutputFormat::Table => print!("{}", render_table(&letters)),
    }
    Ok(())
}

/// Redrive one message by id, or every dead letter with `all`.
pub async fn redrive<S: DeadLetterStore>(store: &S, id: Option<&str>, all: bool) -> Result<usize> {
    let moved = match (id, all) {
        (_, true) => store
            .redrive_all()
            .await
            .context("Failed to redrive dead letters")?,
        (Some(id), false) => {
            store
                .redrive(&MessageId::from(id))
                .await
                .with_context(|| format!("Failed to redrive message {}", id))?;
            1
        }
        (None, false) => bail!("Pass --id <ID> or --all"),
    };

    info!("Returned {} message(s) to the queue", moved);
    Ok(moved)
}

/// Delete dead letters older than `older_than`, or count them with `dry_run`.
pub async fn purge<S: DeadLetterStore>(store: &S, older_than: &str, dry_run: bool) -> Result<usize> {
    let duration = parse_duration(older_than)
        .with_context(|| format!("Invalid duration: '{}'", older_than))?;
    let cutoff = Utc::now().checked_sub_signed(duration).with_context(|| {
        format!(
            "Duration '{}' reaches past the earliest supported date",
            older_than
        )
    })?;

    info!(
        "Purging dead letters older than {} (cutoff: {})",
        older_than, cutoff
    );

    if dry_run {
        let count = store
            .list_dead_letters(usize::MAX)
            .await
            .context("Failed to count dead letters")?
            .iter()
            .filter(|letter| letter.dead_lettered_at < cutoff)
            .count();
        info!(
            "[DRY RUN] Would delete {} dead letter(s) older than {}",
            count, cutoff
        );
        return Ok(count);
    }

    let deleted = store
        .purge_dead_letters(cutoff)
        .await
        .context("Failed to purge dead letters")?;
    if deleted == 0 {
        info!("No dead letters found older than {}", cutoff);
    } else {
        info!("Deleted {} dead letter(s) older than {}", deleted, cutoff);
    }
    Ok(deleted)
}

fn render_table(letters: &[DeadLetter]) -> String {
    let mut out = String::new();
    if letters.is_empty() {
        out.push_str("No dead letters\n");
        return out;
    }

    let _ = writeln!(
        out,
        "{:<36}  {:<20}  {:>8}  {:<40}  REASON",
        "MESSAGE ID", "DEAD-LETTERED", "RECEIVES", "PATH"
    );
    for letter in letters {
        // Bodies that never decoded are shown raw.
        let path = InvalidationRequest::from_body(&letter.body)
            .map(|request| request.path)
            .unwrap_or_else(|_| letter.body.clone());
        let _ = writeln!(
            out,
            "{:<36}  {:<20}  {:>8}  {:<40}  {}",
            letter.message_id,
            letter.dead_lettered_at.format("%Y-%m-%d %H:%M:%S"),
            letter.receive_count,
            truncate(&path, 40),
            letter.reason
        );
    }
    out
}

fn truncate(value: &str, width: usize) -> String {
    if value.chars().count() <= width {
        return value.to_string();
    }
    let mut truncated: String = value.chars().take(width.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
