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

//! purgelinectl - operator commands for the purgeline queue and dead-letter store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use purgeline::{QueueSettings, SqliteQueue};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::dead_letters::OutputFormat;

/// Inspect and repair a purgeline queue
#[derive(Parser)]
#[command(name = "purgelinectl")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Queue URL (can also be set via PURGELINE_QUEUE_URL environment variable)
    #[arg(long, env = "PURGELINE_QUEUE_URL", global = true)]
    queue_url: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect, redrive and purge dead-lettered messages
    DeadLetters {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },
    /// Queue-wide operations
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
    /// Normalize a path the way the ingestion endpoint does
    ValidatePath {
        /// Raw path as a caller would submit it
        path: String,

        /// Maximum path length in bytes
        #[arg(long, default_value_t = purgeline::path::DEFAULT_MAX_PATH_LENGTH)]
        max_length: usize,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List dead-lettered messages, most recent first
    List {
        /// Maximum number of messages to show
        #[arg(long, default_value_t = 50)]
        limit: usize,

        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
    /// Return dead-lettered messages to the queue
    Redrive {
        /// Message id to redrive
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        id: Option<String>,

        /// Redrive every dead-lettered message
        #[arg(long)]
        all: bool,
    },
    /// Delete dead-lettered messages older than a retention period
    Purge {
        /// Delete messages dead-lettered longer ago than this (e.g., "30d", "12h")
        #[arg(long, default_value = "30d")]
        older_than: String,

        /// Preview what would be deleted without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// Show visible, in-flight and dead-lettered message counts
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    if let Commands::ValidatePath { path, max_length } = &cli.command {
        return commands::validate_path::run(path, *max_length);
    }

    let queue_url = cli
        .queue_url
        .context("Queue URL is required. Set --queue-url or PURGELINE_QUEUE_URL environment variable")?;
    let queue = SqliteQueue::connect(&queue_url, QueueSettings::default())
        .await
        .with_context(|| format!("Failed to open queue at {}", queue_url))?;

    match cli.command {
        Commands::DeadLetters { command } => match command {
            DeadLetterCommands::List { limit, format } => {
                commands::dead_letters::list(&queue, limit, format).await?;
            }
            DeadLetterCommands::Redrive { id, all } => {
                commands::dead_letters::redrive(&queue, id.as_deref(), all).await?;
            }
            DeadLetterCommands::Purge {
                older_than,
                dry_run,
            } => {
                commands::dead_letters::purge(&queue, &older_than, dry_run).await?;
            }
        },
        Commands::Queue { command } => match command {
            QueueCommands::Stats { json } => {
                commands::queue::stats(&queue, json).await?;
            }
        },
        Commands::ValidatePath { .. } => {}
    }

    Ok(())
}
