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

use anyhow::{Context, Result};
use clap::Parser;
use purgeline_server::config::{ConfigLoader, PurgelineConfig, Validate};
use purgeline_server::{logging, metrics, server, Role};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "purgeline-server",
    version,
    about = "Batched edge-cache invalidation service"
)]
struct Cli {
    /// Configuration file (defaults to PURGELINE_CONFIG or the standard search paths)
    #[arg(short, long, env = "PURGELINE_CONFIG")]
    config: Option<PathBuf>,

    /// Which parts of the pipeline to run
    #[arg(long, value_enum, default_value = "all")]
    role: Role,

    /// Print the default configuration as TOML and exit
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let defaults = toml::to_string_pretty(&PurgelineConfig::with_defaults())
            .context("Failed to render default configuration")?;
        print!("{}", defaults);
        return Ok(());
    }

    let config = ConfigLoader::new()
        .load_config(cli.config.as_deref())
        .context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let _log_guard = logging::init_logging(&config.logging)?;
    let metrics = if config.server.metrics_enabled {
        Some(metrics::init_metrics()?)
    } else {
        None
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        distribution_id = %config.pipeline.distribution_id,
        queue = %config.queue.url,
        "Starting purgeline-server"
    );
    server::run(config, cli.role, metrics).await
}
