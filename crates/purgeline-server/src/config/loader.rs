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

use crate::config::{ConfigError, PurgelineConfig};
use regex::Regex;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "PURGELINE_CONFIG";

pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths
    pub fn new() -> Self {
        let mut search_paths = Vec::new();

        // 1. Current directory
        search_paths.push(PathBuf::from("./purgeline.toml"));

        // 2. User config directory
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join("purgeline").join("config.toml"));
        }

        // 3. System config directory
        search_paths.push(PathBuf::from("/etc/purgeline/config.toml"));

        Self { search_paths }
    }

    /// Create a config loader with custom search paths
    pub fn with_search_paths(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Load configuration from the specified file, `PURGELINE_CONFIG`, or the
    /// first file found in the search paths, then apply environment overrides.
    ///
    /// Falls back to defaults when no file is named and none is found.
    pub fn load_config(&self, config_file: Option<&Path>) -> Result<PurgelineConfig, ConfigError> {
        let explicit = config_file
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(CONFIG_ENV_VAR).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) if !path.is_file() => return Err(ConfigError::ConfigNotFound { path }),
            Some(path) => self.load_config_from_file(&path)?,
            None => match self.find_config_file() {
                Some(path) => self.load_config_from_file(&path)?,
                None => {
                    debug!("No configuration file found, using defaults");
                    PurgelineConfig::default()
                }
            },
        };

        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_config_from_file(&self, path: &Path) -> Result<PurgelineConfig, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        })?;

        let substituted_content = substitute_env_vars(&content)?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") | None => toml::from_str::<PurgelineConfig>(&substituted_content)?,
            Some(ext) => {
                return Err(ConfigError::UnsupportedFormat {
                    extension: ext.to_string(),
                })
            }
        };

        debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Find the first existing configuration file in search paths
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .find(|path| path.is_file())
            .cloned()
    }

    /// Get all search paths for debugging
    pub fn get_search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Substitute `${VAR}`, `${VAR:-default}` and `${VAR:?error}` in configuration content
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::EnvSubstitutionError(e.to_string()))?;
    let mut result = content.to_string();

    for cap in re.captures_iter(content) {
        let full_match = &cap[0];
        let replacement = process_var_expression(&cap[1])?;
        result = result.replace(full_match, &replacement);
    }

    Ok(result)
}

fn process_var_expression(expr: &str) -> Result<String, ConfigError> {
    if let Some((var_name, default_value)) = expr.split_once(":-") {
        Ok(env::var(var_name).unwrap_or_else(|_| default_value.to_string()))
    } else if let Some((var_name, error_msg)) = expr.split_once(":?") {
        env::var(var_name).map_err(|_| {
            ConfigError::EnvSubstitutionError(format!(
                "Required environment variable '{}' is not set: {}",
                var_name, error_msg
            ))
        })
    } else {
        env::var(expr).map_err(|_| {
            ConfigError::EnvSubstitutionError(format!(
                "Required environment variable '{}' is not set",
                expr
            ))
        })
    }
}

/// Applies the `PURGELINE_*` overrides on top of file values.
fn apply_env_overrides(config: &mut PurgelineConfig) -> Result<(), ConfigError> {
    if let Ok(value) = env::var("PURGELINE_DISTRIBUTION_ID") {
        config.pipeline.distribution_id = value;
    }
    if let Ok(value) = env::var("PURGELINE_QUEUE_URL") {
        config.queue.url = value;
    }
    if let Some(value) = parse_env("PURGELINE_MAX_BATCH_SIZE")? {
        config.pipeline.max_batch_size = value;
    }
    if let Some(value) = parse_env("PURGELINE_MAX_BATCH_WINDOW_MS")? {
        config.pipeline.max_batch_window_ms = value;
    }
    if let Some(value) = parse_env("PURGELINE_MAX_REDELIVERIES")? {
        config.pipeline.max_redeliveries = value;
    }
    if let Some(value) = parse_env("PURGELINE_WORKER_COUNT")? {
        config.pipeline.worker_count = value;
    }
    if let Some(value) = parse_env("PURGELINE_PORT")? {
        config.server.port = value;
    }
    Ok(())
}

fn parse_env<T: FromStr>(name: &str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvOverrideError {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
