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

use crate::config::{types::*, ValidationError};

pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

impl Validate for PurgelineConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = self.server.validate() {
            errors.push(e);
        }
        if let Err(e) = self.queue.validate() {
            errors.push(e);
        }
        if let Err(e) = self.provider.validate() {
            errors.push(e);
        }
        if let Err(e) = self.logging.validate() {
            errors.push(e);
        }
        // Cross-field rules live with the library configuration.
        if let Err(e) = self.pipeline_config().validate() {
            errors.push(ValidationError::Pipeline {
                message: e.to_string(),
            });
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ValidationError::Multiple { errors }),
        }
    }
}

impl Validate for ServerConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        if self.bind_address.is_empty() {
            return Err(invalid("server.bind_address", "cannot be empty"));
        }
        if self.port == 0 {
            return Err(invalid("server.port", "cannot be 0"));
        }
        if self.body_limit_bytes == 0 {
            return Err(invalid("server.body_limit_bytes", "must be positive"));
        }
        if self.graceful_shutdown_timeout_secs == 0 {
            return Err(invalid(
                "server.graceful_shutdown_timeout_secs",
                "must be positive",
            ));
        }
        Ok(())
    }
}

impl Validate for QueueConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        let url = self.url.as_str();
        let supported = url == "memory" || (cfg!(feature = "sqlite") && url.starts_with("sqlite://"));
        if !supported || url == "sqlite://" {
            return Err(ValidationError::InvalidQueueUrl {
                url: self.url.clone(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(invalid("queue.poll_interval_ms", "must be positive"));
        }
        Ok(())
    }
}

impl Validate for ProviderConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.kind {
            ProviderKind::Noop => Ok(()),
            ProviderKind::Webhook => {
                if !cfg!(feature = "webhook") {
                    return Err(invalid(
                        "provider.kind",
                        "webhook support is not compiled in",
                    ));
                }
                match self.endpoint.as_deref() {
                    Some(endpoint) if endpoint.starts_with("http://") || endpoint.starts_with("https://") => {
                        Ok(())
                    }
                    Some(endpoint) => Err(invalid(
                        "provider.endpoint",
                        &format!("'{}' is not an http(s) URL", endpoint),
                    )),
                    None => Err(ValidationError::MissingEndpoint {
                        kind: "webhook".to_string(),
                    }),
                }
            }
        }
    }
}

impl Validate for LoggingConfig {
    fn validate(&self) -> Result<(), ValidationError> {
        match self.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ValidationError::InvalidLogLevel {
                    level: self.level.clone(),
                });
            }
        }
        if self.directory.is_some() && self.file_prefix.is_empty() {
            return Err(invalid("logging.file_prefix", "cannot be empty"));
        }
        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> ValidationError {
    ValidationError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}
