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

//! Cache path normalization and validation.
//!
//! Every path that enters the pipeline passes through [`PathValidator`]. The
//! validator is a pure function over its input: the same raw string always
//! produces the same [`NormalizedPath`] or the same [`PathError`].
//!
//! Normalization rules:
//!
//! - the raw input is percent-decoded exactly once
//! - duplicate slashes are collapsed and a single leading `/` is enforced
//! - a `*` wildcard is only allowed as the final character
//! - control characters are rejected
//! - the raw and normalized forms are bounded by the provider's path length
//!
//! # Example
//!
//! ```
//! use purgeline::path::PathValidator;
//!
//! let validator = PathValidator::default();
//! let path = validator.validate("storage//v1/object/public/*").unwrap();
//! assert_eq!(path.as_str(), "/storage/v1/object/public/*");
//! assert!(path.is_wildcard());
//! ```

use serde::Serialize;
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

/// Maximum path length accepted by the invalidation provider, in bytes.
pub const DEFAULT_MAX_PATH_LENGTH: usize = 4000;

/// Errors produced when a path cannot be normalized.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("Path must not be empty")]
    Empty,

    #[error("Path is {length} bytes long (maximum {max})")]
    TooLong { length: usize, max: usize },

    #[error("Path is not valid UTF-8 after percent-decoding")]
    InvalidEncoding,

    #[error("Path contains a control character at byte {position}")]
    ControlCharacter { position: usize },

    #[error("Wildcard '*' is only allowed as the last character of a path")]
    MisplacedWildcard,

    #[error("Path is not in normalized form: '{0}'")]
    NotNormalized(String),
}

/// A path that has passed normalization.
///
/// Only [`PathValidator`] constructs values of this type, so holding one is
/// proof that the invariants listed in the module documentation hold.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NormalizedPath(String);

impl NormalizedPath {
    /// Returns the normalized path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the path ends in a `*` pattern wildcard.
    pub fn is_wildcard(&self) -> bool {
        self.0.ends_with('*')
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for NormalizedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NormalizedPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NormalizedPath {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Normalizes and validates cache paths.
#[derive(Debug, Clone, Copy)]
pub struct PathValidator {
    max_length: usize,
}

impl Default for PathValidator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PATH_LENGTH)
    }
}

impl PathValidator {
    /// Creates a validator with a custom maximum length in bytes.
    pub fn new(max_length: usize) -> Self {
        Self { max_length }
    }

    /// Maximum accepted length in bytes.
    pub fn max_length(&self) -> usize {
        self.max_length
    }

    /// Normalizes a raw, caller-supplied path.
    ///
    /// # Errors
    ///
    /// Returns a [`PathError`] describing the first rule the input violates.
    pub fn validate(&self, raw: &str) -> Result<NormalizedPath, PathError> {
        if raw.is_empty() {
            return Err(PathError::Empty);
        }
        self.check_length(raw)?;

        let decoded = urlencoding::decode(raw).map_err(|_| PathError::InvalidEncoding)?;
        check_characters(&decoded)?;

        let normalized = collapse_slashes(&decoded);
        self.check_length(&normalized)?;

        Ok(NormalizedPath(normalized))
    }

    /// Re-checks a path that is expected to be normalized already.
    ///
    /// Unlike [`validate`](Self::validate) this never decodes, so a literal
    /// `%25` that survived the first decode stays untouched.
    pub fn revalidate(&self, normalized: &str) -> Result<NormalizedPath, PathError> {
        if normalized.is_empty() {
            return Err(PathError::Empty);
        }
        self.check_length(normalized)?;
        check_characters(normalized)?;

        if !normalized.starts_with('/') || normalized.contains("//") {
            return Err(PathError::NotNormalized(normalized.to_string()));
        }

        Ok(NormalizedPath(normalized.to_string()))
    }

    fn check_length(&self, value: &str) -> Result<(), PathError> {
        if value.len() > self.max_length {
            return Err(PathError::TooLong {
                length: value.len(),
                max: self.max_length,
            });
        }
        Ok(())
    }
}

/// Normalizes a raw path with the default validator.
pub fn validate(raw: &str) -> Result<NormalizedPath, PathError> {
    PathValidator::default().validate(raw)
}

fn check_characters(value: &str) -> Result<(), PathError> {
    if let Some((position, _)) = value.char_indices().find(|(_, c)| c.is_control()) {
        return Err(PathError::ControlCharacter { position });
    }

    let last = value.len().saturating_sub(1);
    if value
        .char_indices()
        .any(|(index, c)| c == '*' && index != last)
    {
        return Err(PathError::MisplacedWildcard);
    }

    Ok(())
}

fn collapse_slashes(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 1);
    out.push('/');
    for c in value.chars() {
        if c == '/' && out.ends_with('/') {
            continue;
        }
        out.push(c);
    }
    out
}
