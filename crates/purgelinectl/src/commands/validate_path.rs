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

//! Implementation of the `validate-path` command.

use anyhow::{anyhow, Result};
use purgeline::PathValidator;

/// Prints the normalized form of `raw`, or fails with the validation error.
pub fn run(raw: &str, max_length: usize) -> Result<()> {
    println!("{}", normalize(raw, max_length)?);
    Ok(())
}

fn normalize(raw: &str, max_length: usize) -> Result<String> {
    PathValidator::new(max_length)
        .validate(raw)
        .map(|path| path.into_string())
        .map_err(|e| anyhow!("'{}' is not a valid path: {}", raw, e))
}
