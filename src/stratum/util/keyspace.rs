/*
 * Copyright (C) 2024 The Stratum Operator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::stratum::util::error::with_context;
use crate::stratum::Config;

use std::error::Error;
use std::fmt;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

const KEYSPACE_VALUE_FILE: &str = "_value_";

/// Error returned when a key has no stored value. Callers use
/// `is_missing_value_error` to turn absence into a NotFound condition
/// instead of a hard failure.
#[derive(Debug)]
pub struct MissingValueError {
    key: String,
}

impl MissingValueError {
    fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

impl fmt::Display for MissingValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no value stored for key '{}'", self.key)
    }
}

impl Error for MissingValueError {}

pub fn is_missing_value_error(err: &(dyn Error + 'static)) -> bool {
    if err.downcast_ref::<MissingValueError>().is_some() {
        return true;
    }
    err.source().map(is_missing_value_error).unwrap_or(false)
}

/// Filesystem-backed key/value namespace rooted under the configured
/// keyspace directory. Values live in `<root>/<namespace>/<key>/_value_`;
/// writes go through a tempfile and an atomic rename.
#[derive(Debug, Clone, Copy)]
pub struct Keyspace {
    namespace: &'static str,
}

impl Keyspace {
    pub const fn new(namespace: &'static str) -> Self {
        Self { namespace }
    }

    fn base_dir(&self) -> PathBuf {
        Config::Keyspace.get_path().join(self.namespace)
    }

    fn key_dir(&self, key: &str) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
        let trimmed = key.trim_matches('/');
        if trimmed.is_empty() {
            return Err(crate::stratum::util::error::new_error(
                "keyspace keys must not be empty",
            ));
        }
        let relative = Path::new(trimmed);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(crate::stratum::util::error::new_error(format!(
                "keyspace key '{}' contains path traversal components",
                key
            )));
        }
        Ok(self.base_dir().join(relative))
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let dir = self.key_dir(key)?;
        fs::create_dir_all(&dir)
            .map_err(|e| with_context(e, format!("failed to create keyspace dir for '{key}'")))?;

        let tmp = dir.join(format!(".{}.tmp-{}", KEYSPACE_VALUE_FILE, std::process::id()));
        fs::write(&tmp, value)
            .map_err(|e| with_context(e, format!("failed to stage value for '{key}'")))?;
        fs::rename(&tmp, dir.join(KEYSPACE_VALUE_FILE))
            .map_err(|e| with_context(e, format!("failed to commit value for '{key}'")))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
        let path = self.key_dir(key)?.join(KEYSPACE_VALUE_FILE);
        match fs::read_to_string(&path) {
            Ok(value) => Ok(value),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Box::new(MissingValueError::new(key)))
            }
            Err(err) => Err(with_context(err, format!("failed to read key '{key}'"))),
        }
    }

    pub fn delete(&self, key: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
        let dir = self.key_dir(key)?;
        let value = dir.join(KEYSPACE_VALUE_FILE);
        match fs::remove_file(&value) {
            Ok(()) => {
                // Best effort: drop the now-empty key directory.
                let _ = fs::remove_dir(&dir);
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(Box::new(MissingValueError::new(key)))
            }
            Err(err) => Err(with_context(err, format!("failed to delete key '{key}'"))),
        }
    }

    /// Lists the immediate child keys under `prefix` that carry a value.
    /// Returned keys are full keys (prefix included), sorted.
    pub fn list(&self, prefix: &str) -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        let trimmed = prefix.trim_matches('/');
        let dir = if trimmed.is_empty() {
            self.base_dir()
        } else {
            self.key_dir(trimmed)?
        };

        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(with_context(
                    err,
                    format!("failed to list keyspace prefix '{prefix}'"),
                ))
            }
        };

        let mut keys = Vec::new();
        for entry in entries {
            let entry =
                entry.map_err(|e| with_context(e, format!("failed to scan prefix '{prefix}'")))?;
            if !entry.path().is_dir() {
                continue;
            }
            if !entry.path().join(KEYSPACE_VALUE_FILE).is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if trimmed.is_empty() {
                keys.push(name.to_string());
            } else {
                keys.push(format!("{}/{}", trimmed, name));
            }
        }
        keys.sort();
        Ok(keys)
    }
}
