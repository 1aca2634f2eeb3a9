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

use std::env;
use std::time::Duration;

use std::path::{Component, PathBuf};

/// Enum for supported configuration parameters
#[derive(Debug)]
pub enum Config {
    Keyspace,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::Keyspace => "STRATUM_KEYSPACE",
        }
    }

    /// Returns the default value used when the environment variable is unset.
    pub fn default_path(&self) -> &'static str {
        match self {
            Config::Keyspace => {
                #[cfg(test)]
                {
                    "/tmp/stratum-operator-test/keyspace"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/stratum.io/keyspace"
                }
            }
        }
    }

    /// Returns the effective value, either from environment or default.
    pub fn get_path(&self) -> PathBuf {
        env::var(self.env_var()).map_or_else(
            |_| Self::normalize_path(self.default_path()),
            |value| Self::normalize_path(&value),
        )
    }

    /// Normalize a directory path by expanding ~, resolving ., .., and returning an absolute, cleaned path.
    fn normalize_path(input: &str) -> PathBuf {
        let path: PathBuf = match input {
            _ if input.starts_with("~/") => env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(&input[2..])),
            _ if !input.starts_with('/') => env::current_dir().ok().map(|cwd| cwd.join(input)),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from(input));

        path.components()
            .fold(PathBuf::new(), |mut normalized, component| {
                match component {
                    Component::CurDir => {}
                    Component::ParentDir => {
                        normalized.pop();
                    }
                    _ => normalized.push(component),
                }
                normalized
            })
    }
}

const UNJOINED_GRACE_ENV: &str = "STRATUM_UNJOINED_GRACE";
const DEFAULT_UNJOINED_GRACE: Duration = Duration::from_secs(5 * 60);

/// How long a pod may exist without appearing in the placement tier's health
/// report before it is flagged as a stuck bootstrap member. Accepts humantime
/// syntax ("90s", "5m", "1h"); invalid values fall back to the default.
pub fn unjoined_grace() -> Duration {
    match env::var(UNJOINED_GRACE_ENV) {
        Ok(raw) => humantime::parse_duration(raw.trim()).unwrap_or(DEFAULT_UNJOINED_GRACE),
        Err(_) => DEFAULT_UNJOINED_GRACE,
    }
}

const RESYNC_INTERVAL_ENV: &str = "STRATUM_RESYNC_INTERVAL";
const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Interval at which every known cluster is re-enqueued for reconciliation.
pub fn resync_interval() -> Duration {
    match env::var(RESYNC_INTERVAL_ENV) {
        Ok(raw) => humantime::parse_duration(raw.trim()).unwrap_or(DEFAULT_RESYNC_INTERVAL),
        Err(_) => DEFAULT_RESYNC_INTERVAL,
    }
}
