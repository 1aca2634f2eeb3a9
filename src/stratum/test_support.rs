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
use std::fs;
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex, MutexGuard, OnceLock,
};

pub struct KeyspaceTestLock {
    inner: Mutex<()>,
}

impl KeyspaceTestLock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for KeyspaceTestLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Global mutex used by tests that manipulate the keyspace environment to
/// avoid interfering with each other when running in parallel.
pub fn keyspace_lock() -> &'static KeyspaceTestLock {
    static LOCK: OnceLock<KeyspaceTestLock> = OnceLock::new();
    LOCK.get_or_init(KeyspaceTestLock::new)
}

fn target_dir() -> PathBuf {
    if let Ok(dir) = env::var("CARGO_TARGET_DIR") {
        PathBuf::from(dir)
    } else if let Ok(dir) = env::var("STRATUM_TEST_TARGET_DIR") {
        PathBuf::from(dir)
    } else {
        env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("target")
    }
}

/// Returns a unique directory under `target/test-output/<component>/`.
/// The directory is created eagerly and returned to the caller.
pub fn test_output_dir(component: &str) -> PathBuf {
    static COUNTER: OnceLock<AtomicU64> = OnceLock::new();
    let counter = COUNTER.get_or_init(|| AtomicU64::new(0));
    let mut path = target_dir();
    path.push("test-output");
    path.push(component);
    path.push(format!(
        "pid{}-{}",
        std::process::id(),
        counter.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&path).expect("create test output directory");
    path
}

/// Points the keyspace root at a fresh per-call directory and restores the
/// previous environment on drop. Callers must hold `keyspace_lock`.
pub struct ScopedKeyspaceRoot {
    previous: Option<String>,
}

impl ScopedKeyspaceRoot {
    fn new() -> Self {
        Self::at(&test_output_dir("keyspace"))
    }

    fn at(root: &std::path::Path) -> Self {
        let env_var = crate::stratum::Config::Keyspace.env_var();
        let previous = env::var(env_var).ok();
        env::set_var(env_var, root);
        Self { previous }
    }
}

impl Drop for ScopedKeyspaceRoot {
    fn drop(&mut self) {
        let env_var = crate::stratum::Config::Keyspace.env_var();
        match self.previous.as_ref() {
            Some(value) => env::set_var(env_var, value),
            None => env::remove_var(env_var),
        }
    }
}

pub fn scoped_keyspace_root() -> ScopedKeyspaceRoot {
    ScopedKeyspaceRoot::new()
}

/// Same, but rooted at a caller-owned directory (typically a tempdir).
pub fn scoped_keyspace_root_at(root: &std::path::Path) -> ScopedKeyspaceRoot {
    ScopedKeyspaceRoot::at(root)
}
