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

use crate::stratum::api::types::StratumCluster;
use crate::stratum::controller::member::PlacementMemberManager;
use crate::stratum::k8s::store::normalize_namespace;
use crate::stratum::logger::{log_debug, log_error, log_warn};
use crate::stratum::util::{is_missing_value_error, Keyspace};

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

const COMPONENT: &str = "operator-runtime";
const DEFAULT_QUEUE_CAPACITY: usize = 256;

const CLUSTER_KEYSPACE: Keyspace = Keyspace::new("clusters");

/// Identity of one cluster; the unit of reconciliation scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ClusterKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(|ns| ns.to_string()),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StratumCluster/{}/{}",
            normalize_namespace(self.namespace.as_deref()),
            self.name
        )
    }
}

#[derive(Clone)]
pub struct WorkQueue<T> {
    inner: Arc<WorkQueueInner<T>>,
}

struct WorkQueueInner<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
}

impl<T> WorkQueue<T>
where
    T: Send + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            inner: Arc::new(WorkQueueInner {
                sender,
                receiver: Mutex::new(receiver),
            }),
        }
    }

    pub async fn enqueue(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        self.inner.sender.send(item).await
    }

    pub async fn next(&self) -> Option<T> {
        let mut guard = self.inner.receiver.lock().await;
        guard.recv().await
    }
}

/// Registry of cluster objects in the keyspace. The specification is owned
/// by whoever writes it there; this crate only merges the status subtree
/// back after a cycle.
pub struct ClusterRegistry;

impl ClusterRegistry {
    fn key(namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", normalize_namespace(namespace), name)
    }

    pub fn load(key: &ClusterKey) -> Result<Option<StratumCluster>, Box<dyn Error + Send + Sync>> {
        match CLUSTER_KEYSPACE.get(&Self::key(key.namespace.as_deref(), &key.name)) {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(err) if is_missing_value_error(err.as_ref()) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn save(cluster: &StratumCluster) -> Result<(), Box<dyn Error + Send + Sync>> {
        let key = Self::key(cluster.namespace(), cluster.name());
        let payload = serde_json::to_string_pretty(cluster)?;
        CLUSTER_KEYSPACE.put(&key, &payload)
    }

    pub fn list() -> Result<Vec<ClusterKey>, Box<dyn Error + Send + Sync>> {
        // Two levels: <namespace>/<name>. Namespace directories carry no
        // value themselves, so they are enumerated directly.
        let mut keys = Vec::new();
        for namespace_dir in Self::namespaces()? {
            for full_key in CLUSTER_KEYSPACE.list(&namespace_dir)? {
                if let Some((namespace, name)) = full_key.split_once('/') {
                    keys.push(ClusterKey::new(Some(namespace), name));
                }
            }
        }
        Ok(keys)
    }

    fn namespaces() -> Result<Vec<String>, Box<dyn Error + Send + Sync>> {
        let root = crate::stratum::Config::Keyspace.get_path().join("clusters");
        let entries = match std::fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(Box::new(err)),
        };
        let mut namespaces = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    namespaces.push(name.to_string());
                }
            }
        }
        namespaces.sort();
        Ok(namespaces)
    }
}

/// Drives reconciliation: a work queue of cluster keys drained by a worker
/// that handles one key at a time, and a resync ticker re-enqueueing every
/// known cluster. Errors (including the deliberate requeue signal) are
/// absorbed here; the next resync retries.
pub struct OperatorRuntime {
    queue: WorkQueue<ClusterKey>,
    manager: Arc<PlacementMemberManager>,
}

impl OperatorRuntime {
    pub fn new(manager: Arc<PlacementMemberManager>) -> Self {
        Self {
            queue: WorkQueue::new(DEFAULT_QUEUE_CAPACITY),
            manager,
        }
    }

    pub fn work_queue(&self) -> WorkQueue<ClusterKey> {
        self.queue.clone()
    }

    /// Loads the cluster, runs one cycle on a private copy, and merges the
    /// status subtree back when it changed.
    pub fn reconcile_key(manager: &PlacementMemberManager, key: &ClusterKey) {
        let stored = match ClusterRegistry::load(key) {
            Ok(Some(cluster)) => cluster,
            Ok(None) => {
                log_debug(
                    COMPONENT,
                    "cluster vanished before reconciliation",
                    &[("cluster", key.to_string().as_str())],
                );
                return;
            }
            Err(err) => {
                log_error(
                    COMPONENT,
                    "failed to load cluster",
                    &[
                        ("cluster", key.to_string().as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
                return;
            }
        };

        let mut cluster = stored.clone();
        match manager.sync(&mut cluster) {
            Ok(()) => {}
            Err(err) if err.is_requeue() => {
                log_debug(
                    COMPONENT,
                    "cycle asked for a prompt re-check",
                    &[
                        ("cluster", key.to_string().as_str()),
                        ("reason", err.to_string().as_str()),
                    ],
                );
            }
            Err(err) => {
                log_error(
                    COMPONENT,
                    "reconciliation cycle failed",
                    &[
                        ("cluster", key.to_string().as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
            }
        }

        if cluster.status != stored.status {
            if let Err(err) = ClusterRegistry::save(&cluster) {
                log_warn(
                    COMPONENT,
                    "failed to persist cluster status",
                    &[
                        ("cluster", key.to_string().as_str()),
                        ("error", err.to_string().as_str()),
                    ],
                );
            }
        }
    }

    /// Spawns the worker loop. One item at a time: distinct clusters queue
    /// behind each other here; scaling out means more runtimes, each owning
    /// disjoint keys.
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let manager = self.manager.clone();
        tokio::spawn(async move {
            while let Some(key) = queue.next().await {
                let manager = manager.clone();
                let result =
                    tokio::task::spawn_blocking(move || Self::reconcile_key(&manager, &key)).await;
                if let Err(err) = result {
                    log_error(
                        COMPONENT,
                        "reconciliation worker panicked",
                        &[("error", err.to_string().as_str())],
                    );
                }
            }
        })
    }

    /// Spawns the resync ticker enqueueing every known cluster.
    pub fn spawn_resync(&self, interval: Duration) -> JoinHandle<()> {
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let keys = match ClusterRegistry::list() {
                    Ok(keys) => keys,
                    Err(err) => {
                        log_error(
                            COMPONENT,
                            "failed to enumerate clusters for resync",
                            &[("error", err.to_string().as_str())],
                        );
                        continue;
                    }
                };
                for key in keys {
                    if queue.enqueue(key).await.is_err() {
                        return;
                    }
                }
            }
        })
    }
}
