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

use crate::stratum::k8s::persistentvolumeclaim::PersistentVolumeClaim;
use crate::stratum::k8s::pod::{ObjectMeta, Pod};
use crate::stratum::k8s::service::Service;
use crate::stratum::k8s::statefulset::StatefulSet;
use crate::stratum::util::{is_missing_value_error, Keyspace};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Mutex;

const K8S_KEYSPACE: Keyspace = Keyspace::new("k8s");
const SERVICE_PREFIX: &str = "services";
const STATEFULSET_PREFIX: &str = "statefulsets";
const POD_PREFIX: &str = "pods";
const CLAIM_PREFIX: &str = "persistentvolumeclaims";

pub fn normalize_namespace(namespace: Option<&str>) -> String {
    namespace.unwrap_or("default").to_string()
}

/// Errors surfaced by the object store. Absence and write conflicts are
/// distinguishable conditions; everything else is an opaque internal error.
#[derive(Debug)]
pub enum StoreError {
    NotFound { kind: &'static str, name: String },
    Conflict { kind: &'static str, name: String },
    Internal(Box<dyn Error + Send + Sync>),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    fn internal(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        StoreError::Internal(err.into())
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound { kind, name } => write!(f, "{} '{}' not found", kind, name),
            StoreError::Conflict { kind, name } => {
                write!(f, "conflicting write to {} '{}'", kind, name)
            }
            StoreError::Internal(err) => write!(f, "object store error: {}", err),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Internal(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Typed CRUD and indexed read access over the objects the member manager
/// touches. Pods and claims are read-only from this crate's point of view.
pub trait ObjectStore: Send + Sync {
    fn get_service(&self, namespace: Option<&str>, name: &str) -> Result<Service, StoreError>;
    fn create_service(&self, service: &Service) -> Result<(), StoreError>;
    fn update_service(&self, service: &Service) -> Result<(), StoreError>;

    fn get_stateful_set(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<StatefulSet, StoreError>;
    fn create_stateful_set(&self, set: &StatefulSet) -> Result<(), StoreError>;
    fn update_stateful_set(&self, set: &StatefulSet) -> Result<(), StoreError>;

    fn get_pod(&self, namespace: Option<&str>, name: &str) -> Result<Pod, StoreError>;
    fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError>;
    fn list_claims(
        &self,
        namespace: Option<&str>,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError>;
}

fn matches_selector(selector: &HashMap<String, String>, labels: &HashMap<String, String>) -> bool {
    if selector.is_empty() {
        return false;
    }
    selector
        .iter()
        .all(|(key, value)| labels.get(key).map(|v| v == value).unwrap_or(false))
}

fn bump_resource_version(meta: &mut ObjectMeta) {
    let next = meta
        .resource_version
        .as_deref()
        .and_then(|rv| rv.parse::<u64>().ok())
        .map(|rv| rv + 1)
        .unwrap_or(1);
    meta.resource_version = Some(next.to_string());
}

/// Production store persisting objects in the filesystem keyspace under
/// `k8s/<kind>/<namespace>/<name>`. Optimistic concurrency rides on the
/// object's resourceVersion.
#[derive(Debug, Default)]
pub struct KeyspaceStore;

impl KeyspaceStore {
    pub fn new() -> Self {
        Self
    }

    fn object_key(prefix: &str, namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}/{}", prefix, normalize_namespace(namespace), name)
    }

    fn load<T: DeserializeOwned>(
        kind: &'static str,
        prefix: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<T, StoreError> {
        let key = Self::object_key(prefix, namespace, name);
        match K8S_KEYSPACE.get(&key) {
            Ok(raw) => serde_json::from_str(&raw).map_err(StoreError::internal),
            Err(err) if is_missing_value_error(err.as_ref()) => Err(StoreError::NotFound {
                kind,
                name: name.to_string(),
            }),
            Err(err) => Err(StoreError::Internal(err)),
        }
    }

    fn save<T: Serialize>(
        prefix: &str,
        namespace: Option<&str>,
        name: &str,
        object: &T,
    ) -> Result<(), StoreError> {
        let key = Self::object_key(prefix, namespace, name);
        let payload = serde_json::to_string_pretty(object).map_err(StoreError::internal)?;
        K8S_KEYSPACE.put(&key, &payload).map_err(StoreError::Internal)
    }

    fn list_labelled<T: DeserializeOwned>(
        kind: &'static str,
        prefix: &str,
        namespace: Option<&str>,
    ) -> Result<Vec<T>, StoreError> {
        let scope = format!("{}/{}", prefix, normalize_namespace(namespace));
        let keys = K8S_KEYSPACE.list(&scope).map_err(StoreError::Internal)?;
        let mut objects = Vec::with_capacity(keys.len());
        for key in keys {
            let raw = match K8S_KEYSPACE.get(&key) {
                Ok(raw) => raw,
                // The entry may have been deleted between list and get.
                Err(err) if is_missing_value_error(err.as_ref()) => continue,
                Err(err) => return Err(StoreError::Internal(err)),
            };
            let object: T = serde_json::from_str(&raw).map_err(|err| {
                StoreError::internal(format!("corrupt {} entry at '{}': {}", kind, key, err))
            })?;
            objects.push(object);
        }
        Ok(objects)
    }
}

impl ObjectStore for KeyspaceStore {
    fn get_service(&self, namespace: Option<&str>, name: &str) -> Result<Service, StoreError> {
        Self::load("Service", SERVICE_PREFIX, namespace, name)
    }

    fn create_service(&self, service: &Service) -> Result<(), StoreError> {
        let mut stored = service.clone();
        let name = stored.metadata.name.clone().unwrap_or_default();
        let namespace = stored.metadata.namespace.clone();
        match Self::load::<Service>("Service", SERVICE_PREFIX, namespace.as_deref(), &name) {
            Ok(_) => Err(StoreError::Conflict {
                kind: "Service",
                name,
            }),
            Err(err) if err.is_not_found() => {
                stored.metadata.resource_version = Some("1".to_string());
                Self::save(SERVICE_PREFIX, namespace.as_deref(), &name, &stored)
            }
            Err(err) => Err(err),
        }
    }

    fn update_service(&self, service: &Service) -> Result<(), StoreError> {
        let name = service.metadata.name.clone().unwrap_or_default();
        let namespace = service.metadata.namespace.clone();
        let current: Service = Self::load("Service", SERVICE_PREFIX, namespace.as_deref(), &name)?;
        if current.metadata.resource_version != service.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "Service",
                name,
            });
        }
        let mut stored = service.clone();
        bump_resource_version(&mut stored.metadata);
        Self::save(SERVICE_PREFIX, namespace.as_deref(), &name, &stored)
    }

    fn get_stateful_set(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<StatefulSet, StoreError> {
        Self::load("StatefulSet", STATEFULSET_PREFIX, namespace, name)
    }

    fn create_stateful_set(&self, set: &StatefulSet) -> Result<(), StoreError> {
        let mut stored = set.clone();
        let name = stored.metadata.name.clone().unwrap_or_default();
        let namespace = stored.metadata.namespace.clone();
        match Self::load::<StatefulSet>(
            "StatefulSet",
            STATEFULSET_PREFIX,
            namespace.as_deref(),
            &name,
        ) {
            Ok(_) => Err(StoreError::Conflict {
                kind: "StatefulSet",
                name,
            }),
            Err(err) if err.is_not_found() => {
                stored.metadata.resource_version = Some("1".to_string());
                Self::save(STATEFULSET_PREFIX, namespace.as_deref(), &name, &stored)
            }
            Err(err) => Err(err),
        }
    }

    fn update_stateful_set(&self, set: &StatefulSet) -> Result<(), StoreError> {
        let name = set.metadata.name.clone().unwrap_or_default();
        let namespace = set.metadata.namespace.clone();
        let current: StatefulSet = Self::load(
            "StatefulSet",
            STATEFULSET_PREFIX,
            namespace.as_deref(),
            &name,
        )?;
        if current.metadata.resource_version != set.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "StatefulSet",
                name,
            });
        }
        let mut stored = set.clone();
        bump_resource_version(&mut stored.metadata);
        Self::save(STATEFULSET_PREFIX, namespace.as_deref(), &name, &stored)
    }

    fn get_pod(&self, namespace: Option<&str>, name: &str) -> Result<Pod, StoreError> {
        Self::load("Pod", POD_PREFIX, namespace, name)
    }

    fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError> {
        let pods: Vec<Pod> = Self::list_labelled("Pod", POD_PREFIX, namespace)?;
        Ok(pods
            .into_iter()
            .filter(|pod| matches_selector(selector, &pod.metadata.labels))
            .collect())
    }

    fn list_claims(
        &self,
        namespace: Option<&str>,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        let claims: Vec<PersistentVolumeClaim> =
            Self::list_labelled("PersistentVolumeClaim", CLAIM_PREFIX, namespace)?;
        Ok(claims
            .into_iter()
            .filter(|claim| matches_selector(selector, &claim.metadata.labels))
            .collect())
    }
}

type StatusChangeFn = Box<dyn Fn(&mut StatefulSet) + Send>;

#[derive(Default)]
struct FailurePlan {
    // op name -> (call index that fails, message); counters track calls seen.
    failures: HashMap<&'static str, (usize, String)>,
    counters: HashMap<&'static str, usize>,
}

impl FailurePlan {
    fn arm(&mut self, op: &'static str, at: usize, message: &str) {
        self.failures.insert(op, (at, message.to_string()));
    }

    fn check(&mut self, op: &'static str) -> Result<(), StoreError> {
        let seen = self.counters.entry(op).or_insert(0);
        let index = *seen;
        *seen += 1;
        if let Some((at, message)) = self.failures.get(op) {
            if *at == index {
                return Err(StoreError::internal(message.clone()));
            }
        }
        Ok(())
    }
}

/// Deterministic in-memory store for tests: same contract as the keyspace
/// store, plus failure injection and a status-change hook emulating the
/// platform's StatefulSet controller filling in observed status.
#[derive(Default)]
pub struct MemoryStore {
    services: Mutex<HashMap<String, Service>>,
    stateful_sets: Mutex<HashMap<String, StatefulSet>>,
    pods: Mutex<HashMap<String, Pod>>,
    claims: Mutex<HashMap<String, PersistentVolumeClaim>>,
    status_change: Mutex<Option<StatusChangeFn>>,
    failure_plan: Mutex<FailurePlan>,
    write_count: Mutex<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(namespace: Option<&str>, name: &str) -> String {
        format!("{}/{}", normalize_namespace(namespace), name)
    }

    /// Emulates the platform writing StatefulSet status after each
    /// create/update, the way a live controller would.
    pub fn set_status_change(&self, hook: impl Fn(&mut StatefulSet) + Send + 'static) {
        *self.status_change.lock().unwrap() = Some(Box::new(hook));
    }

    /// Arms the nth (0-based) call of the given operation to fail.
    /// Operations: "create_service", "update_service",
    /// "create_stateful_set", "update_stateful_set".
    pub fn fail_call(&self, op: &'static str, at: usize, message: &str) {
        self.failure_plan.lock().unwrap().arm(op, at, message);
    }

    /// Number of successful mutations issued against the store.
    pub fn write_count(&self) -> usize {
        *self.write_count.lock().unwrap()
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = Self::key(
            pod.metadata.namespace.as_deref(),
            pod.metadata.name.as_deref().unwrap_or(""),
        );
        self.pods.lock().unwrap().insert(key, pod);
    }

    pub fn remove_pod(&self, namespace: Option<&str>, name: &str) {
        self.pods.lock().unwrap().remove(&Self::key(namespace, name));
    }

    pub fn add_claim(&self, claim: PersistentVolumeClaim) {
        let key = Self::key(
            claim.metadata.namespace.as_deref(),
            claim.metadata.name.as_deref().unwrap_or(""),
        );
        self.claims.lock().unwrap().insert(key, claim);
    }

    fn record_write(&self) {
        *self.write_count.lock().unwrap() += 1;
    }
}

impl ObjectStore for MemoryStore {
    fn get_service(&self, namespace: Option<&str>, name: &str) -> Result<Service, StoreError> {
        self.services
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Service",
                name: name.to_string(),
            })
    }

    fn create_service(&self, service: &Service) -> Result<(), StoreError> {
        self.failure_plan.lock().unwrap().check("create_service")?;
        let name = service.metadata.name.clone().unwrap_or_default();
        let key = Self::key(service.metadata.namespace.as_deref(), &name);
        let mut services = self.services.lock().unwrap();
        if services.contains_key(&key) {
            return Err(StoreError::Conflict {
                kind: "Service",
                name,
            });
        }
        let mut stored = service.clone();
        stored.metadata.resource_version = Some("1".to_string());
        services.insert(key, stored);
        self.record_write();
        Ok(())
    }

    fn update_service(&self, service: &Service) -> Result<(), StoreError> {
        self.failure_plan.lock().unwrap().check("update_service")?;
        let name = service.metadata.name.clone().unwrap_or_default();
        let key = Self::key(service.metadata.namespace.as_deref(), &name);
        let mut services = self.services.lock().unwrap();
        let current = services.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: "Service",
            name: name.clone(),
        })?;
        if current.metadata.resource_version != service.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "Service",
                name,
            });
        }
        let mut stored = service.clone();
        bump_resource_version(&mut stored.metadata);
        services.insert(key, stored);
        self.record_write();
        Ok(())
    }

    fn get_stateful_set(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<StatefulSet, StoreError> {
        self.stateful_sets
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "StatefulSet",
                name: name.to_string(),
            })
    }

    fn create_stateful_set(&self, set: &StatefulSet) -> Result<(), StoreError> {
        self.failure_plan
            .lock()
            .unwrap()
            .check("create_stateful_set")?;
        let name = set.metadata.name.clone().unwrap_or_default();
        let key = Self::key(set.metadata.namespace.as_deref(), &name);
        let mut sets = self.stateful_sets.lock().unwrap();
        if sets.contains_key(&key) {
            return Err(StoreError::Conflict {
                kind: "StatefulSet",
                name,
            });
        }
        let mut stored = set.clone();
        stored.metadata.resource_version = Some("1".to_string());
        if let Some(hook) = self.status_change.lock().unwrap().as_ref() {
            hook(&mut stored);
        }
        sets.insert(key, stored);
        self.record_write();
        Ok(())
    }

    fn update_stateful_set(&self, set: &StatefulSet) -> Result<(), StoreError> {
        self.failure_plan
            .lock()
            .unwrap()
            .check("update_stateful_set")?;
        let name = set.metadata.name.clone().unwrap_or_default();
        let key = Self::key(set.metadata.namespace.as_deref(), &name);
        let mut sets = self.stateful_sets.lock().unwrap();
        let current = sets.get(&key).ok_or_else(|| StoreError::NotFound {
            kind: "StatefulSet",
            name: name.clone(),
        })?;
        if current.metadata.resource_version != set.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "StatefulSet",
                name,
            });
        }
        let mut stored = set.clone();
        bump_resource_version(&mut stored.metadata);
        if let Some(hook) = self.status_change.lock().unwrap().as_ref() {
            hook(&mut stored);
        }
        sets.insert(key, stored);
        self.record_write();
        Ok(())
    }

    fn get_pod(&self, namespace: Option<&str>, name: &str) -> Result<Pod, StoreError> {
        self.pods
            .lock()
            .unwrap()
            .get(&Self::key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Pod",
                name: name.to_string(),
            })
    }

    fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<Pod>, StoreError> {
        let scope = normalize_namespace(namespace);
        let mut pods: Vec<Pod> = self
            .pods
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, pod)| {
                key.starts_with(&format!("{}/", scope))
                    && matches_selector(selector, &pod.metadata.labels)
            })
            .map(|(_, pod)| pod.clone())
            .collect();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(pods)
    }

    fn list_claims(
        &self,
        namespace: Option<&str>,
        selector: &HashMap<String, String>,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        let scope = normalize_namespace(namespace);
        let mut claims: Vec<PersistentVolumeClaim> = self
            .claims
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, claim)| {
                key.starts_with(&format!("{}/", scope))
                    && matches_selector(selector, &claim.metadata.labels)
            })
            .map(|(_, claim)| claim.clone())
            .collect();
        claims.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(claims)
    }
}
