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

//! Shared harness for member-manager scenarios: an in-memory object store
//! with a platform-like status hook, a fake placement API, and fake
//! decision collaborators wired into a real manager.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use stratum_operator::stratum::api::types::{ClusterSpec, StratumCluster};
use stratum_operator::stratum::controller::hooks::{FakeFailover, FakeScaler, FakeSuspender};
use stratum_operator::stratum::controller::upgrade::GatedUpgrader;
use stratum_operator::stratum::controller::PlacementMemberManager;
use stratum_operator::stratum::k8s::pod::{
    ObjectMeta, Pod, PodCondition, PodSpec, PodStatus,
};
use stratum_operator::stratum::k8s::statefulset::StatefulSet;
use stratum_operator::stratum::k8s::store::MemoryStore;
use stratum_operator::stratum::placement::client::{
    FakePlacementClient, FakePlacementControl, MemberHealth,
};

pub struct Harness {
    pub manager: PlacementMemberManager,
    pub store: Arc<MemoryStore>,
    pub client: Arc<FakePlacementClient>,
    pub scaler: Arc<FakeScaler>,
    pub failover: Arc<FakeFailover>,
    pub suspender: Arc<FakeSuspender>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        store.set_status_change(platform_status_hook);
        let client = Arc::new(FakePlacementClient::new());
        let scaler = Arc::new(FakeScaler::new());
        let failover = Arc::new(FakeFailover::new());
        let suspender = Arc::new(FakeSuspender::new());

        let manager = PlacementMemberManager::new(
            store.clone(),
            Arc::new(FakePlacementControl::new(client.clone())),
            scaler.clone(),
            Arc::new(GatedUpgrader::new(store.clone())),
            failover.clone(),
            suspender.clone(),
        );

        Self {
            manager,
            store,
            client,
            scaler,
            failover,
            suspender,
        }
    }
}

/// Emulates the platform's StatefulSet controller: observed status follows
/// the spec, and the update revision tracks a digest of the pod template so
/// template changes make the revisions diverge.
pub fn platform_status_hook(set: &mut StatefulSet) {
    let payload = serde_json::to_string(&set.spec.template).expect("serialize template");
    let mut hasher = DefaultHasher::new();
    payload.hash(&mut hasher);
    let revision = format!("rev-{:x}", hasher.finish());

    let mut status = set.status.clone().unwrap_or_default();
    status.replicas = set.spec.replicas;
    status.ready_replicas = set.spec.replicas;
    if status.current_revision.is_empty() {
        status.current_revision = revision.clone();
    }
    status.update_revision = revision;
    status.observed_generation = Some(1);
    set.status = Some(status);
}

pub fn new_cluster(name: &str, replicas: i32) -> StratumCluster {
    let mut cluster = StratumCluster::new(
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            ..Default::default()
        },
        ClusterSpec::default(),
    );
    cluster.spec.placement.replicas = replicas;
    cluster.spec.placement.image = "stratum/placement:v4.2.0".to_string();
    cluster
}

pub fn member_health(name: &str, id: u64, health: bool) -> MemberHealth {
    MemberHealth {
        name: name.to_string(),
        member_id: id,
        client_urls: vec![format!("http://{}:2379", name)],
        health,
    }
}

/// A placement pod as the platform would run it, labelled for the cluster
/// selector and optionally reporting ready.
pub fn placement_pod(cluster: &StratumCluster, ordinal: i32, ready: bool) -> Pod {
    let mut pod = Pod::new(
        ObjectMeta {
            name: Some(cluster.ordinal_pod_name(ordinal)),
            namespace: Some("default".to_string()),
            labels: cluster.placement_selector(),
            ..Default::default()
        },
        PodSpec::default(),
    );
    pod.status = Some(PodStatus {
        phase: Some("Running".to_string()),
        conditions: vec![PodCondition {
            condition_type: "Ready".to_string(),
            status: if ready { "True" } else { "False" }.to_string(),
        }],
    });
    pod
}
