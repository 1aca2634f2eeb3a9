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
use crate::stratum::controller::error::SyncError;
use crate::stratum::controller::hooks::Upgrader;
use crate::stratum::k8s::pod::Pod;
use crate::stratum::k8s::statefulset::{StatefulSet, LABEL_REVISION_HASH};
use crate::stratum::k8s::store::ObjectStore;

use std::sync::Arc;

/// Detects an in-flight rollout. Either signal suffices: the group's
/// current/update revision status fields differ, or any owned pod carries a
/// revision label different from the update revision. Pods without a
/// revision label are ignored. Revisions are opaque tokens; only equality
/// matters.
pub fn is_upgrading(cluster: &StratumCluster, set: &StatefulSet, pods: &[Pod]) -> bool {
    if let Some(status) = set.status.as_ref() {
        if !status.current_revision.is_empty()
            && !status.update_revision.is_empty()
            && status.current_revision != status.update_revision
        {
            return true;
        }
    }

    let update_revision = cluster
        .status
        .placement
        .stateful_set
        .as_ref()
        .map(|echo| echo.update_revision.clone())
        .filter(|revision| !revision.is_empty())
        .or_else(|| set.status.as_ref().map(|s| s.update_revision.clone()))
        .unwrap_or_default();
    if update_revision.is_empty() {
        return false;
    }

    pods.iter().any(|pod| {
        pod.metadata
            .labels
            .get(LABEL_REVISION_HASH)
            .map(|revision| revision != &update_revision)
            .unwrap_or(false)
    })
}

/// Whether the health-gated rollout may be bypassed entirely (partition 0,
/// every ordinal takes the new template immediately).
///
/// A single-node tier with no federated peers risks nothing by restarting;
/// it is forced even without the annotation. The moment peer members exist,
/// forcing is refused regardless of the annotation, and the gated path
/// decides instead.
pub fn force_upgrade_applies(cluster: &StratumCluster) -> bool {
    if cluster.spec.placement.replicas < 2 {
        cluster.status.placement.peer_members.is_empty()
    } else {
        cluster.force_upgrade_enabled()
    }
}

/// Production upgrader: walks ordinals from the top down and lowers the
/// protected boundary one step at a time, only past pods that already run
/// the update revision and report a healthy member.
pub struct GatedUpgrader {
    store: Arc<dyn ObjectStore>,
}

impl GatedUpgrader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

impl Upgrader for GatedUpgrader {
    fn next_partition(
        &self,
        cluster: &StratumCluster,
        observed: &StatefulSet,
        desired_replicas: i32,
    ) -> Result<i32, SyncError> {
        let status = observed.status.clone().unwrap_or_default();

        // No rollout in flight: protect every ordinal so a future template
        // change starts fully gated.
        if status.update_revision.is_empty() || status.update_revision == status.current_revision {
            return Ok(desired_replicas);
        }

        if !cluster.status.placement.synced {
            return Err(SyncError::Requeue(format!(
                "placement status of {} is not synced; rollout needs fresh health",
                cluster.name()
            )));
        }

        let hold = observed.partition().min(desired_replicas);
        let mut partition = desired_replicas;
        for ordinal in (0..desired_replicas).rev() {
            let pod_name = cluster.ordinal_pod_name(ordinal);
            let pod = match self.store.get_pod(cluster.namespace(), &pod_name) {
                Ok(pod) => pod,
                Err(err) if err.is_not_found() => return Ok(hold),
                Err(err) => return Err(err.into()),
            };
            let revision = pod
                .metadata
                .labels
                .get(LABEL_REVISION_HASH)
                .cloned()
                .unwrap_or_default();
            if revision != status.update_revision {
                // Next ordinal to update; expose it and stop.
                partition = ordinal;
                break;
            }
            let healthy = cluster
                .status
                .placement
                .members
                .get(&pod_name)
                .map(|member| member.health)
                .unwrap_or(false);
            if !healthy {
                return Ok(hold);
            }
            partition = ordinal;
        }
        Ok(partition)
    }
}
