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

use crate::stratum::api::types::{Member, MemberPhase, StratumCluster, UnjoinedMember};
use crate::stratum::controller::error::SyncError;
use crate::stratum::controller::upgrade;
use crate::stratum::k8s::statefulset::StatefulSet;
use crate::stratum::k8s::store::ObjectStore;
use crate::stratum::logger::{log_debug, log_warn};
use crate::stratum::placement::client::PlacementClient;

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;

const COMPONENT: &str = "placement-status";

/// Refreshes the placement slice of cluster status from the tier's own API
/// and the object store, given the observed pod group.
///
/// Failures of the placement API are non-fatal: the member map stays stale,
/// `synced` drops to false, and the cycle continues. Object store failures
/// abort the cycle.
pub fn sync_placement_status(
    store: &dyn ObjectStore,
    client: &dyn PlacementClient,
    cluster: &mut StratumCluster,
    set: &StatefulSet,
    unjoined_grace: Duration,
) -> Result<(), SyncError> {
    cluster.status.placement.stateful_set = Some(set.status.clone().unwrap_or_default());

    let pods = store.list_pods(cluster.namespace(), &cluster.placement_selector())?;

    let upgrading = upgrade::is_upgrading(cluster, set, &pods);
    cluster.status.placement.phase = if upgrading {
        MemberPhase::Upgrade
    } else if cluster.placement_desired_replicas() != set.spec.replicas {
        MemberPhase::Scale
    } else {
        MemberPhase::Normal
    };

    let health = match client.get_health() {
        Ok(health) => health,
        Err(err) => {
            log_warn(
                COMPONENT,
                "failed to fetch placement health; status stays stale this cycle",
                &[
                    ("cluster", cluster.name()),
                    ("error", err.to_string().as_str()),
                ],
            );
            cluster.status.placement.synced = false;
            return Ok(());
        }
    };

    let info = match client.get_cluster_info() {
        Ok(info) => info,
        Err(err) => {
            log_warn(
                COMPONENT,
                "failed to fetch placement cluster identity; status stays stale this cycle",
                &[
                    ("cluster", cluster.name()),
                    ("error", err.to_string().as_str()),
                ],
            );
            cluster.status.placement.synced = false;
            return Ok(());
        }
    };
    cluster.status.cluster_id = info.id.to_string();

    let mut members = HashMap::with_capacity(health.healths.len());
    for reported in health.healths {
        let client_url = reported.client_urls.first().cloned().unwrap_or_default();
        members.insert(
            reported.name.clone(),
            Member {
                name: reported.name,
                id: reported.member_id.to_string(),
                client_url,
                health: reported.health,
            },
        );
    }
    cluster.status.placement.members = members;

    // A pod that exists but is absent from the fresh health report has not
    // joined the consensus group yet. Entries keep their first-seen stamp
    // across cycles and vanish the cycle their name reappears as a member.
    let now = Utc::now();
    let mut unjoined = HashMap::new();
    for pod in &pods {
        let Some(pod_name) = pod.metadata.name.as_deref() else {
            continue;
        };
        if cluster.status.placement.members.contains_key(pod_name) {
            continue;
        }
        let created_at = cluster
            .status
            .placement
            .unjoined_members
            .get(pod_name)
            .map(|entry| entry.created_at)
            .unwrap_or(now);
        unjoined.insert(
            pod_name.to_string(),
            UnjoinedMember {
                pod_name: pod_name.to_string(),
                created_at,
            },
        );
    }

    for entry in unjoined.values() {
        let age = (now - entry.created_at).to_std().unwrap_or_default();
        if age > unjoined_grace {
            log_warn(
                COMPONENT,
                "pod has not joined the placement group within the grace period",
                &[
                    ("cluster", cluster.name()),
                    ("pod", entry.pod_name.as_str()),
                    ("age", format!("{}s", age.as_secs()).as_str()),
                ],
            );
        }
    }
    cluster.status.placement.unjoined_members = unjoined;

    cluster.status.placement.synced = true;
    log_debug(
        COMPONENT,
        "refreshed placement status",
        &[
            ("cluster", cluster.name()),
            (
                "members",
                cluster.status.placement.members.len().to_string().as_str(),
            ),
            (
                "unjoined",
                cluster
                    .status
                    .placement
                    .unjoined_members
                    .len()
                    .to_string()
                    .as_str(),
            ),
        ],
    );
    Ok(())
}
