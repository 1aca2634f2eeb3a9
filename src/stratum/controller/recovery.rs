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
use crate::stratum::k8s::store::ObjectStore;
use crate::stratum::logger::log_warn;

const COMPONENT: &str = "placement-recovery";

/// Decides whether previously recorded failure members may be cleared.
///
/// Only members whose ordinal falls below the declared replica count are
/// considered; members created transiently by failover beyond that count
/// never block recovery. A true result merely signals the failover
/// collaborator; the records themselves are not touched here.
pub fn should_recover(store: &dyn ObjectStore, cluster: &StratumCluster) -> bool {
    if cluster.status.placement.failure_members.is_empty() {
        return false;
    }

    let replicas = cluster.spec.placement.replicas;
    let in_range: Vec<_> = cluster
        .status
        .placement
        .members
        .values()
        .filter(|member| {
            cluster
                .parse_ordinal(&member.name)
                .map(|ordinal| ordinal < replicas)
                .unwrap_or(false)
        })
        .collect();

    // Status must have converged to exactly the declared shape; this also
    // catches member names that do not belong to this cluster's pod group.
    if in_range.len() as i32 != replicas {
        return false;
    }

    for member in in_range {
        if !member.health {
            return false;
        }
        match store.get_pod(cluster.namespace(), &member.name) {
            Ok(pod) => {
                if !pod.is_ready() {
                    return false;
                }
            }
            Err(err) => {
                if !err.is_not_found() {
                    log_warn(
                        COMPONENT,
                        "failed to look up member pod; postponing recovery",
                        &[
                            ("cluster", cluster.name()),
                            ("pod", member.name.as_str()),
                            ("error", err.to_string().as_str()),
                        ],
                    );
                }
                return false;
            }
        }
    }

    true
}
