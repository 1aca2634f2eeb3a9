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

use crate::stratum::api::types::{MemberKind, StratumCluster};
use crate::stratum::config;
use crate::stratum::controller::error::SyncError;
use crate::stratum::controller::hooks::{Failover, Scaler, Suspender, Upgrader};
use crate::stratum::controller::{builder, recovery, service, status, upgrade};
use crate::stratum::k8s::store::ObjectStore;
use crate::stratum::logger::{log_debug, log_info};
use crate::stratum::placement::client::PlacementControl;

use std::sync::Arc;
use std::time::Duration;

const COMPONENT: &str = "placement-member-manager";

/// Reconciles one cluster's placement tier per invocation: endpoints, pod
/// group, status, rollout gating, and the failover handoff. Mutations land
/// on the in-memory cluster object; the caller persists the owned status
/// subtree when it changed.
pub struct PlacementMemberManager {
    store: Arc<dyn ObjectStore>,
    control: Arc<dyn PlacementControl>,
    scaler: Arc<dyn Scaler>,
    upgrader: Arc<dyn Upgrader>,
    failover: Arc<dyn Failover>,
    suspender: Arc<dyn Suspender>,
    unjoined_grace: Duration,
}

impl PlacementMemberManager {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        control: Arc<dyn PlacementControl>,
        scaler: Arc<dyn Scaler>,
        upgrader: Arc<dyn Upgrader>,
        failover: Arc<dyn Failover>,
        suspender: Arc<dyn Suspender>,
    ) -> Self {
        Self {
            store,
            control,
            scaler,
            upgrader,
            failover,
            suspender,
            unjoined_grace: config::unjoined_grace(),
        }
    }

    pub fn with_unjoined_grace(mut self, grace: Duration) -> Self {
        self.unjoined_grace = grace;
        self
    }

    pub fn sync(&self, cluster: &mut StratumCluster) -> Result<(), SyncError> {
        if self
            .suspender
            .suspended(cluster, MemberKind::Placement)?
        {
            log_info(
                COMPONENT,
                "placement reconciliation is suspended",
                &[("cluster", cluster.name())],
            );
            return Ok(());
        }

        service::reconcile_service(self.store.as_ref(), &service::desired_client_service(cluster))
            .map_err(|err| err.wrap("failed to reconcile placement client service"))?;
        service::reconcile_service(self.store.as_ref(), &service::desired_peer_service(cluster))
            .map_err(|err| err.wrap("failed to reconcile placement peer service"))?;

        self.sync_stateful_set(cluster)?;
        self.sync_failover(cluster)
    }

    fn sync_stateful_set(&self, cluster: &mut StratumCluster) -> Result<(), SyncError> {
        let name = cluster.placement_member_name();
        let namespace = cluster.namespace().map(|ns| ns.to_string());

        let existing = match self.store.get_stateful_set(namespace.as_deref(), &name) {
            Ok(set) => Some(set),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };

        // Status first, so replica count and partition act on fresh health.
        if let Some(set) = existing.as_ref() {
            let client = self.control.placement_client(cluster);
            status::sync_placement_status(
                self.store.as_ref(),
                client.as_ref(),
                cluster,
                set,
                self.unjoined_grace,
            )?;
        }

        let base_replicas = cluster.placement_desired_replicas();
        let desired_replicas = match existing.as_ref() {
            Some(observed) => self
                .scaler
                .adjust_replicas(cluster, base_replicas, observed)?,
            None => base_replicas,
        };

        let mut desired = builder::desired_stateful_set(cluster, desired_replicas);

        let Some(observed) = existing else {
            self.store.create_stateful_set(&desired)?;
            log_info(
                COMPONENT,
                "created placement pod group",
                &[
                    ("cluster", cluster.name()),
                    ("replicas", desired_replicas.to_string().as_str()),
                ],
            );
            // A just-created group has no observable status yet.
            return Err(SyncError::Requeue(format!(
                "StatefulSet {} just created, status not yet observable",
                name
            )));
        };

        let partition = if upgrade::force_upgrade_applies(cluster) {
            log_debug(
                COMPONENT,
                "rollout gate bypassed",
                &[("cluster", cluster.name())],
            );
            0
        } else {
            self.upgrader
                .next_partition(cluster, &observed, desired_replicas)?
        };
        desired.spec.update_strategy.set_partition(partition);

        let mut merged = observed.clone();
        merged.metadata.labels = desired.metadata.labels.clone();
        merged.spec = desired.spec.clone();
        if merged.spec != observed.spec || merged.metadata.labels != observed.metadata.labels {
            self.store.update_stateful_set(&merged)?;
            log_info(
                COMPONENT,
                "patched placement pod group",
                &[
                    ("cluster", cluster.name()),
                    ("replicas", desired_replicas.to_string().as_str()),
                    ("partition", partition.to_string().as_str()),
                ],
            );
        }
        Ok(())
    }

    fn sync_failover(&self, cluster: &mut StratumCluster) -> Result<(), SyncError> {
        if recovery::should_recover(self.store.as_ref(), cluster) {
            log_info(
                COMPONENT,
                "all members recovered; signalling failover to clear records",
                &[("cluster", cluster.name())],
            );
            return self.failover.clear_failed(cluster);
        }

        let replicas = cluster.spec.placement.replicas;
        let unhealthy_in_range = cluster.status.placement.members.values().any(|member| {
            !member.health
                && cluster
                    .parse_ordinal(&member.name)
                    .map(|ordinal| ordinal < replicas)
                    .unwrap_or(false)
        });
        if cluster.status.placement.synced && unhealthy_in_range {
            return self.failover.mark_failed(cluster);
        }
        Ok(())
    }
}
