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

//! Capability interfaces for the decision modules the member manager
//! consumes but does not implement. Each has one production implementation
//! and one deterministic fake; the manager depends only on the traits.

use crate::stratum::api::types::{FailureMember, MemberKind, StratumCluster};
use crate::stratum::controller::error::SyncError;
use crate::stratum::k8s::statefulset::StatefulSet;

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Decides whether reconciliation of a tier is frozen for this cluster.
pub trait Suspender: Send + Sync {
    fn suspended(&self, cluster: &StratumCluster, kind: MemberKind) -> Result<bool, SyncError>;
}

/// Production suspender: an explicit cluster annotation freezes the tier,
/// e.g. during maintenance windows.
#[derive(Default)]
pub struct AnnotationSuspender;

impl Suspender for AnnotationSuspender {
    fn suspended(&self, cluster: &StratumCluster, _kind: MemberKind) -> Result<bool, SyncError> {
        Ok(cluster.suspend_requested())
    }
}

#[derive(Default)]
pub struct FakeSuspender {
    suspended: AtomicBool,
}

impl FakeSuspender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Relaxed);
    }
}

impl Suspender for FakeSuspender {
    fn suspended(&self, _cluster: &StratumCluster, _kind: MemberKind) -> Result<bool, SyncError> {
        Ok(self.suspended.load(Ordering::Relaxed))
    }
}

/// Adjusts the replica count the pod group is asked for. The member manager
/// supplies the declared count plus replacement placeholders; a scaler may
/// stage the change one step at a time.
pub trait Scaler: Send + Sync {
    fn adjust_replicas(
        &self,
        cluster: &StratumCluster,
        desired: i32,
        observed: &StatefulSet,
    ) -> Result<i32, SyncError>;
}

/// Production scaler used here: applies the desired count as-is. Staged
/// scaling heuristics live outside this crate.
#[derive(Default)]
pub struct PassthroughScaler;

impl Scaler for PassthroughScaler {
    fn adjust_replicas(
        &self,
        _cluster: &StratumCluster,
        desired: i32,
        _observed: &StatefulSet,
    ) -> Result<i32, SyncError> {
        Ok(desired)
    }
}

#[derive(Default)]
pub struct FakeScaler {
    pinned: Mutex<Option<i32>>,
}

impl FakeScaler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin_replicas(&self, replicas: i32) {
        *self.pinned.lock().unwrap() = Some(replicas);
    }
}

impl Scaler for FakeScaler {
    fn adjust_replicas(
        &self,
        _cluster: &StratumCluster,
        desired: i32,
        _observed: &StatefulSet,
    ) -> Result<i32, SyncError> {
        Ok(self.pinned.lock().unwrap().unwrap_or(desired))
    }
}

/// Supplies the rollout partition for the pod group, advancing the
/// protected boundary only past members already healthy under the new
/// template.
pub trait Upgrader: Send + Sync {
    fn next_partition(
        &self,
        cluster: &StratumCluster,
        observed: &StatefulSet,
        desired_replicas: i32,
    ) -> Result<i32, SyncError>;
}

/// Fake upgrader: answers with the pinned partition, or carries the
/// observed one forward.
#[derive(Default)]
pub struct FakeUpgrader {
    pinned: Mutex<Option<i32>>,
}

impl FakeUpgrader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pin_partition(&self, partition: i32) {
        *self.pinned.lock().unwrap() = Some(partition);
    }
}

impl Upgrader for FakeUpgrader {
    fn next_partition(
        &self,
        _cluster: &StratumCluster,
        observed: &StatefulSet,
        _desired_replicas: i32,
    ) -> Result<i32, SyncError> {
        Ok(self
            .pinned
            .lock()
            .unwrap()
            .unwrap_or_else(|| observed.partition()))
    }
}

/// Owns the failure-member bookkeeping. The member manager only signals;
/// it never edits the failure records itself.
pub trait Failover: Send + Sync {
    fn mark_failed(&self, cluster: &mut StratumCluster) -> Result<(), SyncError>;
    fn clear_failed(&self, cluster: &mut StratumCluster) -> Result<(), SyncError>;
}

/// Production failover: records the first unhealthy in-range member not
/// already tracked, and clears every record when recovery is signalled.
/// Replacement scheduling beyond the record itself lives outside this crate.
#[derive(Default)]
pub struct StatusFailover;

impl Failover for StatusFailover {
    fn mark_failed(&self, cluster: &mut StratumCluster) -> Result<(), SyncError> {
        let replicas = cluster.spec.placement.replicas;
        let candidate = cluster
            .status
            .placement
            .members
            .values()
            .filter(|member| !member.health)
            .filter(|member| {
                cluster
                    .parse_ordinal(&member.name)
                    .map(|ordinal| ordinal < replicas)
                    .unwrap_or(false)
            })
            .map(|member| member.name.clone())
            .find(|name| !cluster.status.placement.failure_members.contains_key(name));

        if let Some(name) = candidate {
            cluster.status.placement.failure_members.insert(
                name.clone(),
                FailureMember {
                    pod_name: name,
                    created_at: Utc::now(),
                    member_deleted: false,
                },
            );
        }
        Ok(())
    }

    fn clear_failed(&self, cluster: &mut StratumCluster) -> Result<(), SyncError> {
        cluster.status.placement.failure_members.clear();
        Ok(())
    }
}

/// Fake failover counting invocations; `clear_failed` still empties the
/// records so recovery scenarios observe the handoff.
#[derive(Default)]
pub struct FakeFailover {
    pub marked: AtomicUsize,
    pub cleared: AtomicUsize,
}

impl FakeFailover {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_count(&self) -> usize {
        self.marked.load(Ordering::Relaxed)
    }

    pub fn clear_count(&self) -> usize {
        self.cleared.load(Ordering::Relaxed)
    }
}

impl Failover for FakeFailover {
    fn mark_failed(&self, _cluster: &mut StratumCluster) -> Result<(), SyncError> {
        self.marked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn clear_failed(&self, cluster: &mut StratumCluster) -> Result<(), SyncError> {
        self.cleared.fetch_add(1, Ordering::Relaxed);
        cluster.status.placement.failure_members.clear();
        Ok(())
    }
}
