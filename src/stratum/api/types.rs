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

use crate::stratum::k8s::pod::{
    ContainerSpec, EnvVar, ObjectMeta, PodSecurityContext, ResourceRequirements, VolumeSpec,
};
use crate::stratum::k8s::statefulset::StatefulSetStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cluster-level annotation forcing the rollout past the health gate.
pub const ANN_FORCE_UPGRADE: &str = "stratum.io/force-upgrade";
/// Component annotation opting into the sysctl tuning init container.
pub const ANN_SYSCTL_INIT: &str = "stratum.io/sysctl-init";
/// Cluster-level annotation freezing reconciliation of a tier.
pub const ANN_SUSPEND: &str = "stratum.io/suspend";

pub const LABEL_NAME: &str = "app.stratum.io/name";
pub const LABEL_MANAGED_BY: &str = "app.stratum.io/managed-by";
pub const LABEL_INSTANCE: &str = "app.stratum.io/instance";
pub const LABEL_COMPONENT: &str = "app.stratum.io/component";
pub const LABEL_USED_BY: &str = "app.stratum.io/used-by";

pub const MANAGED_BY_VALUE: &str = "stratum-operator";
pub const CLUSTER_NAME_VALUE: &str = "stratum-cluster";

pub const DEFAULT_CLIENT_PORT: u16 = 2379;
pub const DEFAULT_PEER_PORT: u16 = 2380;

/// Tiers managed by the operator. Only the placement tier is reconciled by
/// this crate; data tiers have their own managers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemberKind {
    #[serde(rename = "placement")]
    Placement,
}

impl MemberKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            MemberKind::Placement => "placement",
        }
    }
}

impl std::fmt::Display for MemberKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconciliation phase of a tier, recomputed every cycle from the diff
/// between desired and observed state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberPhase {
    #[default]
    Normal,
    Scale,
    Upgrade,
}

/// A member reported by the placement tier's own health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: String,
    pub id: String,
    #[serde(rename = "clientURL", default)]
    pub client_url: String,
    pub health: bool,
}

/// A pod that exists in the object store but has not yet appeared in the
/// placement tier's health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnjoinedMember {
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// A member judged permanently unhealthy by the failover collaborator.
/// `member_deleted == false` reserves a replacement replica slot until the
/// old pod/claim pair is actually removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureMember {
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "memberDeleted", default)]
    pub member_deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsClient {
    pub enabled: bool,
}

/// Service shape overrides for the client-facing endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceOverride {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
    #[serde(rename = "portName", skip_serializing_if = "Option::is_none")]
    pub port_name: Option<String>,
}

/// An extra persistent volume requested for every placement pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageVolume {
    pub name: String,
    #[serde(rename = "storageSize")]
    pub storage_size: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
}

/// Readiness probe override; the default is a TCP connect to the client port.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeOverride {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub probe_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

/// Desired specification of the placement tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementSpec {
    pub replicas: i32,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceOverride>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    #[serde(rename = "storageClassName", skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(rename = "storageVolumes", default, skip_serializing_if = "Vec::is_empty")]
    pub storage_volumes: Vec<StorageVolume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(
        rename = "additionalContainers",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub additional_containers: Vec<ContainerSpec>,
    #[serde(
        rename = "additionalVolumes",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub additional_volumes: Vec<VolumeSpec>,
    #[serde(
        rename = "podSecurityContext",
        skip_serializing_if = "Option::is_none"
    )]
    pub pod_security_context: Option<PodSecurityContext>,
    #[serde(rename = "readinessProbe", skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<ProbeOverride>,
    #[serde(rename = "hostNetwork", skip_serializing_if = "Option::is_none")]
    pub host_network: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub placement: PlacementSpec,
    #[serde(rename = "tlsClient", skip_serializing_if = "Option::is_none")]
    pub tls_client: Option<TlsClient>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Observed state of the placement tier. This is the only slice of cluster
/// status the member manager writes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlacementStatus {
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub phase: MemberPhase,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub members: HashMap<String, Member>,
    #[serde(
        rename = "peerMembers",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub peer_members: HashMap<String, Member>,
    #[serde(
        rename = "unjoinedMembers",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub unjoined_members: HashMap<String, UnjoinedMember>,
    #[serde(
        rename = "failureMembers",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub failure_members: HashMap<String, FailureMember>,
    #[serde(rename = "statefulSet", skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<StatefulSetStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    #[serde(rename = "clusterID", default, skip_serializing_if = "String::is_empty")]
    pub cluster_id: String,
    #[serde(default)]
    pub placement: PlacementStatus,
}

/// Aggregate cluster object. The specification is owned externally; the
/// member manager mutates only the placement slice of status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumCluster {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ClusterSpec,
    #[serde(default)]
    pub status: ClusterStatus,
}

impl StratumCluster {
    pub fn new(metadata: ObjectMeta, spec: ClusterSpec) -> Self {
        Self {
            api_version: "stratum.io/v1".to_string(),
            kind: "StratumCluster".to_string(),
            metadata,
            spec,
            status: ClusterStatus::default(),
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("")
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata.namespace.as_deref()
    }

    /// Name of the client-facing service and of the pod group.
    pub fn placement_member_name(&self) -> String {
        format!("{}-{}", self.name(), MemberKind::Placement)
    }

    /// Name of the headless peer-discovery service.
    pub fn placement_peer_name(&self) -> String {
        format!("{}-{}-peer", self.name(), MemberKind::Placement)
    }

    pub fn ordinal_pod_name(&self, ordinal: i32) -> String {
        format!("{}-{}", self.placement_member_name(), ordinal)
    }

    /// Parses the ordinal out of a placement pod name, if the name belongs
    /// to this cluster's pod group.
    pub fn parse_ordinal(&self, pod_name: &str) -> Option<i32> {
        let prefix = format!("{}-", self.placement_member_name());
        pod_name.strip_prefix(&prefix)?.parse().ok()
    }

    pub fn force_upgrade_enabled(&self) -> bool {
        self.metadata
            .annotations
            .get(ANN_FORCE_UPGRADE)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn suspend_requested(&self) -> bool {
        self.metadata
            .annotations
            .get(ANN_SUSPEND)
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn tls_client_enabled(&self) -> bool {
        self.spec
            .tls_client
            .as_ref()
            .map(|tls| tls.enabled)
            .unwrap_or(false)
    }

    /// Image tag of the placement container, used only for capability gates.
    pub fn placement_version(&self) -> &str {
        match self.spec.placement.image.rsplit_once(':') {
            Some((_, tag)) => tag,
            None => "",
        }
    }

    /// Labels selecting every pod of this cluster's placement tier.
    pub fn placement_selector(&self) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(LABEL_NAME.to_string(), CLUSTER_NAME_VALUE.to_string());
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
        labels.insert(LABEL_INSTANCE.to_string(), self.name().to_string());
        labels.insert(
            LABEL_COMPONENT.to_string(),
            MemberKind::Placement.as_str().to_string(),
        );
        labels
    }

    /// Replicas to request from the pod group: the declared count plus one
    /// slot per failure member whose pod/claim pair has not been removed yet.
    pub fn placement_desired_replicas(&self) -> i32 {
        let reserved = self
            .status
            .placement
            .failure_members
            .values()
            .filter(|fm| !fm.member_deleted)
            .count() as i32;
        self.spec.placement.replicas + reserved
    }
}
