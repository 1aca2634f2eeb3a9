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

//! Pure construction of the desired pod group from the cluster
//! specification. Nothing here reads or writes the object store, which
//! keeps the diff/patch step mechanical and this module testable in
//! isolation.

use crate::stratum::api::types::{
    MemberKind, StratumCluster, ANN_SYSCTL_INIT, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT,
};
use crate::stratum::k8s::persistentvolumeclaim::{PersistentVolumeClaim, PersistentVolumeClaimSpec};
use crate::stratum::k8s::pod::{
    ContainerPort, ContainerProbe, ContainerSecurityContext, ContainerSpec, EnvVar, ObjectMeta,
    PodSecurityContext, PodSpec, ProbeExec, ProbeTcpSocket, ResourceRequirements,
    SecretVolumeSource, VolumeMount, VolumeSpec,
};
use crate::stratum::k8s::statefulset::{
    LabelSelector, PodTemplateSpec, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};

const DATA_MOUNT_PATH: &str = "/var/lib/placement";
const CLIENT_TLS_VOLUME: &str = "client-tls";
const CLIENT_TLS_MOUNT_PATH: &str = "/var/lib/stratum-client-tls";
const INIT_IMAGE: &str = "busybox:1.26.2";
const ACCESS_MODE_RWO: &str = "ReadWriteOnce";
const STORAGE_RESOURCE: &str = "storage";
const READINESS_INITIAL_DELAY_SECONDS: i32 = 10;

/// Builds the desired pod group. `replicas` is supplied by the caller: the
/// declared count plus replacement placeholders, possibly adjusted by the
/// scaler. The rollout partition starts at `replicas` so every ordinal is
/// protected until the upgrade decision lowers it.
pub fn desired_stateful_set(cluster: &StratumCluster, replicas: i32) -> StatefulSet {
    let spec = &cluster.spec.placement;
    let labels = cluster.placement_selector();

    let mut placement = ContainerSpec {
        name: MemberKind::Placement.as_str().to_string(),
        image: Some(spec.image.clone()),
        command: vec![
            "/usr/local/bin/placement-server".to_string(),
            format!("--data-dir={}", DATA_MOUNT_PATH),
        ],
        env: merged_env(cluster),
        ports: vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: DEFAULT_CLIENT_PORT,
                protocol: Some("TCP".to_string()),
            },
            ContainerPort {
                name: Some("peer".to_string()),
                container_port: DEFAULT_PEER_PORT,
                protocol: Some("TCP".to_string()),
            },
        ],
        volume_mounts: vec![VolumeMount {
            name: MemberKind::Placement.as_str().to_string(),
            mount_path: DATA_MOUNT_PATH.to_string(),
            read_only: None,
        }],
        resources: container_resources(spec.resources.as_ref()),
        readiness_probe: Some(readiness_probe(cluster)),
        ..Default::default()
    };

    let mut volumes = Vec::new();
    let mut claims = vec![data_claim(cluster)];

    for storage in &spec.storage_volumes {
        let volume_name = format!("{}-{}", MemberKind::Placement, storage.name);
        placement.volume_mounts.push(VolumeMount {
            name: volume_name.clone(),
            mount_path: storage.mount_path.clone(),
            read_only: None,
        });
        claims.push(storage_claim(cluster, &volume_name, &storage.storage_size));
    }

    if cluster.tls_client_enabled() && version_supports_client_tls(cluster.placement_version()) {
        placement.volume_mounts.push(VolumeMount {
            name: CLIENT_TLS_VOLUME.to_string(),
            mount_path: CLIENT_TLS_MOUNT_PATH.to_string(),
            read_only: Some(true),
        });
        volumes.push(VolumeSpec {
            name: CLIENT_TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: format!("{}-client-tls", cluster.name()),
            }),
            ..Default::default()
        });
    }

    // Additional containers and volumes always append after the generated
    // entries; the main container keeps position zero.
    let mut containers = vec![placement];
    containers.extend(spec.additional_containers.iter().cloned());
    volumes.extend(spec.additional_volumes.iter().cloned());

    let (init_containers, security_context) = init_containers(cluster);

    StatefulSet::new(
        ObjectMeta {
            name: Some(cluster.placement_member_name()),
            namespace: cluster.namespace().map(|ns| ns.to_string()),
            labels: labels.clone(),
            ..Default::default()
        },
        StatefulSetSpec {
            service_name: cluster.placement_peer_name(),
            replicas,
            selector: LabelSelector {
                match_labels: labels.clone(),
            },
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels,
                    annotations: spec.annotations.clone(),
                    ..Default::default()
                },
                spec: PodSpec {
                    init_containers,
                    containers,
                    volumes,
                    host_network: spec.host_network.unwrap_or(false),
                    security_context,
                },
            },
            update_strategy: {
                let mut strategy = StatefulSetUpdateStrategy::default();
                strategy.set_partition(replicas);
                strategy
            },
            volume_claim_templates: claims,
        },
    )
}

/// Generated environment, with specification-provided variables replacing
/// generated ones of the same name in place and new names appended.
fn merged_env(cluster: &StratumCluster) -> Vec<EnvVar> {
    let namespace = cluster.namespace().unwrap_or("default");
    let timezone = cluster.spec.timezone.as_deref().unwrap_or("UTC");
    let mut env = vec![
        EnvVar::literal("NAMESPACE", namespace),
        EnvVar::literal("PEER_SERVICE_NAME", cluster.placement_peer_name()),
        EnvVar::literal("SERVICE_NAME", cluster.placement_member_name()),
        EnvVar::literal("SET_NAME", cluster.placement_member_name()),
        EnvVar::literal("TZ", timezone),
    ];

    for user_var in &cluster.spec.placement.env {
        match env.iter().position(|v| v.name == user_var.name) {
            Some(position) => env[position] = user_var.clone(),
            None => env.push(user_var.clone()),
        }
    }
    env
}

/// Container resources minus the storage request, which sizes the data
/// claim instead of the container.
fn container_resources(resources: Option<&ResourceRequirements>) -> Option<ResourceRequirements> {
    resources.map(|r| {
        let mut stripped = r.clone();
        stripped.requests.remove(STORAGE_RESOURCE);
        stripped.limits.remove(STORAGE_RESOURCE);
        stripped
    })
}

fn data_claim(cluster: &StratumCluster) -> PersistentVolumeClaim {
    let spec = &cluster.spec.placement;
    let storage_request = spec
        .resources
        .as_ref()
        .and_then(|r| r.requests.get(STORAGE_RESOURCE))
        .cloned();

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(MemberKind::Placement.as_str().to_string()),
            ..Default::default()
        },
        spec: PersistentVolumeClaimSpec {
            access_modes: vec![ACCESS_MODE_RWO.to_string()],
            storage_class_name: spec.storage_class_name.clone(),
            resources: storage_request.map(|size| {
                let mut requests = std::collections::HashMap::new();
                requests.insert(STORAGE_RESOURCE.to_string(), size);
                ResourceRequirements {
                    requests,
                    limits: Default::default(),
                }
            }),
        },
    }
}

fn storage_claim(cluster: &StratumCluster, name: &str, size: &str) -> PersistentVolumeClaim {
    let mut requests = std::collections::HashMap::new();
    requests.insert(STORAGE_RESOURCE.to_string(), size.to_string());
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        spec: PersistentVolumeClaimSpec {
            access_modes: vec![ACCESS_MODE_RWO.to_string()],
            storage_class_name: cluster.spec.placement.storage_class_name.clone(),
            resources: Some(ResourceRequirements {
                requests,
                limits: Default::default(),
            }),
        },
    }
}

/// Kernel tuning runs in a privileged init container only when both the
/// opt-in annotation is set and the security context actually lists
/// sysctls; the sysctls then move out of the pod security context. An
/// empty sysctl list never produces an init container.
fn init_containers(cluster: &StratumCluster) -> (Vec<ContainerSpec>, Option<PodSecurityContext>) {
    let spec = &cluster.spec.placement;
    let Some(security_context) = spec.pod_security_context.as_ref() else {
        return (Vec::new(), None);
    };

    let opted_in = spec
        .annotations
        .get(ANN_SYSCTL_INIT)
        .map(|v| v == "true")
        .unwrap_or(false);
    if !opted_in || security_context.sysctls.is_empty() {
        return (Vec::new(), Some(security_context.clone()));
    }

    let assignments: Vec<String> = security_context
        .sysctls
        .iter()
        .map(|sysctl| format!("{}={}", sysctl.name, sysctl.value))
        .collect();
    let command = format!("sysctl -w {}", assignments.join(" "));

    let resources = spec.resources.as_ref().map(|r| {
        let keep = |quantities: &std::collections::HashMap<String, String>| {
            quantities
                .iter()
                .filter(|(key, _)| key.as_str() == "cpu" || key.as_str() == "memory")
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        };
        ResourceRequirements {
            requests: keep(&r.requests),
            limits: keep(&r.limits),
        }
    });

    let init = ContainerSpec {
        name: "init".to_string(),
        image: Some(INIT_IMAGE.to_string()),
        command: vec!["sh".to_string(), "-c".to_string(), command],
        security_context: Some(ContainerSecurityContext {
            privileged: Some(true),
        }),
        resources,
        ..Default::default()
    };

    let mut stripped = security_context.clone();
    stripped.sysctls = Vec::new();
    (vec![init], Some(stripped))
}

fn readiness_probe(cluster: &StratumCluster) -> ContainerProbe {
    if let Some(probe) = cluster.spec.placement.readiness_probe.as_ref() {
        if probe.probe_type.as_deref() == Some("command") && !probe.command.is_empty() {
            return ContainerProbe {
                exec: Some(ProbeExec {
                    command: probe.command.clone(),
                }),
                initial_delay_seconds: Some(READINESS_INITIAL_DELAY_SECONDS),
                ..Default::default()
            };
        }
    }
    ContainerProbe {
        tcp_socket: Some(ProbeTcpSocket {
            port: DEFAULT_CLIENT_PORT,
        }),
        initial_delay_seconds: Some(READINESS_INITIAL_DELAY_SECONDS),
        ..Default::default()
    }
}

/// Client-TLS material can only be mounted on placement versions that know
/// how to read it. Tags below v4 predate the feature; tags that do not
/// parse (nightly, latest, digests) are assumed current.
pub fn version_supports_client_tls(version: &str) -> bool {
    let trimmed = version.trim_start_matches('v');
    let major: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    match major.parse::<u32>() {
        Ok(major) => major >= 4,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::api::types::{
        ClusterSpec, FailureMember, ProbeOverride, StorageVolume, TlsClient,
    };
    use crate::stratum::k8s::pod::Sysctl;
    use std::collections::HashMap;

    fn cluster() -> StratumCluster {
        let mut cluster = StratumCluster::new(
            ObjectMeta {
                name: Some("basin".to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            ClusterSpec::default(),
        );
        cluster.spec.placement.replicas = 3;
        cluster.spec.placement.image = "stratum/placement:v4.2.0".to_string();
        cluster
    }

    fn sysctls() -> Vec<Sysctl> {
        vec![
            Sysctl {
                name: "net.core.somaxconn".to_string(),
                value: "32768".to_string(),
            },
            Sysctl {
                name: "net.ipv4.tcp_keepalive_time".to_string(),
                value: "300".to_string(),
            },
        ]
    }

    #[test]
    fn generated_env_carries_service_dns_names() {
        let tc = cluster();
        let set = desired_stateful_set(&tc, 3);
        let env = &set.spec.template.spec.containers[0].env;
        let get = |name: &str| {
            env.iter()
                .find(|v| v.name == name)
                .and_then(|v| v.value.clone())
        };
        assert_eq!(get("NAMESPACE").as_deref(), Some("ns"));
        assert_eq!(get("PEER_SERVICE_NAME").as_deref(), Some("basin-placement-peer"));
        assert_eq!(get("SERVICE_NAME").as_deref(), Some("basin-placement"));
        assert_eq!(get("SET_NAME").as_deref(), Some("basin-placement"));
        assert_eq!(get("TZ").as_deref(), Some("UTC"));
    }

    #[test]
    fn user_env_overrides_generated_vars_in_place_and_appends_new_ones() {
        let mut tc = cluster();
        tc.spec.placement.env = vec![
            EnvVar::literal("TZ", "America/New_York"),
            EnvVar::literal("EXTRA", "1"),
        ];
        let set = desired_stateful_set(&tc, 3);
        let env = &set.spec.template.spec.containers[0].env;

        let tz_position = env.iter().position(|v| v.name == "TZ").unwrap();
        assert_eq!(env[tz_position].value.as_deref(), Some("America/New_York"));
        // TZ keeps its generated slot; EXTRA lands at the end.
        assert_eq!(tz_position, 4);
        assert_eq!(env.last().unwrap().name, "EXTRA");
    }

    #[test]
    fn storage_request_sizes_the_data_claim_not_the_container() {
        let mut tc = cluster();
        let mut requests = HashMap::new();
        requests.insert("cpu".to_string(), "1".to_string());
        requests.insert("memory".to_string(), "2Gi".to_string());
        requests.insert("storage".to_string(), "100Gi".to_string());
        tc.spec.placement.resources = Some(ResourceRequirements {
            requests,
            limits: Default::default(),
        });
        tc.spec.placement.storage_class_name = Some("fast-ssd".to_string());

        let set = desired_stateful_set(&tc, 3);
        let container = &set.spec.template.spec.containers[0];
        let resources = container.resources.as_ref().unwrap();
        assert!(!resources.requests.contains_key("storage"));
        assert_eq!(resources.requests.get("cpu").map(String::as_str), Some("1"));

        let claim = &set.spec.volume_claim_templates[0];
        assert_eq!(claim.metadata.name.as_deref(), Some("placement"));
        assert_eq!(
            claim.spec.storage_class_name.as_deref(),
            Some("fast-ssd")
        );
        assert_eq!(
            claim
                .spec
                .resources
                .as_ref()
                .unwrap()
                .requests
                .get("storage")
                .map(String::as_str),
            Some("100Gi")
        );
    }

    #[test]
    fn storage_volumes_produce_claims_and_mounts() {
        let mut tc = cluster();
        tc.spec.placement.storage_volumes = vec![StorageVolume {
            name: "log".to_string(),
            storage_size: "2Gi".to_string(),
            mount_path: "/var/log".to_string(),
        }];

        let set = desired_stateful_set(&tc, 3);
        assert_eq!(set.spec.volume_claim_templates.len(), 2);
        let claim = &set.spec.volume_claim_templates[1];
        assert_eq!(claim.metadata.name.as_deref(), Some("placement-log"));
        assert_eq!(
            claim
                .spec
                .resources
                .as_ref()
                .unwrap()
                .requests
                .get("storage")
                .map(String::as_str),
            Some("2Gi")
        );

        let mounts = &set.spec.template.spec.containers[0].volume_mounts;
        let last = mounts.last().unwrap();
        assert_eq!(last.name, "placement-log");
        assert_eq!(last.mount_path, "/var/log");
    }

    #[test]
    fn additional_containers_and_volumes_append_after_generated_ones() {
        let mut tc = cluster();
        tc.spec.placement.additional_containers = vec![ContainerSpec {
            name: "sidecar".to_string(),
            image: Some("sidecar:1".to_string()),
            ..Default::default()
        }];
        tc.spec.placement.additional_volumes = vec![VolumeSpec {
            name: "scratch".to_string(),
            empty_dir: Some(Default::default()),
            ..Default::default()
        }];

        let set = desired_stateful_set(&tc, 3);
        let containers = &set.spec.template.spec.containers;
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "placement");
        assert_eq!(containers[1].name, "sidecar");
        assert_eq!(
            set.spec.template.spec.volumes.last().unwrap().name,
            "scratch"
        );
    }

    #[test]
    fn sysctls_stay_in_the_security_context_without_the_annotation() {
        let mut tc = cluster();
        tc.spec.placement.pod_security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            sysctls: sysctls(),
        });

        let set = desired_stateful_set(&tc, 3);
        assert!(set.spec.template.spec.init_containers.is_empty());
        let sc = set.spec.template.spec.security_context.as_ref().unwrap();
        assert_eq!(sc.sysctls.len(), 2);
    }

    #[test]
    fn annotation_plus_sysctls_produce_the_init_container() {
        let mut tc = cluster();
        tc.spec
            .placement
            .annotations
            .insert(ANN_SYSCTL_INIT.to_string(), "true".to_string());
        tc.spec.placement.pod_security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            sysctls: sysctls(),
        });

        let set = desired_stateful_set(&tc, 3);
        let inits = &set.spec.template.spec.init_containers;
        assert_eq!(inits.len(), 1);
        assert_eq!(inits[0].name, "init");
        assert_eq!(inits[0].image.as_deref(), Some(INIT_IMAGE));
        assert_eq!(
            inits[0].command,
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "sysctl -w net.core.somaxconn=32768 net.ipv4.tcp_keepalive_time=300".to_string()
            ]
        );
        assert_eq!(inits[0].security_context.as_ref().unwrap().privileged, Some(true));

        let sc = set.spec.template.spec.security_context.as_ref().unwrap();
        assert!(sc.sysctls.is_empty(), "sysctls move into the init container");
        assert_eq!(sc.run_as_non_root, Some(true));
    }

    #[test]
    fn annotation_without_sysctls_produces_no_init_container() {
        let mut tc = cluster();
        tc.spec
            .placement
            .annotations
            .insert(ANN_SYSCTL_INIT.to_string(), "true".to_string());
        tc.spec.placement.pod_security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            sysctls: Vec::new(),
        });

        let set = desired_stateful_set(&tc, 3);
        assert!(set.spec.template.spec.init_containers.is_empty());
        assert!(set.spec.template.spec.security_context.is_some());
    }

    #[test]
    fn init_container_inherits_cpu_and_memory_only() {
        let mut tc = cluster();
        tc.spec
            .placement
            .annotations
            .insert(ANN_SYSCTL_INIT.to_string(), "true".to_string());
        tc.spec.placement.pod_security_context = Some(PodSecurityContext {
            run_as_non_root: Some(true),
            sysctls: sysctls(),
        });
        let mut requests = HashMap::new();
        requests.insert("cpu".to_string(), "150m".to_string());
        requests.insert("memory".to_string(), "200Mi".to_string());
        requests.insert("storage".to_string(), "20G".to_string());
        tc.spec.placement.resources = Some(ResourceRequirements {
            requests,
            limits: Default::default(),
        });

        let set = desired_stateful_set(&tc, 3);
        let init = &set.spec.template.spec.init_containers[0];
        let resources = init.resources.as_ref().unwrap();
        assert_eq!(resources.requests.len(), 2);
        assert!(!resources.requests.contains_key("storage"));
    }

    #[test]
    fn tls_mount_requires_both_the_flag_and_a_capable_version() {
        let mut tc = cluster();
        tc.spec.tls_client = Some(TlsClient { enabled: true });

        tc.spec.placement.image = "stratum/placement:v3.1.0".to_string();
        let set = desired_stateful_set(&tc, 3);
        assert!(!has_tls_volume(&set));

        tc.spec.placement.image = "stratum/placement:v4.0.0-rc.1".to_string();
        let set = desired_stateful_set(&tc, 3);
        assert!(has_tls_volume(&set));

        tc.spec.placement.image = "stratum/placement:nightly".to_string();
        let set = desired_stateful_set(&tc, 3);
        assert!(has_tls_volume(&set));

        tc.spec.tls_client = Some(TlsClient { enabled: false });
        let set = desired_stateful_set(&tc, 3);
        assert!(!has_tls_volume(&set));
    }

    fn has_tls_volume(set: &StatefulSet) -> bool {
        let volume = set
            .spec
            .template
            .spec
            .volumes
            .iter()
            .any(|v| v.name == CLIENT_TLS_VOLUME);
        let mount = set.spec.template.spec.containers[0]
            .volume_mounts
            .iter()
            .any(|m| m.name == CLIENT_TLS_VOLUME);
        assert_eq!(volume, mount, "volume and mount are gated together");
        volume
    }

    #[test]
    fn readiness_probe_defaults_to_tcp_and_honors_command_override() {
        let tc = cluster();
        let set = desired_stateful_set(&tc, 3);
        let probe = set.spec.template.spec.containers[0]
            .readiness_probe
            .as_ref()
            .unwrap();
        assert_eq!(
            probe.tcp_socket.as_ref().map(|t| t.port),
            Some(DEFAULT_CLIENT_PORT)
        );
        assert_eq!(probe.initial_delay_seconds, Some(10));

        let mut tc = cluster();
        tc.spec.placement.readiness_probe = Some(ProbeOverride {
            probe_type: Some("command".to_string()),
            command: vec!["/bin/ready".to_string()],
        });
        let set = desired_stateful_set(&tc, 3);
        let probe = set.spec.template.spec.containers[0]
            .readiness_probe
            .as_ref()
            .unwrap();
        assert!(probe.tcp_socket.is_none());
        assert_eq!(
            probe.exec.as_ref().map(|e| e.command.clone()),
            Some(vec!["/bin/ready".to_string()])
        );
    }

    #[test]
    fn replicas_reserve_slots_for_undeleted_failure_members() {
        let mut tc = cluster();
        tc.status.placement.failure_members.insert(
            "basin-placement-1".to_string(),
            FailureMember {
                pod_name: "basin-placement-1".to_string(),
                created_at: chrono::Utc::now(),
                member_deleted: false,
            },
        );
        let set = desired_stateful_set(&tc, tc.placement_desired_replicas());
        assert_eq!(set.spec.replicas, 4);

        tc.status
            .placement
            .failure_members
            .get_mut("basin-placement-1")
            .unwrap()
            .member_deleted = true;
        let set = desired_stateful_set(&tc, tc.placement_desired_replicas());
        assert_eq!(set.spec.replicas, 3);
    }

    #[test]
    fn new_groups_start_fully_partition_protected() {
        let tc = cluster();
        let set = desired_stateful_set(&tc, 3);
        assert_eq!(set.partition(), 3);
        assert_eq!(set.spec.service_name, "basin-placement-peer");
    }

    #[test]
    fn version_gate_parses_major_versions_and_trusts_unparseable_tags() {
        assert!(!version_supports_client_tls("v3.1.0"));
        assert!(version_supports_client_tls("v4.0.0-rc.1"));
        assert!(version_supports_client_tls("v10.0.0"));
        assert!(version_supports_client_tls("nightly"));
        assert!(version_supports_client_tls("latest"));
        assert!(version_supports_client_tls(""));
    }
}
