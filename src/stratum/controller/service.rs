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

use crate::stratum::api::types::{
    StratumCluster, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT, LABEL_USED_BY,
};
use crate::stratum::controller::error::SyncError;
use crate::stratum::k8s::service::{Service, ServicePort, ServiceSpec, CLUSTER_IP_NONE};
use crate::stratum::k8s::store::ObjectStore;
use crate::stratum::logger::log_info;

use crate::stratum::k8s::pod::ObjectMeta;

const COMPONENT: &str = "placement-service";

/// Client-facing endpoint: type and addressing may be overridden per
/// specification; the default is a plain ClusterIP service on the client
/// port.
pub fn desired_client_service(cluster: &StratumCluster) -> Service {
    let override_spec = cluster.spec.placement.service.clone().unwrap_or_default();

    let mut labels = cluster.placement_selector();
    labels.insert(LABEL_USED_BY.to_string(), "end-user".to_string());

    let port_name = override_spec.port_name.unwrap_or_else(|| "client".to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(cluster.placement_member_name()),
            namespace: cluster.namespace().map(|ns| ns.to_string()),
            labels,
            ..Default::default()
        },
        spec: ServiceSpec {
            selector: cluster.placement_selector(),
            ports: vec![ServicePort {
                name: Some(port_name),
                port: DEFAULT_CLIENT_PORT,
                target_port: Some(DEFAULT_CLIENT_PORT),
                protocol: Some("TCP".to_string()),
            }],
            cluster_ip: override_spec.cluster_ip,
            type_name: override_spec
                .type_name
                .or_else(|| Some("ClusterIP".to_string())),
            load_balancer_ip: override_spec.load_balancer_ip,
            publish_not_ready_addresses: false,
        },
        ..Default::default()
    }
}

/// Headless peer-discovery endpoint: no cluster IP, and not-yet-ready
/// addresses are published so peers can find each other before the group
/// reports healthy.
pub fn desired_peer_service(cluster: &StratumCluster) -> Service {
    let mut labels = cluster.placement_selector();
    labels.insert(LABEL_USED_BY.to_string(), "peer".to_string());

    Service {
        metadata: ObjectMeta {
            name: Some(cluster.placement_peer_name()),
            namespace: cluster.namespace().map(|ns| ns.to_string()),
            labels,
            ..Default::default()
        },
        spec: ServiceSpec {
            selector: cluster.placement_selector(),
            ports: vec![
                ServicePort {
                    name: Some("peer".to_string()),
                    port: DEFAULT_PEER_PORT,
                    target_port: Some(DEFAULT_PEER_PORT),
                    protocol: Some("TCP".to_string()),
                },
                ServicePort {
                    name: Some("client".to_string()),
                    port: DEFAULT_CLIENT_PORT,
                    target_port: Some(DEFAULT_CLIENT_PORT),
                    protocol: Some("TCP".to_string()),
                },
            ],
            cluster_ip: Some(CLUSTER_IP_NONE.to_string()),
            type_name: Some("ClusterIP".to_string()),
            load_balancer_ip: None,
            publish_not_ready_addresses: true,
        },
        ..Default::default()
    }
}

/// Field-level merge: fields under this core's ownership (labels, selector,
/// ports, type, addressing overrides) are rewritten from the desired
/// object; externally assigned fields (an allocated cluster IP) survive
/// unless the specification pins one. Returns None when nothing changed.
pub fn merge_service(existing: &Service, desired: &Service) -> Option<Service> {
    let mut merged = existing.clone();
    merged.metadata.labels = desired.metadata.labels.clone();
    merged.spec.selector = desired.spec.selector.clone();
    merged.spec.ports = desired.spec.ports.clone();
    merged.spec.type_name = desired.spec.type_name.clone();
    merged.spec.load_balancer_ip = desired.spec.load_balancer_ip.clone();
    merged.spec.publish_not_ready_addresses = desired.spec.publish_not_ready_addresses;
    if desired.spec.cluster_ip.is_some() {
        merged.spec.cluster_ip = desired.spec.cluster_ip.clone();
    }

    if &merged == existing {
        None
    } else {
        Some(merged)
    }
}

/// Create-or-merge reconciliation of one endpoint. Store errors propagate
/// verbatim; absence triggers the create path.
pub fn reconcile_service(store: &dyn ObjectStore, desired: &Service) -> Result<(), SyncError> {
    let name = desired.metadata.name.as_deref().unwrap_or("");
    let namespace = desired.metadata.namespace.as_deref();

    match store.get_service(namespace, name) {
        Ok(existing) => {
            if let Some(merged) = merge_service(&existing, desired) {
                store.update_service(&merged)?;
                log_info(COMPONENT, "patched service", &[("service", name)]);
            }
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            store.create_service(desired)?;
            log_info(COMPONENT, "created service", &[("service", name)]);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
