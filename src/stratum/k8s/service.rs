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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::pod::ObjectMeta;

/// Sentinel cluster IP marking a headless service.
pub const CLUSTER_IP_NONE: &str = "None";

/// Describes a single Service port mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServicePort {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub port: u16,
    #[serde(rename = "targetPort", skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub selector: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePort>,
    #[serde(rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(rename = "loadBalancerIP", skip_serializing_if = "Option::is_none")]
    pub load_balancer_ip: Option<String>,
    #[serde(
        rename = "publishNotReadyAddresses",
        default,
        skip_serializing_if = "is_false"
    )]
    pub publish_not_ready_addresses: bool,
}

const fn is_false(value: &bool) -> bool {
    !*value
}

impl Default for ServiceSpec {
    fn default() -> Self {
        ServiceSpec {
            selector: HashMap::new(),
            ports: Vec::new(),
            cluster_ip: None,
            type_name: Some("ClusterIP".to_string()),
            load_balancer_ip: None,
            publish_not_ready_addresses: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ServiceSpec,
}

impl Default for Service {
    fn default() -> Self {
        Service {
            api_version: "v1".to_string(),
            kind: "Service".to_string(),
            metadata: ObjectMeta::default(),
            spec: ServiceSpec::default(),
        }
    }
}
