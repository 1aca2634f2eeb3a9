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

use super::persistentvolumeclaim::PersistentVolumeClaim;
use super::pod::{ObjectMeta, PodSpec};

/// Pod label carrying the template revision a pod was created from. Written
/// by the platform's StatefulSet controller; treated as an opaque token here.
pub const LABEL_REVISION_HASH: &str = "stratum.io/revision-hash";

/// Minimal label selector supporting exact-match labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(
        rename = "matchLabels",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub match_labels: HashMap<String, String>,
}

/// Template describing the pods managed by the StatefulSet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodTemplateSpec {
    pub metadata: ObjectMeta,
    pub spec: PodSpec,
}

/// StatefulSet update behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatefulSetUpdateStrategy {
    #[serde(rename = "type", default)]
    pub r#type: StatefulSetUpdateStrategyType,
    #[serde(rename = "rollingUpdate", skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<StatefulSetRollingUpdate>,
}

impl Default for StatefulSetUpdateStrategy {
    fn default() -> Self {
        Self {
            r#type: StatefulSetUpdateStrategyType::RollingUpdate,
            rolling_update: Some(StatefulSetRollingUpdate::default()),
        }
    }
}

impl StatefulSetUpdateStrategy {
    pub fn partition(&self) -> i32 {
        self.rolling_update
            .as_ref()
            .and_then(|config| config.partition)
            .unwrap_or(0)
    }

    pub fn set_partition(&mut self, partition: i32) {
        match self.rolling_update.as_mut() {
            Some(rolling) => rolling.partition = Some(partition),
            None => {
                self.rolling_update = Some(StatefulSetRollingUpdate {
                    partition: Some(partition),
                })
            }
        }
    }
}

/// Supported update strategy types.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatefulSetUpdateStrategyType {
    #[serde(rename = "RollingUpdate")]
    #[default]
    RollingUpdate,
    #[serde(rename = "OnDelete")]
    OnDelete,
}

/// Rolling update configuration for StatefulSets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatefulSetRollingUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partition: Option<i32>,
}

/// Desired StatefulSet specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatefulSetSpec {
    #[serde(rename = "serviceName")]
    pub service_name: String,
    pub replicas: i32,
    pub selector: LabelSelector,
    pub template: PodTemplateSpec,
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: StatefulSetUpdateStrategy,
    #[serde(
        rename = "volumeClaimTemplates",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_claim_templates: Vec<PersistentVolumeClaim>,
}

/// Runtime status of a StatefulSet as reported by the platform. Revisions
/// are opaque, equality-comparable tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatefulSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(
        rename = "currentRevision",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub current_revision: String,
    #[serde(
        rename = "updateRevision",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub update_revision: String,
    #[serde(
        rename = "observedGeneration",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,
}

/// StatefulSet object description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatefulSet {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: StatefulSetSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatefulSetStatus>,
}

impl StatefulSet {
    pub fn new(metadata: ObjectMeta, spec: StatefulSetSpec) -> Self {
        Self {
            api_version: "apps/v1".to_string(),
            kind: "StatefulSet".to_string(),
            metadata,
            spec,
            status: None,
        }
    }

    pub fn partition(&self) -> i32 {
        self.spec.update_strategy.partition()
    }
}
