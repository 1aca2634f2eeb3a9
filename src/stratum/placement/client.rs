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

use crate::stratum::api::types::{StratumCluster, DEFAULT_CLIENT_PORT};
use crate::stratum::k8s::store::normalize_namespace;

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// One member's health as reported by the placement tier itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberHealth {
    pub name: String,
    #[serde(rename = "memberID", default)]
    pub member_id: u64,
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
    pub health: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthInfo {
    #[serde(default)]
    pub healths: Vec<MemberHealth>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub id: u64,
}

/// Failures talking to the placement tier. All of them degrade status
/// freshness for the cycle; none abort reconciliation.
#[derive(Debug)]
pub enum PlacementError {
    Request(reqwest::Error),
    Status { endpoint: &'static str, code: u16 },
    Decode(serde_json::Error),
    Internal(String),
}

impl fmt::Display for PlacementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlacementError::Request(err) => write!(f, "placement request failed: {}", err),
            PlacementError::Status { endpoint, code } => {
                write!(f, "placement {} returned HTTP {}", endpoint, code)
            }
            PlacementError::Decode(err) => write!(f, "placement response undecodable: {}", err),
            PlacementError::Internal(message) => write!(f, "{}", message),
        }
    }
}

impl Error for PlacementError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            PlacementError::Request(err) => Some(err),
            PlacementError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

/// Health and cluster-identity API of one cluster's placement tier.
pub trait PlacementClient: Send + Sync {
    fn get_health(&self) -> Result<HealthInfo, PlacementError>;
    fn get_cluster_info(&self) -> Result<ClusterInfo, PlacementError>;
}

/// Hands out a client scoped to a specific cluster.
pub trait PlacementControl: Send + Sync {
    fn placement_client(&self, cluster: &StratumCluster) -> Arc<dyn PlacementClient>;
}

pub struct HttpPlacementClient {
    base_url: String,
    http: reqwest::blocking::Client,
}

impl HttpPlacementClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &'static str,
    ) -> Result<T, PlacementError> {
        let url = format!("{}/placement/api/v1/{}", self.base_url, endpoint);
        let response = self.http.get(&url).send().map_err(PlacementError::Request)?;
        if !response.status().is_success() {
            return Err(PlacementError::Status {
                endpoint,
                code: response.status().as_u16(),
            });
        }
        let body = response.text().map_err(PlacementError::Request)?;
        serde_json::from_str(&body).map_err(PlacementError::Decode)
    }
}

impl PlacementClient for HttpPlacementClient {
    fn get_health(&self) -> Result<HealthInfo, PlacementError> {
        self.get_json("health")
    }

    fn get_cluster_info(&self) -> Result<ClusterInfo, PlacementError> {
        self.get_json("cluster")
    }
}

/// Production control: addresses the tier through its client service DNS name.
#[derive(Default)]
pub struct HttpPlacementControl;

impl HttpPlacementControl {
    pub fn new() -> Self {
        Self
    }
}

impl PlacementControl for HttpPlacementControl {
    fn placement_client(&self, cluster: &StratumCluster) -> Arc<dyn PlacementClient> {
        let url = format!(
            "http://{}.{}:{}",
            cluster.placement_member_name(),
            normalize_namespace(cluster.namespace()),
            DEFAULT_CLIENT_PORT
        );
        Arc::new(HttpPlacementClient::new(url))
    }
}

type FakeReaction<T> = Result<T, String>;

/// Deterministic fake. Reactions are installed per endpoint; unset
/// endpoints answer with empty defaults.
#[derive(Default)]
pub struct FakePlacementClient {
    health: Mutex<Option<FakeReaction<HealthInfo>>>,
    cluster: Mutex<Option<FakeReaction<ClusterInfo>>>,
}

impl FakePlacementClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_health(&self, healths: Vec<MemberHealth>) {
        *self.health.lock().unwrap() = Some(Ok(HealthInfo { healths }));
    }

    pub fn fail_health(&self, message: &str) {
        *self.health.lock().unwrap() = Some(Err(message.to_string()));
    }

    pub fn set_cluster_id(&self, id: u64) {
        *self.cluster.lock().unwrap() = Some(Ok(ClusterInfo { id }));
    }

    pub fn fail_cluster_info(&self, message: &str) {
        *self.cluster.lock().unwrap() = Some(Err(message.to_string()));
    }
}

impl PlacementClient for FakePlacementClient {
    fn get_health(&self) -> Result<HealthInfo, PlacementError> {
        match self.health.lock().unwrap().clone() {
            Some(Ok(info)) => Ok(info),
            Some(Err(message)) => Err(PlacementError::Internal(message)),
            None => Ok(HealthInfo::default()),
        }
    }

    fn get_cluster_info(&self) -> Result<ClusterInfo, PlacementError> {
        match self.cluster.lock().unwrap().clone() {
            Some(Ok(info)) => Ok(info),
            Some(Err(message)) => Err(PlacementError::Internal(message)),
            None => Ok(ClusterInfo::default()),
        }
    }
}

/// Control wrapper returning the same fake for every cluster.
pub struct FakePlacementControl {
    client: Arc<FakePlacementClient>,
}

impl FakePlacementControl {
    pub fn new(client: Arc<FakePlacementClient>) -> Self {
        Self { client }
    }
}

impl PlacementControl for FakePlacementControl {
    fn placement_client(&self, _cluster: &StratumCluster) -> Arc<dyn PlacementClient> {
        self.client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_defaults_answer_empty() {
        let fake = FakePlacementClient::new();
        assert!(fake.get_health().expect("health").healths.is_empty());
        assert_eq!(fake.get_cluster_info().expect("cluster").id, 0);
    }

    #[test]
    fn fake_reactions_replay_until_replaced() {
        let fake = FakePlacementClient::new();
        fake.set_health(vec![MemberHealth {
            name: "basin-placement-0".to_string(),
            member_id: 7,
            client_urls: vec!["http://basin-placement-0:2379".to_string()],
            health: true,
        }]);
        assert_eq!(fake.get_health().expect("health").healths.len(), 1);
        assert_eq!(fake.get_health().expect("health").healths.len(), 1);

        fake.fail_health("unreachable");
        let err = fake.get_health().unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn health_payload_decodes_camel_case() {
        let raw = r#"{"healths":[{"name":"a","memberID":12,"clientURLs":["http://a:2379"],"health":false}]}"#;
        let info: HealthInfo = serde_json::from_str(raw).expect("decode");
        assert_eq!(info.healths[0].member_id, 12);
        assert!(!info.healths[0].health);
    }
}
