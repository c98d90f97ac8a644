/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Palisade configuration.

use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Config is the configuration of a proxy.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct Config {
    pub version: Version,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,

    #[serde(default)]
    pub routes: Vec<RouteEntryConfig>,
}

impl Config {
    /// Attempts to locate and parse a `Config` located at either `path`,
    /// the `$PALISADE_CONFIG` environment variable if set, or the
    /// `palisade.yaml` file in the current directory. Returns an error if
    /// the found configuration is invalid, or if no configuration could be
    /// found at any location.
    pub fn find(path: Option<&str>) -> crate::Result<Self> {
        const ENV_CONFIG_PATH: &str = "PALISADE_CONFIG";
        const CONFIG_FILE: &str = "palisade.yaml";

        let config_env = std::env::var(ENV_CONFIG_PATH).ok();

        let config_path = std::path::Path::new(
            path.or(config_env.as_deref()).unwrap_or(CONFIG_FILE),
        )
        .canonicalize()?;

        tracing::info!(path = %config_path.display(), "found configuration file");

        let file = std::fs::File::open(&config_path)?;
        let config = Self::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// Attempts to deserialize `input` as a YAML object representing `Self`.
    pub fn from_reader<R: std::io::Read>(input: R) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_reader(input)
    }

    /// Checks cross-cutting constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut names = HashSet::new();
        for cluster in &self.clusters {
            if cluster.name.is_empty() {
                return Err(ValidationError::EmptyClusterName);
            }

            if !names.insert(cluster.name.as_str()) {
                return Err(ValidationError::DuplicateCluster(cluster.name.clone()));
            }
        }

        for route in &self.routes {
            if !names.contains(route.route.cluster.as_str()) {
                return Err(ValidationError::UnknownRouteCluster(
                    route.route.cluster.clone(),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("cluster declared with an empty name")]
    EmptyClusterName,
    #[error("cluster {0} declared more than once")]
    DuplicateCluster(String),
    #[error("route references unknown cluster {0}")]
    UnknownRouteCluster(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum Version {
    #[serde(rename = "v1alpha1")]
    V1Alpha1,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_id")]
    pub id: String,
    #[serde(default = "default_proxy_address")]
    pub address: SocketAddr,
}

fn default_proxy_id() -> String {
    "palisade".into()
}

fn default_proxy_address() -> SocketAddr {
    (std::net::Ipv6Addr::UNSPECIFIED, 7720).into()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            id: default_proxy_id(),
            address: default_proxy_address(),
        }
    }
}

/// Static definition of one upstream cluster.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub name: String,

    #[serde(default)]
    pub lb_policy: LbPolicy,

    /// Upstream TCP connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_conn_buffer_limit_bytes")]
    pub conn_buffer_limit_bytes: usize,

    /// How many requests a pooled connection may serve before it is
    /// discarded. Zero means unlimited.
    #[serde(default = "default_max_requests_per_connection")]
    pub max_requests_per_connection: u32,

    #[serde(default)]
    pub circuit_breakers: ResourceLimitsConfig,

    #[serde(default)]
    pub lb_subset: Option<LbSubsetConfig>,

    #[serde(default)]
    pub health_check_protocol: Option<String>,

    /// Opaque TLS handle forwarded to the transport layer; the proxy core
    /// never interprets it.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub hosts: Vec<HostConfig>,
}

impl ClusterConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lb_policy: LbPolicy::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            conn_buffer_limit_bytes: default_conn_buffer_limit_bytes(),
            max_requests_per_connection: default_max_requests_per_connection(),
            circuit_breakers: ResourceLimitsConfig::default(),
            lb_subset: None,
            health_check_protocol: None,
            tls: None,
            hosts: Vec::new(),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_conn_buffer_limit_bytes() -> usize {
    16 * 1024
}

fn default_max_requests_per_connection() -> u32 {
    1_024
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    #[default]
    Random,
    RoundRobin,
}

/// Per-cluster resource ceilings enforced by the resource manager.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimitsConfig {
    #[serde(default = "default_resource_max")]
    pub max_connections: u64,
    #[serde(default = "default_resource_max")]
    pub max_pending_requests: u64,
    #[serde(default = "default_resource_max")]
    pub max_requests: u64,
}

fn default_resource_max() -> u64 {
    1_024
}

impl Default for ResourceLimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_resource_max(),
            max_pending_requests: default_resource_max(),
            max_requests: default_resource_max(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LbSubsetConfig {
    #[serde(default)]
    pub fallback_policy: SubsetFallbackPolicy,
    #[serde(default)]
    pub default_subset: BTreeMap<String, String>,
    /// Each entry is one selector key-group; order and duplicates within a
    /// group are normalised away at build time.
    #[serde(default)]
    pub subset_keys: Vec<Vec<String>>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubsetFallbackPolicy {
    #[default]
    NoFallback,
    AnyEndpoint,
    DefaultSubset,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    #[serde(default)]
    pub server_name: Option<String>,
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub address: SocketAddr,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_host_weight")]
    pub weight: u32,
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub locality: Option<String>,
}

impl HostConfig {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            hostname: None,
            weight: default_host_weight(),
            canary: false,
            metadata: BTreeMap::new(),
            locality: None,
        }
    }
}

fn default_host_weight() -> u32 {
    1
}

/// One rule of the route table. Rules are scanned in declared order and
/// the first whose header matches all hold wins.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RouteEntryConfig {
    #[serde(rename = "match")]
    pub matcher: RouteMatchConfig,
    pub route: RouteActionConfig,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RouteMatchConfig {
    #[serde(default)]
    pub headers: Vec<HeaderMatchConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HeaderMatchConfig {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RouteActionConfig {
    pub cluster: String,
    #[serde(default)]
    pub metadata_match: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialise_from_yaml() {
        let yaml = "
version: v1alpha1
proxy:
  id: edge-1
  address: 127.0.0.1:7720
clusters:
  - name: svc-a
    connect_timeout_ms: 250
    circuit_breakers:
      max_connections: 4
    hosts:
      - address: 127.0.0.1:9001
        weight: 2
        metadata:
          stage: prod
routes:
  - match:
      headers:
        - name: service
          value: svc-a
    route:
      cluster: svc-a
";
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.proxy.id, "edge-1");
        let cluster = &config.clusters[0];
        assert_eq!(cluster.name, "svc-a");
        assert_eq!(cluster.connect_timeout(), Duration::from_millis(250));
        assert_eq!(cluster.circuit_breakers.max_connections, 4);
        // Unset limits keep their defaults.
        assert_eq!(cluster.circuit_breakers.max_requests, 1_024);
        assert_eq!(cluster.hosts[0].weight, 2);
        assert_eq!(cluster.hosts[0].metadata["stage"], "prod");
        assert_eq!(config.routes[0].route.cluster, "svc-a");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = "
version: v1alpha1
proxy:
  listen_port: 7720
";
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn route_must_reference_known_cluster() {
        let yaml = "
version: v1alpha1
routes:
  - match:
      headers:
        - name: service
          value: svc-a
    route:
      cluster: svc-a
";
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::UnknownRouteCluster(name)) if name == "svc-a"
        ));
    }

    #[test]
    fn duplicate_clusters_are_rejected() {
        let mut config = Config {
            version: Version::V1Alpha1,
            proxy: ProxyConfig::default(),
            clusters: vec![ClusterConfig::new("svc-a"), ClusterConfig::new("svc-a")],
            routes: vec![],
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateCluster(_))
        ));
        config.clusters.pop();
        assert!(config.validate().is_ok());
    }
}
