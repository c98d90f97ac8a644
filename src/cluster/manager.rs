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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::cluster::load_balancer::{new_load_balancer, LoadBalancer, LoadBalancerContext};
use crate::cluster::pool::{ConnectionPool, Protocol};
use crate::cluster::subset::LbSubsetInfo;
use crate::cluster::{Host, HostSetViews, PrioritySet, ResourceManager};
use crate::config::{ClusterConfig, Config, HostConfig, LbPolicy, TlsConfig};
use crate::net::{ClientConnection, ConnectionFactory};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("no cluster named {0}")]
    NoCluster(String),
}

/// Immutable description of one cluster generation.
pub struct ClusterInfo {
    name: String,
    lb_policy: LbPolicy,
    connect_timeout: Duration,
    conn_buffer_limit_bytes: usize,
    max_requests_per_connection: u32,
    resource_manager: ResourceManager,
    subset: Arc<LbSubsetInfo>,
    health_check_protocol: Option<String>,
    tls: Option<Arc<TlsConfig>>,
}

impl ClusterInfo {
    fn new(config: &ClusterConfig) -> Arc<Self> {
        Arc::new(Self {
            name: config.name.clone(),
            lb_policy: config.lb_policy,
            connect_timeout: config.connect_timeout(),
            conn_buffer_limit_bytes: config.conn_buffer_limit_bytes,
            max_requests_per_connection: config.max_requests_per_connection,
            resource_manager: ResourceManager::new(&config.circuit_breakers),
            subset: Arc::new(LbSubsetInfo::new(config.lb_subset.as_ref())),
            health_check_protocol: config.health_check_protocol.clone(),
            tls: config.tls.clone().map(Arc::new),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lb_policy(&self) -> LbPolicy {
        self.lb_policy
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn conn_buffer_limit_bytes(&self) -> usize {
        self.conn_buffer_limit_bytes
    }

    pub fn max_requests_per_connection(&self) -> u32 {
        self.max_requests_per_connection
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn lb_subset_info(&self) -> &Arc<LbSubsetInfo> {
        &self.subset
    }

    pub fn health_check_protocol(&self) -> Option<&str> {
        self.health_check_protocol.as_deref()
    }

    /// Opaque TLS handle; the core only passes it through.
    pub fn tls(&self) -> Option<&Arc<TlsConfig>> {
        self.tls.as_ref()
    }
}

/// One generation of a cluster. Updating a cluster's config installs a
/// whole new generation; membership updates mutate the priority set in
/// place so existing snapshot holders observe them.
struct Cluster {
    config: ClusterConfig,
    info: Arc<ClusterInfo>,
    priority_set: Arc<PrioritySet>,
    load_balancer: Arc<dyn LoadBalancer>,
    initialized: AtomicBool,
}

impl Cluster {
    fn new(config: ClusterConfig) -> Arc<Self> {
        let info = ClusterInfo::new(&config);
        let priority_set = Arc::new(PrioritySet::new());
        let load_balancer =
            new_load_balancer(config.lb_policy, Arc::clone(&info.subset), None);

        let hosts: Vec<Arc<Host>> = config
            .hosts
            .iter()
            .map(|host_config| Arc::new(Host::new(&config.name, host_config)))
            .collect();
        let initialized = !hosts.is_empty();
        if initialized {
            super::active_hosts().add(hosts.len() as i64);
            priority_set.update_hosts(0, HostSetViews::partition(hosts.clone()), &hosts, &[]);
        }

        Arc::new(Self {
            config,
            info,
            priority_set,
            load_balancer,
            initialized: AtomicBool::new(initialized),
        })
    }

    fn host_count(&self) -> usize {
        self.priority_set
            .host_sets_by_priority()
            .iter()
            .map(|set| set.hosts().len())
            .sum()
    }
}

/// A consistent, short-lived view of one cluster generation. All three
/// parts originate from the same generation; holders must not retain a
/// snapshot across blocking calls.
#[derive(Clone)]
pub struct ClusterSnapshot {
    priority_set: Arc<PrioritySet>,
    info: Arc<ClusterInfo>,
    load_balancer: Arc<dyn LoadBalancer>,
}

impl ClusterSnapshot {
    pub fn priority_set(&self) -> &PrioritySet {
        &self.priority_set
    }

    pub fn cluster_info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.load_balancer
    }
}

/// A freshly created upstream connection and the host it targets. The
/// connection has not been `connect`ed; that is the caller's call.
pub struct CreateConnectionData {
    pub connection: Box<dyn ClientConnection>,
    pub host: Arc<Host>,
}

#[derive(Clone, Eq, Hash, PartialEq)]
struct PoolKey {
    cluster: String,
    protocol: Protocol,
    address: SocketAddr,
}

/// Registry of the upstream clusters and their shared connection pools.
pub struct ClusterManager {
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    pools: DashMap<PoolKey, Arc<ConnectionPool>>,
    factory: Arc<dyn ConnectionFactory>,
    initialized_cb: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    shut_down: AtomicBool,
}

impl ClusterManager {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Arc::new(Self {
            clusters: RwLock::new(HashMap::new()),
            pools: DashMap::new(),
            factory,
            initialized_cb: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Builds a manager pre-populated with the config's static clusters.
    pub fn from_config(config: &Config, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        let manager = Self::new(factory);
        for cluster in &config.clusters {
            manager.add_or_update_primary_cluster(cluster.clone());
        }
        manager
    }

    /// Installs or replaces a cluster. Returns whether the cluster was
    /// created or its config changed; an identical config is a no-op.
    /// Replacement is atomic: readers keep the old generation until the
    /// new one is installed, and live host membership carries over when
    /// the new config does not declare hosts itself.
    pub fn add_or_update_primary_cluster(&self, config: ClusterConfig) -> bool {
        let name = config.name.clone();
        let changed = {
            let mut clusters = self.clusters.write();
            let previous = clusters.get(&name);

            if previous.is_some_and(|existing| existing.config == config) {
                return false;
            }

            let carry_hosts = config.hosts.is_empty();
            let cluster = Cluster::new(config);

            match previous {
                Some(existing) if carry_hosts => {
                    for host_set in existing.priority_set.host_sets_by_priority() {
                        let hosts = host_set.hosts();
                        if hosts.is_empty() {
                            continue;
                        }
                        cluster.priority_set.update_hosts(
                            host_set.priority(),
                            HostSetViews::partition(hosts.clone()),
                            &hosts,
                            &[],
                        );
                    }
                    cluster
                        .initialized
                        .store(existing.initialized.load(Ordering::Acquire), Ordering::Release);
                }
                Some(existing) => {
                    super::active_hosts().sub(existing.host_count() as i64);
                }
                None => super::active_clusters().inc(),
            }

            tracing::debug!(cluster = %name, "installed cluster generation");
            clusters.insert(name, cluster);
            true
        };

        self.maybe_fire_initialized();
        changed
    }

    /// Removes a cluster. Future `get` calls miss; snapshots already
    /// handed out stay valid for their holders.
    pub fn remove_primary_cluster(&self, name: &str) -> bool {
        let removed = self.clusters.write().remove(name);
        let Some(cluster) = removed else {
            return false;
        };

        super::active_clusters().dec();
        super::active_hosts().sub(cluster.host_count() as i64);

        self.pools.retain(|key, pool| {
            if key.cluster == name {
                pool.close_all();
                false
            } else {
                true
            }
        });

        tracing::debug!(cluster = name, "removed cluster");
        true
    }

    pub fn cluster_exists(&self, name: &str) -> bool {
        self.clusters.read().contains_key(name)
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.read().keys().cloned().collect()
    }

    /// A consistent snapshot of the named cluster, or `None` when it is
    /// unknown.
    pub fn get(
        &self,
        name: &str,
        _ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<ClusterSnapshot> {
        let clusters = self.clusters.read();
        let cluster = clusters.get(name)?;

        Some(ClusterSnapshot {
            priority_set: Arc::clone(&cluster.priority_set),
            info: Arc::clone(&cluster.info),
            load_balancer: Arc::clone(&cluster.load_balancer),
        })
    }

    /// Replaces the membership of one priority level. Hosts already
    /// present keep their identity (and health flags); new addresses are
    /// added, missing ones removed.
    pub fn update_cluster_hosts(
        &self,
        name: &str,
        priority: u32,
        host_configs: &[HostConfig],
    ) -> Result<(), ClusterError> {
        let cluster = self
            .clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NoCluster(name.into()))?;

        let existing = cluster.priority_set.get_or_create_host_set(priority).hosts();

        let mut hosts = Vec::with_capacity(host_configs.len());
        let mut added = Vec::new();
        for host_config in host_configs {
            match existing
                .iter()
                .find(|host| host.address() == host_config.address)
            {
                Some(host) => hosts.push(Arc::clone(host)),
                None => {
                    let host = Arc::new(Host::new(name, host_config));
                    added.push(Arc::clone(&host));
                    hosts.push(host);
                }
            }
        }

        let removed: Vec<Arc<Host>> = existing
            .iter()
            .filter(|host| {
                !host_configs
                    .iter()
                    .any(|config| config.address == host.address())
            })
            .cloned()
            .collect();

        super::active_hosts().add(added.len() as i64 - removed.len() as i64);
        cluster
            .priority_set
            .update_hosts(priority, HostSetViews::partition(hosts), &added, &removed);

        cluster.initialized.store(true, Ordering::Release);
        self.maybe_fire_initialized();
        Ok(())
    }

    /// Removes `address` from every priority level that contains it.
    pub fn remove_cluster_hosts(
        &self,
        name: &str,
        address: SocketAddr,
    ) -> Result<(), ClusterError> {
        let cluster = self
            .clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NoCluster(name.into()))?;

        for host_set in cluster.priority_set.host_sets_by_priority() {
            let hosts = host_set.hosts();
            let removed: Vec<Arc<Host>> = hosts
                .iter()
                .filter(|host| host.address() == address)
                .cloned()
                .collect();
            if removed.is_empty() {
                continue;
            }

            let remaining: Vec<Arc<Host>> = hosts
                .iter()
                .filter(|host| host.address() != address)
                .cloned()
                .collect();

            super::active_hosts().sub(removed.len() as i64);
            cluster.priority_set.update_hosts(
                host_set.priority(),
                HostSetViews::partition(remaining),
                &[],
                &removed,
            );
        }

        Ok(())
    }

    /// A fresh, unconnected TCP connection to a host selected by the
    /// cluster's load balancer, or `None` when the cluster is unknown or
    /// has no eligible host.
    pub fn tcp_conn_for_cluster(
        &self,
        name: &str,
        ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<CreateConnectionData> {
        let snapshot = self.get(name, ctx)?;
        let host = snapshot
            .load_balancer()
            .choose_host(snapshot.priority_set(), ctx)?;

        let info = snapshot.cluster_info();
        let connection = host.create_connection(
            &*self.factory,
            info.connect_timeout(),
            info.conn_buffer_limit_bytes(),
        );
        Some(CreateConnectionData { connection, host })
    }

    pub fn http_conn_pool_for_cluster(
        &self,
        name: &str,
        ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<Arc<ConnectionPool>> {
        self.conn_pool_for_cluster(name, Protocol::Http1, ctx)
    }

    pub fn rpc_conn_pool_for_cluster(
        &self,
        name: &str,
        ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<Arc<ConnectionPool>> {
        self.conn_pool_for_cluster(name, Protocol::BinaryRpc, ctx)
    }

    fn conn_pool_for_cluster(
        &self,
        name: &str,
        protocol: Protocol,
        ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<Arc<ConnectionPool>> {
        if self.shut_down.load(Ordering::Acquire) {
            return None;
        }

        let snapshot = self.get(name, ctx)?;
        let host = snapshot
            .load_balancer()
            .choose_host(snapshot.priority_set(), ctx)?;

        let key = PoolKey {
            cluster: name.into(),
            protocol,
            address: host.address(),
        };
        let pool = self
            .pools
            .entry(key)
            .or_insert_with(|| {
                Arc::new(ConnectionPool::new(
                    protocol,
                    host,
                    snapshot.cluster_info().connect_timeout(),
                    snapshot.cluster_info().conn_buffer_limit_bytes(),
                    snapshot.cluster_info().max_requests_per_connection(),
                    Arc::clone(&self.factory),
                ))
            })
            .clone();
        Some(pool)
    }

    /// Registers a callback fired once every primary cluster has
    /// completed its initial host population. Fires immediately when that
    /// is already true.
    pub fn set_initialized_cb(&self, cb: impl FnOnce() + Send + 'static) {
        *self.initialized_cb.lock() = Some(Box::new(cb));
        self.maybe_fire_initialized();
    }

    fn all_initialized(&self) -> bool {
        self.clusters
            .read()
            .values()
            .all(|cluster| cluster.initialized.load(Ordering::Acquire))
    }

    fn maybe_fire_initialized(&self) {
        if !self.all_initialized() {
            return;
        }
        if let Some(cb) = self.initialized_cb.lock().take() {
            cb();
        }
    }

    /// Closes every pool. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }

        for entry in self.pools.iter() {
            entry.value().close_all();
        }
        self.pools.clear();
        tracing::debug!("cluster manager shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::HealthFlag;
    use crate::test_utils::{cluster_config as cluster_with_hosts, MockConnectionFactory};
    use std::sync::atomic::AtomicUsize;

    fn manager() -> Arc<ClusterManager> {
        ClusterManager::new(Arc::new(MockConnectionFactory::default()))
    }

    #[test]
    fn get_unknown_cluster_is_none() {
        assert!(manager().get("nope", None).is_none());
    }

    #[test]
    fn add_is_idempotent_for_identical_config() {
        let manager = manager();
        let config = cluster_with_hosts("svc-a", &["127.0.0.1:9001"]);

        assert!(manager.add_or_update_primary_cluster(config.clone()));
        assert!(!manager.add_or_update_primary_cluster(config.clone()));

        let mut changed = config;
        changed.connect_timeout_ms += 1;
        assert!(manager.add_or_update_primary_cluster(changed));
    }

    #[test]
    fn update_replaces_the_generation_but_old_snapshots_survive() {
        let manager = manager();
        let mut config = cluster_with_hosts("svc-a", &["127.0.0.1:9001"]);
        config.connect_timeout_ms = 100;
        manager.add_or_update_primary_cluster(config.clone());

        let old = manager.get("svc-a", None).unwrap();

        config.connect_timeout_ms = 200;
        manager.add_or_update_primary_cluster(config);

        let new = manager.get("svc-a", None).unwrap();
        assert_eq!(old.cluster_info().connect_timeout(), Duration::from_millis(100));
        assert_eq!(new.cluster_info().connect_timeout(), Duration::from_millis(200));
    }

    #[test]
    fn config_update_without_hosts_carries_membership_over() {
        let manager = manager();
        manager.add_or_update_primary_cluster(ClusterConfig::new("svc-a"));
        manager
            .update_cluster_hosts("svc-a", 0, &[HostConfig::new("127.0.0.1:9001".parse().unwrap())])
            .unwrap();

        let mut updated = ClusterConfig::new("svc-a");
        updated.connect_timeout_ms = 42;
        manager.add_or_update_primary_cluster(updated);

        let snapshot = manager.get("svc-a", None).unwrap();
        let hosts = snapshot.priority_set().get_or_create_host_set(0).hosts();
        assert_eq!(hosts.len(), 1);
    }

    #[test]
    fn update_hosts_preserves_existing_host_identity() {
        let manager = manager();
        manager.add_or_update_primary_cluster(cluster_with_hosts("svc-a", &["127.0.0.1:9001"]));

        let snapshot = manager.get("svc-a", None).unwrap();
        let original = snapshot.priority_set().get_or_create_host_set(0).hosts()[0].clone();
        original.set_health_flag(HealthFlag::FailedOutlierCheck);

        manager
            .update_cluster_hosts(
                "svc-a",
                0,
                &[
                    HostConfig::new("127.0.0.1:9001".parse().unwrap()),
                    HostConfig::new("127.0.0.1:9002".parse().unwrap()),
                ],
            )
            .unwrap();

        let hosts = snapshot.priority_set().get_or_create_host_set(0).hosts();
        assert_eq!(hosts.len(), 2);
        let kept = hosts
            .iter()
            .find(|host| host.address() == original.address())
            .unwrap();
        assert!(Arc::ptr_eq(kept, &original));
        assert!(!kept.health());
    }

    #[test]
    fn update_hosts_on_unknown_cluster_fails() {
        assert!(matches!(
            manager().update_cluster_hosts("missing", 0, &[]),
            Err(ClusterError::NoCluster(_))
        ));
    }

    #[test]
    fn remove_cluster_hosts_spans_priorities() {
        let manager = manager();
        manager.add_or_update_primary_cluster(ClusterConfig::new("svc-a"));
        let shared = HostConfig::new("127.0.0.1:9001".parse().unwrap());
        let only_p1 = HostConfig::new("127.0.0.1:9002".parse().unwrap());
        manager
            .update_cluster_hosts("svc-a", 0, &[shared.clone()])
            .unwrap();
        manager
            .update_cluster_hosts("svc-a", 1, &[shared.clone(), only_p1])
            .unwrap();

        manager
            .remove_cluster_hosts("svc-a", shared.address)
            .unwrap();

        let snapshot = manager.get("svc-a", None).unwrap();
        assert!(snapshot
            .priority_set()
            .get_or_create_host_set(0)
            .hosts()
            .is_empty());
        let p1 = snapshot.priority_set().get_or_create_host_set(1).hosts();
        assert_eq!(p1.len(), 1);
        assert_eq!(p1[0].address().port(), 9002);
    }

    #[test]
    fn tcp_conn_for_cluster_selects_a_healthy_host() {
        let manager = manager();
        manager.add_or_update_primary_cluster(cluster_with_hosts("svc-a", &["127.0.0.1:9001"]));

        let data = manager.tcp_conn_for_cluster("svc-a", None).unwrap();
        assert_eq!(data.host.address().port(), 9001);
        assert_eq!(
            data.connection.remote_addr().unwrap(),
            data.host.address()
        );

        // All hosts flagged: no connection.
        data.host.set_health_flag(HealthFlag::FailedActiveHc);
        manager
            .get("svc-a", None)
            .unwrap()
            .priority_set()
            .refresh_healthy(0);
        assert!(manager.tcp_conn_for_cluster("svc-a", None).is_none());

        assert!(manager.tcp_conn_for_cluster("missing", None).is_none());
    }

    #[test]
    fn pools_are_shared_per_cluster_protocol_and_host() {
        let manager = manager();
        manager.add_or_update_primary_cluster(cluster_with_hosts("svc-a", &["127.0.0.1:9001"]));

        let rpc_a = manager.rpc_conn_pool_for_cluster("svc-a", None).unwrap();
        let rpc_b = manager.rpc_conn_pool_for_cluster("svc-a", None).unwrap();
        let http = manager.http_conn_pool_for_cluster("svc-a", None).unwrap();

        assert!(Arc::ptr_eq(&rpc_a, &rpc_b));
        assert!(!Arc::ptr_eq(&rpc_a, &http));

        manager.shutdown();
        assert!(manager.rpc_conn_pool_for_cluster("svc-a", None).is_none());
        assert!(rpc_a.fetch_connection().is_none());
        // Idempotent.
        manager.shutdown();
    }

    #[test]
    fn initialized_cb_fires_once_all_clusters_have_hosts() {
        let manager = manager();
        manager.add_or_update_primary_cluster(ClusterConfig::new("svc-a"));
        manager.add_or_update_primary_cluster(ClusterConfig::new("svc-b"));

        let fired = Arc::new(AtomicUsize::new(0));
        let cb_fired = Arc::clone(&fired);
        manager.set_initialized_cb(move || {
            cb_fired.fetch_add(1, Ordering::SeqCst);
        });

        manager
            .update_cluster_hosts("svc-a", 0, &[HostConfig::new("127.0.0.1:1".parse().unwrap())])
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        manager
            .update_cluster_hosts("svc-b", 0, &[HostConfig::new("127.0.0.1:2".parse().unwrap())])
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Further updates do not re-fire.
        manager
            .update_cluster_hosts("svc-b", 0, &[HostConfig::new("127.0.0.1:3".parse().unwrap())])
            .unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn initialized_cb_fires_immediately_when_already_populated() {
        let manager = manager();
        manager.add_or_update_primary_cluster(cluster_with_hosts("svc-a", &["127.0.0.1:1"]));

        let fired = Arc::new(AtomicUsize::new(0));
        let cb_fired = Arc::clone(&fired);
        manager.set_initialized_cb(move || {
            cb_fired.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn snapshots_stay_internally_consistent_under_concurrent_updates() {
        let manager = manager();

        // Two alternating generations whose fields are correlated: the
        // 100ms generation always has one host, the 200ms one two.
        let mut generation_a = cluster_with_hosts("svc-a", &["127.0.0.1:9001"]);
        generation_a.connect_timeout_ms = 100;
        let mut generation_b =
            cluster_with_hosts("svc-a", &["127.0.0.1:9001", "127.0.0.1:9002"]);
        generation_b.connect_timeout_ms = 200;

        manager.add_or_update_primary_cluster(generation_a.clone());

        let writer_manager = Arc::clone(&manager);
        let writer = std::thread::spawn(move || {
            for round in 0..200 {
                let config = if round % 2 == 0 {
                    generation_b.clone()
                } else {
                    generation_a.clone()
                };
                writer_manager.add_or_update_primary_cluster(config);
            }
        });

        for _ in 0..500 {
            let snapshot = manager.get("svc-a", None).unwrap();
            let hosts = snapshot.priority_set().get_or_create_host_set(0).hosts();
            let expected = match snapshot.cluster_info().connect_timeout().as_millis() {
                100 => 1,
                200 => 2,
                other => panic!("unexpected generation timeout {other}"),
            };
            assert_eq!(hosts.len(), expected);
        }

        writer.join().unwrap();
    }
}
