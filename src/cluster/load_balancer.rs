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

//! Host selection policies.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::cluster::subset::{LbSubsetInfo, SortedMetadata};
use crate::cluster::{Host, PrioritySet};
use crate::config::{LbPolicy, SubsetFallbackPolicy};

/// Per-request state the balancer may consult, most importantly the
/// route's metadata match for subset selection.
pub trait LoadBalancerContext: Send + Sync {
    fn metadata_match(&self) -> Option<&SortedMetadata>;
}

/// A stateless selection policy over a cluster's priority set.
pub trait LoadBalancer: Send + Sync {
    /// Picks one host, or `None` when no eligible host exists.
    fn choose_host(
        &self,
        priority_set: &PrioritySet,
        ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<Arc<Host>>;
}

pub fn new_load_balancer(
    policy: LbPolicy,
    subset: Arc<LbSubsetInfo>,
    seed: Option<u64>,
) -> Arc<dyn LoadBalancer> {
    match policy {
        LbPolicy::Random => Arc::new(RandomLoadBalancer::new(subset, seed)),
        LbPolicy::RoundRobin => Arc::new(RoundRobinLoadBalancer::new(subset)),
    }
}

/// Healthy hosts of the highest-priority level that has any, with the
/// subset restriction applied. Hosts with weight zero never qualify.
fn candidates(
    priority_set: &PrioritySet,
    subset: &LbSubsetInfo,
    ctx: Option<&dyn LoadBalancerContext>,
) -> Vec<Arc<Host>> {
    for host_set in priority_set.host_sets_by_priority() {
        let views = host_set.views();
        if views.healthy_hosts.is_empty() {
            continue;
        }

        let healthy: Vec<Arc<Host>> = views
            .healthy_hosts
            .iter()
            .filter(|host| host.weight() > 0)
            .cloned()
            .collect();
        if healthy.is_empty() {
            continue;
        }

        return apply_subset(healthy, subset, ctx);
    }

    Vec::new()
}

fn apply_subset(
    healthy: Vec<Arc<Host>>,
    subset: &LbSubsetInfo,
    ctx: Option<&dyn LoadBalancerContext>,
) -> Vec<Arc<Host>> {
    let metadata_match = match ctx.and_then(LoadBalancerContext::metadata_match) {
        Some(metadata) if subset.is_enabled() && !metadata.is_empty() => metadata,
        _ => return healthy,
    };

    let restricted: Vec<Arc<Host>> = healthy
        .iter()
        .filter(|host| host.metadata().is_superset_of(metadata_match))
        .cloned()
        .collect();
    if !restricted.is_empty() {
        return restricted;
    }

    match subset.fallback_policy() {
        SubsetFallbackPolicy::NoFallback => Vec::new(),
        SubsetFallbackPolicy::AnyEndpoint => healthy,
        SubsetFallbackPolicy::DefaultSubset => healthy
            .iter()
            .filter(|host| host.metadata().is_superset_of(subset.default_subset()))
            .cloned()
            .collect(),
    }
}

/// Weighted random selection. Reproducible for a fixed seed, which the
/// tests rely on.
pub struct RandomLoadBalancer {
    subset: Arc<LbSubsetInfo>,
    rng: Mutex<SmallRng>,
}

impl RandomLoadBalancer {
    pub fn new(subset: Arc<LbSubsetInfo>, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        Self {
            subset,
            rng: Mutex::new(rng),
        }
    }
}

impl LoadBalancer for RandomLoadBalancer {
    fn choose_host(
        &self,
        priority_set: &PrioritySet,
        ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<Arc<Host>> {
        let candidates = candidates(priority_set, &self.subset, ctx);
        if candidates.is_empty() {
            return None;
        }

        let total: u64 = candidates.iter().map(|host| u64::from(host.weight())).sum();
        let mut ticket = self.rng.lock().gen_range(0..total);
        for host in &candidates {
            let weight = u64::from(host.weight());
            if ticket < weight {
                return Some(Arc::clone(host));
            }
            ticket -= weight;
        }

        unreachable!("ticket drawn below the summed weight")
    }
}

/// Round-robin over the eligible candidates.
pub struct RoundRobinLoadBalancer {
    subset: Arc<LbSubsetInfo>,
    next: AtomicUsize,
}

impl RoundRobinLoadBalancer {
    pub fn new(subset: Arc<LbSubsetInfo>) -> Self {
        Self {
            subset,
            next: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn choose_host(
        &self,
        priority_set: &PrioritySet,
        ctx: Option<&dyn LoadBalancerContext>,
    ) -> Option<Arc<Host>> {
        let candidates = candidates(priority_set, &self.subset, ctx);
        if candidates.is_empty() {
            return None;
        }

        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[index]))
    }
}

/// A plain metadata-match context, built from the matched route.
#[derive(Debug, Default)]
pub struct MetadataMatchContext {
    metadata: Option<SortedMetadata>,
}

impl MetadataMatchContext {
    pub fn new(metadata: Option<SortedMetadata>) -> Self {
        Self { metadata }
    }
}

impl LoadBalancerContext for MetadataMatchContext {
    fn metadata_match(&self) -> Option<&SortedMetadata> {
        self.metadata.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{HealthFlag, HostSetViews};
    use crate::config::{HostConfig, LbSubsetConfig};

    fn host(address: &str, weight: u32, metadata: &[(&str, &str)]) -> Arc<Host> {
        let mut config = HostConfig::new(address.parse().unwrap());
        config.weight = weight;
        config.metadata = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Arc::new(Host::new("svc-test", &config))
    }

    fn priority_set_with(hosts: Vec<Arc<Host>>) -> PrioritySet {
        let priority_set = PrioritySet::new();
        priority_set.update_hosts(0, HostSetViews::partition(hosts.clone()), &hosts, &[]);
        priority_set
    }

    fn no_subset() -> Arc<LbSubsetInfo> {
        Arc::new(LbSubsetInfo::new(None))
    }

    #[test]
    fn selection_is_reproducible_for_a_fixed_seed() {
        let hosts = vec![
            host("127.0.0.1:1", 1, &[]),
            host("127.0.0.1:2", 2, &[]),
            host("127.0.0.1:3", 3, &[]),
        ];
        let priority_set = priority_set_with(hosts);

        let picks = |seed| -> Vec<std::net::SocketAddr> {
            let lb = RandomLoadBalancer::new(no_subset(), Some(seed));
            (0..16)
                .map(|_| lb.choose_host(&priority_set, None).unwrap().address())
                .collect()
        };

        assert_eq!(picks(7), picks(7));
        assert_ne!(picks(7), picks(8));
    }

    #[test]
    fn zero_weight_hosts_are_never_selected() {
        let dead = host("127.0.0.1:1", 0, &[]);
        let live = host("127.0.0.1:2", 1, &[]);
        let priority_set = priority_set_with(vec![Arc::clone(&dead), Arc::clone(&live)]);

        let lb = RandomLoadBalancer::new(no_subset(), Some(1));
        for _ in 0..32 {
            assert_eq!(
                lb.choose_host(&priority_set, None).unwrap().address(),
                live.address()
            );
        }
    }

    #[test]
    fn unhealthy_hosts_are_skipped_until_flags_clear() {
        let flagged = host("127.0.0.1:1", 1, &[]);
        let healthy = host("127.0.0.1:2", 1, &[]);
        flagged.set_health_flag(HealthFlag::FailedActiveHc);

        let priority_set =
            priority_set_with(vec![Arc::clone(&flagged), Arc::clone(&healthy)]);
        let lb = RandomLoadBalancer::new(no_subset(), Some(3));

        for _ in 0..32 {
            assert_eq!(
                lb.choose_host(&priority_set, None).unwrap().address(),
                healthy.address()
            );
        }

        flagged.clear_health_flag(HealthFlag::FailedActiveHc);
        priority_set.refresh_healthy(0);

        let mut seen_flagged = false;
        for _ in 0..64 {
            seen_flagged |=
                lb.choose_host(&priority_set, None).unwrap().address() == flagged.address();
        }
        assert!(seen_flagged);
    }

    #[test]
    fn lower_priorities_are_preferred_while_healthy() {
        let primary = host("127.0.0.1:1", 1, &[]);
        let fallback = host("127.0.0.1:2", 1, &[]);

        let priority_set = PrioritySet::new();
        priority_set.update_hosts(
            0,
            HostSetViews::partition(vec![Arc::clone(&primary)]),
            &[Arc::clone(&primary)],
            &[],
        );
        priority_set.update_hosts(
            1,
            HostSetViews::partition(vec![Arc::clone(&fallback)]),
            &[Arc::clone(&fallback)],
            &[],
        );

        let lb = RandomLoadBalancer::new(no_subset(), Some(11));
        assert_eq!(
            lb.choose_host(&priority_set, None).unwrap().address(),
            primary.address()
        );

        primary.set_health_flag(HealthFlag::FailedOutlierCheck);
        priority_set.refresh_healthy(0);
        assert_eq!(
            lb.choose_host(&priority_set, None).unwrap().address(),
            fallback.address()
        );
    }

    #[test]
    fn subset_match_restricts_candidates() {
        let prod = host("127.0.0.1:1", 1, &[("stage", "prod")]);
        let dev = host("127.0.0.1:2", 1, &[("stage", "dev")]);
        let priority_set = priority_set_with(vec![Arc::clone(&prod), Arc::clone(&dev)]);

        let subset = Arc::new(LbSubsetInfo::new(Some(&LbSubsetConfig {
            subset_keys: vec![vec!["stage".into()]],
            ..LbSubsetConfig::default()
        })));
        let lb = RandomLoadBalancer::new(subset, Some(5));

        let ctx = MetadataMatchContext::new(Some(SortedMetadata::new([(
            "stage".to_string(),
            "prod".to_string(),
        )])));
        for _ in 0..16 {
            assert_eq!(
                lb.choose_host(&priority_set, Some(&ctx)).unwrap().address(),
                prod.address()
            );
        }
    }

    #[test]
    fn subset_fallback_policies() {
        let prod = host("127.0.0.1:1", 1, &[("stage", "prod")]);
        let priority_set = priority_set_with(vec![Arc::clone(&prod)]);
        let ctx = MetadataMatchContext::new(Some(SortedMetadata::new([(
            "stage".to_string(),
            "qa".to_string(),
        )])));

        let with_policy = |policy, default_subset: &[(&str, &str)]| {
            Arc::new(LbSubsetInfo::new(Some(&LbSubsetConfig {
                fallback_policy: policy,
                default_subset: default_subset
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                subset_keys: vec![vec!["stage".into()]],
            })))
        };

        let none = RandomLoadBalancer::new(
            with_policy(SubsetFallbackPolicy::NoFallback, &[]),
            Some(2),
        );
        assert!(none.choose_host(&priority_set, Some(&ctx)).is_none());

        let any = RandomLoadBalancer::new(
            with_policy(SubsetFallbackPolicy::AnyEndpoint, &[]),
            Some(2),
        );
        assert!(any.choose_host(&priority_set, Some(&ctx)).is_some());

        let default = RandomLoadBalancer::new(
            with_policy(SubsetFallbackPolicy::DefaultSubset, &[("stage", "prod")]),
            Some(2),
        );
        assert_eq!(
            default
                .choose_host(&priority_set, Some(&ctx))
                .unwrap()
                .address(),
            prod.address()
        );
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let hosts = vec![host("127.0.0.1:1", 1, &[]), host("127.0.0.1:2", 1, &[])];
        let priority_set = priority_set_with(hosts.clone());
        let lb = RoundRobinLoadBalancer::new(no_subset());

        let first = lb.choose_host(&priority_set, None).unwrap().address();
        let second = lb.choose_host(&priority_set, None).unwrap().address();
        let third = lb.choose_host(&priority_set, None).unwrap().address();

        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn empty_priority_set_yields_nothing() {
        let priority_set = PrioritySet::new();
        let lb = RandomLoadBalancer::new(no_subset(), Some(1));
        assert!(lb.choose_host(&priority_set, None).is_none());
    }
}
