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

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::cluster::Host;

/// The four parallel views over the hosts of one priority level. Replaced
/// wholesale behind a single pointer so readers always observe one
/// consistent generation.
#[derive(Debug, Default)]
pub struct HostSetViews {
    pub hosts: Vec<Arc<Host>>,
    pub healthy_hosts: Vec<Arc<Host>>,
    pub hosts_per_locality: Vec<Vec<Arc<Host>>>,
    pub healthy_hosts_per_locality: Vec<Vec<Arc<Host>>>,
}

impl HostSetViews {
    /// Builds the views from a membership list: hosts are grouped per
    /// locality in first-appearance order, and the healthy views carry the
    /// hosts whose health-flag bitmask is clear. The concatenation of the
    /// per-locality groups equals the corresponding flat view.
    pub fn partition(hosts: Vec<Arc<Host>>) -> Self {
        let mut localities: Vec<Option<String>> = Vec::new();
        for host in &hosts {
            let locality = host.locality().map(String::from);
            if !localities.contains(&locality) {
                localities.push(locality);
            }
        }

        let group = |members: &[Arc<Host>]| -> Vec<Vec<Arc<Host>>> {
            localities
                .iter()
                .map(|locality| {
                    members
                        .iter()
                        .filter(|host| host.locality() == locality.as_deref())
                        .cloned()
                        .collect()
                })
                .collect()
        };

        let healthy_hosts: Vec<Arc<Host>> =
            hosts.iter().filter(|host| host.health()).cloned().collect();

        Self {
            hosts_per_locality: group(&hosts),
            healthy_hosts_per_locality: group(&healthy_hosts),
            hosts,
            healthy_hosts,
        }
    }
}

/// The hosts of one priority level of one cluster.
pub struct HostSet {
    priority: u32,
    views: ArcSwap<HostSetViews>,
}

impl HostSet {
    fn new(priority: u32) -> Self {
        Self {
            priority,
            views: ArcSwap::from_pointee(HostSetViews::default()),
        }
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    /// Snapshot of all four views at a single generation.
    pub fn views(&self) -> Arc<HostSetViews> {
        self.views.load_full()
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.views.load().hosts.clone()
    }

    pub fn healthy_hosts(&self) -> Vec<Arc<Host>> {
        self.views.load().healthy_hosts.clone()
    }

    fn update_hosts(&self, views: HostSetViews) {
        self.views.store(Arc::new(views));
    }
}

impl std::fmt::Debug for HostSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let views = self.views.load();
        f.debug_struct("HostSet")
            .field("priority", &self.priority)
            .field("hosts", &views.hosts.len())
            .field("healthy", &views.healthy_hosts.len())
            .finish()
    }
}

/// Observer invoked after a host-set swap with the priority and the
/// membership delta. Must not block.
pub type MemberUpdateCb = Box<dyn Fn(u32, &[Arc<Host>], &[Arc<Host>]) + Send + Sync>;

/// The ordered host sets of one cluster, indexed by priority. Lower
/// numeric priorities are preferred by the load balancer.
#[derive(Default)]
pub struct PrioritySet {
    host_sets: RwLock<Vec<Arc<HostSet>>>,
    callbacks: RwLock<Vec<MemberUpdateCb>>,
}

impl PrioritySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The host set at `priority`, allocating empty sets for it and any
    /// gap below it if absent.
    pub fn get_or_create_host_set(&self, priority: u32) -> Arc<HostSet> {
        {
            let host_sets = self.host_sets.read();
            if let Some(set) = host_sets.get(priority as usize) {
                return Arc::clone(set);
            }
        }

        let mut host_sets = self.host_sets.write();
        while host_sets.len() <= priority as usize {
            let next_priority = host_sets.len() as u32;
            host_sets.push(Arc::new(HostSet::new(next_priority)));
        }
        Arc::clone(&host_sets[priority as usize])
    }

    /// The dense ordered slice of host sets.
    pub fn host_sets_by_priority(&self) -> Vec<Arc<HostSet>> {
        self.host_sets.read().clone()
    }

    pub fn add_member_update_cb(&self, cb: MemberUpdateCb) {
        self.callbacks.write().push(cb);
    }

    /// Swaps the views at `priority` and then notifies member-update
    /// observers with the delta, synchronously from the caller's thread.
    pub fn update_hosts(
        &self,
        priority: u32,
        views: HostSetViews,
        added: &[Arc<Host>],
        removed: &[Arc<Host>],
    ) {
        self.get_or_create_host_set(priority).update_hosts(views);

        for cb in self.callbacks.read().iter() {
            cb(priority, added, removed);
        }
    }

    /// Rebuilds the healthy views at `priority` from the current
    /// membership after a health-flag change. Membership is unchanged, so
    /// observers see an empty delta.
    pub fn refresh_healthy(&self, priority: u32) {
        let host_set = self.get_or_create_host_set(priority);
        let views = HostSetViews::partition(host_set.hosts());
        self.update_hosts(priority, views, &[], &[]);
    }
}
