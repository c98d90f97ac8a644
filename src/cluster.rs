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

//! Upstream cluster management.
//!
//! The relation between the pieces:
//!
//! ```text
//!        1             * | 1              1 | 1             * | 1        *
//! ClusterManager ------ Cluster ------- PrioritySet ------- HostSet ----- Host
//! ```

mod host;
pub mod load_balancer;
mod manager;
pub mod pool;
mod priority;
mod resource;
pub mod subset;

use once_cell::sync::Lazy;

use crate::metrics::{opts, CollectorExt};

pub use self::{
    host::{HealthFlag, Host, HostStats},
    manager::{
        ClusterError, ClusterInfo, ClusterManager, ClusterSnapshot, CreateConnectionData,
    },
    priority::{HostSet, HostSetViews, MemberUpdateCb, PrioritySet},
    resource::{Resource, ResourceGuard, ResourceManager},
};

const SUBSYSTEM: &str = "cluster";

pub(crate) fn active_clusters() -> &'static prometheus::IntGauge {
    static ACTIVE_CLUSTERS: Lazy<prometheus::IntGauge> = Lazy::new(|| {
        prometheus::IntGauge::with_opts(opts(
            "active",
            SUBSYSTEM,
            "Number of currently active clusters.",
        ))
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &ACTIVE_CLUSTERS
}

pub(crate) fn active_hosts() -> &'static prometheus::IntGauge {
    static ACTIVE_HOSTS: Lazy<prometheus::IntGauge> = Lazy::new(|| {
        prometheus::IntGauge::with_opts(opts(
            "active_hosts",
            SUBSYSTEM,
            "Number of hosts across all active clusters.",
        ))
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &ACTIVE_HOSTS
}

pub(crate) fn upstream_connections_total() -> &'static prometheus::IntCounterVec {
    static TOTAL: Lazy<prometheus::IntCounterVec> = Lazy::new(|| {
        prometheus::IntCounterVec::new(
            opts(
                "upstream_connections_total",
                SUBSYSTEM,
                "Total upstream connections created, by cluster and host.",
            ),
            &["cluster", "host"],
        )
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &TOTAL
}

pub(crate) fn upstream_connections_active() -> &'static prometheus::IntGaugeVec {
    static ACTIVE: Lazy<prometheus::IntGaugeVec> = Lazy::new(|| {
        prometheus::IntGaugeVec::new(
            opts(
                "upstream_connections_active",
                SUBSYSTEM,
                "Upstream connections currently held by proxies, by cluster and host.",
            ),
            &["cluster", "host"],
        )
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &ACTIVE
}

pub(crate) fn upstream_connect_failures_total() -> &'static prometheus::IntCounterVec {
    static FAILURES: Lazy<prometheus::IntCounterVec> = Lazy::new(|| {
        prometheus::IntCounterVec::new(
            opts(
                "upstream_connect_failures_total",
                SUBSYSTEM,
                "Upstream connect attempts that timed out or were refused, by cluster and host.",
            ),
            &["cluster", "host"],
        )
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &FAILURES
}
