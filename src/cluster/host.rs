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

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crate::cluster::subset::SortedMetadata;
use crate::config::HostConfig;
use crate::net::{ClientConnection, ConnectionFactory};

/// Why a host is currently excluded from the healthy set.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum HealthFlag {
    /// The host is failing active health checks.
    FailedActiveHc = 0x01,
    /// The host is considered an outlier and has been ejected.
    FailedOutlierCheck = 0x02,
}

/// An addressable upstream endpoint.
///
/// A host is healthy iff no [`HealthFlag`] is set.
pub struct Host {
    hostname: String,
    address: SocketAddr,
    weight: u32,
    canary: bool,
    locality: Option<String>,
    metadata: SortedMetadata,
    health_flags: AtomicU32,
    used: AtomicBool,
    stats: HostStats,
}

impl Host {
    pub fn new(cluster: &str, config: &HostConfig) -> Self {
        Self {
            hostname: config
                .hostname
                .clone()
                .unwrap_or_else(|| config.address.to_string()),
            address: config.address,
            weight: config.weight,
            canary: config.canary,
            locality: config.locality.clone(),
            metadata: SortedMetadata::new(config.metadata.clone()),
            health_flags: AtomicU32::new(0),
            used: AtomicBool::new(false),
            stats: HostStats::new(cluster, config.address),
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn canary(&self) -> bool {
        self.canary
    }

    pub fn locality(&self) -> Option<&str> {
        self.locality.as_deref()
    }

    pub fn metadata(&self) -> &SortedMetadata {
        &self.metadata
    }

    pub fn health(&self) -> bool {
        self.health_flags.load(Ordering::Acquire) == 0
    }

    pub fn set_health_flag(&self, flag: HealthFlag) {
        self.health_flags.fetch_or(flag as u32, Ordering::AcqRel);
    }

    pub fn clear_health_flag(&self, flag: HealthFlag) {
        self.health_flags.fetch_and(!(flag as u32), Ordering::AcqRel);
    }

    pub fn contains_health_flag(&self, flag: HealthFlag) -> bool {
        self.health_flags.load(Ordering::Acquire) & flag as u32 != 0
    }

    pub fn used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: bool) {
        self.used.store(used, Ordering::Release);
    }

    /// Creates an unconnected client connection to this host. The caller
    /// decides when to `connect`.
    pub fn create_connection(
        &self,
        factory: &dyn ConnectionFactory,
        connect_timeout: Duration,
        buffer_limit_bytes: usize,
    ) -> Box<dyn ClientConnection> {
        self.stats.cx_total.inc();
        factory.create_connection(self.address, connect_timeout, buffer_limit_bytes)
    }

    pub fn stats(&self) -> &HostStats {
        &self.stats
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("hostname", &self.hostname)
            .field("address", &self.address)
            .field("weight", &self.weight)
            .field("healthy", &self.health())
            .finish_non_exhaustive()
    }
}

/// Per-host upstream connection counters, resolved once against the
/// shared metric vectors.
#[derive(Clone)]
pub struct HostStats {
    pub cx_total: prometheus::IntCounter,
    pub cx_active: prometheus::IntGauge,
    pub cx_connect_fail: prometheus::IntCounter,
}

impl HostStats {
    fn new(cluster: &str, address: SocketAddr) -> Self {
        let address = address.to_string();
        let labels = &[cluster, address.as_str()];
        Self {
            cx_total: super::upstream_connections_total().with_label_values(labels),
            cx_active: super::upstream_connections_active().with_label_values(labels),
            cx_connect_fail: super::upstream_connect_failures_total().with_label_values(labels),
        }
    }
}
