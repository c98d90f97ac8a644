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
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cluster::Host;

/// A bit recording the terminal reason of a session.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ResponseFlag {
    NoRouteFound = 0x01,
    NoHealthyUpstream = 0x02,
    UpstreamOverflow = 0x04,
    UpstreamConnectionFailure = 0x08,
    UpstreamConnectionTermination = 0x10,
    DurationTimeout = 0x20,
}

/// Per-session bookkeeping: addresses, the selected upstream host, byte
/// counters and the response-flag bit set.
pub struct RequestInfo {
    start_time: Instant,
    downstream_local_address: Option<SocketAddr>,
    downstream_remote_address: Option<SocketAddr>,
    upstream_host: Option<Arc<Host>>,
    /// Bytes relayed upstream→downstream.
    bytes_sent: u64,
    /// Bytes relayed downstream→upstream.
    bytes_received: u64,
    response_flags: u32,
}

impl RequestInfo {
    pub fn new(
        downstream_local_address: Option<SocketAddr>,
        downstream_remote_address: Option<SocketAddr>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            downstream_local_address,
            downstream_remote_address,
            upstream_host: None,
            bytes_sent: 0,
            bytes_received: 0,
            response_flags: 0,
        }
    }

    pub fn downstream_local_address(&self) -> Option<SocketAddr> {
        self.downstream_local_address
    }

    pub fn downstream_remote_address(&self) -> Option<SocketAddr> {
        self.downstream_remote_address
    }

    /// Recorded once, when the load balancer selects the host.
    pub fn on_upstream_host_selected(&mut self, host: Arc<Host>) {
        self.upstream_host = Some(host);
    }

    pub fn upstream_host(&self) -> Option<&Arc<Host>> {
        self.upstream_host.as_ref()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn add_bytes_sent(&mut self, count: u64) {
        self.bytes_sent += count;
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn add_bytes_received(&mut self, count: u64) {
        self.bytes_received += count;
    }

    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        self.response_flags |= flag as u32;
    }

    pub fn has_response_flag(&self, flag: ResponseFlag) -> bool {
        self.response_flags & flag as u32 != 0
    }

    pub fn duration(&self) -> Duration {
        self.start_time.elapsed()
    }
}
