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

//! The per-connection proxy state machine.
//!
//! One [`RpcProxy`] bridges one downstream connection to at most one
//! upstream connection: it decodes arriving frames just enough to extract
//! the routing headers, resolves a cluster, acquires an upstream
//! connection under the cluster's resource limits and then relays bytes
//! in both directions. All proxy callbacks are serialized by the driving
//! task; the proxy itself takes no locks.

pub mod driver;
mod request_info;

pub use request_info::{RequestInfo, ResponseFlag};

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;

use crate::cluster::load_balancer::MetadataMatchContext;
use crate::cluster::{ClusterManager, CreateConnectionData, ResourceGuard};
use crate::codec::{DecodeCallbacks, FilterStatus, Headers, ProtocolRegistry};
use crate::metrics::{
    histogram_opts, opts, CollectorExt, DIRECTION_LABEL, READ_DIRECTION, WRITE_DIRECTION,
};
use crate::net::{ClientConnection, CloseReason, Connection, ConnectionEvent, FlushMode};
use crate::router::RouterConfig;

const SUBSYSTEM: &str = "proxy";

pub(crate) fn active_sessions() -> &'static prometheus::IntGauge {
    static ACTIVE_SESSIONS: Lazy<prometheus::IntGauge> = Lazy::new(|| {
        prometheus::IntGauge::with_opts(opts(
            "active_sessions",
            SUBSYSTEM,
            "Number of downstream sessions currently being proxied.",
        ))
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &ACTIVE_SESSIONS
}

pub(crate) fn sessions_total() -> &'static prometheus::IntCounter {
    static SESSIONS_TOTAL: Lazy<prometheus::IntCounter> = Lazy::new(|| {
        prometheus::IntCounter::with_opts(opts(
            "sessions_total",
            SUBSYSTEM,
            "Total number of downstream sessions accepted.",
        ))
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &SESSIONS_TOTAL
}

pub(crate) fn session_duration_seconds() -> &'static prometheus::Histogram {
    static SESSION_DURATION: Lazy<prometheus::Histogram> = Lazy::new(|| {
        prometheus::Histogram::with_opts(histogram_opts(
            "session_duration_seconds",
            SUBSYSTEM,
            "Duration of proxied downstream sessions, measured at close.",
            None,
        ))
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &SESSION_DURATION
}

pub(crate) fn bytes_forwarded_total() -> &'static prometheus::IntCounterVec {
    static BYTES_FORWARDED: Lazy<prometheus::IntCounterVec> = Lazy::new(|| {
        prometheus::IntCounterVec::new(
            opts(
                "bytes_forwarded_total",
                SUBSYSTEM,
                "Bytes relayed through the proxy, by direction.",
            ),
            &[DIRECTION_LABEL],
        )
        .unwrap()
        .register_if_not_exists()
        .unwrap()
    });

    &BYTES_FORWARDED
}

/// Lifecycle of one proxied session. `Closed` is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProxyState {
    Idle,
    Decoding,
    Connecting,
    Streaming,
    Closing,
    Closed,
}

/// Why upstream acquisition failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UpstreamFailureReason {
    NoRoute,
    ResourceLimitExceeded,
    NoHealthyUpstream,
    ConnectFailed,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("unknown cluster {0}")]
    UnknownCluster(String),
    #[error("upstream overflow in cluster {0}")]
    Overflow(String),
    #[error("no healthy upstream in cluster {0}")]
    NoHealthyUpstream(String),
    #[error(transparent)]
    Connect(#[from] crate::net::ConnectionError),
}

/// The per-downstream-connection proxy.
pub struct RpcProxy {
    cluster_manager: Arc<ClusterManager>,
    router_config: Arc<RouterConfig>,
    protocols: Arc<ProtocolRegistry>,
    downstream: Box<dyn Connection>,
    upstream: Option<Box<dyn ClientConnection>>,
    /// Held from successful acquisition until the upstream reaches a
    /// terminal state; dropping it releases the cluster's connection slot.
    connection_guard: Option<ResourceGuard>,
    request_info: RequestInfo,
    state: ProxyState,
    upstream_connecting: bool,
    upstream_terminated: bool,
    downstream_closed: bool,
    /// Bytes accumulated while waiting for a complete, routable frame.
    buf_current: BytesMut,
}

impl RpcProxy {
    pub fn new(
        downstream: Box<dyn Connection>,
        router_config: Arc<RouterConfig>,
        cluster_manager: Arc<ClusterManager>,
        protocols: Arc<ProtocolRegistry>,
    ) -> Self {
        let request_info =
            RequestInfo::new(downstream.local_addr(), downstream.remote_addr());
        tracing::debug!(
            id = downstream.id(),
            remote = ?request_info.downstream_remote_address(),
            "proxy installed on downstream connection"
        );

        Self {
            cluster_manager,
            router_config,
            protocols,
            downstream,
            upstream: None,
            connection_guard: None,
            request_info,
            state: ProxyState::Idle,
            upstream_connecting: false,
            upstream_terminated: false,
            downstream_closed: false,
            buf_current: BytesMut::new(),
        }
    }

    pub fn state(&self) -> ProxyState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ProxyState::Closed
    }

    pub fn request_info(&self) -> &RequestInfo {
        &self.request_info
    }

    /// Hands the upstream connection's event and read streams to the
    /// driving task once an upstream has been acquired.
    pub fn take_upstream_channels(
        &mut self,
    ) -> Option<(
        tokio::sync::mpsc::UnboundedReceiver<ConnectionEvent>,
        tokio::sync::mpsc::UnboundedReceiver<Bytes>,
    )> {
        let upstream = self.upstream.as_mut()?;
        let events = upstream.take_event_stream()?;
        let data = upstream.take_read_stream()?;
        Some((events, data))
    }

    /// Downstream read entry point. Returns `StopIteration`
    /// unconditionally: the proxy owns forwarding of the buffer.
    pub fn on_data(&mut self, buf: &[u8]) -> FilterStatus {
        if matches!(self.state, ProxyState::Closing | ProxyState::Closed) {
            return FilterStatus::StopIteration;
        }

        if self.upstream.is_some() {
            // The route is pinned; later frames are relayed wholesale.
            self.forward_upstream(buf);
            return FilterStatus::StopIteration;
        }

        self.state = ProxyState::Decoding;
        self.buf_current.extend_from_slice(buf);

        let current = Bytes::copy_from_slice(&self.buf_current);
        let protocols = Arc::clone(&self.protocols);
        if let Err(error) = protocols.decode(&current, self) {
            tracing::warn!(%error, "failed to decode downstream frame");
            self.on_data_err();
        }

        FilterStatus::StopIteration
    }

    /// Upstream read entry point: response bytes are relayed verbatim.
    pub fn on_upstream_data(&mut self, buf: &[u8]) -> FilterStatus {
        if self.downstream_closed || self.state == ProxyState::Closed {
            return FilterStatus::StopIteration;
        }

        self.request_info.add_bytes_sent(buf.len() as u64);
        bytes_forwarded_total()
            .with_label_values(&[WRITE_DIRECTION])
            .inc_by(buf.len() as u64);
        self.downstream.write(buf);
        FilterStatus::StopIteration
    }

    pub fn on_upstream_event(&mut self, event: ConnectionEvent) {
        if self.state == ProxyState::Closed {
            return;
        }

        match event {
            ConnectionEvent::OnConnect => {
                if !self.upstream_terminated {
                    self.upstream_connecting = true;
                }
            }
            ConnectionEvent::Connected => {
                if self.state == ProxyState::Connecting {
                    self.upstream_connecting = false;
                    self.on_connection_success();
                }
            }
            ConnectionEvent::ConnectTimeout => {
                if self.upstream_terminated {
                    self.advance_close_state();
                    return;
                }
                self.request_info
                    .set_response_flag(ResponseFlag::UpstreamConnectionFailure);
                if let Some(host) = self.request_info.upstream_host() {
                    host.stats().cx_connect_fail.inc();
                }
                self.upstream_terminated = true;
                self.release_connection_guard();
                self.close_downstream(FlushMode::NoFlush);
            }
            ConnectionEvent::RemoteClose => {
                if self.upstream_terminated {
                    self.advance_close_state();
                    return;
                }
                self.upstream_terminated = true;
                self.release_connection_guard();

                if self.upstream_connecting {
                    self.request_info
                        .set_response_flag(ResponseFlag::UpstreamConnectionFailure);
                    if let Some(host) = self.request_info.upstream_host() {
                        host.stats().cx_connect_fail.inc();
                    }
                    self.close_downstream(FlushMode::NoFlush);
                } else if self.state == ProxyState::Streaming {
                    self.request_info
                        .set_response_flag(ResponseFlag::UpstreamConnectionTermination);
                    self.close_downstream(FlushMode::FlushWrite);
                } else {
                    self.advance_close_state();
                }
            }
            ConnectionEvent::LocalClose => {
                self.upstream_terminated = true;
                self.release_connection_guard();
                self.advance_close_state();
            }
            ConnectionEvent::ReadTimeout | ConnectionEvent::WriteTimeout => {}
        }
    }

    pub fn on_downstream_event(&mut self, event: ConnectionEvent) {
        if self.state == ProxyState::Closed {
            return;
        }

        match event {
            ConnectionEvent::RemoteClose => {
                self.downstream_closed = true;
                if self.has_live_upstream() {
                    self.close_upstream(FlushMode::FlushWrite);
                } else {
                    self.advance_close_state();
                }
            }
            ConnectionEvent::LocalClose => {
                self.downstream_closed = true;
                if self.has_live_upstream() {
                    self.close_upstream(FlushMode::NoFlush);
                } else {
                    self.advance_close_state();
                }
            }
            _ => {}
        }
    }

    fn forward_upstream(&mut self, buf: &[u8]) {
        self.request_info.add_bytes_received(buf.len() as u64);
        bytes_forwarded_total()
            .with_label_values(&[READ_DIRECTION])
            .inc_by(buf.len() as u64);
        if let Some(upstream) = &mut self.upstream {
            upstream.write(buf);
        }
    }

    /// Resolves the cluster, checks its connection resource, lets the
    /// load balancer pick a host and starts the upstream connect.
    fn initialize_upstream_connection(
        &mut self,
        cluster_name: &str,
        ctx: &MetadataMatchContext,
    ) -> Result<(), UpstreamError> {
        let Some(snapshot) = self.cluster_manager.get(cluster_name, Some(ctx)) else {
            self.request_info
                .set_response_flag(ResponseFlag::NoRouteFound);
            self.on_init_failure(UpstreamFailureReason::NoRoute);
            return Err(UpstreamError::UnknownCluster(cluster_name.into()));
        };

        let resource = Arc::clone(snapshot.cluster_info().resource_manager().connections());
        if !resource.can_create() {
            self.request_info
                .set_response_flag(ResponseFlag::UpstreamOverflow);
            self.on_init_failure(UpstreamFailureReason::ResourceLimitExceeded);
            return Err(UpstreamError::Overflow(cluster_name.into()));
        }

        let Some(CreateConnectionData {
            mut connection,
            host,
        }) = self.cluster_manager.tcp_conn_for_cluster(cluster_name, Some(ctx))
        else {
            self.request_info
                .set_response_flag(ResponseFlag::NoHealthyUpstream);
            self.on_init_failure(UpstreamFailureReason::NoHealthyUpstream);
            return Err(UpstreamError::NoHealthyUpstream(cluster_name.into()));
        };

        // The advisory check above passed, but the slot is only ours if
        // the linearizable acquire succeeds too.
        let Some(guard) = resource.acquire() else {
            self.request_info
                .set_response_flag(ResponseFlag::UpstreamOverflow);
            self.on_init_failure(UpstreamFailureReason::ResourceLimitExceeded);
            return Err(UpstreamError::Overflow(cluster_name.into()));
        };

        // A connect error drops `guard` on the way out, releasing the
        // slot it took.
        connection.connect()?;
        connection.set_nodelay(true);

        host.stats().cx_active.inc();
        self.request_info.on_upstream_host_selected(host);
        self.upstream = Some(connection);
        self.connection_guard = Some(guard);
        self.state = ProxyState::Connecting;

        Ok(())
    }

    fn on_connection_success(&mut self) {
        self.state = ProxyState::Streaming;
        if let Some(upstream) = &self.upstream {
            tracing::debug!(id = upstream.id(), "new upstream connection established");
        }
    }

    fn on_init_failure(&mut self, reason: UpstreamFailureReason) {
        tracing::debug!(?reason, "failed to initialize upstream connection");
        self.close_downstream(FlushMode::NoFlush);
    }

    /// Tears both sides down after a decode or routing failure.
    fn on_data_err(&mut self) {
        self.buf_current.clear();

        if self.has_live_upstream() {
            self.close_upstream(FlushMode::NoFlush);
        }
        self.close_downstream(FlushMode::NoFlush);
    }

    fn has_live_upstream(&self) -> bool {
        self.upstream.is_some() && !self.upstream_terminated
    }

    fn close_upstream(&mut self, flush: FlushMode) {
        self.upstream_terminated = true;
        if let Some(upstream) = &mut self.upstream {
            if !upstream.is_closed() {
                upstream.close(flush, CloseReason::LocalClose);
            }
        }
        self.release_connection_guard();
        self.advance_close_state();
    }

    fn close_downstream(&mut self, flush: FlushMode) {
        if !self.downstream_closed {
            self.downstream.close(flush, CloseReason::LocalClose);
            self.downstream_closed = true;
        }
        self.advance_close_state();
    }

    fn release_connection_guard(&mut self) {
        if self.connection_guard.take().is_some() {
            if let Some(host) = self.request_info.upstream_host() {
                host.stats().cx_active.dec();
            }
        }
    }

    fn advance_close_state(&mut self) {
        if self.state == ProxyState::Closed {
            return;
        }

        let upstream_done = self.upstream.is_none() || self.upstream_terminated;
        if self.downstream_closed && upstream_done {
            self.state = ProxyState::Closed;
            let duration = self.request_info.duration();
            session_duration_seconds().observe(duration.as_secs_f64());
            tracing::debug!(
                ?duration,
                bytes_sent = self.request_info.bytes_sent(),
                "session closed"
            );
        } else if self.downstream_closed || self.upstream_terminated {
            self.state = ProxyState::Closing;
        }
    }
}

impl DecodeCallbacks for RpcProxy {
    fn on_decode_header(&mut self, headers: Headers) -> FilterStatus {
        let (cluster_name, ctx) = match self.router_config.route(&headers) {
            Some(route) => {
                let rule = route.route_rule();
                (
                    rule.cluster_name().to_string(),
                    MetadataMatchContext::new(rule.metadata_match().cloned()),
                )
            }
            None => {
                tracing::debug!("no route matched the frame headers");
                self.request_info
                    .set_response_flag(ResponseFlag::NoRouteFound);
                self.on_data_err();
                return FilterStatus::StopIteration;
            }
        };

        match self.initialize_upstream_connection(&cluster_name, &ctx) {
            Ok(()) => {
                // Forward the original bytes untouched: routing is a
                // header peek, not a rewrite.
                let frame = self.buf_current.split().freeze();
                self.forward_upstream(&frame);
            }
            Err(error) => {
                tracing::debug!(%error, cluster = %cluster_name, "upstream initialization failed");
                self.on_data_err();
            }
        }

        FilterStatus::StopIteration
    }

    fn on_decode_data(&mut self, _data: &[u8]) -> FilterStatus {
        FilterStatus::StopIteration
    }

    fn on_decode_trailer(&mut self, _trailers: Headers) -> FilterStatus {
        FilterStatus::StopIteration
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        cluster_config, mock_proxy, route_entry, rpc_frame, MockConnectionFactory,
    };

    #[test]
    fn decode_error_closes_the_downstream() {
        let factory = Arc::new(MockConnectionFactory::default());
        let (mut proxy, downstream, _manager) = mock_proxy(
            vec![cluster_config("svc-a", &["127.0.0.1:9001"])],
            vec![route_entry("svc-a", "svc-a")],
            Arc::clone(&factory),
        );

        proxy.on_data(&[0x00, 0x01, 0x02]);

        assert_eq!(proxy.state(), ProxyState::Closed);
        assert_eq!(
            downstream.closes(),
            vec![(FlushMode::NoFlush, CloseReason::LocalClose)]
        );
        assert_eq!(factory.created(), 0);
    }

    #[test]
    fn resource_guard_is_released_exactly_once_on_double_close() {
        let factory = Arc::new(MockConnectionFactory::default());
        let (mut proxy, _downstream, manager) = mock_proxy(
            vec![cluster_config("svc-a", &["127.0.0.1:9001"])],
            vec![route_entry("svc-a", "svc-a")],
            Arc::clone(&factory),
        );

        proxy.on_data(&rpc_frame("svc-a", b"ping"));
        let resource = Arc::clone(
            manager
                .get("svc-a", None)
                .unwrap()
                .cluster_info()
                .resource_manager()
                .connections(),
        );
        assert_eq!(resource.current(), 1);

        proxy.on_downstream_event(ConnectionEvent::RemoteClose);
        assert_eq!(resource.current(), 0);

        // Redundant close paths must not double-release.
        proxy.on_upstream_event(ConnectionEvent::LocalClose);
        proxy.on_downstream_event(ConnectionEvent::RemoteClose);
        assert_eq!(resource.current(), 0);
        assert_eq!(proxy.state(), ProxyState::Closed);
    }

    #[test]
    fn partial_frames_accumulate_until_routable() {
        let factory = Arc::new(MockConnectionFactory::default());
        let (mut proxy, _downstream, _manager) = mock_proxy(
            vec![cluster_config("svc-a", &["127.0.0.1:9001"])],
            vec![route_entry("svc-a", "svc-a")],
            Arc::clone(&factory),
        );

        let frame = rpc_frame("svc-a", b"split across reads");
        let (first, second) = frame.split_at(7);

        proxy.on_data(first);
        assert_eq!(proxy.state(), ProxyState::Decoding);
        assert_eq!(factory.created(), 0);

        proxy.on_data(second);
        assert_eq!(proxy.state(), ProxyState::Connecting);
        assert_eq!(factory.created(), 1);
        assert_eq!(factory.last().written(), frame.to_vec());
    }

    #[test]
    fn session_duration_is_recorded_when_the_session_closes() {
        let factory = Arc::new(MockConnectionFactory::default());
        let (mut proxy, _downstream, _manager) = mock_proxy(
            vec![cluster_config("svc-a", &["127.0.0.1:9001"])],
            vec![route_entry("svc-a", "svc-a")],
            Arc::clone(&factory),
        );

        let before = session_duration_seconds().get_sample_count();
        proxy.on_data(&rpc_frame("svc-a", b"ping"));
        proxy.on_downstream_event(ConnectionEvent::RemoteClose);
        assert_eq!(proxy.state(), ProxyState::Closed);

        // Concurrent tests may close sessions of their own, so only a
        // lower bound is stable here.
        assert!(session_duration_seconds().get_sample_count() >= before + 1);
    }

    #[test]
    fn events_after_terminal_close_are_no_ops() {
        let factory = Arc::new(MockConnectionFactory::default());
        let (mut proxy, downstream, _manager) = mock_proxy(
            vec![cluster_config("svc-a", &["127.0.0.1:9001"])],
            vec![route_entry("svc-a", "svc-a")],
            Arc::clone(&factory),
        );

        proxy.on_data(&rpc_frame("svc-a", b"ping"));
        proxy.on_upstream_event(ConnectionEvent::OnConnect);
        proxy.on_downstream_event(ConnectionEvent::RemoteClose);
        let closes = downstream.closes().len();

        proxy.on_upstream_event(ConnectionEvent::Connected);
        proxy.on_upstream_event(ConnectionEvent::ConnectTimeout);
        proxy.on_data(b"late bytes");

        assert_eq!(downstream.closes().len(), closes);
        assert!(!proxy
            .request_info()
            .has_response_flag(ResponseFlag::UpstreamConnectionFailure));
    }
}
