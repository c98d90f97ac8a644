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

//! Common utilities for testing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::cluster::ClusterManager;
use crate::codec::{frame, Headers, ProtocolRegistry};
use crate::config::{
    ClusterConfig, HeaderMatchConfig, HostConfig, RouteActionConfig, RouteEntryConfig,
    RouteMatchConfig,
};
use crate::net::{
    next_connection_id, ClientConnection, CloseReason, Connection, ConnectionError,
    ConnectionEvent, ConnectionFactory, FlushMode,
};
use crate::proxy::RpcProxy;
use crate::router::{RouterConfig, SERVICE_KEY};

#[derive(Default)]
struct RecordedIo {
    written: Vec<u8>,
    closes: Vec<(FlushMode, CloseReason)>,
    connect_called: bool,
    nodelay: bool,
}

/// An in-memory downstream connection that records what the proxy does
/// to it.
pub struct MockConnection {
    id: u64,
    local: SocketAddr,
    remote: SocketAddr,
    state: Arc<Mutex<RecordedIo>>,
}

/// Assertion handle kept by the test after the connection has moved into
/// the proxy.
#[derive(Clone)]
pub struct MockConnectionHandle {
    state: Arc<Mutex<RecordedIo>>,
}

impl MockConnection {
    pub fn new() -> (Self, MockConnectionHandle) {
        let state = Arc::new(Mutex::new(RecordedIo::default()));
        let connection = Self {
            id: next_connection_id(),
            local: "127.0.0.1:7720".parse().unwrap(),
            remote: "127.0.0.1:40001".parse().unwrap(),
            state: Arc::clone(&state),
        };
        (connection, MockConnectionHandle { state })
    }
}

impl Connection for MockConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.local)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn write(&mut self, buf: &[u8]) {
        self.state.lock().written.extend_from_slice(buf);
    }

    fn close(&mut self, flush: FlushMode, reason: CloseReason) {
        self.state.lock().closes.push((flush, reason));
    }

    fn is_closed(&self) -> bool {
        !self.state.lock().closes.is_empty()
    }
}

impl MockConnectionHandle {
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn closes(&self) -> Vec<(FlushMode, CloseReason)> {
        self.state.lock().closes.clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.state.lock().closes.is_empty()
    }
}

/// An in-memory upstream client connection. The paired
/// [`MockClientHandle`] records proxy-side effects and injects events and
/// response data.
pub struct MockClientConnection {
    id: u64,
    address: SocketAddr,
    state: Arc<Mutex<RecordedIo>>,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    read_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

#[derive(Clone)]
pub struct MockClientHandle {
    pub id: u64,
    pub address: SocketAddr,
    state: Arc<Mutex<RecordedIo>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    read_tx: mpsc::UnboundedSender<Bytes>,
}

impl MockClientConnection {
    pub fn new(address: SocketAddr) -> (Self, MockClientHandle) {
        let state = Arc::new(Mutex::new(RecordedIo::default()));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let id = next_connection_id();

        let connection = Self {
            id,
            address,
            state: Arc::clone(&state),
            event_rx: Some(event_rx),
            read_rx: Some(read_rx),
        };
        let handle = MockClientHandle {
            id,
            address,
            state,
            event_tx,
            read_tx,
        };
        (connection, handle)
    }
}

impl Connection for MockClientConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.address)
    }

    fn write(&mut self, buf: &[u8]) {
        self.state.lock().written.extend_from_slice(buf);
    }

    fn close(&mut self, flush: FlushMode, reason: CloseReason) {
        self.state.lock().closes.push((flush, reason));
    }

    fn is_closed(&self) -> bool {
        !self.state.lock().closes.is_empty()
    }
}

impl ClientConnection for MockClientConnection {
    fn connect(&mut self) -> Result<(), ConnectionError> {
        let mut state = self.state.lock();
        if state.connect_called {
            return Err(ConnectionError::AlreadyConnected(self.id));
        }
        state.connect_called = true;
        Ok(())
    }

    fn set_nodelay(&mut self, nodelay: bool) {
        self.state.lock().nodelay = nodelay;
    }

    fn take_event_stream(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    fn take_read_stream(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.read_rx.take()
    }
}

impl MockClientHandle {
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().written.clone()
    }

    pub fn closes(&self) -> Vec<(FlushMode, CloseReason)> {
        self.state.lock().closes.clone()
    }

    pub fn connect_called(&self) -> bool {
        self.state.lock().connect_called
    }

    pub fn nodelay(&self) -> bool {
        self.state.lock().nodelay
    }

    pub fn send_event(&self, event: ConnectionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub fn send_data(&self, data: &[u8]) {
        let _ = self.read_tx.send(Bytes::copy_from_slice(data));
    }
}

/// Connection factory handing out [`MockClientConnection`]s and keeping a
/// handle to every connection it created.
#[derive(Default)]
pub struct MockConnectionFactory {
    handles: Mutex<Vec<MockClientHandle>>,
}

impl MockConnectionFactory {
    pub fn created(&self) -> usize {
        self.handles.lock().len()
    }

    /// The most recently created connection's handle.
    pub fn last(&self) -> MockClientHandle {
        self.handles
            .lock()
            .last()
            .expect("no connection has been created")
            .clone()
    }
}

impl ConnectionFactory for MockConnectionFactory {
    fn create_connection(
        &self,
        address: SocketAddr,
        _connect_timeout: Duration,
        _buffer_limit_bytes: usize,
    ) -> Box<dyn ClientConnection> {
        let (connection, handle) = MockClientConnection::new(address);
        self.handles.lock().push(handle);
        Box::new(connection)
    }
}

/// A cluster config with the given static hosts at priority zero.
pub fn cluster_config(name: &str, addresses: &[&str]) -> ClusterConfig {
    let mut config = ClusterConfig::new(name);
    config.hosts = addresses
        .iter()
        .map(|address| HostConfig::new(address.parse().unwrap()))
        .collect();
    config
}

/// A route sending `service` to `cluster`.
pub fn route_entry(service: &str, cluster: &str) -> RouteEntryConfig {
    RouteEntryConfig {
        matcher: RouteMatchConfig {
            headers: vec![HeaderMatchConfig {
                name: SERVICE_KEY.into(),
                value: service.into(),
            }],
        },
        route: RouteActionConfig {
            cluster: cluster.into(),
            metadata_match: None,
            timeout_ms: None,
        },
    }
}

/// One encoded RPC frame addressed at `service`.
pub fn rpc_frame(service: &str, body: &[u8]) -> Bytes {
    let headers = Headers::from([(SERVICE_KEY.to_string(), service.to_string())]);
    frame::encode_frame(&headers, body, None)
}

/// A proxy over a mock downstream connection, backed by a cluster
/// manager built from `clusters` and the given connection factory.
pub fn mock_proxy(
    clusters: Vec<ClusterConfig>,
    routes: Vec<RouteEntryConfig>,
    factory: Arc<MockConnectionFactory>,
) -> (RpcProxy, MockConnectionHandle, Arc<ClusterManager>) {
    let manager = ClusterManager::new(factory);
    for cluster in clusters {
        manager.add_or_update_primary_cluster(cluster);
    }

    let router_config = Arc::new(RouterConfig::new(&routes));
    let protocols = Arc::new(ProtocolRegistry::default_protocols());
    let (downstream, handle) = MockConnection::new();
    let proxy = RpcProxy::new(
        Box::new(downstream),
        router_config,
        Arc::clone(&manager),
        protocols,
    );

    (proxy, handle, manager)
}
