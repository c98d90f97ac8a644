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

//! The per-connection driving task.
//!
//! The proxy state machine performs no IO of its own; this task owns it
//! and serializes every callback into it: downstream reads, upstream
//! lifecycle events and upstream response data all funnel through one
//! `select!` loop, which is what guarantees the proxy's lock-free
//! single-threaded view of its own state.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::cluster::ClusterManager;
use crate::codec::ProtocolRegistry;
use crate::net::tcp::DownstreamConnection;
use crate::net::ConnectionEvent;
use crate::proxy::{active_sessions, sessions_total, RpcProxy};
use crate::router::RouterConfig;
use crate::ShutdownRx;

const READ_BUFFER_BYTES: usize = 16 * 1024;

/// Services one accepted downstream connection until the session reaches
/// its terminal state or shutdown is signalled.
pub async fn run_downstream(
    stream: TcpStream,
    router_config: Arc<RouterConfig>,
    cluster_manager: Arc<ClusterManager>,
    protocols: Arc<ProtocolRegistry>,
    mut shutdown_rx: ShutdownRx,
) {
    let local = stream.local_addr().ok();
    let peer = stream.peer_addr().ok();
    let (mut read_half, write_half) = stream.into_split();
    let downstream = DownstreamConnection::spawn(write_half, local, peer);

    let mut proxy = RpcProxy::new(
        Box::new(downstream),
        router_config,
        cluster_manager,
        protocols,
    );
    sessions_total().inc();
    active_sessions().inc();

    let mut upstream_events: Option<mpsc::UnboundedReceiver<ConnectionEvent>> = None;
    let mut upstream_data: Option<mpsc::UnboundedReceiver<Bytes>> = None;
    let mut read_buf = BytesMut::with_capacity(READ_BUFFER_BYTES);
    let mut downstream_eof = false;

    while !proxy.is_closed() {
        if downstream_eof && upstream_events.is_none() && upstream_data.is_none() {
            break;
        }

        read_buf.reserve(READ_BUFFER_BYTES);
        tokio::select! {
            result = read_half.read_buf(&mut read_buf), if !downstream_eof => {
                match result {
                    Ok(0) => {
                        downstream_eof = true;
                        proxy.on_downstream_event(ConnectionEvent::RemoteClose);
                    }
                    Ok(_) => {
                        let chunk = read_buf.split().freeze();
                        proxy.on_data(&chunk);
                        if upstream_events.is_none() {
                            if let Some((events, data)) = proxy.take_upstream_channels() {
                                upstream_events = Some(events);
                                upstream_data = Some(data);
                            }
                        }
                    }
                    Err(error) => {
                        tracing::debug!(%error, "downstream read failed");
                        downstream_eof = true;
                        proxy.on_downstream_event(ConnectionEvent::RemoteClose);
                    }
                }
            }
            event = recv_or_pending(&mut upstream_events) => {
                match event {
                    Some(event) => proxy.on_upstream_event(event),
                    None => upstream_events = None,
                }
            }
            data = recv_or_pending(&mut upstream_data) => {
                match data {
                    Some(data) => {
                        proxy.on_upstream_data(&data);
                    }
                    None => upstream_data = None,
                }
            }
            _ = shutdown_rx.changed() => {
                proxy.on_downstream_event(ConnectionEvent::LocalClose);
                break;
            }
        }
    }

    active_sessions().dec();
}

/// Awaits the receiver when present, otherwise parks the branch so the
/// other `select!` arms keep running.
async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
