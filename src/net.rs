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

//! Connection abstractions the proxy core is driven by.
//!
//! The IO runtime owns the sockets and dispatches reads and lifecycle
//! events into the proxy; the proxy talks back through the [`Connection`]
//! and [`ClientConnection`] traits. Connect completion is asynchronous:
//! `connect` returns immediately and the outcome arrives later as a
//! [`ConnectionEvent`].

pub mod tcp;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Lifecycle events raised by a connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionEvent {
    /// The connection has started connecting.
    OnConnect,
    /// The transport handshake completed.
    Connected,
    /// The connect attempt outlived the configured deadline.
    ConnectTimeout,
    /// The peer closed the connection.
    RemoteClose,
    /// The connection was closed locally.
    LocalClose,
    ReadTimeout,
    WriteTimeout,
}

impl ConnectionEvent {
    pub fn is_close(self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout | Self::RemoteClose | Self::LocalClose
        )
    }
}

/// Whether pending write data is flushed before the socket is torn down.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlushMode {
    NoFlush,
    FlushWrite,
}

/// Which side initiated a close.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    LocalClose,
    RemoteClose,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("connection {0} is already connecting or connected")]
    AlreadyConnected(u64),
    #[error("connection {0} is closed")]
    Closed(u64),
}

/// A writable transport endpoint.
pub trait Connection: Send {
    fn id(&self) -> u64;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Queues `buf` for transmission. Writes issued before the transport
    /// is established are buffered and flushed in order once it is.
    fn write(&mut self, buf: &[u8]);

    fn close(&mut self, flush: FlushMode, reason: CloseReason);

    /// Whether a local close has been issued. Remote closure is reported
    /// through [`ConnectionEvent`]s instead.
    fn is_closed(&self) -> bool;
}

/// An outbound connection whose establishment the caller initiates.
pub trait ClientConnection: Connection {
    /// Starts connecting. Non-blocking: completion arrives as
    /// [`ConnectionEvent::Connected`] or a failure event on the event
    /// stream.
    fn connect(&mut self) -> Result<(), ConnectionError>;

    fn set_nodelay(&mut self, nodelay: bool);

    /// Hands the lifecycle event stream to the driving task. Yields
    /// `Some` exactly once.
    fn take_event_stream(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>>;

    /// Hands the inbound data stream to the driving task. Yields `Some`
    /// exactly once.
    fn take_read_stream(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>>;
}

/// Builds client connections for upstream hosts. The seam exists so the
/// cluster manager can be exercised without real sockets.
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(
        &self,
        address: SocketAddr,
        connect_timeout: std::time::Duration,
        buffer_limit_bytes: usize,
    ) -> Box<dyn ClientConnection>;
}

static CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id, used only for log correlation.
pub(crate) fn next_connection_id() -> u64 {
    CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}
