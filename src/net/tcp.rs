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

//! Tokio-backed TCP connections.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::net::{
    next_connection_id, ClientConnection, CloseReason, Connection, ConnectionError,
    ConnectionEvent, ConnectionFactory, FlushMode,
};

const READ_BUFFER_BYTES: usize = 16 * 1024;

enum SocketCommand {
    Data(Bytes),
    Close(FlushMode),
}

/// Builds [`TcpClientConnection`]s. This is the production factory the
/// cluster manager is constructed with.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpConnectionFactory;

impl ConnectionFactory for TcpConnectionFactory {
    fn create_connection(
        &self,
        address: SocketAddr,
        connect_timeout: Duration,
        buffer_limit_bytes: usize,
    ) -> Box<dyn ClientConnection> {
        Box::new(TcpClientConnection::new(
            address,
            connect_timeout,
            buffer_limit_bytes,
        ))
    }
}

/// An outbound TCP connection. `connect` spawns the IO tasks; writes
/// issued beforehand queue on the command channel and flush in order once
/// the stream is established.
pub struct TcpClientConnection {
    id: u64,
    address: SocketAddr,
    connect_timeout: Duration,
    buffer_limit_bytes: usize,
    connect_called: bool,
    closed: bool,
    /// Tells an in-flight connect task to drop the stream on arrival.
    abort: Arc<AtomicBool>,
    nodelay: Arc<AtomicBool>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    cmd_tx: mpsc::UnboundedSender<SocketCommand>,
    cmd_rx: Option<mpsc::UnboundedReceiver<SocketCommand>>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    read_tx: mpsc::UnboundedSender<Bytes>,
    read_rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl TcpClientConnection {
    pub fn new(
        address: SocketAddr,
        connect_timeout: Duration,
        buffer_limit_bytes: usize,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (read_tx, read_rx) = mpsc::unbounded_channel();

        Self {
            id: next_connection_id(),
            address,
            connect_timeout,
            buffer_limit_bytes,
            connect_called: false,
            closed: false,
            abort: Arc::new(AtomicBool::new(false)),
            nodelay: Arc::new(AtomicBool::new(false)),
            local_addr: Arc::new(Mutex::new(None)),
            cmd_tx,
            cmd_rx: Some(cmd_rx),
            event_tx,
            event_rx: Some(event_rx),
            read_tx,
            read_rx: Some(read_rx),
        }
    }
}

impl Connection for TcpClientConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.address)
    }

    fn write(&mut self, buf: &[u8]) {
        if self.closed {
            tracing::debug!(id = self.id, "dropping write to closed connection");
            return;
        }
        let _ = self
            .cmd_tx
            .send(SocketCommand::Data(Bytes::copy_from_slice(buf)));
    }

    fn close(&mut self, flush: FlushMode, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(id = self.id, ?flush, ?reason, "closing upstream connection");

        if flush == FlushMode::NoFlush {
            self.abort.store(true, Ordering::Relaxed);
        }
        let _ = self.cmd_tx.send(SocketCommand::Close(flush));
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ClientConnection for TcpClientConnection {
    fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.closed {
            return Err(ConnectionError::Closed(self.id));
        }
        let cmd_rx = match self.cmd_rx.take() {
            Some(rx) if !self.connect_called => rx,
            _ => return Err(ConnectionError::AlreadyConnected(self.id)),
        };
        self.connect_called = true;

        tokio::spawn(run_client(
            self.id,
            self.address,
            self.connect_timeout,
            self.buffer_limit_bytes,
            Arc::clone(&self.nodelay),
            Arc::clone(&self.abort),
            Arc::clone(&self.local_addr),
            cmd_rx,
            self.event_tx.clone(),
            self.read_tx.clone(),
        ));

        Ok(())
    }

    fn set_nodelay(&mut self, nodelay: bool) {
        self.nodelay.store(nodelay, Ordering::Relaxed);
    }

    fn take_event_stream(&mut self) -> Option<mpsc::UnboundedReceiver<ConnectionEvent>> {
        self.event_rx.take()
    }

    fn take_read_stream(&mut self) -> Option<mpsc::UnboundedReceiver<Bytes>> {
        self.read_rx.take()
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_client(
    id: u64,
    address: SocketAddr,
    connect_timeout: Duration,
    buffer_limit_bytes: usize,
    nodelay: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    local_addr: Arc<Mutex<Option<SocketAddr>>>,
    cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    read_tx: mpsc::UnboundedSender<Bytes>,
) {
    let _ = event_tx.send(ConnectionEvent::OnConnect);

    let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(address)).await {
        Err(_) => {
            tracing::debug!(id, %address, "upstream connect timed out");
            let _ = event_tx.send(ConnectionEvent::ConnectTimeout);
            return;
        }
        Ok(Err(error)) => {
            tracing::debug!(id, %address, %error, "upstream connect failed");
            let _ = event_tx.send(ConnectionEvent::RemoteClose);
            return;
        }
        Ok(Ok(stream)) => stream,
    };

    if abort.load(Ordering::Relaxed) {
        let _ = event_tx.send(ConnectionEvent::LocalClose);
        return;
    }

    if nodelay.load(Ordering::Relaxed) {
        let _ = stream.set_nodelay(true);
    }
    *local_addr.lock() = stream.local_addr().ok();
    let _ = event_tx.send(ConnectionEvent::Connected);

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(write_loop(write_half, cmd_rx, Some(event_tx.clone())));
    read_loop(read_half, buffer_limit_bytes, read_tx, event_tx).await;
}

async fn write_loop(
    mut write_half: OwnedWriteHalf,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCommand>,
    event_tx: Option<mpsc::UnboundedSender<ConnectionEvent>>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            SocketCommand::Data(buf) => {
                // Write failures surface as a close on the read side.
                if write_half.write_all(&buf).await.is_err() {
                    return;
                }
            }
            SocketCommand::Close(flush) => {
                // Queued data was already drained in command order, so a
                // flushing close only needs the shutdown handshake.
                if flush == FlushMode::FlushWrite {
                    let _ = write_half.shutdown().await;
                }
                if let Some(event_tx) = &event_tx {
                    let _ = event_tx.send(ConnectionEvent::LocalClose);
                }
                return;
            }
        }
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    buffer_limit_bytes: usize,
    read_tx: mpsc::UnboundedSender<Bytes>,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let chunk_bytes = buffer_limit_bytes.clamp(1, READ_BUFFER_BYTES);
    let mut buf = BytesMut::with_capacity(chunk_bytes);
    loop {
        buf.reserve(chunk_bytes);
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = event_tx.send(ConnectionEvent::RemoteClose);
                return;
            }
            Ok(_) => {
                if read_tx.send(buf.split().freeze()).is_err() {
                    return;
                }
            }
            Err(error) => {
                tracing::debug!(%error, "upstream read failed");
                let _ = event_tx.send(ConnectionEvent::RemoteClose);
                return;
            }
        }
    }
}

/// The write side of an accepted downstream socket. The driving task
/// keeps the read half; remote closure is observed there rather than via
/// an event stream.
pub struct DownstreamConnection {
    id: u64,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    closed: bool,
    cmd_tx: mpsc::UnboundedSender<SocketCommand>,
}

impl DownstreamConnection {
    pub fn spawn(write_half: OwnedWriteHalf, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(write_half, cmd_rx, None));

        Self {
            id: next_connection_id(),
            local,
            remote,
            closed: false,
            cmd_tx,
        }
    }
}

impl Connection for DownstreamConnection {
    fn id(&self) -> u64 {
        self.id
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    fn write(&mut self, buf: &[u8]) {
        if self.closed {
            return;
        }
        let _ = self
            .cmd_tx
            .send(SocketCommand::Data(Bytes::copy_from_slice(buf)));
    }

    fn close(&mut self, flush: FlushMode, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        tracing::debug!(id = self.id, ?flush, ?reason, "closing downstream connection");
        let _ = self.cmd_tx.send(SocketCommand::Close(flush));
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[tokio::test]
    async fn connect_emits_events_and_flushes_queued_writes_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            socket.read_to_end(&mut buf).await.unwrap();
            buf
        });

        let mut conn = TcpClientConnection::new(addr, Duration::from_secs(5), READ_BUFFER_BYTES);
        let mut events = conn.take_event_stream().unwrap();
        conn.connect().unwrap();
        // Queued before the stream exists; flushed once it is.
        conn.write(b"hello ");
        conn.write(b"world");

        assert_eq!(events.recv().await, Some(ConnectionEvent::OnConnect));
        assert_eq!(events.recv().await, Some(ConnectionEvent::Connected));

        conn.close(FlushMode::FlushWrite, CloseReason::LocalClose);
        assert_eq!(events.recv().await, Some(ConnectionEvent::LocalClose));

        let received = timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn refused_connect_surfaces_as_remote_close_while_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut conn = TcpClientConnection::new(addr, Duration::from_secs(5), READ_BUFFER_BYTES);
        let mut events = conn.take_event_stream().unwrap();
        conn.connect().unwrap();

        assert_eq!(events.recv().await, Some(ConnectionEvent::OnConnect));
        assert_eq!(events.recv().await, Some(ConnectionEvent::RemoteClose));
    }

    #[tokio::test]
    async fn connect_is_single_shot() {
        let mut conn = TcpClientConnection::new(
            "127.0.0.1:9".parse().unwrap(),
            Duration::from_millis(50),
            READ_BUFFER_BYTES,
        );
        conn.connect().unwrap();
        assert!(matches!(
            conn.connect(),
            Err(ConnectionError::AlreadyConnected(_))
        ));

        conn.close(FlushMode::NoFlush, CloseReason::LocalClose);
        assert!(conn.is_closed());
    }
}
