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

//! Reusable upstream connection pools.
//!
//! One pool exists per `(cluster, protocol, host)` triple, created lazily
//! and shared across proxies. The relay path does not use pools; they
//! serve the request/response protocols that can reuse a connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::cluster::Host;
use crate::net::{ClientConnection, CloseReason, ConnectionFactory, FlushMode};

/// Upstream protocol a pool serves.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Protocol {
    Http1,
    BinaryRpc,
}

/// A checked-out pooled connection.
pub struct PooledConnection {
    pub connection: Box<dyn ClientConnection>,
    pub host: Arc<Host>,
    requests_served: u32,
}

impl PooledConnection {
    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }
}

pub struct ConnectionPool {
    protocol: Protocol,
    host: Arc<Host>,
    connect_timeout: Duration,
    buffer_limit_bytes: usize,
    /// Zero means a connection may serve any number of requests.
    max_requests_per_connection: u32,
    factory: Arc<dyn ConnectionFactory>,
    idle: Mutex<Vec<PooledConnection>>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub(crate) fn new(
        protocol: Protocol,
        host: Arc<Host>,
        connect_timeout: Duration,
        buffer_limit_bytes: usize,
        max_requests_per_connection: u32,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        Self {
            protocol,
            host,
            connect_timeout,
            buffer_limit_bytes,
            max_requests_per_connection,
            factory,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Checks a connection out, reusing an idle one when available. A
    /// freshly created connection has not been `connect`ed yet.
    pub fn fetch_connection(&self) -> Option<PooledConnection> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        if let Some(pooled) = self.idle.lock().pop() {
            return Some(pooled);
        }

        Some(PooledConnection {
            connection: self.host.create_connection(
                &*self.factory,
                self.connect_timeout,
                self.buffer_limit_bytes,
            ),
            host: Arc::clone(&self.host),
            requests_served: 0,
        })
    }

    /// Returns a connection after one served request. Connections that
    /// reached their request ceiling, or arrive after shutdown, are
    /// closed instead of re-pooled.
    pub fn release(&self, mut pooled: PooledConnection) {
        pooled.requests_served += 1;

        let exhausted = self.max_requests_per_connection > 0
            && pooled.requests_served >= self.max_requests_per_connection;
        if exhausted || self.closed.load(Ordering::Acquire) {
            pooled
                .connection
                .close(FlushMode::NoFlush, CloseReason::LocalClose);
            return;
        }

        self.idle.lock().push(pooled);
    }

    pub fn close_all(&self) {
        self.closed.store(true, Ordering::Release);
        for mut pooled in self.idle.lock().drain(..) {
            pooled
                .connection
                .close(FlushMode::NoFlush, CloseReason::LocalClose);
        }
    }

    #[cfg(test)]
    pub(crate) fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use crate::test_utils::MockConnectionFactory;

    fn pool(max_requests: u32) -> (ConnectionPool, Arc<MockConnectionFactory>) {
        let factory = Arc::new(MockConnectionFactory::default());
        let host = Arc::new(Host::new(
            "svc-test",
            &HostConfig::new("127.0.0.1:9000".parse().unwrap()),
        ));
        let pool = ConnectionPool::new(
            Protocol::BinaryRpc,
            host,
            Duration::from_millis(100),
            16 * 1024,
            max_requests,
            Arc::clone(&factory) as Arc<dyn ConnectionFactory>,
        );
        (pool, factory)
    }

    #[test]
    fn released_connections_are_reused() {
        let (pool, factory) = pool(0);

        let first = pool.fetch_connection().unwrap();
        let id = first.connection.id();
        pool.release(first);
        assert_eq!(pool.idle_len(), 1);

        let again = pool.fetch_connection().unwrap();
        assert_eq!(again.connection.id(), id);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn exhausted_connections_are_discarded() {
        let (pool, factory) = pool(1);

        let first = pool.fetch_connection().unwrap();
        pool.release(first);
        assert_eq!(pool.idle_len(), 0);

        let _second = pool.fetch_connection().unwrap();
        assert_eq!(factory.created(), 2);
    }

    #[test]
    fn close_all_drains_and_rejects() {
        let (pool, _factory) = pool(0);
        let out = pool.fetch_connection().unwrap();
        pool.release(out);

        pool.close_all();
        assert_eq!(pool.idle_len(), 0);
        assert!(pool.fetch_connection().is_none());
        // Idempotent.
        pool.close_all();
    }
}
