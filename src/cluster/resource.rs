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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::ResourceLimitsConfig;

/// A bounded counter guarding one per-cluster limit.
///
/// `current <= max` holds at every observable point: `try_increase` only
/// increments below the ceiling, so the check-then-increment pair stays
/// linearizable under contention without a lock.
#[derive(Debug)]
pub struct Resource {
    current: AtomicU64,
    max: u64,
}

impl Resource {
    pub fn new(max: u64) -> Arc<Self> {
        Arc::new(Self {
            current: AtomicU64::new(0),
            max,
        })
    }

    /// Cheap advisory check. A `true` answer can go stale before a
    /// following `try_increase`; callers must still handle its failure.
    pub fn can_create(&self) -> bool {
        self.current.load(Ordering::Acquire) < self.max
    }

    /// Increments the counter unless it is at the ceiling. Returns
    /// whether the slot was taken.
    pub fn try_increase(&self) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max).then(|| current + 1)
            })
            .is_ok()
    }

    pub fn decrease(&self) {
        let underflow = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_err();

        if underflow {
            tracing::warn!("resource decreased below zero, ignoring");
        }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Takes one slot and ties its release to the returned guard.
    pub fn acquire(self: &Arc<Self>) -> Option<ResourceGuard> {
        self.try_increase().then(|| ResourceGuard {
            resource: Arc::clone(self),
        })
    }
}

/// Holds one acquired slot of a [`Resource`]; dropping the guard releases
/// it exactly once.
#[derive(Debug)]
pub struct ResourceGuard {
    resource: Arc<Resource>,
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.resource.decrease();
    }
}

/// Groups the per-cluster resources: upstream connections, pending
/// requests and in-flight requests.
#[derive(Debug)]
pub struct ResourceManager {
    connections: Arc<Resource>,
    pending_requests: Arc<Resource>,
    requests: Arc<Resource>,
}

impl ResourceManager {
    pub fn new(limits: &ResourceLimitsConfig) -> Self {
        Self {
            connections: Resource::new(limits.max_connections),
            pending_requests: Resource::new(limits.max_pending_requests),
            requests: Resource::new(limits.max_requests),
        }
    }

    pub fn connections(&self) -> &Arc<Resource> {
        &self.connections
    }

    pub fn pending_requests(&self) -> &Arc<Resource> {
        &self.pending_requests
    }

    pub fn requests(&self) -> &Arc<Resource> {
        &self.requests
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_within_the_ceiling_under_contention() {
        let resource = Resource::new(8);
        let mut handles = Vec::new();

        for _ in 0..16 {
            let resource = Arc::clone(&resource);
            handles.push(std::thread::spawn(move || {
                let mut acquired = 0;
                for _ in 0..1_000 {
                    if resource.try_increase() {
                        assert!(resource.current() <= resource.max());
                        acquired += 1;
                        if acquired % 2 == 0 {
                            resource.decrease();
                            acquired -= 1;
                        }
                    }
                }
                for _ in 0..acquired {
                    resource.decrease();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(resource.current(), 0);
    }

    #[test]
    fn try_increase_fails_at_the_ceiling() {
        let resource = Resource::new(1);
        assert!(resource.can_create());
        assert!(resource.try_increase());
        assert!(!resource.can_create());
        assert!(!resource.try_increase());
        assert_eq!(resource.current(), 1);

        resource.decrease();
        assert!(resource.can_create());
    }

    #[test]
    fn guard_releases_exactly_once() {
        let resource = Resource::new(2);
        let guard = resource.acquire().unwrap();
        assert_eq!(resource.current(), 1);
        drop(guard);
        assert_eq!(resource.current(), 0);
    }

    #[test]
    fn decrease_below_zero_is_ignored() {
        let resource = Resource::new(1);
        resource.decrease();
        assert_eq!(resource.current(), 0);
    }

    #[test]
    fn zero_max_never_admits() {
        let resource = Resource::new(0);
        assert!(!resource.can_create());
        assert!(resource.acquire().is_none());
    }
}
