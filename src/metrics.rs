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

use prometheus::core::Collector;
use prometheus::{HistogramOpts, Opts, Registry, DEFAULT_BUCKETS};

pub use prometheus::Result;

pub(crate) const NAMESPACE: &str = "palisade";

/// Label used to partition counters by transfer direction
/// (downstream→upstream is `read`, upstream→downstream is `write`).
pub(crate) const DIRECTION_LABEL: &str = "direction";
pub(crate) const READ_DIRECTION: &str = "read";
pub(crate) const WRITE_DIRECTION: &str = "write";

pub fn opts(name: &str, subsystem: &str, description: &str) -> Opts {
    Opts::new(name, description)
        .namespace(NAMESPACE)
        .subsystem(subsystem)
}

pub fn histogram_opts(
    name: &str,
    subsystem: &str,
    description: &str,
    buckets: Option<Vec<f64>>,
) -> HistogramOpts {
    HistogramOpts {
        common_opts: opts(name, subsystem, description),
        buckets: buckets.unwrap_or_else(|| Vec::from(DEFAULT_BUCKETS as &'static [f64])),
    }
}

/// Registers the collector against the default registry, treating
/// "already registered" as success so that lazily-initialised statics
/// behave across tests and hot paths.
pub trait CollectorExt: Collector + Clone + Sized + 'static {
    fn register_if_not_exists(self) -> Result<Self> {
        self.register_in(prometheus::default_registry())
    }

    fn register_in(self, registry: &Registry) -> Result<Self> {
        match registry.register(Box::new(self.clone())) {
            Ok(_) | Err(prometheus::Error::AlreadyReg) => Ok(self),
            Err(prometheus::Error::Msg(msg)) if msg.contains("already exists") => Ok(self),
            Err(err) => Err(err),
        }
    }
}

impl<C: Collector + Clone + 'static> CollectorExt for C {}
