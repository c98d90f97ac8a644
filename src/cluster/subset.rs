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

//! Metadata subset selection support for the load balancer.

use std::collections::BTreeMap;

use crate::config::{LbSubsetConfig, SubsetFallbackPolicy};

/// A deduplicated, lexicographically ordered set of strings. One instance
/// describes one selector key-group.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SortedStringSet {
    keys: Vec<String>,
}

impl SortedStringSet {
    pub fn new(input: impl IntoIterator<Item = String>) -> Self {
        let mut keys: Vec<String> = input.into_iter().collect();
        keys.sort();
        keys.dedup();
        Self { keys }
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Key/value metadata with keys enumerated in lexicographic order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SortedMetadata {
    entries: Vec<(String, String)>,
}

impl SortedMetadata {
    pub fn new(input: impl IntoIterator<Item = (String, String)>) -> Self {
        // A BTreeMap gives sorted keys and last-entry-wins dedup.
        let map: BTreeMap<String, String> = input.into_iter().collect();
        Self {
            entries: map.into_iter().collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|index| self.entries[index].1.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether every entry of `other` is present in `self` with the same
    /// value.
    pub fn is_superset_of(&self, other: &SortedMetadata) -> bool {
        other.iter().all(|(key, value)| self.get(key) == Some(value))
    }
}

impl From<&BTreeMap<String, String>> for SortedMetadata {
    fn from(map: &BTreeMap<String, String>) -> Self {
        Self::new(map.iter().map(|(k, v)| (k.clone(), v.clone())))
    }
}

/// Subset selection policy of one cluster.
#[derive(Clone, Debug, Default)]
pub struct LbSubsetInfo {
    enabled: bool,
    fallback_policy: SubsetFallbackPolicy,
    default_subset: SortedMetadata,
    subset_keys: Vec<SortedStringSet>,
}

impl LbSubsetInfo {
    pub fn new(config: Option<&LbSubsetConfig>) -> Self {
        match config {
            None => Self::default(),
            Some(config) => Self {
                enabled: true,
                fallback_policy: config.fallback_policy,
                default_subset: SortedMetadata::from(&config.default_subset),
                subset_keys: config
                    .subset_keys
                    .iter()
                    .map(|group| SortedStringSet::new(group.iter().cloned()))
                    .collect(),
            },
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn fallback_policy(&self) -> SubsetFallbackPolicy {
        self.fallback_policy
    }

    pub fn default_subset(&self) -> &SortedMetadata {
        &self.default_subset
    }

    pub fn subset_keys(&self) -> &[SortedStringSet] {
        &self.subset_keys
    }
}
