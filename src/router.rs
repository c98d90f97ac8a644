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

//! Header-based route selection.

use std::time::Duration;

use crate::cluster::subset::SortedMetadata;
use crate::codec::Headers;
use crate::config::RouteEntryConfig;

/// The frame header the stock routes match the target service on.
pub const SERVICE_KEY: &str = "service";

/// The route table: rules are scanned in declared order, first full
/// header match wins.
pub struct RouterConfig {
    routes: Vec<Route>,
}

impl RouterConfig {
    pub fn new(entries: &[RouteEntryConfig]) -> Self {
        Self {
            routes: entries.iter().map(Route::new).collect(),
        }
    }

    pub fn route(&self, headers: &Headers) -> Option<&Route> {
        self.routes.iter().find(|route| route.matches(headers))
    }
}

/// One matched route.
pub struct Route {
    header_matches: Vec<(String, String)>,
    rule: RouteRule,
}

impl Route {
    fn new(config: &RouteEntryConfig) -> Self {
        Self {
            header_matches: config
                .matcher
                .headers
                .iter()
                .map(|header| (header.name.clone(), header.value.clone()))
                .collect(),
            rule: RouteRule {
                cluster_name: config.route.cluster.clone(),
                metadata_match: config
                    .route
                    .metadata_match
                    .as_ref()
                    .map(SortedMetadata::from),
                timeout: config.route.timeout_ms.map(Duration::from_millis),
            },
        }
    }

    fn matches(&self, headers: &Headers) -> bool {
        self.header_matches
            .iter()
            .all(|(name, value)| headers.get(name) == Some(value))
    }

    pub fn route_rule(&self) -> &RouteRule {
        &self.rule
    }
}

/// Where a matched request goes.
pub struct RouteRule {
    cluster_name: String,
    metadata_match: Option<SortedMetadata>,
    timeout: Option<Duration>,
}

impl RouteRule {
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Metadata the load balancer's subset selector matches hosts
    /// against.
    pub fn metadata_match(&self) -> Option<&SortedMetadata> {
        self.metadata_match.as_ref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeaderMatchConfig, RouteActionConfig, RouteMatchConfig};

    fn entry(service: &str, cluster: &str) -> RouteEntryConfig {
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

    fn headers(service: &str) -> Headers {
        Headers::from([(SERVICE_KEY.to_string(), service.to_string())])
    }

    #[test]
    fn first_match_wins() {
        let mut catch_all = entry("svc-a", "cluster-late");
        catch_all.matcher.headers.clear();

        let router = RouterConfig::new(&[
            entry("svc-a", "cluster-a"),
            entry("svc-b", "cluster-b"),
            catch_all,
        ]);

        let route = router.route(&headers("svc-a")).unwrap();
        assert_eq!(route.route_rule().cluster_name(), "cluster-a");

        let route = router.route(&headers("svc-b")).unwrap();
        assert_eq!(route.route_rule().cluster_name(), "cluster-b");

        // An empty matcher matches everything left over.
        let route = router.route(&headers("svc-z")).unwrap();
        assert_eq!(route.route_rule().cluster_name(), "cluster-late");
    }

    #[test]
    fn miss_returns_none() {
        let router = RouterConfig::new(&[entry("svc-a", "cluster-a")]);
        assert!(router.route(&headers("unknown")).is_none());
        assert!(router.route(&Headers::new()).is_none());
    }

    #[test]
    fn all_declared_headers_must_match() {
        let mut config = entry("svc-a", "cluster-a");
        config.matcher.headers.push(HeaderMatchConfig {
            name: "caller".into(),
            value: "edge".into(),
        });
        let router = RouterConfig::new(&[config]);

        assert!(router.route(&headers("svc-a")).is_none());

        let mut full = headers("svc-a");
        full.insert("caller".into(), "edge".into());
        assert!(router.route(&full).is_some());
    }

    #[test]
    fn metadata_match_reaches_the_rule() {
        let mut config = entry("svc-a", "cluster-a");
        config.route.metadata_match =
            Some([("stage".to_string(), "prod".to_string())].into());
        config.route.timeout_ms = Some(1_500);
        let router = RouterConfig::new(&[config]);

        let rule = router.route(&headers("svc-a")).unwrap().route_rule();
        assert_eq!(rule.metadata_match().unwrap().get("stage"), Some("prod"));
        assert_eq!(rule.timeout(), Some(Duration::from_millis(1_500)));
    }
}
