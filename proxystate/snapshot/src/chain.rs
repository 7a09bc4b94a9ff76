//! Compiled discovery chains.
//!
//! A chain is a DAG rooted at `start_node`. Router nodes lead to splitter or
//! resolver nodes, splitter nodes lead to resolver nodes, and every resolver
//! names the target that traffic is ultimately sent to.

use crate::{
    duration::Timeout,
    mesh::{Locality, MeshGatewayConfig},
    or_default,
};
use ahash::AHashMap as HashMap;
use std::{collections::BTreeMap, time::Duration};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CompiledDiscoveryChain {
    pub service_name: String,
    pub namespace: String,
    pub partition: String,
    pub datacenter: String,

    /// Set when a consumer overrode compiled configuration; cluster names
    /// are qualified with it so that they never collide with the defaults.
    pub customization_hash: String,

    /// Whether the chain was compiled without any routing configuration.
    pub default: bool,
    pub protocol: String,

    pub start_node: String,
    pub nodes: HashMap<String, DiscoveryGraphNode>,
    pub targets: HashMap<String, DiscoveryTarget>,

    pub auto_virtual_ips: Vec<String>,
    pub manual_virtual_ips: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DiscoveryGraphNode {
    pub name: String,
    pub kind: NodeKind,
    pub load_balancer: Option<LoadBalancer>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeKind {
    /// Routes in the order they are evaluated.
    Router(Vec<DiscoveryRoute>),
    Splitter(Vec<DiscoverySplit>),
    Resolver(DiscoveryResolver),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoveryRoute {
    pub definition: ServiceRoute,
    pub next_node: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceRoute {
    pub r#match: Option<ServiceRouteMatch>,
    pub destination: Option<ServiceRouteDestination>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceRouteMatch {
    pub http: Option<ServiceRouteHttpMatch>,
}

/// At most one of the path fields is set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceRouteHttpMatch {
    pub path_exact: String,
    pub path_prefix: String,
    pub path_regex: String,
    pub header: Vec<ServiceRouteHttpMatchHeader>,
    pub query_param: Vec<ServiceRouteHttpMatchQueryParam>,
    pub methods: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceRouteHttpMatchHeader {
    pub name: String,
    pub present: bool,
    pub exact: String,
    pub prefix: String,
    pub suffix: String,
    pub regex: String,
    pub invert: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceRouteHttpMatchQueryParam {
    pub name: String,
    pub present: bool,
    pub exact: String,
    pub regex: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceRouteDestination {
    pub prefix_rewrite: String,
    pub request_timeout: Timeout,
    pub idle_timeout: Timeout,
    pub num_retries: u32,
    pub retry_on_connect_failure: bool,
    pub retry_on: Vec<String>,
    pub retry_on_status_codes: Vec<u32>,
    pub request_headers: Option<HttpHeaderModifiers>,
    pub response_headers: Option<HttpHeaderModifiers>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HttpHeaderModifiers {
    pub add: BTreeMap<String, String>,
    pub set: BTreeMap<String, String>,
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoverySplit {
    pub definition: ServiceSplit,
    /// Percentage with hundredths precision, e.g. `12.34`.
    pub weight: f32,
    pub next_node: String,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServiceSplit {
    pub weight: f32,
    pub request_headers: Option<HttpHeaderModifiers>,
    pub response_headers: Option<HttpHeaderModifiers>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryResolver {
    pub default: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Timeout,
    pub target: String,
    pub failover: Option<DiscoveryFailover>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryFailover {
    /// Target ids tried in order after the primary target.
    pub targets: Vec<String>,
    pub policy: Option<FailoverPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FailoverPolicy {
    /// `""`/`sequential` or `order-by-locality`.
    pub mode: String,
    pub regions: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiscoveryTarget {
    pub id: String,
    pub service: String,
    pub service_subset: String,
    pub namespace: String,
    pub partition: String,
    pub datacenter: String,
    pub peer: String,

    pub mesh_gateway: MeshGatewayConfig,
    pub subset: ServiceResolverSubset,
    pub locality: Option<Locality>,
    pub prioritize_by_locality: Option<PrioritizeByLocality>,
    pub connect_timeout: Duration,

    /// The cluster name for the target.
    pub name: String,
    pub sni: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceResolverSubset {
    pub filter: String,
    pub only_passing: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrioritizeByLocality {
    /// `none` or `failover`.
    pub mode: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancer {
    pub policy: String,
    pub ring_hash_config: Option<RingHashConfig>,
    pub least_request_config: Option<LeastRequestConfig>,
    pub hash_policies: Vec<HashPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RingHashConfig {
    pub minimum_ring_size: u64,
    pub maximum_ring_size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeastRequestConfig {
    pub choice_count: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HashPolicy {
    /// `header`, `cookie` or `query_parameter`; ignored when `source_ip`.
    pub field: String,
    pub field_value: String,
    pub cookie_config: Option<CookieConfig>,
    pub source_ip: bool,
    pub terminal: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CookieConfig {
    pub session: bool,
    pub ttl: Duration,
    pub path: String,
}

// === impl CompiledDiscoveryChain ===

impl CompiledDiscoveryChain {
    /// The target id of the chain's own service, without a subset.
    pub fn id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.service_name,
            or_default(&self.namespace),
            or_default(&self.partition),
            self.datacenter
        )
    }

    /// The service name qualified with its partition and namespace when
    /// they are not the defaults.
    pub fn compound_service_name(&self) -> String {
        let mut name = String::new();
        for tenancy in [&self.partition, &self.namespace] {
            if or_default(tenancy) != crate::DEFAULT {
                name.push_str(tenancy);
                name.push('/');
            }
        }
        name.push_str(&self.service_name);
        name
    }

    pub fn start_node(&self) -> Option<&DiscoveryGraphNode> {
        self.nodes.get(&self.start_node)
    }
}

// === impl DiscoveryGraphNode ===

impl DiscoveryGraphNode {
    pub fn resolver(&self) -> Option<&DiscoveryResolver> {
        match self.kind {
            NodeKind::Resolver(ref r) => Some(r),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            NodeKind::Router(_) => "router",
            NodeKind::Splitter(_) => "splitter",
            NodeKind::Resolver(_) => "resolver",
        }
    }
}

// === impl ServiceRouteDestination ===

impl ServiceRouteDestination {
    pub fn has_retry_features(&self) -> bool {
        self.num_retries > 0
            || self.retry_on_connect_failure
            || !self.retry_on.is_empty()
            || !self.retry_on_status_codes.is_empty()
    }
}

// === impl HttpHeaderModifiers ===

impl HttpHeaderModifiers {
    pub fn is_zero(&self) -> bool {
        self.add.is_empty() && self.set.is_empty() && self.remove.is_empty()
    }
}

// === impl DiscoveryTarget ===

impl DiscoveryTarget {
    pub fn namespace_or_default(&self) -> &str {
        or_default(&self.namespace)
    }

    pub fn partition_or_default(&self) -> &str {
        or_default(&self.partition)
    }
}

// === impl LoadBalancer ===

impl LoadBalancer {
    /// Hash policies only apply to policies that pick hosts by hash.
    pub fn is_hash_based(&self) -> bool {
        matches!(self.policy.as_str(), "ring_hash" | "maglev")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_ids_use_default_tenancy() {
        let chain = CompiledDiscoveryChain {
            service_name: "db".to_string(),
            datacenter: "dc1".to_string(),
            ..Default::default()
        };
        assert_eq!(chain.id(), "db.default.default.dc1");
        assert_eq!(chain.compound_service_name(), "db");

        let chain = CompiledDiscoveryChain {
            namespace: "billing".to_string(),
            ..chain
        };
        assert_eq!(chain.id(), "db.billing.default.dc1");
        assert_eq!(chain.compound_service_name(), "billing/db");
    }

    #[test]
    fn retry_features() {
        assert!(!ServiceRouteDestination::default().has_retry_features());
        assert!(ServiceRouteDestination {
            retry_on_connect_failure: true,
            ..Default::default()
        }
        .has_retry_features());
        assert!(ServiceRouteDestination {
            retry_on_status_codes: vec![503],
            ..Default::default()
        }
        .has_retry_features());
    }
}
