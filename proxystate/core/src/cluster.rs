use crate::tls::TransportSocket;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub group: ClusterGroup,
    pub alt_stat_name: Option<String>,
    pub protocol: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClusterGroup {
    EndpointGroup(EndpointGroup),
    Failover(FailoverGroup),
}

/// An ordered list of endpoint groups; traffic moves to the next group once
/// the current one has no healthy endpoints.
#[derive(Clone, Debug, PartialEq)]
pub struct FailoverGroup {
    pub endpoint_groups: Vec<FailoverTarget>,
    pub connect_timeout: Duration,
}

/// One member of a failover group, named after the cluster its endpoints are
/// stored under.
#[derive(Clone, Debug, PartialEq)]
pub struct FailoverTarget {
    pub name: String,
    pub group: EndpointGroup,
}

#[derive(Clone, Debug, PartialEq)]
pub enum EndpointGroup {
    Dynamic(DynamicEndpointGroup),
    Static(StaticEndpointGroup),
    Dns(DnsEndpointGroup),
    Passthrough(PassthroughEndpointGroup),
}

/// Endpoints are discovered separately and referenced by cluster name.
#[derive(Clone, Debug, PartialEq)]
pub struct DynamicEndpointGroup {
    pub config: DynamicEndpointGroupConfig,
    pub outbound_tls: Option<TransportSocket>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DynamicEndpointGroupConfig {
    pub connect_timeout: Duration,
    pub disable_panic_threshold: bool,
    pub use_alt_stat_name: bool,
    pub circuit_breakers: Option<UpstreamLimits>,
    pub outlier_detection: Option<OutlierDetection>,
    pub lb_policy: Option<LbPolicy>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct StaticEndpointGroup {
    pub connect_timeout: Duration,
    pub circuit_breakers: Option<UpstreamLimits>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DnsEndpointGroup {
    pub config: DnsEndpointGroupConfig,
    pub outbound_tls: Option<TransportSocket>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DnsEndpointGroupConfig {
    pub connect_timeout: Duration,
    pub disable_panic_threshold: bool,
    pub use_alt_stat_name: bool,
    pub circuit_breakers: Option<UpstreamLimits>,
    pub outlier_detection: Option<OutlierDetection>,
    pub discovery_type: DiscoveryType,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DiscoveryType {
    #[default]
    Logical,
    Strict,
}

/// Forwards to the original destination address of a redirected connection.
#[derive(Clone, Debug, PartialEq)]
pub struct PassthroughEndpointGroup {
    pub connect_timeout: Duration,
    pub outbound_tls: Option<TransportSocket>,
}

/// Unset limits fall back to the data plane's defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpstreamLimits {
    pub max_connections: Option<u32>,
    pub max_pending_requests: Option<u32>,
    pub max_concurrent_requests: Option<u32>,
}

/// Passive health checking. An empty value enables it with defaults.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutlierDetection {
    pub interval: Option<Duration>,
    pub consecutive_5xx: Option<u32>,
    pub enforcing_consecutive_5xx: Option<u32>,
    pub max_ejection_percent: Option<u32>,
    pub base_ejection_time: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LbPolicy {
    LeastRequest { choice_count: Option<u32> },
    RoundRobin,
    Random,
    RingHash {
        minimum_ring_size: Option<u64>,
        maximum_ring_size: Option<u64>,
    },
    Maglev,
}

// === impl Cluster ===

impl Cluster {
    pub fn endpoint_group(group: EndpointGroup) -> Self {
        Self {
            group: ClusterGroup::EndpointGroup(group),
            alt_stat_name: None,
            protocol: None,
        }
    }

    pub fn failover(group: FailoverGroup) -> Self {
        Self {
            group: ClusterGroup::Failover(group),
            alt_stat_name: None,
            protocol: None,
        }
    }

    pub fn with_alt_stat_name(mut self, name: impl ToString) -> Self {
        self.alt_stat_name = Some(name.to_string());
        self
    }

    pub fn with_protocol(mut self, protocol: impl ToString) -> Self {
        self.protocol = Some(protocol.to_string());
        self
    }

    /// The outbound TLS settings of a single endpoint group cluster.
    pub fn outbound_tls(&self) -> Option<&TransportSocket> {
        match self.group {
            ClusterGroup::EndpointGroup(ref group) => group.outbound_tls(),
            ClusterGroup::Failover(_) => None,
        }
    }
}

// === impl EndpointGroup ===

impl EndpointGroup {
    pub fn outbound_tls(&self) -> Option<&TransportSocket> {
        match self {
            Self::Dynamic(group) => group.outbound_tls.as_ref(),
            Self::Dns(group) => group.outbound_tls.as_ref(),
            Self::Passthrough(group) => group.outbound_tls.as_ref(),
            Self::Static(_) => None,
        }
    }
}
