use std::time::Duration;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    /// Evaluated in order; the first matching rule wins.
    pub route_rules: Vec<RouteRule>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteRule {
    pub r#match: RouteMatch,
    pub destination: RouteDestination,
    pub header_mutations: Vec<HeaderMutation>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteMatch {
    pub path_match: PathMatch,
    pub header_matches: Vec<HeaderMatch>,
    pub method_matches: Vec<String>,
    pub query_parameter_matches: Vec<QueryParameterMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    pub r#match: HeaderMatchKind,
    pub invert_match: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderMatchKind {
    Exact(String),
    Regex(String),
    Prefix(String),
    Suffix(String),
    Present,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryParameterMatch {
    pub name: String,
    pub r#match: QueryParameterMatchKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryParameterMatchKind {
    Exact(String),
    Regex(String),
    Present,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteDestination {
    pub destination: Destination,
    pub configuration: Option<DestinationConfiguration>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Cluster(String),
    WeightedClusters(Vec<WeightedCluster>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedCluster {
    pub name: String,
    /// Hundredths of a percent.
    pub weight: u32,
    pub header_mutations: Vec<HeaderMutation>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DestinationConfiguration {
    pub timeout_config: Option<TimeoutConfig>,
    pub hash_policies: Vec<LoadBalancerHashPolicy>,
    pub prefix_rewrite: Option<String>,
    pub retry_policy: Option<RetryPolicy>,
}

/// A zero duration disables the corresponding timeout.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TimeoutConfig {
    pub timeout: Option<Duration>,
    pub idle_timeout: Option<Duration>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    pub num_retries: Option<u32>,
    /// Comma-separated retry conditions.
    pub retry_on: String,
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadBalancerHashPolicy {
    ConnectionProperties {
        source_ip: bool,
        terminal: bool,
    },
    Header {
        name: String,
        terminal: bool,
    },
    Cookie {
        name: String,
        path: String,
        /// `Some(ZERO)` requests a session cookie.
        ttl: Option<Duration>,
        terminal: bool,
    },
    QueryParameter {
        name: String,
        terminal: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderMutation {
    RequestHeaderAdd {
        header: Header,
        append_action: AppendAction,
    },
    RequestHeaderRemove {
        header_keys: Vec<String>,
    },
    ResponseHeaderAdd {
        header: Header,
        append_action: AppendAction,
    },
    ResponseHeaderRemove {
        header_keys: Vec<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AppendAction {
    AppendIfExistsOrAdd,
    OverwriteIfExistsOrAdd,
}

// === impl RouteMatch ===

/// Matches every request.
impl Default for RouteMatch {
    fn default() -> Self {
        Self {
            path_match: PathMatch::Prefix("/".to_string()),
            header_matches: vec![],
            method_matches: vec![],
            query_parameter_matches: vec![],
        }
    }
}

// === impl RouteDestination ===

impl RouteDestination {
    pub fn cluster(name: impl ToString) -> Self {
        Self {
            destination: Destination::Cluster(name.to_string()),
            configuration: None,
        }
    }

    pub fn weighted(clusters: Vec<WeightedCluster>) -> Self {
        Self {
            destination: Destination::WeightedClusters(clusters),
            configuration: None,
        }
    }

    pub fn configuration_mut(&mut self) -> &mut DestinationConfiguration {
        self.configuration.get_or_insert_with(Default::default)
    }
}
