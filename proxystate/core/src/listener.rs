use crate::tls::TransportSocket;
use ipnet::IpNet;

#[derive(Clone, Debug, PartialEq)]
pub struct Listener {
    /// Encodes the bind target so a changed address yields a new listener.
    pub name: String,
    pub bind_address: Option<BindAddress>,
    pub direction: Direction,
    pub routers: Vec<Router>,
    pub default_router: Option<Router>,
    pub capabilities: Vec<Capability>,
    pub balance_connections: BalanceConnections,

    /// Raw listener configuration supplied by the operator. When set, the
    /// remaining fields are not meaningful.
    pub escape_hatch_listener: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BindAddress {
    HostPort { host: String, port: u32 },
    UnixSocket { path: String, mode: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    Transparent,
    L4TlsInspection,
    L7ProtocolInspection,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BalanceConnections {
    #[default]
    Default,
    Exact,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Router {
    pub r#match: Option<Match>,
    pub destination: RouterDestination,
    pub inbound_tls: Option<TransportSocket>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Match {
    pub prefix_ranges: Vec<IpNet>,
    pub source_prefix_ranges: Vec<IpNet>,
    pub server_names: Vec<String>,
    pub destination_port: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouterDestination {
    L4(L4Destination),
    L7(L7Destination),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct L4Destination {
    /// The cluster traffic is proxied to.
    pub name: String,
    pub stat_prefix: String,
    pub max_inbound_connections: u64,
    pub add_empty_intention: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct L7Destination {
    /// The route this destination is served by.
    pub name: String,
    pub stat_prefix: String,
    pub protocol: L7Protocol,
    /// Set when the route is generated alongside the listener rather than
    /// discovered separately.
    pub static_route: bool,
    pub include_xfcc: bool,
    pub max_inbound_connections: u64,
    pub add_empty_intention: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum L7Protocol {
    #[default]
    Unknown,
    Http,
    Http2,
    Grpc,
}

// === impl Listener ===

impl Listener {
    pub fn host_port(name: &str, host: &str, port: u32, direction: Direction) -> Self {
        Self {
            name: format!("{name}:{host}:{port}"),
            bind_address: Some(BindAddress::HostPort {
                host: host.to_string(),
                port,
            }),
            ..Self::empty(direction)
        }
    }

    pub fn unix_socket(name: &str, path: &str, mode: &str, direction: Direction) -> Self {
        Self {
            name: format!("{name}:{path}"),
            bind_address: Some(BindAddress::UnixSocket {
                path: path.to_string(),
                mode: mode.to_string(),
            }),
            ..Self::empty(direction)
        }
    }

    pub fn escape_hatch(name: impl ToString, json: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            escape_hatch_listener: Some(json.to_string()),
            ..Self::empty(Direction::Outbound)
        }
    }

    pub fn add_capability(&mut self, capability: Capability) {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
    }

    pub fn has_routes(&self) -> bool {
        !self.routers.is_empty() || self.default_router.is_some()
    }

    fn empty(direction: Direction) -> Self {
        Self {
            name: String::new(),
            bind_address: None,
            direction,
            routers: vec![],
            default_router: None,
            capabilities: vec![],
            balance_connections: BalanceConnections::Default,
            escape_hatch_listener: None,
        }
    }
}

// === impl BalanceConnections ===

impl BalanceConnections {
    /// Maps a configured balancing mode; unknown modes use the default.
    pub fn from_config(mode: &str) -> Self {
        match mode {
            "exact_balance" => Self::Exact,
            _ => Self::Default,
        }
    }
}

// === impl Router ===

impl Router {
    pub fn new(destination: RouterDestination) -> Self {
        Self {
            r#match: None,
            destination,
            inbound_tls: None,
        }
    }

    pub fn with_match(mut self, m: Match) -> Self {
        self.r#match = Some(m);
        self
    }

    pub fn l4(&self) -> Option<&L4Destination> {
        match self.destination {
            RouterDestination::L4(ref dst) => Some(dst),
            RouterDestination::L7(_) => None,
        }
    }

    pub fn l7(&self) -> Option<&L7Destination> {
        match self.destination {
            RouterDestination::L7(ref dst) => Some(dst),
            RouterDestination::L4(_) => None,
        }
    }
}

// === impl L7Protocol ===

impl L7Protocol {
    pub fn from_protocol(protocol: &str) -> Self {
        match protocol {
            "http" => Self::Http,
            "http2" => Self::Http2,
            "grpc" => Self::Grpc,
            _ => Self::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_encode_bind_target() {
        let l = Listener::host_port("public_listener", "10.0.0.1", 21000, Direction::Inbound);
        assert_eq!(l.name, "public_listener:10.0.0.1:21000");

        let l = Listener::unix_socket("db", "/tmp/db.sock", "0600", Direction::Outbound);
        assert_eq!(l.name, "db:/tmp/db.sock");
    }

    #[test]
    fn capabilities_are_not_repeated() {
        let mut l = Listener::host_port("outbound_listener", "127.0.0.1", 15001, Direction::Outbound);
        l.add_capability(Capability::Transparent);
        l.add_capability(Capability::Transparent);
        assert_eq!(l.capabilities, vec![Capability::Transparent]);
    }
}
