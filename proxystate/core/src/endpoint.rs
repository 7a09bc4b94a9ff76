#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: EndpointAddress,
    pub health_status: HealthStatus,
    pub load_balancing_weight: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointAddress {
    HostPort { host: String, port: u32 },
    UnixSocket { path: String, mode: String },
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
}

// === impl Endpoint ===

impl Endpoint {
    pub fn host_port(host: impl ToString, port: u32) -> Self {
        Self {
            address: EndpointAddress::HostPort {
                host: host.to_string(),
                port,
            },
            health_status: HealthStatus::Unknown,
            load_balancing_weight: None,
        }
    }

    pub fn unix_socket(path: impl ToString) -> Self {
        Self {
            address: EndpointAddress::UnixSocket {
                path: path.to_string(),
                // Pipe modes only apply to filesystem sockets; "0" leaves the
                // permissions alone.
                mode: "0".to_string(),
            },
            health_status: HealthStatus::Unknown,
            load_balancing_weight: None,
        }
    }

    pub fn weighted(mut self, health_status: HealthStatus, weight: u32) -> Self {
        self.health_status = health_status;
        self.load_balancing_weight = Some(weight);
        self
    }
}

// === impl Endpoints ===

impl From<Vec<Endpoint>> for Endpoints {
    fn from(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}
