use crate::{mesh::PeeringServiceMeta, or_default, ServiceKind};
use ahash::AHashMap as HashMap;

/// Tagged address holding an instance's externally reachable address.
pub const TAGGED_ADDRESS_WAN: &str = "wan";

/// Tagged address holding the virtual IP assigned to a service.
pub const TAGGED_ADDRESS_VIRTUAL_IP: &str = "consul-virtual";

/// Tagged address a Kubernetes sync stores a service's cluster IP under.
pub const VIRTUAL_IP_TAG: &str = "virtual";

/// A service instance together with the node it runs on and its checks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CheckServiceNode {
    pub node: Node,
    pub service: NodeService,
    pub checks: Vec<HealthCheck>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub node: String,
    pub address: String,
    pub datacenter: String,
    pub partition: String,
    pub tagged_addresses: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeService {
    pub kind: ServiceKind,
    pub id: String,
    pub service: String,
    pub address: String,
    pub port: u32,
    pub weights: Option<Weights>,
    pub tagged_addresses: HashMap<String, ServiceAddress>,
    pub namespace: String,
    pub partition: String,

    /// For proxies, the service they front.
    pub proxy_destination_service_name: String,
    pub connect_native: bool,

    /// Set on instances imported from a cluster peer.
    pub peer_meta: Option<PeeringServiceMeta>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Weights {
    pub passing: i32,
    pub warning: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceAddress {
    pub address: String,
    pub port: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HealthCheck {
    pub check_id: String,
    pub status: CheckStatus,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum CheckStatus {
    #[default]
    Passing,
    Warning,
    Critical,
}

// === impl CheckServiceNode ===

impl CheckServiceNode {
    /// The address other datacenters (`wan`) or the local datacenter should
    /// dial. Service addresses take precedence over node addresses.
    pub fn best_address(&self, wan: bool) -> (String, u32) {
        let (mut addr, port) = self.service.best_address(wan);
        if addr.is_empty() {
            addr = self.node.best_address(wan).to_string();
        }
        (addr, port)
    }
}

// === impl Node ===

impl Node {
    pub fn best_address(&self, wan: bool) -> &str {
        if wan {
            if let Some(addr) = self.tagged_addresses.get(TAGGED_ADDRESS_WAN) {
                return addr;
            }
        }
        &self.address
    }

    pub fn partition_or_default(&self) -> &str {
        or_default(&self.partition)
    }
}

// === impl NodeService ===

impl NodeService {
    pub fn best_address(&self, wan: bool) -> (String, u32) {
        let mut addr = self.address.clone();
        let mut port = self.port;
        if wan {
            if let Some(tagged) = self.tagged_addresses.get(TAGGED_ADDRESS_WAN) {
                addr = tagged.address.clone();
                if tagged.port != 0 {
                    port = tagged.port;
                }
            }
        }
        (addr, port)
    }

    pub fn namespace_or_default(&self) -> &str {
        or_default(&self.namespace)
    }

    pub fn partition_or_default(&self) -> &str {
        or_default(&self.partition)
    }

    /// The address stored under `tag`, if it is set and non-empty.
    pub fn tagged_address(&self, tag: &str) -> Option<&str> {
        self.tagged_addresses
            .get(tag)
            .map(|a| a.address.as_str())
            .filter(|a| !a.is_empty())
    }
}

/// A service-specific gateway virtual IP tag.
pub fn gateway_virtual_ip_tag(compound_service_name: &str) -> String {
    format!("{TAGGED_ADDRESS_VIRTUAL_IP}:{compound_service_name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;

    fn mk_node() -> CheckServiceNode {
        CheckServiceNode {
            node: Node {
                node: "node1".to_string(),
                address: "10.0.0.1".to_string(),
                tagged_addresses: hashmap! {
                    TAGGED_ADDRESS_WAN.to_string() => "198.18.0.1".to_string(),
                }
                .into_iter()
                .collect(),
                ..Default::default()
            },
            service: NodeService {
                service: "db".to_string(),
                port: 8080,
                ..Default::default()
            },
            checks: vec![],
        }
    }

    #[test]
    fn falls_back_to_node_addresses() {
        let csn = mk_node();
        assert_eq!(csn.best_address(false), ("10.0.0.1".to_string(), 8080));
        assert_eq!(csn.best_address(true), ("198.18.0.1".to_string(), 8080));
    }

    #[test]
    fn prefers_service_addresses() {
        let mut csn = mk_node();
        csn.service.address = "10.0.1.1".to_string();
        csn.service.tagged_addresses.insert(
            TAGGED_ADDRESS_WAN.to_string(),
            ServiceAddress {
                address: "198.18.1.1".to_string(),
                port: 443,
            },
        );
        assert_eq!(csn.best_address(false), ("10.0.1.1".to_string(), 8080));
        assert_eq!(csn.best_address(true), ("198.18.1.1".to_string(), 443));
    }
}
