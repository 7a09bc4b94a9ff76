use crate::{mesh::MeshGatewayConfig, or_default};
use std::fmt;

/// Identifies one upstream of a proxy.
///
/// An empty `peer` means the upstream lives in the local cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamId {
    pub destination_type: DestinationType,
    pub name: String,
    pub namespace: String,
    pub partition: String,
    pub peer: String,
    pub datacenter: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DestinationType {
    #[default]
    Service,
    PreparedQuery,
}

/// An upstream as registered on the proxy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Upstream {
    pub destination_type: DestinationType,
    pub destination_name: String,
    pub destination_namespace: String,
    pub destination_partition: String,
    pub destination_peer: String,
    pub datacenter: String,
    pub local_bind_address: String,
    pub local_bind_port: u32,
    pub local_bind_socket_path: String,
    pub local_bind_socket_mode: String,
    /// Opaque per-upstream configuration; see [`crate::UpstreamConfig`].
    pub config: serde_json::Map<String, serde_json::Value>,
    pub mesh_gateway: MeshGatewayConfig,
}

pub const WILDCARD: &str = "*";

// === impl UpstreamId ===

impl UpstreamId {
    pub fn service(name: impl ToString) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// The upstream every unconfigured upstream in `namespace` inherits
    /// defaults from.
    pub fn wildcard(namespace: &str, partition: &str) -> Self {
        Self {
            name: WILDCARD.to_string(),
            namespace: namespace.to_string(),
            partition: partition.to_string(),
            ..Default::default()
        }
    }

    pub fn from_upstream(u: &Upstream) -> Self {
        Self {
            destination_type: u.destination_type,
            name: u.destination_name.clone(),
            namespace: u.destination_namespace.clone(),
            partition: u.destination_partition.clone(),
            peer: u.destination_peer.clone(),
            datacenter: u.datacenter.clone(),
        }
    }

    /// Parses a discovery target id.
    ///
    /// Local targets have the form `[subset.]service.namespace.partition.dc`;
    /// peered targets have the form `service.namespace.partition.external.peer`.
    pub fn from_target_id(tid: &str) -> Self {
        let mut parts = tid.split('.').collect::<Vec<_>>();
        if parts.len() < 2 {
            return Self::service(tid);
        }

        if parts[parts.len() - 2] == "external" {
            return Self {
                name: parts[0].to_string(),
                namespace: parts.get(1).map(|s| s.to_string()).unwrap_or_default(),
                partition: if parts.len() == 5 {
                    parts[2].to_string()
                } else {
                    String::new()
                },
                peer: parts[parts.len() - 1].to_string(),
                ..Default::default()
            };
        }

        if parts.len() == 5 {
            parts.remove(0);
        }
        let part = |i: usize| parts.get(i).map(|s| s.to_string()).unwrap_or_default();
        Self {
            name: part(0),
            namespace: part(1),
            partition: part(2),
            datacenter: part(3),
            ..Default::default()
        }
    }

    pub fn namespace_or_default(&self) -> &str {
        or_default(&self.namespace)
    }

    pub fn partition_or_default(&self) -> &str {
        or_default(&self.partition)
    }

    /// The identifier the data plane knows this upstream by. Routes and
    /// listeners for the upstream are named after it.
    pub fn envoy_id(&self) -> String {
        let mut name = self.name.clone();
        if !self.datacenter.is_empty() {
            name.push_str("?dc=");
            name.push_str(&self.datacenter);
        }
        if self.destination_type == DestinationType::PreparedQuery {
            name = format!("prepared_query:{name}");
        }
        if !self.peer.is_empty() {
            name.push_str("?peer=");
            name.push_str(&self.peer);
        }
        name
    }
}

impl fmt::Display for UpstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.envoy_id())
    }
}

// === impl Upstream ===

impl Upstream {
    pub fn has_local_port_or_socket(&self) -> bool {
        self.local_bind_port != 0 || !self.local_bind_socket_path.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_target_ids() {
        let uid = UpstreamId::from_target_id("db.default.default.dc1");
        assert_eq!(uid.name, "db");
        assert_eq!(uid.namespace, "default");
        assert_eq!(uid.partition, "default");
        assert_eq!(uid.datacenter, "dc1");
        assert!(uid.peer.is_empty());

        let subset = UpstreamId::from_target_id("v2.db.default.default.dc1");
        assert_eq!(subset, uid);
    }

    #[test]
    fn parses_peered_target_ids() {
        let uid = UpstreamId::from_target_id("db.default.default.external.cluster-02");
        assert_eq!(uid.name, "db");
        assert_eq!(uid.namespace, "default");
        assert_eq!(uid.peer, "cluster-02");
        assert!(uid.datacenter.is_empty());
    }

    #[test]
    fn envoy_ids() {
        assert_eq!(UpstreamId::service("db").envoy_id(), "db");

        let uid = UpstreamId {
            datacenter: "dc2".to_string(),
            ..UpstreamId::service("db")
        };
        assert_eq!(uid.envoy_id(), "db?dc=dc2");

        let uid = UpstreamId {
            destination_type: DestinationType::PreparedQuery,
            ..UpstreamId::service("geo-cache")
        };
        assert_eq!(uid.envoy_id(), "prepared_query:geo-cache");

        let uid = UpstreamId {
            peer: "cluster-01".to_string(),
            ..UpstreamId::service("payments")
        };
        assert_eq!(uid.envoy_id(), "payments?peer=cluster-01");
    }
}
