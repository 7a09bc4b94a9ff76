use crate::{
    chain::CompiledDiscoveryChain,
    health::CheckServiceNode,
    mesh::{
        Locality, MeshConfigEntry, MeshDirectionalTlsConfig, MeshGatewayConfig,
        PeeringServiceMeta, PeeringTrustBundle, ServiceConfigEntry,
    },
    or_default,
    upstream::{Upstream, UpstreamId},
    MutualTlsMode, ProxyMode, ServiceKind,
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Anything that may be converted into proxy state.
///
/// Only [`ConfigSnapshot`]s can be converted today; other snapshot types
/// report `None`.
pub trait ProxySnapshot: fmt::Debug {
    fn as_config_snapshot(&self) -> Option<&ConfigSnapshot>;
}

/// Everything known about one proxy at a point in time.
#[derive(Clone, Debug, Default)]
pub struct ConfigSnapshot {
    pub kind: ServiceKind,
    pub service: String,
    pub proxy_id: ServiceId,
    pub address: String,
    pub port: u32,
    pub service_locality: Option<Locality>,
    pub proxy: ConnectProxyConfig,
    pub datacenter: String,

    /// The datacenter and partition the proxy's gateways live in.
    pub locality: GatewayKey,

    pub roots: IndexedCaRoots,
    pub connect_proxy: ConfigSnapshotConnectProxy,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ServiceId {
    pub id: String,
    pub namespace: String,
    pub partition: String,
}

/// Identifies the gateways of a datacenter and partition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct GatewayKey {
    pub datacenter: String,
    pub partition: String,
}

/// The proxy registration.
#[derive(Clone, Debug, Default)]
pub struct ConnectProxyConfig {
    pub destination_service_name: String,
    pub destination_service_id: String,
    pub local_service_address: String,
    pub local_service_port: u32,
    pub local_service_socket_path: String,
    pub mode: ProxyMode,
    pub mutual_tls_mode: MutualTlsMode,

    /// Opaque configuration; see [`crate::ProxyConfig`].
    pub config: serde_json::Map<String, serde_json::Value>,

    pub upstreams: Vec<Upstream>,
    pub mesh_gateway: MeshGatewayConfig,
    pub expose: ExposeConfig,
    pub transparent_proxy: TransparentProxyConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExposeConfig {
    /// Expose every HTTP and gRPC check registered for the service.
    pub checks: bool,
    pub paths: Vec<ExposePath>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExposePath {
    pub listener_port: u32,
    pub path: String,
    pub local_path_port: u32,
    pub protocol: String,
    pub parsed_from_check: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransparentProxyConfig {
    /// Zero selects the default outbound port.
    pub outbound_listener_port: u32,
    pub dialed_directly: bool,
}

/// A health check registered for the proxied service.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CheckType {
    pub check_id: String,
    pub http: String,
    /// The check's URL rewritten to go through the proxy.
    pub proxy_http: String,
    pub grpc: String,
    pub proxy_grpc: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexedCaRoots {
    pub trust_domain: String,
    pub roots: Vec<CaRoot>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CaRoot {
    pub root_cert: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IssuedCert {
    pub cert_pem: String,
    pub private_key_pem: String,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigSnapshotConnectProxy {
    pub upstreams: ConfigSnapshotUpstreams,
    pub leaf: Option<IssuedCert>,
    pub watched_service_checks: HashMap<ServiceId, Vec<CheckType>>,
    pub prepared_query_endpoints: HashMap<UpstreamId, Vec<CheckServiceNode>>,

    /// Bundles of the peers that may dial this proxy.
    pub inbound_peer_trust_bundles: Vec<PeeringTrustBundle>,

    /// Destinations outside the mesh, reached through terminating gateways.
    pub destinations_upstream: BTreeMap<UpstreamId, ServiceConfigEntry>,
    pub destination_gateways: HashMap<UpstreamId, Vec<CheckServiceNode>>,
}

/// The upstream state shared by every proxy kind that dials upstreams.
#[derive(Clone, Debug, Default)]
pub struct ConfigSnapshotUpstreams {
    pub discovery_chain: BTreeMap<UpstreamId, CompiledDiscoveryChain>,

    /// Instances keyed by upstream, then by target id.
    pub watched_upstream_endpoints: HashMap<UpstreamId, HashMap<String, Vec<CheckServiceNode>>>,

    /// Gateway instances keyed by upstream, then by gateway key.
    pub watched_gateway_endpoints: HashMap<UpstreamId, HashMap<String, Vec<CheckServiceNode>>>,

    pub upstream_config: HashMap<UpstreamId, Upstream>,

    /// Addresses of directly dialable instances, keyed by upstream and then
    /// by target id.
    pub passthrough_upstreams: HashMap<UpstreamId, BTreeMap<String, BTreeSet<String>>>,

    /// Upstreams the proxy may dial because an intention allows it.
    pub intention_upstreams: HashSet<UpstreamId>,
    /// Upstreams imported from cluster peers.
    pub peered_upstreams: HashSet<UpstreamId>,

    /// Bundles of the peers this proxy dials, keyed by peer name.
    pub upstream_peer_trust_bundles: HashMap<String, PeeringTrustBundle>,
    pub peer_upstream_endpoints: HashMap<UpstreamId, Vec<CheckServiceNode>>,
    /// Peered upstreams whose instances are addressed by hostname.
    pub peer_upstream_endpoints_use_hostnames: HashSet<UpstreamId>,

    /// The local mesh gateways, keyed by gateway key.
    pub watched_local_gw_endpoints: HashMap<String, Vec<CheckServiceNode>>,

    pub mesh_config: Option<MeshConfigEntry>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("No upstream snapshot for gateway mode {:?}", .0.to_string())]
pub struct UpstreamsUnavailable(pub ServiceKind);

// === impl ConfigSnapshot ===

impl ProxySnapshot for ConfigSnapshot {
    fn as_config_snapshot(&self) -> Option<&ConfigSnapshot> {
        Some(self)
    }
}

impl ConfigSnapshot {
    pub fn upstreams(&self) -> Result<&ConfigSnapshotUpstreams, UpstreamsUnavailable> {
        match self.kind {
            ServiceKind::ConnectProxy | ServiceKind::IngressGateway | ServiceKind::ApiGateway => {
                Ok(&self.connect_proxy.upstreams)
            }
            kind => Err(UpstreamsUnavailable(kind)),
        }
    }

    /// Returns the upstream registered for `uid`, falling back to the
    /// wildcard upstream, and whether the upstream should be skipped because
    /// the proxy neither declares it nor may dial it implicitly.
    pub fn get_upstream(&self, uid: &UpstreamId) -> (Option<&Upstream>, bool) {
        let upstreams = &self.connect_proxy.upstreams;
        let upstream = upstreams.upstream_config.get(uid).or_else(|| {
            let wildcard = UpstreamId::wildcard(&self.proxy_id.namespace, &self.proxy_id.partition);
            upstreams.upstream_config.get(&wildcard)
        });

        let explicit = upstream.map_or(false, Upstream::has_local_port_or_socket);
        let implicit = upstreams.is_implicit_upstream(uid);
        (upstream, !implicit && !explicit)
    }

    pub fn leaf(&self) -> IssuedCert {
        match self.kind {
            ServiceKind::ConnectProxy => self.connect_proxy.leaf.clone().unwrap_or_default(),
            _ => IssuedCert::default(),
        }
    }

    /// Bundles of the peers that may dial this proxy.
    pub fn peering_trust_bundles(&self) -> &[PeeringTrustBundle] {
        match self.kind {
            ServiceKind::ConnectProxy => &self.connect_proxy.inbound_peer_trust_bundles,
            _ => &[],
        }
    }

    /// All local CA roots concatenated, each ending in a newline.
    pub fn root_pems(&self) -> String {
        let mut pems = String::new();
        for root in &self.roots.roots {
            pems.push_str(&root.root_cert);
            if !root.root_cert.ends_with('\n') {
                pems.push('\n');
            }
        }
        pems
    }

    pub fn mesh_config(&self) -> Option<&MeshConfigEntry> {
        self.upstreams().ok()?.mesh_config.as_ref()
    }

    pub fn mesh_config_tls_incoming(&self) -> Option<&MeshDirectionalTlsConfig> {
        self.mesh_config()?.tls_incoming()
    }

    pub fn mesh_config_tls_outgoing(&self) -> Option<&MeshDirectionalTlsConfig> {
        self.mesh_config()?.tls_outgoing()
    }

    pub fn is_transparent(&self) -> bool {
        self.proxy.mode == ProxyMode::Transparent
    }

    pub fn trust_domain(&self) -> &str {
        &self.roots.trust_domain
    }
}

// === impl GatewayKey ===

impl GatewayKey {
    pub fn new(datacenter: impl ToString, partition: impl ToString) -> Self {
        Self {
            datacenter: datacenter.to_string(),
            partition: partition.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.datacenter.is_empty() && self.partition.is_empty()
    }

    pub fn matches(&self, datacenter: &str, partition: &str) -> bool {
        or_default(&self.partition) == or_default(partition) && self.datacenter == datacenter
    }
}

impl fmt::Display for GatewayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if or_default(&self.partition) != crate::DEFAULT {
            write!(f, "{}.", self.partition)?;
        }
        f.write_str(&self.datacenter)
    }
}

// === impl ServiceId ===

impl ServiceId {
    pub fn namespace_or_default(&self) -> &str {
        or_default(&self.namespace)
    }

    pub fn partition_or_default(&self) -> &str {
        or_default(&self.partition)
    }
}

// === impl ExposePath ===

impl ExposePath {
    /// Paths without a protocol are served as HTTP.
    pub fn protocol(&self) -> &str {
        if self.protocol.is_empty() {
            "http"
        } else {
            &self.protocol
        }
    }
}

// === impl ConfigSnapshotUpstreams ===

impl ConfigSnapshotUpstreams {
    pub fn is_implicit_upstream(&self, uid: &UpstreamId) -> bool {
        self.intention_upstreams.contains(uid) || self.peered_upstreams.contains(uid)
    }

    /// Peered upstreams with both instances and a trust bundle, in order.
    pub fn peered_upstream_ids(&self) -> Vec<UpstreamId> {
        let mut uids = self
            .peer_upstream_endpoints
            .keys()
            .filter(|uid| self.upstream_peer_trust_bundles.contains_key(&uid.peer))
            .cloned()
            .collect::<Vec<_>>();
        uids.sort();
        uids
    }

    /// Peering metadata is replicated onto every imported instance; the
    /// first instance's copy is authoritative.
    pub fn upstream_peer_meta(&self, uid: &UpstreamId) -> Option<&PeeringServiceMeta> {
        self.peer_upstream_endpoints
            .get(uid)?
            .first()?
            .service
            .peer_meta
            .as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::NodeService;
    use maplit::hashset;

    fn mk_snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            kind: ServiceKind::ConnectProxy,
            service: "web-sidecar-proxy".to_string(),
            proxy_id: ServiceId {
                id: "web-sidecar-proxy".to_string(),
                ..Default::default()
            },
            datacenter: "dc1".to_string(),
            locality: GatewayKey::new("dc1", ""),
            ..Default::default()
        }
    }

    #[test]
    fn gateway_keys() {
        let key = GatewayKey::new("dc1", "");
        assert_eq!(key.to_string(), "dc1");
        assert!(key.matches("dc1", "default"));
        assert!(!key.matches("dc2", ""));

        let key = GatewayKey::new("dc1", "ap1");
        assert_eq!(key.to_string(), "ap1.dc1");
        assert!(!key.matches("dc1", "default"));

        assert!(GatewayKey::default().is_empty());
    }

    #[test]
    fn upstreams_only_for_proxies_that_dial() {
        let mut snap = mk_snapshot();
        assert!(snap.upstreams().is_ok());

        snap.kind = ServiceKind::MeshGateway;
        let err = snap.upstreams().unwrap_err();
        assert_eq!(
            err.to_string(),
            "No upstream snapshot for gateway mode \"mesh-gateway\""
        );
        assert!(snap.mesh_config().is_none());
    }

    #[test]
    fn get_upstream_falls_back_to_wildcard() {
        let mut snap = mk_snapshot();
        let db = UpstreamId::service("db");

        let (upstream, skip) = snap.get_upstream(&db);
        assert!(upstream.is_none());
        assert!(skip, "undeclared upstreams are skipped");

        snap.connect_proxy.upstreams.upstream_config.insert(
            UpstreamId::wildcard("", ""),
            Upstream {
                destination_name: "*".to_string(),
                ..Default::default()
            },
        );
        snap.connect_proxy.upstreams.intention_upstreams = hashset! { db.clone() }
            .into_iter()
            .collect();
        let (upstream, skip) = snap.get_upstream(&db);
        assert_eq!(upstream.map(|u| u.destination_name.as_str()), Some("*"));
        assert!(!skip);

        snap.connect_proxy.upstreams.upstream_config.insert(
            db.clone(),
            Upstream {
                destination_name: "db".to_string(),
                local_bind_port: 9191,
                ..Default::default()
            },
        );
        snap.connect_proxy.upstreams.intention_upstreams.clear();
        let (upstream, skip) = snap.get_upstream(&db);
        assert_eq!(upstream.map(|u| u.local_bind_port), Some(9191));
        assert!(!skip, "explicit upstreams are never skipped");
    }

    #[test]
    fn root_pems_end_with_newlines() {
        let mut snap = mk_snapshot();
        snap.roots.roots = vec![
            CaRoot {
                root_cert: "ROOT-A".to_string(),
            },
            CaRoot {
                root_cert: "ROOT-B\n".to_string(),
            },
        ];
        assert_eq!(snap.root_pems(), "ROOT-A\nROOT-B\n");
    }

    #[test]
    fn peered_upstreams_wait_for_trust_bundles() {
        let mut upstreams = ConfigSnapshotUpstreams::default();
        let payments = UpstreamId {
            peer: "cluster-01".to_string(),
            ..UpstreamId::service("payments")
        };
        let refunds = UpstreamId {
            peer: "cluster-02".to_string(),
            ..UpstreamId::service("refunds")
        };
        let meta = PeeringServiceMeta {
            sni: vec!["payments.default.default.cluster-01.external.td".to_string()],
            spiffe_id: vec![],
            protocol: "tcp".to_string(),
        };
        upstreams.peer_upstream_endpoints.insert(
            payments.clone(),
            vec![CheckServiceNode {
                service: NodeService {
                    peer_meta: Some(meta.clone()),
                    ..Default::default()
                },
                ..Default::default()
            }],
        );
        upstreams
            .peer_upstream_endpoints
            .insert(refunds.clone(), vec![]);
        upstreams.upstream_peer_trust_bundles.insert(
            "cluster-01".to_string(),
            PeeringTrustBundle {
                peer_name: "cluster-01".to_string(),
                ..Default::default()
            },
        );

        assert_eq!(upstreams.peered_upstream_ids(), vec![payments.clone()]);
        assert_eq!(upstreams.upstream_peer_meta(&payments), Some(&meta));
        assert_eq!(upstreams.upstream_peer_meta(&refunds), None);
    }
}
