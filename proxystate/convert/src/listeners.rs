use crate::{naming, upstream_config, Builder, Error};
use mesh_proxystate_core::{
    exact_net,
    listener::{
        BalanceConnections, Capability, Direction, L4Destination, L7Destination, L7Protocol, Match,
        RouterDestination,
    },
    route::{
        DestinationConfiguration, PathMatch, RouteDestination, RouteMatch, RouteRule, TimeoutConfig,
        VirtualHost,
    },
    Listener, NetworkMatch, Route, Router,
};
use mesh_proxystate_snapshot::{
    health::{gateway_virtual_ip_tag, TAGGED_ADDRESS_VIRTUAL_IP, VIRTUAL_IP_TAG},
    is_protocol_http_like, CheckServiceNode, CompiledDiscoveryChain, MutualTlsMode,
    PeeringServiceMeta, ServiceKind, Upstream, UpstreamId,
};
use std::{collections::BTreeSet, net::IpAddr, time::Duration};
use tracing::{debug, warn};

const DEFAULT_UPSTREAM_STAT_PREFIX: &str = "upstream.";
const PEERED_UPSTREAM_STAT_PREFIX: &str = "upstream_peered.";

/// Describes what a router forwards to.
#[derive(Clone, Debug, Default)]
pub(crate) struct DestinationOpts<'a> {
    pub(crate) cluster: &'a str,
    pub(crate) filter_name: &'a str,
    pub(crate) route_name: &'a str,
    pub(crate) protocol: &'a str,
    pub(crate) stat_prefix: &'a str,
    pub(crate) use_rds: bool,
    /// Serves only this exact path from a static route.
    pub(crate) route_path: &'a str,
    pub(crate) request_timeout_ms: Option<u64>,
    pub(crate) idle_timeout_ms: Option<u64>,
}

impl Builder<'_> {
    pub(crate) fn listeners_from_snapshot(&mut self) -> Result<(), Error> {
        match self.snap.kind {
            ServiceKind::ConnectProxy => self.listeners_for_connect_proxy(),
            // Gateways are not converted yet.
            ServiceKind::TerminatingGateway
            | ServiceKind::MeshGateway
            | ServiceKind::IngressGateway
            | ServiceKind::ApiGateway => Ok(()),
            kind => Err(Error::InvalidServiceKind(kind)),
        }
    }

    fn listeners_for_connect_proxy(&mut self) -> Result<(), Error> {
        let snap = self.snap;
        let mut listeners = vec![self.make_inbound_listener(naming::PUBLIC_LISTENER)?];

        // In transparent mode, outbound traffic is redirected to a single
        // listener with a router per upstream.
        let mut outbound = snap.is_transparent().then(|| {
            let port = match snap.proxy.transparent_proxy.outbound_listener_port {
                0 => naming::DEFAULT_TPROXY_OUTBOUND_PORT,
                port => port,
            };
            let mut l = Listener::host_port(
                naming::OUTBOUND_LISTENER,
                "127.0.0.1",
                port,
                Direction::Outbound,
            );
            l.add_capability(Capability::Transparent);
            l
        });

        let upstreams = snap.upstreams()?;

        for (uid, chain) in &upstreams.discovery_chain {
            let (upstream, skip) = snap.get_upstream(uid);
            if skip {
                continue;
            }

            let cfg = upstream_config::for_listener(uid, upstream, chain);
            if !cfg.envoy_listener_json.is_empty() {
                listeners.push(Listener::escape_hatch(uid.envoy_id(), &cfg.envoy_listener_json));
                continue;
            }

            // Only customized chains for L7 protocols are routed.
            let use_rds = chain.protocol != "tcp" && !chain.default;
            let mut cluster = String::new();
            if !use_rds {
                let tid = simple_chain_target(chain)?;
                cluster = self.target_cluster_name(chain, tid, false);
                if cluster.is_empty() {
                    continue;
                }
            }

            let filter_name = format!(
                "{}.{}.{}.{}",
                chain.service_name, chain.namespace, chain.partition, chain.datacenter
            );
            let route_name = uid.envoy_id();
            let router = self.make_upstream_router(DestinationOpts {
                cluster: &cluster,
                filter_name: &filter_name,
                route_name: &route_name,
                protocol: &cfg.protocol,
                use_rds,
                ..Default::default()
            })?;

            if let Some(u) = upstream.filter(|u| u.has_local_port_or_socket()) {
                let mut l = make_upstream_listener(&route_name, u);
                l.balance_connections =
                    BalanceConnections::from_config(&cfg.balance_outbound_connections);
                l.routers.push(router);
                listeners.push(l);
                continue;
            }

            // Match on the upstream's virtual IPs rather than its instances'
            // addresses, so that dialing any one instance does not balance
            // across all of them.
            let mut addrs = NetworkMatch::default();
            if or_default(&chain.partition) == snap.proxy_id.partition_or_default() {
                for ip in chain.auto_virtual_ips.iter().chain(&chain.manual_virtual_ips) {
                    addrs.insert_addr(ip);
                }
            }
            let endpoints = upstreams
                .watched_upstream_endpoints
                .get(uid)
                .and_then(|eps| eps.get(&chain.id()))
                .map(Vec::as_slice)
                .unwrap_or_default();
            for ep in endpoints {
                if ep.service.kind == ServiceKind::TerminatingGateway {
                    let tag = gateway_virtual_ip_tag(&chain.compound_service_name());
                    if let Some(vip) = ep.service.tagged_address(&tag) {
                        addrs.insert_addr(vip);
                    }
                    continue;
                }
                self.insert_virtual_ips(&mut addrs, ep);
            }
            attach_virtual_ip_router(outbound.as_mut(), uid, router, addrs);
        }

        let mut requires_tls_inspector = false;
        let mut requires_http_inspector = false;
        let mut configured_ports = BTreeSet::new();
        for (uid, svc) in &snap.connect_proxy.destinations_upstream {
            let destination = match svc.destination.as_ref() {
                Some(d) => d,
                None => continue,
            };

            if is_protocol_http_like(&svc.protocol) {
                if !configured_ports.insert(destination.port) {
                    continue;
                }
                // HTTP destinations on a port share one route, with a virtual
                // host per destination.
                let route_name = naming::destination_cluster(
                    "~http",
                    &destination.port.to_string(),
                    svc.namespace_or_default(),
                    svc.partition_or_default(),
                    &snap.datacenter,
                    snap.trust_domain(),
                );
                let router = self
                    .make_upstream_router(DestinationOpts {
                        filter_name: &route_name,
                        route_name: &route_name,
                        protocol: &svc.protocol,
                        use_rds: true,
                        ..Default::default()
                    })?
                    .with_match(match_address_with_port("", destination.port));
                if let Some(l) = outbound.as_mut() {
                    l.routers.push(router);
                }
                requires_http_inspector = true;
            } else {
                let route_name = uid.envoy_id();
                for address in &destination.addresses {
                    let cluster = naming::destination_cluster(
                        &uid.name,
                        address,
                        uid.namespace_or_default(),
                        uid.partition_or_default(),
                        &snap.datacenter,
                        snap.trust_domain(),
                    );
                    let m = match_address_with_port(address, destination.port);
                    requires_tls_inspector |= !m.server_names.is_empty();
                    let router = self
                        .make_upstream_router(DestinationOpts {
                            cluster: &cluster,
                            filter_name: &cluster,
                            route_name: &route_name,
                            protocol: &svc.protocol,
                            ..Default::default()
                        })?
                        .with_match(m);
                    if let Some(l) = outbound.as_mut() {
                        l.routers.push(router);
                    }
                }
            }
        }
        if let Some(l) = outbound.as_mut() {
            if requires_tls_inspector {
                l.add_capability(Capability::L4TlsInspection);
            }
            if requires_http_inspector {
                l.add_capability(Capability::L7ProtocolInspection);
            }
        }

        // Peered upstreams have no discovery chain.
        for uid in upstreams.peered_upstream_ids() {
            let (upstream, skip) = snap.get_upstream(&uid);
            if skip {
                continue;
            }

            let meta = match upstreams.upstream_peer_meta(&uid) {
                Some(meta) => meta.clone(),
                None => {
                    warn!(upstream = %uid, "failed to fetch upstream peering metadata for listener");
                    PeeringServiceMeta::default()
                }
            };
            let cfg = upstream_config::for_peered_listener(&uid, upstream, &meta);
            if !cfg.envoy_listener_json.is_empty() {
                listeners.push(Listener::escape_hatch(uid.envoy_id(), &cfg.envoy_listener_json));
                continue;
            }

            let bundle = upstreams
                .upstream_peer_trust_bundles
                .get(&uid.peer)
                .ok_or_else(|| Error::PeerTrustBundleNotReady(uid.peer.clone()))?;
            let cluster = naming::peered_cluster(&uid, bundle);
            let route_name = uid.envoy_id();

            if let Some(u) = upstream.filter(|u| u.has_local_port_or_socket()) {
                let filter_name = format!(
                    "{}.{}.{}",
                    u.destination_name, u.destination_namespace, u.destination_peer
                );
                let router = self.make_upstream_router(DestinationOpts {
                    cluster: &cluster,
                    filter_name: &filter_name,
                    route_name: &route_name,
                    protocol: &cfg.protocol,
                    stat_prefix: PEERED_UPSTREAM_STAT_PREFIX,
                    ..Default::default()
                })?;
                let mut l = make_upstream_listener(&route_name, u);
                l.balance_connections =
                    BalanceConnections::from_config(&cfg.balance_outbound_connections);
                l.routers.push(router);
                listeners.push(l);
                continue;
            }

            let filter_name = format!("{}.{}.{}", uid.name, uid.namespace_or_default(), uid.peer);
            let router = self.make_upstream_router(DestinationOpts {
                cluster: &cluster,
                filter_name: &filter_name,
                route_name: &route_name,
                protocol: &cfg.protocol,
                stat_prefix: PEERED_UPSTREAM_STAT_PREFIX,
                ..Default::default()
            })?;

            let mut addrs = NetworkMatch::default();
            let endpoints = upstreams
                .peer_upstream_endpoints
                .get(&uid)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for ep in endpoints {
                self.insert_virtual_ips(&mut addrs, ep);
            }
            attach_virtual_ip_router(outbound.as_mut(), &uid, router, addrs);
        }

        if let Some(mut l) = outbound {
            // Mesh instances that are dialed directly bypass virtual IPs.
            let mut passthrough = upstreams.passthrough_upstreams.iter().collect::<Vec<_>>();
            passthrough.sort_by(|(a, _), (b, _)| a.cmp(b));
            for (_, targets) in passthrough {
                for (tid, addrs) in targets {
                    let target_uid = UpstreamId::from_target_id(tid);
                    let sni = naming::service_sni(
                        &target_uid.name,
                        "",
                        target_uid.namespace_or_default(),
                        target_uid.partition_or_default(),
                        &snap.datacenter,
                        snap.trust_domain(),
                    );
                    let filter_name = format!(
                        "{}.{}.{}.{}",
                        target_uid.name,
                        target_uid.namespace_or_default(),
                        target_uid.partition_or_default(),
                        snap.datacenter
                    );
                    let router = self
                        .make_upstream_router(DestinationOpts {
                            cluster: &naming::passthrough_cluster(&sni),
                            filter_name: &filter_name,
                            protocol: "tcp",
                            ..Default::default()
                        })?
                        .with_match(Match {
                            prefix_ranges: addrs.iter().collect::<NetworkMatch>().into_ranges(),
                            ..Default::default()
                        });
                    l.routers.push(router);
                }
            }

            // Anything else leaves the mesh unless the mesh forbids it.
            let mesh_destinations_only = snap
                .mesh_config()
                .map_or(false, |m| m.transparent_proxy.mesh_destinations_only);
            if !mesh_destinations_only {
                l.default_router = Some(self.make_upstream_router(DestinationOpts {
                    cluster: naming::ORIGINAL_DESTINATION_CLUSTER,
                    filter_name: naming::ORIGINAL_DESTINATION_CLUSTER,
                    protocol: "tcp",
                    ..Default::default()
                })?);
            }

            if l.has_routes() {
                listeners.push(l);
            }
        }

        // Prepared queries have no discovery chain either.
        let mut queries = upstreams
            .upstream_config
            .iter()
            .filter(|(_, u)| u.destination_type == mesh_proxystate_snapshot::DestinationType::PreparedQuery)
            .collect::<Vec<_>>();
        queries.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (uid, u) in queries {
            let cfg = upstream_config::parse(uid, u);
            if !cfg.envoy_listener_json.is_empty() {
                listeners.push(Listener::escape_hatch(uid.envoy_id(), &cfg.envoy_listener_json));
                continue;
            }

            let name = uid.envoy_id();
            let cluster = naming::upstream_sni(u, "", &snap.datacenter, snap.trust_domain());
            let router = self.make_upstream_router(DestinationOpts {
                cluster: &cluster,
                filter_name: &name,
                route_name: &name,
                protocol: &cfg.protocol,
                ..Default::default()
            })?;
            let mut l = make_upstream_listener(&name, u);
            l.balance_connections =
                BalanceConnections::from_config(&cfg.balance_outbound_connections);
            l.routers.push(router);
            listeners.push(l);
        }

        for path in self.exposed_paths() {
            let cluster = if path.local_path_port == snap.proxy.local_service_port {
                naming::LOCAL_APP_CLUSTER.to_string()
            } else {
                naming::expose_cluster(path.local_path_port)
            };
            listeners.push(self.make_exposed_check_listener(&cluster, &path)?);
        }

        self.state.listeners = listeners;
        Ok(())
    }

    /// The public listener, which accepts mesh traffic for the local
    /// application.
    fn make_inbound_listener(&mut self, name: &str) -> Result<Listener, Error> {
        let snap = self.snap;
        let cfg = self.proxy_config();

        if !cfg.envoy_public_listener_json.is_empty() {
            let mut listener = Listener::escape_hatch(name, &cfg.envoy_public_listener_json);
            listener.direction = Direction::Inbound;
            return Ok(listener);
        }

        let addr = if !cfg.bind_address.is_empty() {
            cfg.bind_address.as_str()
        } else if !snap.address.is_empty() {
            snap.address.as_str()
        } else {
            "0.0.0.0"
        };
        let port = match cfg.bind_port {
            0 => snap.port,
            port => port,
        };
        let mut listener = Listener::host_port(name, addr, port, Direction::Inbound);
        listener.balance_connections =
            BalanceConnections::from_config(&cfg.balance_inbound_connections);

        let opts = DestinationOpts {
            cluster: naming::LOCAL_APP_CLUSTER,
            filter_name: name,
            route_name: name,
            protocol: &cfg.protocol,
            request_timeout_ms: cfg.local_request_timeout_ms,
            idle_timeout_ms: cfg.local_idle_timeout_ms,
            ..Default::default()
        };
        let mut destination = self.router_destination(&opts)?;
        match destination {
            RouterDestination::L7(ref mut dst) => {
                dst.add_empty_intention = true;
                dst.include_xfcc = snap
                    .mesh_config()
                    .and_then(|m| m.http.as_ref())
                    .map_or(true, |http| !http.sanitize_x_forwarded_client_cert);
                dst.max_inbound_connections = cfg.max_inbound_connections;
            }
            RouterDestination::L4(ref mut dst) => {
                dst.add_empty_intention = true;
                dst.max_inbound_connections = cfg.max_inbound_connections;
            }
        }

        let mut router = Router::new(destination);
        router.inbound_tls = Some(self.create_inbound_mesh_mtls()?);
        listener.routers.push(router);

        // Permissive mode also admits plaintext traffic that was redirected to
        // the service port.
        if snap.is_transparent() && snap.proxy.mutual_tls_mode == MutualTlsMode::Permissive {
            let service_port = snap.proxy.local_service_port;
            if service_port > 0 {
                let dst = l4_destination(&DestinationOpts {
                    stat_prefix: "permissive_",
                    ..opts
                });
                listener.routers.push(
                    Router::new(RouterDestination::L4(dst)).with_match(Match {
                        destination_port: Some(service_port),
                        ..Default::default()
                    }),
                );
                listener.add_capability(Capability::Transparent);
            } else {
                debug!("no service port defined for service in permissive mTLS mode; not adding filter chain for non-mTLS traffic");
            }
        }

        Ok(listener)
    }

    fn make_upstream_router(&mut self, opts: DestinationOpts<'_>) -> Result<Router, Error> {
        let stat_prefix = if opts.stat_prefix.is_empty() {
            DEFAULT_UPSTREAM_STAT_PREFIX
        } else {
            opts.stat_prefix
        };
        let destination = self.router_destination(&DestinationOpts {
            stat_prefix,
            ..opts
        })?;
        Ok(Router::new(destination))
    }

    /// HTTP-like protocols are proxied at L7 and everything else at L4.
    /// Without RDS, an L7 destination's route is generated here.
    pub(crate) fn router_destination(
        &mut self,
        opts: &DestinationOpts<'_>,
    ) -> Result<RouterDestination, Error> {
        if is_protocol_http_like(opts.protocol) {
            return self.l7_destination(opts).map(RouterDestination::L7);
        }

        if opts.use_rds {
            return Err(Error::TcpWithRds);
        }
        if opts.cluster.is_empty() {
            return Err(Error::MissingTcpCluster);
        }
        Ok(RouterDestination::L4(l4_destination(opts)))
    }

    fn l7_destination(&mut self, opts: &DestinationOpts<'_>) -> Result<L7Destination, Error> {
        let dst = L7Destination {
            name: opts.route_name.to_string(),
            stat_prefix: stat_prefix(opts.stat_prefix, opts.filter_name),
            protocol: L7Protocol::from_protocol(opts.protocol),
            static_route: !opts.use_rds,
            include_xfcc: false,
            max_inbound_connections: 0,
            add_empty_intention: false,
        };

        if opts.use_rds {
            if !opts.cluster.is_empty() {
                return Err(Error::ClusterWithRds);
            }
            return Ok(dst);
        }
        if opts.cluster.is_empty() {
            return Err(Error::MissingClusterWithoutRds);
        }

        let mut destination = RouteDestination::cluster(opts.cluster);
        if opts.request_timeout_ms.is_some() || opts.idle_timeout_ms.is_some() {
            destination.configuration = Some(DestinationConfiguration {
                timeout_config: Some(TimeoutConfig {
                    timeout: opts.request_timeout_ms.map(Duration::from_millis),
                    idle_timeout: opts.idle_timeout_ms.map(Duration::from_millis),
                }),
                ..Default::default()
            });
        }
        let path_match = if opts.route_path.is_empty() {
            PathMatch::Prefix("/".to_string())
        } else {
            PathMatch::Exact(opts.route_path.to_string())
        };
        let route = Route {
            virtual_hosts: vec![VirtualHost {
                name: opts.filter_name.to_string(),
                domains: vec!["*".to_string()],
                route_rules: vec![RouteRule {
                    r#match: RouteMatch {
                        path_match,
                        ..Default::default()
                    },
                    destination,
                    header_mutations: vec![],
                }],
            }],
        };
        self.state.routes.insert(opts.route_name.to_string(), route);

        Ok(dst)
    }

    /// Adds the virtual IPs an instance is tagged with. Cluster IPs are only
    /// unique within a partition.
    fn insert_virtual_ips(&self, addrs: &mut NetworkMatch, ep: &CheckServiceNode) {
        if let Some(vip) = ep.service.tagged_address(TAGGED_ADDRESS_VIRTUAL_IP) {
            addrs.insert_addr(vip);
        }
        if ep.node.partition_or_default() == self.snap.proxy_id.partition_or_default() {
            if let Some(vip) = ep.service.tagged_address(VIRTUAL_IP_TAG) {
                addrs.insert_addr(vip);
            }
        }
    }
}

fn l4_destination(opts: &DestinationOpts<'_>) -> L4Destination {
    L4Destination {
        name: opts.cluster.to_string(),
        stat_prefix: stat_prefix(opts.stat_prefix, opts.filter_name),
        ..Default::default()
    }
}

fn stat_prefix(prefix: &str, filter_name: &str) -> String {
    format!("{prefix}{}", filter_name.replace(':', "_"))
}

/// A listener dedicated to an upstream with a local bind port or socket.
fn make_upstream_listener(name: &str, u: &Upstream) -> Listener {
    if u.local_bind_port == 0 && !u.local_bind_socket_path.is_empty() {
        return Listener::unix_socket(
            name,
            &u.local_bind_socket_path,
            &u.local_bind_socket_mode,
            Direction::Outbound,
        );
    }
    let addr = if u.local_bind_address.is_empty() {
        "127.0.0.1"
    } else {
        u.local_bind_address.as_str()
    };
    Listener::host_port(name, addr, u.local_bind_port, Direction::Outbound)
}

/// The target of a chain whose start node is a lone resolver.
fn simple_chain_target(chain: &CompiledDiscoveryChain) -> Result<&str, Error> {
    let node = chain
        .start_node()
        .ok_or_else(|| Error::MissingStartNode(chain.service_name.clone()))?;
    match node.resolver() {
        Some(resolver) => Ok(&resolver.target),
        None => Err(Error::UnexpectedStartNode(node.type_name())),
    }
}

/// Routes traffic for an upstream's virtual IPs through the outbound
/// listener. Upstreams without virtual IPs cannot be matched and are left
/// out.
fn attach_virtual_ip_router(
    outbound: Option<&mut Listener>,
    uid: &UpstreamId,
    router: Router,
    addrs: NetworkMatch,
) {
    if addrs.len() > 2 {
        debug!(
            upstream = %uid,
            ip_count = addrs.len(),
            "detected multiple virtual IPs for an upstream, all will be used to match traffic"
        );
    }
    if addrs.is_empty() {
        return;
    }
    if let Some(l) = outbound {
        l.routers.push(router.with_match(Match {
            prefix_ranges: addrs.into_ranges(),
            ..Default::default()
        }));
    }
}

/// Matches a destination's port and either its literal IP or, for hostnames,
/// its server name.
fn match_address_with_port(address: &str, port: u32) -> Match {
    let mut m = Match {
        destination_port: Some(port),
        ..Default::default()
    };
    match address.parse::<IpAddr>() {
        Ok(ip) => m.prefix_ranges.push(exact_net(ip)),
        Err(_) if !address.is_empty() => m.server_names.push(address.to_string()),
        Err(_) => {}
    }
    m
}

fn or_default(s: &str) -> &str {
    if s.is_empty() {
        mesh_proxystate_snapshot::DEFAULT
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use maplit::{btreemap, hashmap};
    use mesh_proxystate_core::{listener::BindAddress, IpNet};
    use mesh_proxystate_snapshot::{
        health::ServiceAddress,
        mesh::{DestinationConfig, MeshConfigEntry, MeshHttpConfig, PeeringTrustBundle},
        ProxyMode, ServiceConfigEntry,
    };
    use serde_json::json;

    fn with_vips(mut ep: CheckServiceNode, vips: &[(&str, &str)]) -> CheckServiceNode {
        for (tag, addr) in vips {
            ep.service.tagged_addresses.insert(
                tag.to_string(),
                ServiceAddress {
                    address: addr.to_string(),
                    port: 0,
                },
            );
        }
        ep
    }

    fn mk_transparent(endpoints: Vec<CheckServiceNode>) -> mesh_proxystate_snapshot::ConfigSnapshot {
        let mut snap = mk_connect_proxy();
        snap.proxy.mode = ProxyMode::Transparent;
        let db = UpstreamId::service("db");
        let chain = mk_chain("db", "tcp");
        let upstreams = &mut snap.connect_proxy.upstreams;
        upstreams.watched_upstream_endpoints.insert(
            db.clone(),
            hashmap! { chain.id() => endpoints }.into_iter().collect(),
        );
        upstreams.discovery_chain.insert(db.clone(), chain);
        upstreams.intention_upstreams.insert(db);
        snap
    }

    fn outbound_listener(state: &mesh_proxystate_core::ProxyState) -> &Listener {
        state
            .listeners
            .iter()
            .find(|l| l.name.starts_with(naming::OUTBOUND_LISTENER))
            .expect("outbound listener must exist")
    }

    #[test]
    fn public_listener_for_http_service() {
        let mut snap = mk_connect_proxy();
        snap.proxy.config = mk_config(json!({
            "protocol": "http",
            "bind_port": 21000,
            "max_inbound_connections": 50,
            "local_request_timeout_ms": 3000,
            "balance_inbound_connections": "exact_balance",
        }));
        snap.connect_proxy.upstreams.mesh_config = Some(MeshConfigEntry {
            http: Some(MeshHttpConfig {
                sanitize_x_forwarded_client_cert: true,
            }),
            ..Default::default()
        });

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let state = builder.state;

        let public = &state.listeners[0];
        assert_eq!(public.name, "public_listener:10.0.0.1:21000");
        assert_eq!(public.direction, Direction::Inbound);
        assert_eq!(public.balance_connections, BalanceConnections::Exact);
        assert_eq!(public.routers.len(), 1);

        let router = &public.routers[0];
        assert!(router.inbound_tls.is_some());
        let dst = router.l7().expect("must be an L7 destination");
        assert_eq!(dst.protocol, L7Protocol::Http);
        assert_eq!(dst.stat_prefix, naming::PUBLIC_LISTENER);
        assert!(dst.static_route);
        assert!(dst.add_empty_intention);
        assert!(!dst.include_xfcc);
        assert_eq!(dst.max_inbound_connections, 50);

        let route = &state.routes[naming::PUBLIC_LISTENER];
        let rule = &route.virtual_hosts[0].route_rules[0];
        assert_eq!(rule.r#match, RouteMatch::default());
        assert_eq!(
            rule.destination.configuration,
            Some(DestinationConfiguration {
                timeout_config: Some(TimeoutConfig {
                    timeout: Some(Duration::from_secs(3)),
                    idle_timeout: None,
                }),
                ..Default::default()
            })
        );
    }

    #[test]
    fn public_listener_escape_hatch() {
        let mut snap = mk_connect_proxy();
        snap.proxy.config = mk_config(json!({
            "envoy_public_listener_json": "{\"name\":\"custom-public\"}",
        }));

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let public = &builder.state.listeners[0];
        assert_eq!(public.name, naming::PUBLIC_LISTENER);
        assert_eq!(public.direction, Direction::Inbound);
        assert_eq!(
            public.escape_hatch_listener.as_deref(),
            Some("{\"name\":\"custom-public\"}")
        );
        assert!(public.routers.is_empty());
    }

    #[test]
    fn permissive_mode_admits_plaintext_on_the_service_port() {
        let mut snap = mk_connect_proxy();
        snap.proxy.mode = ProxyMode::Transparent;
        snap.proxy.mutual_tls_mode = MutualTlsMode::Permissive;

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let public = &builder.state.listeners[0];
        assert_eq!(public.capabilities, vec![Capability::Transparent]);
        assert_eq!(public.routers.len(), 2);

        let permissive = &public.routers[1];
        assert!(permissive.inbound_tls.is_none());
        assert_eq!(
            permissive.r#match.as_ref().and_then(|m| m.destination_port),
            Some(8080)
        );
        assert_eq!(
            permissive.l4().map(|d| d.stat_prefix.as_str()),
            Some("permissive_public_listener")
        );

        snap.proxy.mutual_tls_mode = MutualTlsMode::Strict;
        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        assert_eq!(builder.state.listeners[0].routers.len(), 1);
    }

    #[test]
    fn explicit_upstreams_get_dedicated_listeners() {
        let mut snap = mk_connect_proxy();
        let db = UpstreamId::service("db");
        snap.connect_proxy
            .upstreams
            .discovery_chain
            .insert(db.clone(), mk_chain("db", "tcp"));
        snap.connect_proxy.upstreams.upstream_config.insert(
            db,
            Upstream {
                destination_name: "db".to_string(),
                local_bind_port: 9191,
                ..Default::default()
            },
        );

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let state = builder.state;
        assert_eq!(state.listeners.len(), 2);

        let l = &state.listeners[1];
        assert_eq!(l.name, "db:127.0.0.1:9191");
        assert_eq!(
            l.bind_address,
            Some(BindAddress::HostPort {
                host: "127.0.0.1".to_string(),
                port: 9191,
            })
        );
        let dst = l.routers[0].l4().expect("must be an L4 destination");
        assert_eq!(dst.name, naming::service_sni("db", "", "", "", "dc1", TRUST_DOMAIN));
        assert_eq!(dst.stat_prefix, "upstream.db.default.default.dc1");
    }

    #[test]
    fn socket_upstreams_listen_on_the_socket() {
        let u = Upstream {
            destination_name: "db".to_string(),
            local_bind_socket_path: "/tmp/db.sock".to_string(),
            local_bind_socket_mode: "0600".to_string(),
            ..Default::default()
        };
        let l = make_upstream_listener("db", &u);
        assert_eq!(l.name, "db:/tmp/db.sock");
        assert_eq!(
            l.bind_address,
            Some(BindAddress::UnixSocket {
                path: "/tmp/db.sock".to_string(),
                mode: "0600".to_string(),
            })
        );
    }

    #[test]
    fn escape_hatch_replaces_the_upstream_listener() {
        let mut snap = mk_connect_proxy();
        let db = UpstreamId::service("db");
        snap.connect_proxy
            .upstreams
            .discovery_chain
            .insert(db.clone(), mk_chain("db", "tcp"));
        snap.connect_proxy.upstreams.upstream_config.insert(
            db,
            Upstream {
                destination_name: "db".to_string(),
                local_bind_port: 9191,
                config: mk_config(json!({ "envoy_listener_json": "{\"name\":\"custom\"}" })),
                ..Default::default()
            },
        );

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let l = &builder.state.listeners[1];
        assert_eq!(l.name, "db");
        assert_eq!(l.escape_hatch_listener.as_deref(), Some("{\"name\":\"custom\"}"));
        assert!(l.routers.is_empty());
    }

    #[test]
    fn transparent_upstreams_match_virtual_ips() {
        let ep = with_vips(
            mk_endpoint("node1", "10.0.1.1", 8080),
            &[
                (TAGGED_ADDRESS_VIRTUAL_IP, "240.0.0.1"),
                (VIRTUAL_IP_TAG, "10.96.0.10"),
            ],
        );
        let snap = mk_transparent(vec![ep]);

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let outbound = outbound_listener(&builder.state);
        assert_eq!(outbound.name, "outbound_listener:127.0.0.1:15001");
        assert_eq!(outbound.capabilities, vec![Capability::Transparent]);
        assert_eq!(outbound.routers.len(), 1);
        let ranges = &outbound.routers[0].r#match.as_ref().unwrap().prefix_ranges;
        assert_eq!(
            ranges,
            &vec![
                "10.96.0.10/32".parse::<IpNet>().unwrap(),
                "240.0.0.1/32".parse::<IpNet>().unwrap(),
            ]
        );
        assert_eq!(
            outbound.default_router.as_ref().and_then(|r| r.l4()).map(|d| d.name.as_str()),
            Some(naming::ORIGINAL_DESTINATION_CLUSTER)
        );
    }

    #[test]
    fn virtual_ip_order_does_not_matter() {
        let a = with_vips(
            mk_endpoint("node1", "10.0.1.1", 8080),
            &[(TAGGED_ADDRESS_VIRTUAL_IP, "240.0.0.1")],
        );
        let b = with_vips(
            mk_endpoint("node2", "10.0.1.2", 8080),
            &[(VIRTUAL_IP_TAG, "10.96.0.10"), (TAGGED_ADDRESS_VIRTUAL_IP, "240.0.0.1")],
        );

        let ranges = |eps| {
            let snap = mk_transparent(eps);
            let mut builder = mk_builder(&snap);
            builder.listeners_from_snapshot().unwrap();
            outbound_listener(&builder.state).routers[0].r#match.clone()
        };
        assert_eq!(ranges(vec![a.clone(), b.clone()]), ranges(vec![b, a]));
    }

    #[test]
    fn upstreams_without_virtual_ips_are_not_matched() {
        let snap = mk_transparent(vec![mk_endpoint("node1", "10.0.1.1", 8080)]);
        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        assert!(outbound_listener(&builder.state).routers.is_empty());
    }

    #[test]
    fn destinations_share_http_routes_per_port() {
        let mut snap = mk_transparent(vec![]);
        let mut dest = |name: &str, protocol: &str, addresses: &[&str], port| {
            snap.connect_proxy.destinations_upstream.insert(
                UpstreamId::service(name),
                ServiceConfigEntry {
                    name: name.to_string(),
                    protocol: protocol.to_string(),
                    destination: Some(DestinationConfig {
                        addresses: addresses.iter().map(|a| a.to_string()).collect(),
                        port,
                    }),
                    ..Default::default()
                },
            );
        };
        dest("api", "http", &["api.example.com"], 80);
        dest("web", "http", &["www.example.com"], 80);
        dest("kafka", "tcp", &["192.168.2.1", "kafka.example.com"], 9093);

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let outbound = outbound_listener(&builder.state);
        assert_eq!(
            outbound.capabilities,
            vec![
                Capability::Transparent,
                Capability::L4TlsInspection,
                Capability::L7ProtocolInspection,
            ]
        );

        let http = outbound
            .routers
            .iter()
            .filter_map(|r| r.l7())
            .collect::<Vec<_>>();
        assert_eq!(http.len(), 1);
        assert!(!http[0].static_route);
        assert_eq!(
            http[0].name,
            format!("destination.80.~http.default.dc1.internal.{TRUST_DOMAIN}")
        );

        let tcp = outbound
            .routers
            .iter()
            .filter(|r| r.l4().is_some())
            .map(|r| r.r#match.clone().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(
            tcp,
            vec![
                Match {
                    prefix_ranges: vec!["192.168.2.1/32".parse().unwrap()],
                    destination_port: Some(9093),
                    ..Default::default()
                },
                Match {
                    server_names: vec!["kafka.example.com".to_string()],
                    destination_port: Some(9093),
                    ..Default::default()
                },
            ]
        );
    }

    #[test]
    fn passthrough_routers_and_mesh_only_mode() {
        let mut snap = mk_transparent(vec![]);
        let db = UpstreamId::service("db");
        snap.connect_proxy.upstreams.passthrough_upstreams.insert(
            db,
            btreemap! {
                target_id("db", "dc1") => ["10.0.1.1".to_string()].into_iter().collect(),
            },
        );
        snap.connect_proxy.upstreams.mesh_config = Some(MeshConfigEntry {
            transparent_proxy: mesh_proxystate_snapshot::mesh::TransparentProxyMeshConfig {
                mesh_destinations_only: true,
            },
            ..Default::default()
        });

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let outbound = outbound_listener(&builder.state);
        assert!(outbound.default_router.is_none());
        assert_eq!(outbound.routers.len(), 1);
        let dst = outbound.routers[0].l4().unwrap();
        assert_eq!(
            dst.name,
            naming::passthrough_cluster(&naming::service_sni("db", "", "", "", "dc1", TRUST_DOMAIN))
        );
        assert_eq!(dst.stat_prefix, "upstream.db.default.default.dc1");
    }

    #[test]
    fn peered_upstreams_use_peered_clusters() {
        let mut snap = mk_connect_proxy();
        let payments = UpstreamId {
            peer: "cluster-01".to_string(),
            ..UpstreamId::service("payments")
        };
        let upstreams = &mut snap.connect_proxy.upstreams;
        upstreams.peer_upstream_endpoints.insert(
            payments.clone(),
            vec![mk_endpoint("node1", "10.1.0.1", 8443)],
        );
        upstreams.upstream_peer_trust_bundles.insert(
            "cluster-01".to_string(),
            PeeringTrustBundle {
                peer_name: "cluster-01".to_string(),
                trust_domain: "peer1.consul".to_string(),
                root_pems: vec![],
            },
        );
        upstreams.upstream_config.insert(
            payments,
            Upstream {
                destination_name: "payments".to_string(),
                destination_namespace: "default".to_string(),
                destination_peer: "cluster-01".to_string(),
                local_bind_port: 9292,
                ..Default::default()
            },
        );

        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        let l = &builder.state.listeners[1];
        assert_eq!(l.name, "payments?peer=cluster-01:127.0.0.1:9292");
        let dst = l.routers[0].l4().unwrap();
        assert_eq!(dst.name, "payments.default.cluster-01.external.peer1.consul");
        assert_eq!(dst.stat_prefix, "upstream_peered.payments.default.cluster-01");
    }

    #[test]
    fn tcp_destinations_require_a_cluster() {
        let snap = mk_connect_proxy();
        let mut builder = mk_builder(&snap);
        let err = builder
            .router_destination(&DestinationOpts {
                protocol: "tcp",
                use_rds: true,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::TcpWithRds));

        let err = builder
            .router_destination(&DestinationOpts {
                protocol: "tcp",
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::MissingTcpCluster));

        let err = builder
            .router_destination(&DestinationOpts {
                protocol: "http",
                cluster: "db",
                use_rds: true,
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::ClusterWithRds));

        let err = builder
            .router_destination(&DestinationOpts {
                protocol: "grpc",
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, Error::MissingClusterWithoutRds));
    }

    #[test]
    fn gateways_have_no_listeners_yet() {
        let mut snap = mk_connect_proxy();
        snap.kind = ServiceKind::MeshGateway;
        let mut builder = mk_builder(&snap);
        builder.listeners_from_snapshot().unwrap();
        assert!(builder.state.listeners.is_empty());

        snap.kind = ServiceKind::Typical;
        let mut builder = mk_builder(&snap);
        assert!(matches!(
            builder.listeners_from_snapshot(),
            Err(Error::InvalidServiceKind(ServiceKind::Typical))
        ));
    }
}
