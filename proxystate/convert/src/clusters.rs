use crate::{endpoints::endpoint_health_and_weight, naming, tls, upstream_config, Builder, Error};
use ahash::AHashSet as HashSet;
use mesh_proxystate_core::{
    cluster::{
        DiscoveryType, DnsEndpointGroup, DnsEndpointGroupConfig, DynamicEndpointGroup,
        DynamicEndpointGroupConfig, EndpointGroup, FailoverGroup, FailoverTarget, LbPolicy,
        OutlierDetection, PassthroughEndpointGroup, StaticEndpointGroup, UpstreamLimits,
    },
    Cluster, Endpoint, HealthStatus,
};
use mesh_proxystate_snapshot::{
    chain::LoadBalancer, upstream::DestinationType, CheckServiceNode, CompiledDiscoveryChain,
    MeshGatewayMode, PassiveHealthCheck, PeeringServiceMeta, ServiceKind, Upstream,
    UpstreamConfig, UpstreamId,
};
use std::time::Duration;
use tracing::{debug, trace, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

impl Builder<'_> {
    pub(crate) fn clusters_from_snapshot(&mut self) -> Result<(), Error> {
        match self.snap.kind {
            ServiceKind::ConnectProxy => self.clusters_for_connect_proxy(),
            kind => Err(Error::InvalidServiceKind(kind)),
        }
    }

    // Every upstream skipped here must also be skipped when building endpoints
    // so that each cluster has its endpoints.
    fn clusters_for_connect_proxy(&mut self) -> Result<(), Error> {
        let snap = self.snap;

        let (name, cluster) =
            self.make_app_cluster(naming::LOCAL_APP_CLUSTER, "", snap.proxy.local_service_port);
        self.state.clusters.insert(name, cluster);

        if snap.is_transparent() {
            self.make_passthrough_clusters()?;
        }

        for (uid, chain) in &snap.connect_proxy.upstreams.discovery_chain {
            let (upstream, skip) = snap.get_upstream(uid);
            if skip {
                continue;
            }
            self.make_upstream_clusters_for_discovery_chain(uid, upstream, chain)?;
        }

        let upstreams = &snap.connect_proxy.upstreams;
        for uid in upstreams.peered_upstream_ids() {
            let (upstream, skip) = snap.get_upstream(&uid);
            if skip {
                continue;
            }
            let meta = match upstreams.upstream_peer_meta(&uid) {
                Some(meta) => meta.clone(),
                None => {
                    warn!(upstream = %uid, "failed to fetch upstream peering metadata for cluster");
                    PeeringServiceMeta::default()
                }
            };
            let cfg = upstream_config::for_peered_listener(&uid, upstream, &meta);
            self.make_upstream_cluster_for_peer_service(&uid, &cfg, &meta)?;
        }

        for u in &snap.proxy.upstreams {
            if u.destination_type != DestinationType::PreparedQuery {
                continue;
            }
            self.make_upstream_cluster_for_prepared_query(u)?;
        }

        // Paths served on a port other than the service's get their own
        // cluster.
        for path in self.exposed_paths() {
            if path.local_path_port == snap.proxy.local_service_port {
                continue;
            }
            let (name, cluster) = self.make_app_cluster(
                &naming::expose_cluster(path.local_path_port),
                path.protocol(),
                path.local_path_port,
            );
            self.state.clusters.insert(name, cluster);
        }

        Ok(())
    }

    /// A static cluster for the local application listening on `port`. Its
    /// single endpoint is stored alongside it.
    fn make_app_cluster(&mut self, name: &str, path_protocol: &str, port: u32) -> (String, Cluster) {
        let snap = self.snap;
        let proxy = &snap.proxy;
        let cfg = self.proxy_config();

        let endpoint = if proxy.local_service_socket_path.is_empty() {
            let addr = if proxy.local_service_address.is_empty() {
                "127.0.0.1"
            } else {
                proxy.local_service_address.as_str()
            };
            Endpoint::host_port(addr, port)
        } else {
            Endpoint::unix_socket(&proxy.local_service_socket_path)
        };
        self.state
            .endpoints
            .insert(name.to_string(), vec![endpoint].into());

        let circuit_breakers = (cfg.max_inbound_connections > 0).then(|| UpstreamLimits {
            max_connections: Some(cfg.max_inbound_connections.min(u32::MAX as u64) as u32),
            ..Default::default()
        });
        let protocol = if path_protocol.is_empty() {
            cfg.protocol.as_str()
        } else {
            path_protocol
        };
        let cluster = Cluster::endpoint_group(EndpointGroup::Static(StaticEndpointGroup {
            connect_timeout: cfg.local_connect_timeout(),
            circuit_breakers,
        }))
        .with_protocol(protocol);
        (name.to_string(), cluster)
    }

    /// Clusters for traffic redirected to the outbound listener: the catch-all
    /// for destinations outside the catalog, one per directly dialable mesh
    /// target, and one per address of each terminating-gateway destination.
    fn make_passthrough_clusters(&mut self) -> Result<(), Error> {
        let snap = self.snap;
        let td = snap.trust_domain();

        let mesh_destinations_only = snap
            .mesh_config()
            .map_or(false, |m| m.transparent_proxy.mesh_destinations_only);
        if !mesh_destinations_only {
            self.state.clusters.insert(
                naming::ORIGINAL_DESTINATION_CLUSTER.to_string(),
                Cluster::endpoint_group(EndpointGroup::Passthrough(PassthroughEndpointGroup {
                    connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                    outbound_tls: None,
                })),
            );
        }

        let upstreams = &snap.connect_proxy.upstreams;
        for (uid, chain) in &upstreams.discovery_chain {
            let targets = match upstreams.passthrough_upstreams.get(uid) {
                Some(targets) => targets,
                None => continue,
            };
            for tid in targets.keys() {
                let target_uid = UpstreamId::from_target_id(tid);
                let sni = naming::service_sni(
                    &target_uid.name,
                    "",
                    target_uid.namespace_or_default(),
                    target_uid.partition_or_default(),
                    &snap.datacenter,
                    td,
                );
                let connect_timeout = chain
                    .targets
                    .get(tid)
                    .map(|t| t.connect_timeout)
                    .filter(|t| !t.is_zero())
                    .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

                let spiffe_id = self.upstream_spiffe_id(&target_uid);
                let outbound_tls = self.create_outbound_mesh_mtls(vec![spiffe_id], sni.clone())?;
                self.state.clusters.insert(
                    naming::passthrough_cluster(&sni),
                    Cluster::endpoint_group(EndpointGroup::Passthrough(PassthroughEndpointGroup {
                        connect_timeout,
                        outbound_tls: Some(outbound_tls),
                    })),
                );
            }
        }

        for (uid, svc) in &snap.connect_proxy.destinations_upstream {
            let destination = match svc.destination.as_ref() {
                Some(d) => d,
                None => continue,
            };
            for address in &destination.addresses {
                let name = naming::destination_cluster(
                    &uid.name,
                    address,
                    uid.namespace_or_default(),
                    uid.partition_or_default(),
                    &snap.datacenter,
                    td,
                );
                let sni = naming::service_sni(
                    &uid.name,
                    "",
                    uid.namespace_or_default(),
                    uid.partition_or_default(),
                    &snap.datacenter,
                    td,
                );
                let spiffe_id = self.upstream_spiffe_id(uid);
                let outbound_tls = self.create_outbound_mesh_mtls(vec![spiffe_id], sni)?;
                let group = DynamicEndpointGroup {
                    config: DynamicEndpointGroupConfig {
                        connect_timeout: DEFAULT_CONNECT_TIMEOUT,
                        outlier_detection: Some(OutlierDetection::default()),
                        ..Default::default()
                    },
                    outbound_tls: Some(outbound_tls),
                };
                self.state.clusters.insert(
                    name.clone(),
                    Cluster::endpoint_group(EndpointGroup::Dynamic(group)).with_alt_stat_name(name),
                );
            }
        }

        Ok(())
    }

    fn upstream_spiffe_id(&self, uid: &UpstreamId) -> String {
        naming::spiffe_id(
            self.snap.trust_domain(),
            uid.namespace_or_default(),
            uid.partition_or_default(),
            &self.snap.datacenter,
            &uid.name,
        )
    }

    /// One cluster per resolver node of the chain. A resolver with failover
    /// targets becomes a failover cluster wrapping one endpoint group per
    /// target.
    fn make_upstream_clusters_for_discovery_chain(
        &mut self,
        uid: &UpstreamId,
        upstream: Option<&Upstream>,
        chain: &CompiledDiscoveryChain,
    ) -> Result<(), Error> {
        let raw = upstream_config::parse_no_defaults(uid, upstream);

        let mut resolvers = chain
            .nodes
            .iter()
            .filter_map(|(name, node)| Some((name, node, node.resolver()?)))
            .collect::<Vec<_>>();
        resolvers.sort_by(|(a, ..), (b, ..)| a.cmp(b));

        for (_, node, resolver) in resolvers {
            let primary = self.target_cluster_name(chain, &resolver.target, false);
            if primary.is_empty() {
                continue;
            }

            let cfg = upstream_config::finalize(raw.clone(), chain, resolver.connect_timeout);
            let mapped = self.map_disco_chain_targets(chain, node)?;
            let groups = mapped.grouped_targets(self.locality)?;

            let mut failover = mapped.failover.then(|| FailoverGroup {
                endpoint_groups: vec![],
                connect_timeout: resolver.connect_timeout,
            });

            for group in groups {
                debug!(cluster = %group.cluster_name, "Generating cluster");
                let ti = match group.targets.as_slice() {
                    [] => continue,
                    [ti] => ti,
                    _ => return Err(Error::TooManyTargets),
                };

                let outbound_tls = match ti.transport_socket.clone() {
                    Some(ts) => ts,
                    None => self.create_outbound_mesh_mtls(ti.spiffe_ids.clone(), ti.sni.clone())?,
                };
                let lb_policy = lb_policy(node.load_balancer.as_ref(), &group.cluster_name)?;
                let dynamic = EndpointGroup::Dynamic(DynamicEndpointGroup {
                    config: DynamicEndpointGroupConfig {
                        connect_timeout: resolver.connect_timeout,
                        use_alt_stat_name: true,
                        circuit_breakers: upstream_limits(&cfg),
                        outlier_detection: Some(make_outlier_detection(
                            cfg.passive_health_check.as_ref(),
                            true,
                        )),
                        lb_policy,
                        ..Default::default()
                    },
                    outbound_tls: Some(outbound_tls),
                });

                match failover.as_mut() {
                    Some(failover) => failover.endpoint_groups.push(FailoverTarget {
                        name: group.cluster_name,
                        group: dynamic,
                    }),
                    None => {
                        self.state.clusters.insert(
                            mapped.base_cluster_name.clone(),
                            Cluster::endpoint_group(dynamic)
                                .with_alt_stat_name(&mapped.base_cluster_name)
                                .with_protocol(&cfg.protocol),
                        );
                    }
                }
            }

            if let Some(failover) = failover {
                self.state.clusters.insert(
                    mapped.base_cluster_name.clone(),
                    Cluster::failover(failover)
                        .with_alt_stat_name(&mapped.base_cluster_name)
                        .with_protocol(&cfg.protocol),
                );
            }
        }

        Ok(())
    }

    /// The cluster for a service imported from a cluster peer. Instances
    /// addressed by hostnames are resolved by the data plane unless traffic
    /// leaves through the local mesh gateway.
    fn make_upstream_cluster_for_peer_service(
        &mut self,
        uid: &UpstreamId,
        cfg: &UpstreamConfig,
        meta: &PeeringServiceMeta,
    ) -> Result<(), Error> {
        let snap = self.snap;
        let upstreams = snap.upstreams()?;
        let bundle = upstreams
            .upstream_peer_trust_bundles
            .get(&uid.peer)
            .ok_or_else(|| Error::PeerTrustBundleNotReady(uid.peer.clone()))?;
        let name = naming::peered_cluster(uid, bundle);

        // Peer health checks do not account for resolvers, splitters and
        // routers, so outlier detection may eject every instance.
        let mut outlier_detection = make_outlier_detection(cfg.passive_health_check.as_ref(), true);
        outlier_detection.max_ejection_percent = Some(100);

        trace!(cluster = %name, "Generating cluster");
        let outbound_tls = tls::peer_outbound_mtls(
            &uid.peer,
            meta.spiffe_id.clone(),
            meta.primary_sni().to_string(),
        );

        let use_eds = !(upstreams.peer_upstream_endpoints_use_hostnames.contains(uid)
            && cfg.mesh_gateway.mode != MeshGatewayMode::Local);
        let group = if use_eds {
            EndpointGroup::Dynamic(DynamicEndpointGroup {
                config: DynamicEndpointGroupConfig {
                    connect_timeout: cfg.connect_timeout(),
                    disable_panic_threshold: true,
                    circuit_breakers: upstream_limits(cfg),
                    outlier_detection: Some(outlier_detection),
                    ..Default::default()
                },
                outbound_tls: Some(outbound_tls),
            })
        } else {
            let instances = upstreams
                .peer_upstream_endpoints
                .get(uid)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let endpoints = hostname_endpoints(instances, true, false);
            self.state
                .endpoints
                .insert(name.clone(), endpoints.into());

            EndpointGroup::Dns(DnsEndpointGroup {
                config: DnsEndpointGroupConfig {
                    connect_timeout: cfg.connect_timeout(),
                    disable_panic_threshold: true,
                    circuit_breakers: upstream_limits(cfg),
                    outlier_detection: Some(outlier_detection),
                    discovery_type: DiscoveryType::Logical,
                    ..Default::default()
                },
                outbound_tls: Some(outbound_tls),
            })
        };

        self.state.clusters.insert(name, Cluster::endpoint_group(group));
        Ok(())
    }

    fn make_upstream_cluster_for_prepared_query(&mut self, u: &Upstream) -> Result<(), Error> {
        let snap = self.snap;
        let uid = UpstreamId::from_upstream(u);
        let td = snap.trust_domain();
        let sni = naming::upstream_sni(u, "", &snap.datacenter, td);
        let cfg = upstream_config::parse(&uid, u);

        // Identities of the services the query may return, once per
        // datacenter.
        let mut seen = HashSet::new();
        let mut spiffe_ids = vec![];
        let instances = snap
            .connect_proxy
            .prepared_query_endpoints
            .get(&uid)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for ep in instances {
            let svc = &ep.service;
            let id = format!(
                "{}/{}/{}/{}",
                ep.node.datacenter,
                svc.partition_or_default(),
                svc.namespace_or_default(),
                svc.service
            );
            if !seen.insert(id) {
                continue;
            }
            let name = if svc.connect_native {
                &svc.service
            } else {
                &svc.proxy_destination_service_name
            };
            spiffe_ids.push(naming::spiffe_id(
                td,
                svc.namespace_or_default(),
                svc.partition_or_default(),
                &ep.node.datacenter,
                name,
            ));
        }

        let outbound_tls = self.create_outbound_mesh_mtls(spiffe_ids, sni.clone())?;
        let group = DynamicEndpointGroup {
            config: DynamicEndpointGroupConfig {
                connect_timeout: cfg.connect_timeout(),
                disable_panic_threshold: true,
                circuit_breakers: upstream_limits(&cfg),
                outlier_detection: Some(make_outlier_detection(
                    cfg.passive_health_check.as_ref(),
                    true,
                )),
                ..Default::default()
            },
            outbound_tls: Some(outbound_tls),
        };
        self.state.clusters.insert(
            sni,
            Cluster::endpoint_group(EndpointGroup::Dynamic(group)).with_protocol(&cfg.protocol),
        );
        Ok(())
    }
}

/// Picks the single endpoint the data plane resolves for instances addressed
/// by hostname: the first healthy instance, or else the last unhealthy one.
fn hostname_endpoints(
    instances: &[CheckServiceNode],
    is_remote: bool,
    only_passing: bool,
) -> Vec<Endpoint> {
    let mut hostnames = HashSet::new();
    let mut chosen = None;
    let mut fallback = None;
    for ep in instances {
        let (addr, port) = ep.best_address(is_remote);
        hostnames.insert(addr.clone());

        let (health, weight) = endpoint_health_and_weight(ep, only_passing);
        let endpoint = Endpoint::host_port(&addr, port).weighted(health, weight);
        let picked = (ep, addr, endpoint);
        if health == HealthStatus::Unhealthy {
            fallback = Some(picked);
        } else if chosen.is_none() {
            chosen = Some(picked);
        }
    }

    let (ep, hostname, endpoint) = match (chosen, fallback) {
        (Some(chosen), _) => chosen,
        (None, Some(fallback)) => {
            warn!(
                dc = %fallback.0.node.datacenter,
                service = %fallback.0.service.service,
                "upstream service does not contain any healthy instances"
            );
            fallback
        }
        (None, None) => return vec![],
    };

    if hostnames.len() > 1 {
        warn!(
            dc = %ep.node.datacenter,
            service = %ep.service.service,
            %hostname,
            "service contains instances with more than one unique hostname; only one will be resolved"
        );
    }
    vec![endpoint]
}

/// Passive health checking for a cluster. Unset values keep the data plane's
/// defaults; `allow_zero` lets a zero enforcement percentage through.
fn make_outlier_detection(p: Option<&PassiveHealthCheck>, allow_zero: bool) -> OutlierDetection {
    let mut od = OutlierDetection::default();
    let p = match p {
        Some(p) => p,
        None => return od,
    };

    if !p.interval.is_zero() {
        od.interval = p.interval.as_unsigned();
    }
    if p.max_failures != 0 {
        od.consecutive_5xx = Some(p.max_failures);
    }
    if let Some(enforcing) = p.enforcing_consecutive_5xx {
        if enforcing != 0 || allow_zero {
            od.enforcing_consecutive_5xx = Some(enforcing);
        }
    }
    od.max_ejection_percent = p.max_ejection_percent;
    od.base_ejection_time = p.base_ejection_time.and_then(|d| d.as_unsigned());
    od
}

fn upstream_limits(cfg: &UpstreamConfig) -> Option<UpstreamLimits> {
    let limits = cfg.limits.as_ref()?;
    Some(UpstreamLimits {
        max_connections: limits.max_connections,
        max_pending_requests: limits.max_pending_requests,
        max_concurrent_requests: limits.max_concurrent_requests,
    })
}

fn lb_policy(lb: Option<&LoadBalancer>, cluster: &str) -> Result<Option<LbPolicy>, Error> {
    let lb = match lb {
        Some(lb) => lb,
        None => return Ok(None),
    };
    let policy = match lb.policy.as_str() {
        "" => return Ok(None),
        "least_request" => LbPolicy::LeastRequest {
            choice_count: lb.least_request_config.as_ref().map(|c| c.choice_count),
        },
        "round_robin" => LbPolicy::RoundRobin,
        "random" => LbPolicy::Random,
        "ring_hash" => {
            let ring = lb.ring_hash_config.as_ref();
            LbPolicy::RingHash {
                minimum_ring_size: ring.map(|r| r.minimum_ring_size),
                maximum_ring_size: ring.map(|r| r.maximum_ring_size),
            }
        }
        "maglev" => LbPolicy::Maglev,
        policy => {
            return Err(Error::UnsupportedLbPolicy {
                cluster: cluster.to_string(),
                policy: policy.to_string(),
            })
        }
    };
    Ok(Some(policy))
}
