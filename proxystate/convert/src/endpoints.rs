use crate::{failover, naming, Builder, Error};
use ahash::AHashMap as HashMap;
use mesh_proxystate_core::{Endpoint, HealthStatus};
use mesh_proxystate_snapshot::{
    chain::PrioritizeByLocality, upstream::DestinationType, CheckServiceNode, CheckStatus,
    CompiledDiscoveryChain, GatewayKey, MeshGatewayMode, ServiceKind, Upstream, UpstreamId,
};
use tracing::{debug, warn};

/// The largest load-balancing weight the data plane accepts.
const MAX_WEIGHT: i32 = 128;

/// Instances that are load balanced together.
#[derive(Debug)]
struct EndpointGroup<'a> {
    endpoints: &'a [CheckServiceNode],
    only_passing: bool,

    /// Replaces each instance's own health, for gateways standing in for the
    /// instances behind them.
    override_health: Option<HealthStatus>,
}

impl Builder<'_> {
    pub(crate) fn endpoints_from_snapshot(&mut self) -> Result<(), Error> {
        match self.snap.kind {
            ServiceKind::ConnectProxy => self.endpoints_for_connect_proxy(),
            kind => Err(Error::InvalidServiceKind(kind)),
        }
    }

    // Every upstream skipped here must also be skipped when building clusters
    // so that each cluster has its endpoints.
    fn endpoints_for_connect_proxy(&mut self) -> Result<(), Error> {
        let snap = self.snap;
        let upstreams = &snap.connect_proxy.upstreams;

        for (uid, chain) in &upstreams.discovery_chain {
            let (upstream, skip) = snap.get_upstream(uid);
            if skip {
                continue;
            }
            for (cluster, endpoints) in self.endpoints_from_discovery_chain(uid, chain, upstream)? {
                self.state.endpoints.insert(cluster, endpoints.into());
            }
        }

        for uid in upstreams.peered_upstream_ids() {
            let (upstream, skip) = snap.get_upstream(&uid);
            if skip {
                continue;
            }
            let bundle = upstreams
                .upstream_peer_trust_bundles
                .get(&uid.peer)
                .ok_or_else(|| Error::PeerTrustBundleNotReady(uid.peer.clone()))?;
            let cluster = naming::peered_cluster(&uid, bundle);
            let mode = upstream.map(|u| u.mesh_gateway.mode).unwrap_or_default();
            if let Some(endpoints) = self.endpoints_for_peer_service(&uid, mode) {
                self.state.endpoints.insert(cluster, endpoints.into());
            }
        }

        // Prepared queries have no discovery chain.
        for u in &snap.proxy.upstreams {
            if u.destination_type != DestinationType::PreparedQuery {
                continue;
            }
            let uid = UpstreamId::from_upstream(u);
            let cluster = naming::upstream_sni(u, "", &snap.datacenter, snap.trust_domain());
            if let Some(eps) = snap.connect_proxy.prepared_query_endpoints.get(&uid) {
                let endpoints = self.endpoints_for_load_assignment(
                    None,
                    EndpointGroup::new(eps),
                    &snap.locality,
                );
                self.state.endpoints.insert(cluster, endpoints.into());
            }
        }

        // Destinations are reached through terminating gateways, which are
        // always dialed on their WAN addresses.
        for (uid, svc) in &snap.connect_proxy.destinations_upstream {
            let destination = match svc.destination.as_ref() {
                Some(d) => d,
                None => continue,
            };
            let gateways = match snap.connect_proxy.destination_gateways.get(uid) {
                Some(gateways) => gateways,
                None => continue,
            };
            for address in &destination.addresses {
                let cluster = naming::destination_cluster(
                    &uid.name,
                    address,
                    uid.namespace_or_default(),
                    uid.partition_or_default(),
                    &snap.datacenter,
                    snap.trust_domain(),
                );
                let endpoints = self.endpoints_for_load_assignment(
                    None,
                    EndpointGroup::new(gateways),
                    &GatewayKey::default(),
                );
                self.state.endpoints.insert(cluster, endpoints.into());
            }
        }

        Ok(())
    }

    /// Endpoints for every cluster a discovery chain's resolvers produce,
    /// keyed by cluster name.
    fn endpoints_from_discovery_chain(
        &self,
        uid: &UpstreamId,
        chain: &CompiledDiscoveryChain,
        upstream: Option<&Upstream>,
    ) -> Result<Vec<(String, Vec<Endpoint>)>, Error> {
        let snap = self.snap;
        let upstreams = &snap.connect_proxy.upstreams;
        let mode = upstream.map(|u| u.mesh_gateway.mode).unwrap_or_default();
        let no_endpoints = HashMap::new();
        let upstream_endpoints = upstreams
            .watched_upstream_endpoints
            .get(uid)
            .unwrap_or(&no_endpoints);
        let gateway_endpoints = upstreams
            .watched_gateway_endpoints
            .get(uid)
            .unwrap_or(&no_endpoints);

        let mut resolvers = chain
            .nodes
            .iter()
            .filter(|(_, node)| node.resolver().is_some())
            .collect::<Vec<_>>();
        resolvers.sort_by(|(a, _), (b, _)| a.cmp(b));

        let mut cluster_endpoints = Vec::new();
        for (_, node) in resolvers {
            let mapped = self.map_disco_chain_targets(chain, node)?;
            for group in mapped.grouped_targets(self.locality)? {
                let ti = match group.targets.as_slice() {
                    [] => continue,
                    [ti] => ti,
                    _ => return Err(Error::TooManyTargets),
                };
                debug!(cluster = %group.cluster_name, target = %ti.target_id, "Generating endpoints");

                let target_uid = UpstreamId::from_target_id(&ti.target_id);
                if !target_uid.peer.is_empty() {
                    if let Some(endpoints) = self.endpoints_for_peer_service(&target_uid, mode) {
                        cluster_endpoints.push((group.cluster_name, endpoints));
                    }
                    continue;
                }

                let endpoint_group = match load_assignment_endpoint_group(
                    chain,
                    upstream_endpoints,
                    gateway_endpoints,
                    &ti.target_id,
                    &snap.locality,
                )? {
                    Some(g) => g,
                    // Still waiting on the instances.
                    None => continue,
                };
                let endpoints = self.endpoints_for_load_assignment(
                    ti.prioritize_by_locality.as_ref(),
                    endpoint_group,
                    &snap.locality,
                );
                cluster_endpoints.push((group.cluster_name, endpoints));
            }
        }
        Ok(cluster_endpoints)
    }

    /// Endpoints for a service imported from a cluster peer. `None` when the
    /// cluster's endpoints are not provided separately or are not known yet.
    fn endpoints_for_peer_service(
        &self,
        uid: &UpstreamId,
        mode: MeshGatewayMode,
    ) -> Option<Vec<Endpoint>> {
        let snap = self.snap;
        let upstreams = &snap.connect_proxy.upstreams;

        if mode == MeshGatewayMode::None {
            warn!(upstream = %uid, "invalid mesh gateway mode 'none', defaulting to 'remote'");
        }

        // Traffic leaves through the local mesh gateway.
        if mode == MeshGatewayMode::Local {
            let gateways = match upstreams
                .watched_local_gw_endpoints
                .get(&snap.locality.to_string())
            {
                Some(gateways) => gateways,
                None => {
                    debug!(upstream = %uid, "local mesh gateway not ready");
                    return None;
                }
            };
            return Some(self.endpoints_for_load_assignment(
                None,
                EndpointGroup::new(gateways),
                &snap.locality,
            ));
        }

        // Hostnames are resolved by the cluster itself.
        if upstreams.peer_upstream_endpoints_use_hostnames.contains(uid) {
            return None;
        }

        let endpoints = upstreams.peer_upstream_endpoints.get(uid)?;
        Some(self.endpoints_for_load_assignment(
            None,
            EndpointGroup::new(endpoints),
            &GatewayKey::default(),
        ))
    }

    fn endpoints_for_load_assignment(
        &self,
        policy: Option<&PrioritizeByLocality>,
        group: EndpointGroup<'_>,
        local_key: &GatewayKey,
    ) -> Vec<Endpoint> {
        let by_locality = match failover::grouped_endpoints(
            self.locality,
            self.snap.service_locality.as_ref(),
            policy,
            group.endpoints,
        ) {
            Ok(groups) => groups,
            Err(error) => {
                debug!(%error, "Skipping endpoints that cannot be grouped by locality");
                return vec![];
            }
        };

        let mut endpoints = Vec::with_capacity(group.endpoints.len());
        for ep in by_locality.iter().flatten() {
            let wan = !local_key.matches(&ep.node.datacenter, ep.node.partition_or_default());
            let (addr, port) = ep.best_address(wan);
            let (mut health, weight) = endpoint_health_and_weight(ep, group.only_passing);
            if let Some(h) = group.override_health {
                health = h;
            }
            endpoints.push(Endpoint::host_port(addr, port).weighted(health, weight));
        }
        endpoints
    }
}

// === impl EndpointGroup ===

impl<'a> EndpointGroup<'a> {
    fn new(endpoints: &'a [CheckServiceNode]) -> Self {
        Self {
            endpoints,
            only_passing: false,
            override_health: None,
        }
    }
}

/// Selects the instances a target's cluster balances over: the target's own
/// instances, or the mesh gateways in front of them when the target is in
/// another datacenter or partition. `None` while the instances are unknown.
fn load_assignment_endpoint_group<'a>(
    chain: &CompiledDiscoveryChain,
    target_health: &'a HashMap<String, Vec<CheckServiceNode>>,
    gateway_health: &'a HashMap<String, Vec<CheckServiceNode>>,
    tid: &str,
    local_key: &GatewayKey,
) -> Result<Option<EndpointGroup<'a>>, Error> {
    let real = match target_health.get(tid) {
        Some(real) => real,
        None => return Ok(None),
    };
    let target = chain.targets.get(tid).ok_or_else(|| Error::MissingTarget {
        chain: chain.service_name.clone(),
        target: tid.to_string(),
    })?;

    let gateway_key = match target.mesh_gateway.mode {
        MeshGatewayMode::Remote => GatewayKey::new(&target.datacenter, &target.partition),
        MeshGatewayMode::Local => local_key.clone(),
        _ => GatewayKey::default(),
    };

    if gateway_key.is_empty() || local_key.matches(&target.datacenter, &target.partition) {
        return Ok(Some(EndpointGroup {
            endpoints: real,
            only_passing: target.subset.only_passing,
            override_health: None,
        }));
    }

    let gateways = match gateway_health.get(&gateway_key.to_string()) {
        Some(gateways) => gateways,
        None => return Ok(None),
    };

    // Gateways report the health of the instances behind them.
    let any_healthy = real.iter().any(|ep| {
        endpoint_health_and_weight(ep, target.subset.only_passing).0 == HealthStatus::Healthy
    });
    Ok(Some(EndpointGroup {
        endpoints: gateways,
        only_passing: false,
        override_health: Some(if any_healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }),
    }))
}

/// Derives an instance's health and load-balancing weight from its checks.
///
/// A weight below one means the instance should not receive traffic, so it is
/// reported unhealthy with the smallest valid weight.
pub(crate) fn endpoint_health_and_weight(
    ep: &CheckServiceNode,
    only_passing: bool,
) -> (HealthStatus, u32) {
    let mut health = HealthStatus::Healthy;
    let weights = ep.service.weights.as_ref();
    let mut weight = weights.map_or(1, |w| w.passing);

    for check in &ep.checks {
        if check.status == CheckStatus::Critical {
            health = HealthStatus::Unhealthy;
        }
        if only_passing && check.status != CheckStatus::Passing {
            health = HealthStatus::Unhealthy;
        }
        if check.status == CheckStatus::Warning {
            if let Some(w) = weights {
                weight = w.warning;
            }
        }
    }

    if weight < 1 {
        health = HealthStatus::Unhealthy;
        weight = 1;
    }
    (health, weight.min(MAX_WEIGHT) as u32)
}
