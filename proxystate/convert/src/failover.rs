//! Grouping of a resolver's targets into the clusters that serve them.

use crate::{naming, tls, Builder, Error};
use mesh_proxystate_core::tls::TransportSocket;
use mesh_proxystate_snapshot::{
    chain::{FailoverPolicy, PrioritizeByLocality},
    CheckServiceNode, CompiledDiscoveryChain, DiscoveryGraphNode, Locality, UpstreamId,
};
use tracing::{debug, warn};

/// Everything needed to dial one discovery target.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetInfo {
    pub target_id: String,
    pub sni: String,
    pub spiffe_ids: Vec<String>,
    /// The target's region, known only for peered targets.
    pub region: Option<String>,
    pub prioritize_by_locality: Option<PrioritizeByLocality>,
    /// Replaces the default outbound TLS settings of the target's cluster.
    pub transport_socket: Option<TransportSocket>,
}

/// The targets of one resolver node, in failover order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiscoChainTargets {
    pub base_cluster_name: String,
    pub targets: Vec<TargetInfo>,
    pub failover: bool,
    pub failover_policy: FailoverPolicy,
}

/// The targets served by a single cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetGroup {
    pub cluster_name: String,
    pub targets: Vec<TargetInfo>,
}

/// Locality-aware ordering of failover targets and endpoints.
///
/// Implementations may be swapped in when the converter is built; the
/// [`CommunityLocality`] policy supports neither.
pub trait LocalityPolicy {
    /// Orders failover targets so that targets closer to the proxy are tried
    /// first.
    fn order_by_locality(&self, targets: &DiscoChainTargets) -> Result<Vec<TargetGroup>, Error>;

    /// Splits a target's endpoints into priority groups, nearest first. Only
    /// called for prioritize modes other than `none`.
    fn prioritize_by_locality(
        &self,
        locality: Option<&Locality>,
        policy: &PrioritizeByLocality,
        endpoints: &[CheckServiceNode],
    ) -> Result<Vec<Vec<CheckServiceNode>>, Error>;
}

/// The policy used unless another is configured.
#[derive(Copy, Clone, Debug, Default)]
pub struct CommunityLocality;

// === impl DiscoChainTargets ===

impl DiscoChainTargets {
    pub fn grouped_targets(&self, locality: &dyn LocalityPolicy) -> Result<Vec<TargetGroup>, Error> {
        if !self.failover {
            return Ok(vec![TargetGroup {
                cluster_name: self.base_cluster_name.clone(),
                targets: self.targets.clone(),
            }]);
        }

        match self.failover_policy.mode.as_str() {
            "" | "sequential" => Ok(self.sequential()),
            "order-by-locality" => locality.order_by_locality(self),
            mode => Err(Error::UnexpectedFailoverPolicy(mode.to_string())),
        }
    }

    fn sequential(&self) -> Vec<TargetGroup> {
        self.targets
            .iter()
            .enumerate()
            .map(|(i, t)| TargetGroup {
                cluster_name: naming::failover_target_cluster(i, &self.base_cluster_name),
                targets: vec![t.clone()],
            })
            .collect()
    }
}

/// Splits endpoints into the priority groups a target's prioritize-by-locality
/// policy asks for. Without a policy every endpoint shares one group.
pub(crate) fn grouped_endpoints(
    locality: &dyn LocalityPolicy,
    service_locality: Option<&Locality>,
    policy: Option<&PrioritizeByLocality>,
    endpoints: &[CheckServiceNode],
) -> Result<Vec<Vec<CheckServiceNode>>, Error> {
    match policy {
        Some(p) if !matches!(p.mode.as_str(), "" | "none") => {
            locality.prioritize_by_locality(service_locality, p, endpoints)
        }
        _ => Ok(vec![endpoints.to_vec()]),
    }
}

// === impl Builder ===

impl Builder<'_> {
    /// The cluster a discovery target is served by, or an empty name when a
    /// peered target's trust bundle has not arrived yet.
    pub(crate) fn target_cluster_name(
        &self,
        chain: &CompiledDiscoveryChain,
        tid: &str,
        for_mesh_gateway: bool,
    ) -> String {
        let mut name = chain
            .targets
            .get(tid)
            .map(|t| t.name.clone())
            .unwrap_or_default();

        let target_uid = UpstreamId::from_target_id(tid);
        if !target_uid.peer.is_empty() {
            let bundle = self.snap.upstreams().ok().and_then(|u| {
                u.upstream_peer_trust_bundles.get(&target_uid.peer)
            });
            match bundle {
                Some(bundle) => name = naming::peered_cluster(&target_uid, bundle),
                None => {
                    debug!(
                        peer = %target_uid.peer,
                        target = %tid,
                        "peer trust bundle not ready for discovery chain target"
                    );
                    return String::new();
                }
            }
        }

        let name = naming::customize_cluster(&name, chain);
        if for_mesh_gateway {
            return naming::exported_cluster(&name);
        }
        name
    }

    /// Resolves the targets of a resolver node, primary first, along with
    /// the TLS settings each is dialed with.
    pub(crate) fn map_disco_chain_targets(
        &self,
        chain: &CompiledDiscoveryChain,
        node: &DiscoveryGraphNode,
    ) -> Result<DiscoChainTargets, Error> {
        let resolver = match node.resolver() {
            Some(r) => r,
            None => return Err(Error::UnexpectedStartNode(node.type_name())),
        };

        let mut mapped = DiscoChainTargets {
            base_cluster_name: self.target_cluster_name(chain, &resolver.target, false),
            ..Default::default()
        };

        let mut tids = vec![resolver.target.clone()];
        if let Some(failover) = resolver.failover.as_ref() {
            tids.extend(failover.targets.iter().cloned());
            mapped.failover = true;
            mapped.failover_policy = failover.policy.clone().unwrap_or_default();
        }

        let snap = self.snap;
        for tid in tids {
            let target = chain
                .targets
                .get(&tid)
                .ok_or_else(|| Error::MissingTarget {
                    chain: chain.service_name.clone(),
                    target: tid.clone(),
                })?;
            let target_uid = UpstreamId::from_target_id(&tid);
            let mut ti = TargetInfo {
                target_id: tid.clone(),
                prioritize_by_locality: target.prioritize_by_locality.clone(),
                ..Default::default()
            };

            if target_uid.peer.is_empty() {
                ti.sni = target.sni.clone();
                ti.spiffe_ids = vec![naming::spiffe_id(
                    snap.trust_domain(),
                    &target.namespace,
                    &target.partition,
                    &target.datacenter,
                    &target.service,
                )];
            } else {
                let upstreams = snap.upstreams()?;
                let meta = match upstreams.upstream_peer_meta(&target_uid) {
                    Some(meta) => meta,
                    None => {
                        warn!(target = %target_uid, "failed to fetch upstream peering metadata");
                        continue;
                    }
                };
                ti.sni = meta.primary_sni().to_string();
                ti.spiffe_ids = meta.spiffe_id.clone();
                ti.region = Some(
                    target
                        .locality
                        .as_ref()
                        .map(|l| l.region.clone())
                        .unwrap_or_default(),
                );
                ti.transport_socket = Some(tls::peer_outbound_mtls(
                    &target_uid.peer,
                    ti.spiffe_ids.clone(),
                    ti.sni.clone(),
                ));
            }
            mapped.targets.push(ti);
        }

        Ok(mapped)
    }
}

// === impl CommunityLocality ===

impl LocalityPolicy for CommunityLocality {
    fn order_by_locality(&self, _: &DiscoChainTargets) -> Result<Vec<TargetGroup>, Error> {
        Err(Error::EnterpriseFeature("order-by-locality"))
    }

    fn prioritize_by_locality(
        &self,
        _: Option<&Locality>,
        _: &PrioritizeByLocality,
        _: &[CheckServiceNode],
    ) -> Result<Vec<Vec<CheckServiceNode>>, Error> {
        Err(Error::EnterpriseFeature("prioritize-by-locality"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_targets(n: usize, mode: &str) -> DiscoChainTargets {
        DiscoChainTargets {
            base_cluster_name: "db.default.dc1.internal.td.consul".to_string(),
            targets: (0..n)
                .map(|i| TargetInfo {
                    target_id: format!("db.default.default.dc{}", i + 1),
                    ..Default::default()
                })
                .collect(),
            failover: true,
            failover_policy: FailoverPolicy {
                mode: mode.to_string(),
                regions: vec![],
            },
        }
    }

    #[test]
    fn sequential_failover_names_each_target() {
        for mode in ["", "sequential"] {
            let groups = mk_targets(3, mode)
                .grouped_targets(&CommunityLocality::default())
                .unwrap();
            let names = groups
                .iter()
                .map(|g| g.cluster_name.as_str())
                .collect::<Vec<_>>();
            assert_eq!(
                names,
                vec![
                    "failover-target~0~db.default.dc1.internal.td.consul",
                    "failover-target~1~db.default.dc1.internal.td.consul",
                    "failover-target~2~db.default.dc1.internal.td.consul",
                ]
            );
            for (i, g) in groups.iter().enumerate() {
                assert_eq!(g.targets.len(), 1);
                assert_eq!(g.targets[0].target_id, format!("db.default.default.dc{}", i + 1));
            }
        }
    }

    #[test]
    fn without_failover_targets_share_the_base_cluster() {
        let mut targets = mk_targets(1, "");
        targets.failover = false;
        let groups = targets
            .grouped_targets(&CommunityLocality::default())
            .unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].cluster_name, targets.base_cluster_name);
        assert_eq!(groups[0].targets, targets.targets);
    }

    #[test]
    fn locality_ordering_needs_a_policy() {
        let err = mk_targets(2, "order-by-locality")
            .grouped_targets(&CommunityLocality::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "order-by-locality is an enterprise feature");
    }

    #[test]
    fn unknown_failover_modes_are_rejected() {
        let err = mk_targets(2, "round-robin")
            .grouped_targets(&CommunityLocality::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnexpectedFailoverPolicy(m) if m == "round-robin"));
    }

    #[test]
    fn endpoints_share_a_group_without_prioritization() {
        let eps = vec![CheckServiceNode::default(), CheckServiceNode::default()];
        let none = PrioritizeByLocality {
            mode: "none".to_string(),
        };
        for policy in [None, Some(&none)] {
            let groups =
                grouped_endpoints(&CommunityLocality::default(), None, policy, &eps).unwrap();
            assert_eq!(groups, vec![eps.clone()]);
        }

        let failover = PrioritizeByLocality {
            mode: "failover".to_string(),
        };
        assert!(
            grouped_endpoints(&CommunityLocality::default(), None, Some(&failover), &eps).is_err()
        );
    }
}
