use crate::{naming, Builder, Error};
use mesh_proxystate_core::{
    route::{
        AppendAction, Header, HeaderMatch, HeaderMatchKind, HeaderMutation, LoadBalancerHashPolicy,
        PathMatch, QueryParameterMatch, QueryParameterMatchKind, RetryPolicy, RouteDestination,
        RouteMatch, RouteRule, TimeoutConfig, VirtualHost, WeightedCluster,
    },
    Route,
};
use mesh_proxystate_snapshot::{
    chain::{
        DiscoveryRoute, DiscoverySplit, HttpHeaderModifiers, LoadBalancer, NodeKind,
        ServiceRouteDestination,
    },
    is_protocol_http_like, CompiledDiscoveryChain, ServiceKind, Timeout, UpstreamId,
};
use std::{collections::BTreeMap, time::Duration};

impl Builder<'_> {
    pub(crate) fn routes_from_snapshot(&mut self) -> Result<(), Error> {
        match self.snap.kind {
            ServiceKind::ConnectProxy => self.routes_for_connect_proxy(),
            kind => Err(Error::InvalidServiceKind(kind)),
        }
    }

    fn routes_for_connect_proxy(&mut self) -> Result<(), Error> {
        let snap = self.snap;
        for (uid, chain) in &snap.upstreams()?.discovery_chain {
            if chain.default {
                continue;
            }

            // Don't clobber a route that was already generated.
            let name = uid.envoy_id();
            if self.state.routes.contains_key(&name) {
                continue;
            }

            let vhost = self.make_upstream_host_for_discovery_chain(
                uid,
                chain,
                vec!["*".to_string()],
                false,
            )?;
            self.state.routes.insert(
                name,
                Route {
                    virtual_hosts: vec![vhost],
                },
            );
        }

        // HTTP destinations are grouped into one route per port, with a
        // virtual host per address.
        let mut by_port = BTreeMap::<String, BTreeMap<String, String>>::new();
        for svc in snap.connect_proxy.destinations_upstream.values() {
            let destination = match svc.destination.as_ref() {
                Some(d) if is_protocol_http_like(&svc.protocol) && !d.addresses.is_empty() => d,
                _ => continue,
            };

            let route_name = naming::destination_cluster(
                "~http",
                &destination.port.to_string(),
                svc.namespace_or_default(),
                svc.partition_or_default(),
                &snap.datacenter,
                snap.trust_domain(),
            );
            let clusters = by_port.entry(route_name).or_default();
            for address in &destination.addresses {
                let cluster = naming::destination_cluster(
                    &svc.name,
                    address,
                    svc.namespace_or_default(),
                    svc.partition_or_default(),
                    &snap.datacenter,
                    snap.trust_domain(),
                );
                clusters.insert(cluster, address.clone());
            }
        }
        for (route_name, clusters) in by_port {
            self.state
                .routes
                .insert(route_name, make_addresses_route(clusters));
        }

        Ok(())
    }

    /// Builds the virtual host that routes an upstream's traffic through its
    /// discovery chain.
    pub(crate) fn make_upstream_host_for_discovery_chain(
        &self,
        uid: &UpstreamId,
        chain: &CompiledDiscoveryChain,
        domains: Vec<String>,
        for_mesh_gateway: bool,
    ) -> Result<VirtualHost, Error> {
        let start = chain
            .start_node()
            .ok_or_else(|| Error::MissingStartNode(chain.service_name.clone()))?;

        let mut route_rules = Vec::new();
        match start.kind {
            NodeKind::Router(ref routes) => {
                for route in routes {
                    if let Some(rule) = self.make_route_rule(route, chain, for_mesh_gateway)? {
                        route_rules.push(rule);
                    }
                }
            }

            NodeKind::Splitter(ref splits) => {
                let mut destination =
                    self.make_route_destination_for_splitter(splits, chain, for_mesh_gateway)?;
                destination.configuration_mut().hash_policies =
                    hash_policies(start.load_balancer.as_ref())?;
                route_rules.push(RouteRule {
                    r#match: RouteMatch::default(),
                    destination,
                    header_mutations: vec![],
                });
            }

            NodeKind::Resolver(ref resolver) => {
                let cluster = self.target_cluster_name(chain, &resolver.target, for_mesh_gateway);
                // Unresolved targets are routed once their peer is ready.
                if !cluster.is_empty() {
                    let mut destination = RouteDestination::cluster(cluster);
                    let config = destination.configuration_mut();
                    config.hash_policies = hash_policies(start.load_balancer.as_ref())?;

                    // A resolver's timeout only applies when it is the start
                    // node; splits cannot carry their own timeouts.
                    if let Some(timeout) = timeout(resolver.request_timeout) {
                        config.timeout_config = Some(TimeoutConfig {
                            timeout: Some(timeout),
                            idle_timeout: None,
                        });
                    }

                    route_rules.push(RouteRule {
                        r#match: RouteMatch::default(),
                        destination,
                        header_mutations: vec![],
                    });
                }
            }
        }

        Ok(VirtualHost {
            name: uid.envoy_id(),
            domains,
            route_rules,
        })
    }

    fn make_route_rule(
        &self,
        route: &DiscoveryRoute,
        chain: &CompiledDiscoveryChain,
        for_mesh_gateway: bool,
    ) -> Result<Option<RouteRule>, Error> {
        let next = chain
            .nodes
            .get(&route.next_node)
            .ok_or_else(|| Error::MissingNode {
                chain: chain.service_name.clone(),
                node: route.next_node.clone(),
            })?;

        let mut destination = match next.kind {
            NodeKind::Splitter(ref splits) => {
                self.make_route_destination_for_splitter(splits, chain, for_mesh_gateway)?
            }
            NodeKind::Resolver(ref resolver) => {
                let cluster = self.target_cluster_name(chain, &resolver.target, for_mesh_gateway);
                if cluster.is_empty() {
                    return Ok(None);
                }
                RouteDestination::cluster(cluster)
            }
            NodeKind::Router(_) => return Err(Error::UnexpectedNodeAfterRoute(next.type_name())),
        };
        destination.configuration_mut().hash_policies =
            hash_policies(next.load_balancer.as_ref())?;

        let mut header_mutations = Vec::new();
        if let Some(ref dest) = route.definition.destination {
            let config = destination.configuration_mut();
            if !dest.prefix_rewrite.is_empty() {
                config.prefix_rewrite = Some(dest.prefix_rewrite.clone());
            }
            if dest.request_timeout != Timeout::Unset || dest.idle_timeout != Timeout::Unset {
                config.timeout_config = Some(TimeoutConfig {
                    timeout: timeout(dest.request_timeout),
                    idle_timeout: timeout(dest.idle_timeout),
                });
            }
            if dest.has_retry_features() {
                config.retry_policy = Some(retry_policy(dest));
            }
            header_mutations = header_mutations_for(
                dest.request_headers.as_ref(),
                dest.response_headers.as_ref(),
            );
        }

        Ok(Some(RouteRule {
            r#match: route_match(route),
            destination,
            header_mutations,
        }))
    }

    fn make_route_destination_for_splitter(
        &self,
        splits: &[DiscoverySplit],
        chain: &CompiledDiscoveryChain,
        for_mesh_gateway: bool,
    ) -> Result<RouteDestination, Error> {
        let mut clusters = Vec::with_capacity(splits.len());
        for split in splits {
            let next = chain
                .nodes
                .get(&split.next_node)
                .ok_or_else(|| Error::MissingNode {
                    chain: chain.service_name.clone(),
                    node: split.next_node.clone(),
                })?;
            let resolver = next
                .resolver()
                .ok_or_else(|| Error::UnexpectedSplitterDestination(next.type_name()))?;

            let name = self.target_cluster_name(chain, &resolver.target, for_mesh_gateway);
            if name.is_empty() {
                continue;
            }

            clusters.push(WeightedCluster {
                name,
                weight: split_weight(split.weight),
                header_mutations: header_mutations_for(
                    split.definition.request_headers.as_ref(),
                    split.definition.response_headers.as_ref(),
                ),
            });
        }

        if clusters.is_empty() {
            return Err(Error::EmptySplitter);
        }
        Ok(RouteDestination::weighted(clusters))
    }
}

/// Split weights are percentages with hundredths precision; destination
/// weights are integers, so they are scaled by 100.
fn split_weight(weight: f32) -> u32 {
    (weight * 100.0).round() as u32
}

/// A positive timeout is used as-is. A negative one disables the timeout,
/// which is expressed as zero.
fn timeout(t: Timeout) -> Option<Duration> {
    match t {
        Timeout::Unset => None,
        Timeout::Value(d) if d.is_zero() => None,
        Timeout::Value(d) => Some(d),
        Timeout::Disabled => Some(Duration::ZERO),
    }
}

/// One virtual host per destination address, ordered by cluster name
/// descending.
fn make_addresses_route(clusters: BTreeMap<String, String>) -> Route {
    let virtual_hosts = clusters
        .into_iter()
        .rev()
        .map(|(cluster, address)| VirtualHost {
            route_rules: vec![RouteRule {
                r#match: RouteMatch::default(),
                destination: RouteDestination::cluster(&cluster),
                header_mutations: vec![],
            }],
            name: cluster,
            domains: vec![address],
        })
        .collect();
    Route { virtual_hosts }
}

/// Path matches take precedence in the order exact, prefix and regex.
/// Header and query matches without a match kind are ignored.
fn route_match(route: &DiscoveryRoute) -> RouteMatch {
    let http = match route.definition.r#match.as_ref().and_then(|m| m.http.as_ref()) {
        Some(http) => http,
        None => return RouteMatch::default(),
    };

    let path_match = if !http.path_exact.is_empty() {
        PathMatch::Exact(http.path_exact.clone())
    } else if !http.path_prefix.is_empty() {
        PathMatch::Prefix(http.path_prefix.clone())
    } else if !http.path_regex.is_empty() {
        PathMatch::Regex(http.path_regex.clone())
    } else {
        PathMatch::Prefix("/".to_string())
    };

    let header_matches = http
        .header
        .iter()
        .filter_map(|hdr| {
            let r#match = if !hdr.exact.is_empty() {
                HeaderMatchKind::Exact(hdr.exact.clone())
            } else if !hdr.regex.is_empty() {
                HeaderMatchKind::Regex(hdr.regex.clone())
            } else if !hdr.prefix.is_empty() {
                HeaderMatchKind::Prefix(hdr.prefix.clone())
            } else if !hdr.suffix.is_empty() {
                HeaderMatchKind::Suffix(hdr.suffix.clone())
            } else if hdr.present {
                HeaderMatchKind::Present
            } else {
                return None;
            };
            Some(HeaderMatch {
                name: hdr.name.clone(),
                r#match,
                invert_match: hdr.invert,
            })
        })
        .collect();

    let query_parameter_matches = http
        .query_param
        .iter()
        .filter_map(|qp| {
            let r#match = if !qp.exact.is_empty() {
                QueryParameterMatchKind::Exact(qp.exact.clone())
            } else if !qp.regex.is_empty() {
                QueryParameterMatchKind::Regex(qp.regex.clone())
            } else if qp.present {
                QueryParameterMatchKind::Present
            } else {
                return None;
            };
            Some(QueryParameterMatch {
                name: qp.name.clone(),
                r#match,
            })
        })
        .collect();

    RouteMatch {
        path_match,
        header_matches,
        method_matches: http.methods.clone(),
        query_parameter_matches,
    }
}

fn hash_policies(lb: Option<&LoadBalancer>) -> Result<Vec<LoadBalancerHashPolicy>, Error> {
    let lb = match lb {
        Some(lb) if lb.is_hash_based() => lb,
        _ => return Ok(vec![]),
    };

    lb.hash_policies
        .iter()
        .map(|policy| {
            if policy.source_ip {
                return Ok(LoadBalancerHashPolicy::ConnectionProperties {
                    source_ip: true,
                    terminal: policy.terminal,
                });
            }

            match policy.field.as_str() {
                "header" => Ok(LoadBalancerHashPolicy::Header {
                    name: policy.field_value.clone(),
                    terminal: policy.terminal,
                }),
                "cookie" => {
                    let (path, ttl) = match policy.cookie_config {
                        // A zero TTL asks for a session cookie.
                        Some(ref c) if c.session => (c.path.clone(), Some(Duration::ZERO)),
                        Some(ref c) if !c.ttl.is_zero() => (c.path.clone(), Some(c.ttl)),
                        Some(ref c) => (c.path.clone(), None),
                        None => (String::new(), None),
                    };
                    Ok(LoadBalancerHashPolicy::Cookie {
                        name: policy.field_value.clone(),
                        path,
                        ttl,
                        terminal: policy.terminal,
                    })
                }
                "query_parameter" => Ok(LoadBalancerHashPolicy::QueryParameter {
                    name: policy.field_value.clone(),
                    terminal: policy.terminal,
                }),
                field => Err(Error::UnsupportedHashPolicyField(field.to_string())),
            }
        })
        .collect()
}

fn retry_policy(dest: &ServiceRouteDestination) -> RetryPolicy {
    let mut retry_on = Vec::<&str>::new();
    let mut push = |cond| {
        if !retry_on.contains(&cond) {
            retry_on.push(cond);
        }
    };
    for cond in &dest.retry_on {
        push(cond.as_str());
    }
    if dest.retry_on_connect_failure {
        push("connect-failure");
    }
    if !dest.retry_on_status_codes.is_empty() {
        push("retriable-status-codes");
    }

    RetryPolicy {
        num_retries: (dest.num_retries > 0).then_some(dest.num_retries),
        retry_on: retry_on.join(","),
        retriable_status_codes: dest.retry_on_status_codes.clone(),
    }
}

fn header_mutations_for(
    request: Option<&HttpHeaderModifiers>,
    response: Option<&HttpHeaderModifiers>,
) -> Vec<HeaderMutation> {
    let mut mutations = Vec::new();
    if let Some(req) = request.filter(|m| !m.is_zero()) {
        for (key, value, append_action) in header_adds(req) {
            mutations.push(HeaderMutation::RequestHeaderAdd {
                header: Header { key, value },
                append_action,
            });
        }
        if !req.remove.is_empty() {
            mutations.push(HeaderMutation::RequestHeaderRemove {
                header_keys: req.remove.clone(),
            });
        }
    }
    if let Some(rsp) = response.filter(|m| !m.is_zero()) {
        for (key, value, append_action) in header_adds(rsp) {
            mutations.push(HeaderMutation::ResponseHeaderAdd {
                header: Header { key, value },
                append_action,
            });
        }
        if !rsp.remove.is_empty() {
            mutations.push(HeaderMutation::ResponseHeaderRemove {
                header_keys: rsp.remove.clone(),
            });
        }
    }
    mutations
}

/// Added headers are appended to existing values; set headers replace them.
fn header_adds(
    m: &HttpHeaderModifiers,
) -> impl Iterator<Item = (String, String, AppendAction)> + '_ {
    let add = m
        .add
        .iter()
        .map(|(k, v)| (k.clone(), v.clone(), AppendAction::AppendIfExistsOrAdd));
    let set = m
        .set
        .iter()
        .map(|(k, v)| (k.clone(), v.clone(), AppendAction::OverwriteIfExistsOrAdd));
    add.chain(set)
}
