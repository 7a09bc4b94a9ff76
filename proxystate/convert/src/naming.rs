//! Deterministic names for the clusters, listeners and identities the
//! converter generates.
//!
//! Every name here is a pure function of its inputs. Names are the only
//! cross references in proxy state, so generating the same name twice for
//! different inputs (or two names for the same input) silently misroutes
//! traffic.

use mesh_proxystate_snapshot::{
    upstream::DestinationType, CompiledDiscoveryChain, PeeringTrustBundle, Upstream, UpstreamId,
    DEFAULT,
};

/// The cluster that fronts the proxied application.
pub const LOCAL_APP_CLUSTER: &str = "local_app";

/// The catch-all cluster that forwards redirected traffic to wherever it was
/// originally headed.
pub const ORIGINAL_DESTINATION_CLUSTER: &str = "original-destination";

pub const PUBLIC_LISTENER: &str = "public_listener";
pub const OUTBOUND_LISTENER: &str = "outbound_listener";

/// The port outbound traffic is redirected to in transparent mode.
pub const DEFAULT_TPROXY_OUTBOUND_PORT: u32 = 15001;

const PASSTHROUGH_PREFIX: &str = "passthrough~";
const FAILOVER_TARGET_PREFIX: &str = "failover-target~";
const MESH_GATEWAY_EXPORTED_PREFIX: &str = "exported~";
const DESTINATION_PREFIX: &str = "destination.";

/// The SNI a service's instances are addressed by within a trust domain.
///
/// Empty namespaces and partitions stand for `default`; partitioned names
/// carry a versioned suffix so that they never collide with the legacy
/// format.
pub fn service_sni(
    service: &str,
    subset: &str,
    namespace: &str,
    partition: &str,
    datacenter: &str,
    trust_domain: &str,
) -> String {
    let namespace = or_default(namespace);
    let partition = or_default(partition);

    let mut sni = String::new();
    if !subset.is_empty() {
        sni.push_str(subset);
        sni.push('.');
    }
    if partition == DEFAULT {
        sni.push_str(&format!(
            "{service}.{namespace}.{datacenter}.internal.{trust_domain}"
        ));
    } else {
        sni.push_str(&format!(
            "{service}.{namespace}.{partition}.{datacenter}.internal-v1.{trust_domain}"
        ));
    }
    sni
}

pub fn query_sni(query: &str, datacenter: &str, trust_domain: &str) -> String {
    format!("{query}.default.{datacenter}.query.{trust_domain}")
}

/// The SNI an explicitly configured upstream is dialed with. An upstream's own
/// datacenter takes precedence over `datacenter`.
pub fn upstream_sni(u: &Upstream, subset: &str, datacenter: &str, trust_domain: &str) -> String {
    let datacenter = if u.datacenter.is_empty() {
        datacenter
    } else {
        &u.datacenter
    };
    match u.destination_type {
        DestinationType::PreparedQuery => query_sni(&u.destination_name, datacenter, trust_domain),
        DestinationType::Service => service_sni(
            &u.destination_name,
            subset,
            &u.destination_namespace,
            &u.destination_partition,
            datacenter,
            trust_domain,
        ),
    }
}

/// The SPIFFE URI identifying a service's workloads.
pub fn spiffe_id(
    trust_domain: &str,
    namespace: &str,
    partition: &str,
    datacenter: &str,
    service: &str,
) -> String {
    let namespace = or_default(namespace);
    let partition = or_default(partition);
    if partition == DEFAULT {
        format!("spiffe://{trust_domain}/ns/{namespace}/dc/{datacenter}/svc/{service}")
    } else {
        format!(
            "spiffe://{trust_domain}/ap/{partition}/ns/{namespace}/dc/{datacenter}/svc/{service}"
        )
    }
}

/// The name of a cluster that dials one address of a destination outside the
/// mesh through a terminating gateway.
pub fn destination_cluster(
    name: &str,
    address: &str,
    namespace: &str,
    partition: &str,
    datacenter: &str,
    trust_domain: &str,
) -> String {
    let service = format!("{}.{name}", address.replace([':', '.'], "-"));
    let sni = service_sni(&service, "", namespace, partition, datacenter, trust_domain);
    format!("{DESTINATION_PREFIX}{sni}")
}

pub fn passthrough_cluster(sni: &str) -> String {
    format!("{PASSTHROUGH_PREFIX}{sni}")
}

pub fn expose_cluster(port: u32) -> String {
    format!("exposed_cluster_{port}")
}

/// The cluster serving the `index`th target of a failover sequence.
pub fn failover_target_cluster(index: usize, base: &str) -> String {
    format!("{FAILOVER_TARGET_PREFIX}{index}~{base}")
}

/// The cluster for an upstream imported from a cluster peer, qualified with
/// the peer's trust domain.
pub fn peered_cluster(uid: &UpstreamId, bundle: &PeeringTrustBundle) -> String {
    [
        uid.name.as_str(),
        uid.namespace_or_default(),
        uid.peer.as_str(),
        "external",
        bundle.trust_domain.as_str(),
    ]
    .join(".")
}

/// Qualifies a cluster name with the chain's customization hash. `~` keeps
/// the result from being mistaken for a subset name.
pub fn customize_cluster(name: &str, chain: &CompiledDiscoveryChain) -> String {
    if chain.customization_hash.is_empty() {
        return name.to_string();
    }
    format!("{}~{name}", chain.customization_hash)
}

pub fn exported_cluster(name: &str) -> String {
    format!("{MESH_GATEWAY_EXPORTED_PREFIX}{name}")
}

fn or_default(s: &str) -> &str {
    if s.is_empty() {
        DEFAULT
    } else {
        s
    }
}
