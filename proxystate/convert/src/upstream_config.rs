//! Resolution of an upstream's opaque configuration against the discovery
//! chain or peer it is served by.
//!
//! A malformed configuration never fails a conversion; it is reported and
//! the fields that failed to parse keep their defaults.

use mesh_proxystate_snapshot::{
    CompiledDiscoveryChain, MeshGatewayMode, PeeringServiceMeta, Upstream, UpstreamConfig,
    UpstreamId,
};
use std::time::Duration;
use tracing::warn;

const DEFAULT_PROTOCOL: &str = "tcp";
const DEFAULT_PEERED_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Parses an upstream's configuration, leaving unset values empty so that a
/// discovery chain may supply them.
pub(crate) fn parse_no_defaults(uid: &UpstreamId, upstream: Option<&Upstream>) -> UpstreamConfig {
    let config = match upstream {
        Some(u) => &u.config,
        None => return UpstreamConfig::default(),
    };
    UpstreamConfig::parse_no_defaults(config).unwrap_or_else(|diag| {
        warn!(upstream = %uid, error = %diag.error, "failed to parse");
        diag.into_value()
    })
}

/// Parses the configuration of an upstream that is not served by a
/// discovery chain.
pub(crate) fn parse(uid: &UpstreamId, upstream: &Upstream) -> UpstreamConfig {
    UpstreamConfig::parse(&upstream.config).unwrap_or_else(|diag| {
        warn!(upstream = %uid, error = %diag.error, "failed to parse");
        diag.into_value()
    })
}

/// Fills in what the configuration leaves unset from the chain and the
/// resolver's connect timeout.
pub(crate) fn finalize(
    mut cfg: UpstreamConfig,
    chain: &CompiledDiscoveryChain,
    connect_timeout: Duration,
) -> UpstreamConfig {
    if cfg.protocol.is_empty() {
        cfg.protocol = chain.protocol.clone();
    }
    if cfg.protocol.is_empty() {
        cfg.protocol = DEFAULT_PROTOCOL.to_string();
    }
    if cfg.connect_timeout_ms == 0 {
        cfg.connect_timeout_ms = connect_timeout.as_millis() as u64;
    }
    cfg
}

/// The configuration an upstream's listener is built from. A listener escape
/// hatch only applies to upstreams without routing configuration.
pub(crate) fn for_listener(
    uid: &UpstreamId,
    upstream: Option<&Upstream>,
    chain: &CompiledDiscoveryChain,
) -> UpstreamConfig {
    let mut cfg = parse_no_defaults(uid, upstream);
    if !chain.default && !cfg.envoy_listener_json.is_empty() {
        warn!(
            discovery_chain = %chain.service_name,
            upstream = %uid,
            config = "envoy_listener_json",
            "ignoring escape hatch setting because already configured for"
        );
        cfg.envoy_listener_json.clear();
    }

    if cfg.protocol.is_empty() {
        cfg.protocol = chain.protocol.clone();
    }
    if cfg.protocol.is_empty() {
        cfg.protocol = DEFAULT_PROTOCOL.to_string();
    }
    cfg
}

/// The configuration of an upstream imported from a cluster peer. The
/// protocol is always the one the exporting peer advertises.
pub(crate) fn for_peered_listener(
    uid: &UpstreamId,
    upstream: Option<&Upstream>,
    meta: &PeeringServiceMeta,
) -> UpstreamConfig {
    let mut cfg = parse_no_defaults(uid, upstream);

    cfg.protocol = if meta.protocol.is_empty() {
        DEFAULT_PROTOCOL.to_string()
    } else {
        meta.protocol.clone()
    };
    if cfg.connect_timeout_ms == 0 {
        cfg.connect_timeout_ms = DEFAULT_PEERED_CONNECT_TIMEOUT_MS;
    }
    if cfg.mesh_gateway.mode == MeshGatewayMode::Default {
        if let Some(u) = upstream {
            cfg.mesh_gateway = u.mesh_gateway.clone();
        }
    }
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_proxystate_snapshot::MeshGatewayConfig;
    use serde_json::json;

    fn mk_upstream(config: serde_json::Value) -> Upstream {
        Upstream {
            destination_name: "db".to_string(),
            config: config.as_object().cloned().unwrap_or_default(),
            ..Default::default()
        }
    }

    fn mk_chain(protocol: &str, default: bool) -> CompiledDiscoveryChain {
        CompiledDiscoveryChain {
            service_name: "db".to_string(),
            protocol: protocol.to_string(),
            default,
            ..Default::default()
        }
    }

    #[test]
    fn chain_supplies_protocol_and_timeout() {
        let uid = UpstreamId::service("db");
        let cfg = parse_no_defaults(&uid, None);
        let cfg = finalize(cfg, &mk_chain("http", false), Duration::from_secs(33));
        assert_eq!(cfg.protocol, "http");
        assert_eq!(cfg.connect_timeout_ms, 33_000);

        let u = mk_upstream(json!({ "protocol": "grpc", "connect_timeout_ms": 100 }));
        let cfg = finalize(
            parse_no_defaults(&uid, Some(&u)),
            &mk_chain("", false),
            Duration::from_secs(33),
        );
        assert_eq!(cfg.protocol, "grpc");
        assert_eq!(cfg.connect_timeout_ms, 100);

        let cfg = finalize(UpstreamConfig::default(), &mk_chain("", true), Duration::ZERO);
        assert_eq!(cfg.protocol, "tcp");
    }

    #[test]
    fn listener_escape_hatch_requires_default_chain() {
        let uid = UpstreamId::service("db");
        let u = mk_upstream(json!({ "envoy_listener_json": "{}" }));

        let cfg = for_listener(&uid, Some(&u), &mk_chain("tcp", true));
        assert_eq!(cfg.envoy_listener_json, "{}");

        let cfg = for_listener(&uid, Some(&u), &mk_chain("http", false));
        assert!(cfg.envoy_listener_json.is_empty());
        assert_eq!(cfg.protocol, "http");
    }

    #[test]
    fn malformed_fields_fall_back_to_defaults() {
        let uid = UpstreamId::service("db");
        let u = mk_upstream(json!({ "protocol": "http", "connect_timeout_ms": "soon" }));
        let cfg = for_listener(&uid, Some(&u), &mk_chain("", true));
        assert_eq!(cfg.protocol, "http");

        let cfg = parse(&uid, &u);
        assert_eq!(cfg.protocol, "http");
        assert_eq!(cfg.connect_timeout_ms, 5000);
    }

    #[test]
    fn peered_upstreams_use_the_peer_protocol() {
        let uid = UpstreamId {
            peer: "cluster-01".to_string(),
            ..UpstreamId::service("payments")
        };
        let mut u = mk_upstream(json!({ "protocol": "http" }));
        u.mesh_gateway = MeshGatewayConfig {
            mode: MeshGatewayMode::Local,
        };
        let meta = PeeringServiceMeta {
            protocol: "grpc".to_string(),
            ..Default::default()
        };

        let cfg = for_peered_listener(&uid, Some(&u), &meta);
        assert_eq!(cfg.protocol, "grpc");
        assert_eq!(cfg.connect_timeout_ms, 5000);
        assert_eq!(cfg.mesh_gateway.mode, MeshGatewayMode::Local);

        let cfg = for_peered_listener(&uid, None, &PeeringServiceMeta::default());
        assert_eq!(cfg.protocol, "tcp");
    }
}
