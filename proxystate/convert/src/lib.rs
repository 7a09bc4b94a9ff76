#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Converts a proxy's [`ConfigSnapshot`] into the [`ProxyState`] a data-plane
//! proxy is configured from.
//!
//! A conversion is a pure function of the snapshot: every call builds a fresh
//! `ProxyState` and either returns all of it or fails. Data that has not been
//! replicated yet, such as a peer's trust bundle, causes the affected
//! listeners or clusters to be omitted; they appear in the conversion of a
//! later snapshot.

mod clusters;
mod endpoints;
mod error;
mod expose;
pub mod failover;
mod listeners;
pub mod naming;
mod platform;
mod routes;
mod tls;
mod upstream_config;

pub use self::{
    error::Error,
    failover::{CommunityLocality, LocalityPolicy},
    platform::{ConfigFetcher, HostPlatform, Platform},
};
pub use mesh_proxystate_core::ProxyState;
pub use mesh_proxystate_snapshot::{ConfigSnapshot, ProxySnapshot};

use mesh_proxystate_snapshot::ProxyConfig;
use tracing::{debug, warn};

/// Converts snapshots using the host collaborators it was built with.
#[derive(Clone, Debug)]
pub struct Converter<F, P = HostPlatform, L = CommunityLocality> {
    fetcher: F,
    platform: P,
    locality: L,
}

/// The state of a single conversion.
struct Builder<'a> {
    snap: &'a ConfigSnapshot,
    fetcher: &'a dyn ConfigFetcher,
    platform: &'a dyn Platform,
    locality: &'a dyn LocalityPolicy,
    config: ProxyConfig,
    state: ProxyState,
}

// === impl Converter ===

impl<F: ConfigFetcher> Converter<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            platform: HostPlatform::default(),
            locality: CommunityLocality,
        }
    }
}

impl<F, P, L> Converter<F, P, L>
where
    F: ConfigFetcher,
    P: Platform,
    L: LocalityPolicy,
{
    pub fn with_platform<Q: Platform>(self, platform: Q) -> Converter<F, Q, L> {
        Converter {
            fetcher: self.fetcher,
            platform,
            locality: self.locality,
        }
    }

    pub fn with_locality_policy<M: LocalityPolicy>(self, locality: M) -> Converter<F, P, M> {
        Converter {
            fetcher: self.fetcher,
            platform: self.platform,
            locality,
        }
    }

    /// Builds the proxy state for a snapshot.
    ///
    /// Stages run in a fixed order: TLS, listeners, endpoints, clusters and
    /// then routes.
    pub fn proxy_state_from_snapshot(
        &self,
        snapshot: Option<&dyn ProxySnapshot>,
    ) -> Result<ProxyState, Error> {
        let snap = snapshot
            .and_then(|s| s.as_config_snapshot())
            .ok_or(Error::NilSnapshot)?;

        let mut builder = Builder::new(snap, &self.fetcher, &self.platform, &self.locality);
        builder.tls_from_snapshot()?;
        builder.listeners_from_snapshot()?;
        builder.endpoints_from_snapshot()?;
        builder.clusters_from_snapshot()?;
        builder.routes_from_snapshot()?;

        let state = builder.state;
        debug!(
            service = %snap.service,
            listeners = state.listeners.len(),
            clusters = state.clusters.len(),
            routes = state.routes.len(),
            endpoints = state.endpoints.len(),
            "Converted snapshot"
        );
        Ok(state)
    }
}

// === impl Builder ===

impl<'a> Builder<'a> {
    fn new(
        snap: &'a ConfigSnapshot,
        fetcher: &'a dyn ConfigFetcher,
        platform: &'a dyn Platform,
        locality: &'a dyn LocalityPolicy,
    ) -> Self {
        let config = ProxyConfig::parse(&snap.proxy.config).unwrap_or_else(|diag| {
            warn!(error = %diag.error, "failed to parse Connect.Proxy.Config");
            diag.into_value()
        });
        Self {
            snap,
            fetcher,
            platform,
            locality,
            config,
            state: ProxyState::default(),
        }
    }

    /// The proxy's parsed configuration. Fields that failed to parse hold
    /// their defaults.
    pub(crate) fn proxy_config(&self) -> ProxyConfig {
        self.config.clone()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::*;
    use maplit::hashmap;
    use mesh_proxystate_snapshot::{ServiceKind, Upstream, UpstreamId};

    /// A snapshot of a proxy type this converter knows nothing about.
    #[derive(Debug)]
    struct ForeignSnapshot;

    impl ProxySnapshot for ForeignSnapshot {
        fn as_config_snapshot(&self) -> Option<&ConfigSnapshot> {
            None
        }
    }

    fn mk_converter() -> Converter<StaticFetcher, StaticPlatform> {
        Converter::new(StaticFetcher("10.0.0.1")).with_platform(StaticPlatform(false))
    }

    #[test]
    fn missing_snapshots_are_rejected() {
        init_tracing();
        let converter = mk_converter();
        assert!(matches!(
            converter.proxy_state_from_snapshot(None),
            Err(Error::NilSnapshot)
        ));
        assert!(matches!(
            converter.proxy_state_from_snapshot(Some(&ForeignSnapshot)),
            Err(Error::NilSnapshot)
        ));
    }

    #[test]
    fn gateways_are_not_converted() {
        let mut snap = mk_connect_proxy();
        snap.kind = ServiceKind::MeshGateway;
        assert!(matches!(
            mk_converter().proxy_state_from_snapshot(Some(&snap)),
            Err(Error::InvalidServiceKind(ServiceKind::MeshGateway))
        ));
    }

    #[test]
    fn malformed_proxy_config_keeps_valid_fields() {
        let mut snap = mk_connect_proxy();
        snap.proxy.config = mk_config(serde_json::json!({
            "protocol": "http",
            "local_connect_timeout_ms": "soon",
        }));

        let builder = mk_builder(&snap);
        assert_eq!(builder.config.protocol, "http");
        assert_eq!(builder.config.local_connect_timeout_ms, 5000);

        let state = mk_converter()
            .proxy_state_from_snapshot(Some(&snap))
            .expect("conversion must succeed");
        assert!(state.listeners[0].routers[0].l7().is_some());
        assert_eq!(
            state.clusters[naming::LOCAL_APP_CLUSTER].protocol.as_deref(),
            Some("http")
        );
    }

    #[test]
    fn converts_a_connect_proxy() {
        let mut snap = mk_connect_proxy();
        let db = UpstreamId::service("db");
        let chain = mk_chain("db", "tcp");
        let upstreams = &mut snap.connect_proxy.upstreams;
        upstreams.watched_upstream_endpoints.insert(
            db.clone(),
            hashmap! { chain.id() => vec![mk_endpoint("node1", "10.0.1.1", 5432)] }
                .into_iter()
                .collect(),
        );
        upstreams.discovery_chain.insert(db.clone(), chain);
        upstreams.upstream_config.insert(
            db,
            Upstream {
                destination_name: "db".to_string(),
                local_bind_port: 9191,
                ..Default::default()
            },
        );

        let state = mk_converter()
            .proxy_state_from_snapshot(Some(&snap))
            .expect("conversion must succeed");

        let names = state
            .listeners
            .iter()
            .map(|l| l.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec!["public_listener:10.0.0.1:9999", "db:127.0.0.1:9191"]
        );

        let sni = naming::service_sni("db", "", "", "", "dc1", TRUST_DOMAIN);
        assert!(state.clusters.contains_key(naming::LOCAL_APP_CLUSTER));
        assert!(state.clusters.contains_key(&sni));
        assert_eq!(state.endpoints[&sni].endpoints.len(), 1);

        // TCP upstreams and the TCP local app need no routes.
        assert!(state.routes.is_empty());

        assert!(state.trust_bundles.contains_key("local"));
        assert!(state.tls.is_some());
        let inbound = state.listeners[0].routers[0]
            .inbound_tls
            .as_ref()
            .expect("public listener must terminate mTLS");
        assert!(state.leaf_certificates.contains_key(inbound.identity_key()));
    }
}
