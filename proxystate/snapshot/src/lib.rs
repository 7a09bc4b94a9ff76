#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The read-only view of a proxy's mesh configuration that proxy state is
//! generated from.
//!
//! A [`ConfigSnapshot`] is produced elsewhere and handed to the converter
//! whole; nothing in this crate watches or mutates it.

pub mod chain;
mod config;
pub mod duration;
pub mod health;
pub mod mesh;
mod snapshot;
pub mod upstream;

pub use self::{
    chain::{CompiledDiscoveryChain, DiscoveryGraphNode, DiscoveryTarget, NodeKind},
    config::{
        Diagnostic, PassiveHealthCheck, ProxyConfig, UpstreamConfig, UpstreamLimits,
    },
    duration::{GoDuration, Timeout},
    health::{CheckServiceNode, CheckStatus, HealthCheck, Node, NodeService},
    mesh::{
        Locality, MeshConfigEntry, MeshGatewayConfig, MeshGatewayMode, PeeringServiceMeta,
        PeeringTrustBundle, ServiceConfigEntry,
    },
    snapshot::{
        CaRoot, CheckType, ConfigSnapshot, ConfigSnapshotConnectProxy, ConfigSnapshotUpstreams,
        ConnectProxyConfig, ExposeConfig, ExposePath, GatewayKey, IndexedCaRoots, IssuedCert,
        ProxySnapshot, ServiceId, TransparentProxyConfig, UpstreamsUnavailable,
    },
    upstream::{DestinationType, Upstream, UpstreamId},
};

use std::fmt;

/// The kind of service a proxy is registered as.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    #[default]
    Typical,
    ConnectProxy,
    MeshGateway,
    TerminatingGateway,
    IngressGateway,
    ApiGateway,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ProxyMode {
    #[default]
    Default,
    Direct,
    Transparent,
}

/// Whether the public listener also accepts plaintext traffic that was
/// redirected to the service port.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum MutualTlsMode {
    #[default]
    Default,
    Strict,
    Permissive,
}

/// The partition or namespace name an empty value stands for.
pub const DEFAULT: &str = "default";

pub(crate) fn or_default(s: &str) -> &str {
    if s.is_empty() {
        DEFAULT
    } else {
        s
    }
}

/// Protocols that are routed at L7.
pub fn is_protocol_http_like(protocol: &str) -> bool {
    matches!(protocol, "http" | "http2" | "grpc")
}

// === impl ServiceKind ===

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Typical => "",
            Self::ConnectProxy => "connect-proxy",
            Self::MeshGateway => "mesh-gateway",
            Self::TerminatingGateway => "terminating-gateway",
            Self::IngressGateway => "ingress-gateway",
            Self::ApiGateway => "api-gateway",
        })
    }
}
