#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The protocol-agnostic proxy state produced for a single data-plane proxy.
//!
//! Everything in this crate is plain data. Names are the only cross
//! references: routers and route rules name clusters and routes, transport
//! sockets name leaf certificates and trust bundles.

pub mod cluster;
pub mod endpoint;
pub mod listener;
mod network_match;
pub mod route;
pub mod tls;

pub use self::{
    cluster::Cluster,
    endpoint::{Endpoint, Endpoints, HealthStatus},
    listener::{Listener, Router},
    network_match::{exact_net, NetworkMatch},
    route::Route,
    tls::{LeafCertificate, Tls, TrustBundle},
};
pub use ipnet::{IpNet, Ipv4Net, Ipv6Net};

use ahash::AHashMap as HashMap;

/// The trust bundle key reserved for the local trust domain.
pub const LOCAL_PEER_KEY: &str = "local";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProxyState {
    /// Listeners, in the order they were generated.
    pub listeners: Vec<Listener>,

    /// Clusters keyed by cluster name.
    pub clusters: HashMap<String, Cluster>,

    /// Routes keyed by route name.
    pub routes: HashMap<String, Route>,

    /// Endpoints keyed by the name of the cluster they belong to.
    pub endpoints: HashMap<String, Endpoints>,

    /// Trust bundles keyed by peer name, plus [`LOCAL_PEER_KEY`].
    pub trust_bundles: HashMap<String, TrustBundle>,

    /// Leaf certificates keyed by the identity key a transport socket refers to.
    pub leaf_certificates: HashMap<String, LeafCertificate>,

    pub tls: Option<Tls>,
}

// === impl ProxyState ===

impl ProxyState {
    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }
}
