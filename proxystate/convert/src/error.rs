use mesh_proxystate_snapshot::{ServiceKind, UpstreamsUnavailable};

/// A failure that aborts a conversion. Partial proxy state is never returned
/// alongside one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("nil config snapshot")]
    NilSnapshot,

    #[error("Invalid service kind: {0}")]
    InvalidServiceKind(ServiceKind),

    #[error(transparent)]
    UpstreamsUnavailable(#[from] UpstreamsUnavailable),

    #[error("missing first node in compiled discovery chain for: {0}")]
    MissingStartNode(String),

    #[error("missing node {node:?} in compiled discovery chain for: {chain}")]
    MissingNode { chain: String, node: String },

    #[error("missing target {target:?} in compiled discovery chain for: {chain}")]
    MissingTarget { chain: String, target: String },

    #[error("expected discovery chain with single node, found unexpected start node: {0}")]
    UnexpectedStartNode(&'static str),

    #[error("unexpected graph node after route {0:?}")]
    UnexpectedNodeAfterRoute(&'static str),

    #[error("unexpected splitter destination node type: {0}")]
    UnexpectedSplitterDestination(&'static str),

    #[error("number of clusters in splitter must be > 0; got 0")]
    EmptySplitter,

    #[error("failed to apply load balancer configuration to route action: unsupported load balancer hash policy field: {0:?}")]
    UnsupportedHashPolicyField(String),

    #[error("failed to apply load balancer configuration to cluster {cluster:?}: unsupported load balancer policy {policy:?}")]
    UnsupportedLbPolicy { cluster: String, policy: String },

    #[error("cannot specify cluster name when using RDS")]
    ClusterWithRds,

    #[error("must specify cluster name when not using RDS")]
    MissingClusterWithoutRds,

    #[error("RDS is not compatible with the tcp proxy filter")]
    TcpWithRds,

    #[error("cluster name is required for a tcp proxy filter")]
    MissingTcpCluster,

    #[error("unexpected failover policy {0:?}")]
    UnexpectedFailoverPolicy(String),

    #[error("{0} is an enterprise feature")]
    EnterpriseFeature(&'static str),

    #[error("cannot have more than one target")]
    TooManyTargets,

    #[error("trust bundle not ready for peer {0}")]
    PeerTrustBundleNotReady(String),

    #[error("cannot inject peering trust bundles for kind {:?}", .0.to_string())]
    MeshTlsUnsupported(ServiceKind),

    #[error("failed to probe the host platform: {0}")]
    Platform(anyhow::Error),
}
