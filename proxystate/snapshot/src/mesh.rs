use crate::or_default;
use serde::Deserialize;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeshGatewayMode {
    #[default]
    #[serde(rename = "")]
    Default,
    None,
    Local,
    Remote,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MeshGatewayConfig {
    pub mode: MeshGatewayMode,
}

/// Mesh-wide configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshConfigEntry {
    pub transparent_proxy: TransparentProxyMeshConfig,
    pub tls: Option<MeshTlsConfig>,
    pub http: Option<MeshHttpConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransparentProxyMeshConfig {
    /// Restricts transparent proxies to destinations known to the mesh.
    pub mesh_destinations_only: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshTlsConfig {
    pub incoming: Option<MeshDirectionalTlsConfig>,
    pub outgoing: Option<MeshDirectionalTlsConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshDirectionalTlsConfig {
    pub tls_min_version: TlsVersion,
    pub tls_max_version: TlsVersion,
    pub cipher_suites: Vec<TlsCipherSuite>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MeshHttpConfig {
    pub sanitize_x_forwarded_client_cert: bool,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    #[default]
    Unspecified,
    Auto,
    V1_0,
    V1_1,
    V1_2,
    V1_3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
pub enum TlsCipherSuite {
    TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
    TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
    TLS_RSA_WITH_AES_128_GCM_SHA256,
    TLS_RSA_WITH_AES_128_CBC_SHA,
    TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
    TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
    TLS_RSA_WITH_AES_256_GCM_SHA384,
    TLS_RSA_WITH_AES_256_CBC_SHA,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownTlsName {
    kind: &'static str,
    value: String,
}

/// Root material of a cluster peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeeringTrustBundle {
    pub peer_name: String,
    pub trust_domain: String,
    pub root_pems: Vec<String>,
}

/// Replicated alongside every instance of a service imported from a peer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PeeringServiceMeta {
    pub sni: Vec<String>,
    pub spiffe_id: Vec<String>,
    pub protocol: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Locality {
    pub region: String,
    pub zone: String,
}

/// A service-defaults entry describing a destination outside the mesh that
/// is reached through a terminating gateway.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceConfigEntry {
    pub name: String,
    pub namespace: String,
    pub partition: String,
    pub protocol: String,
    pub destination: Option<DestinationConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DestinationConfig {
    /// IP addresses or hostnames.
    pub addresses: Vec<String>,
    pub port: u32,
}

// === impl MeshConfigEntry ===

impl MeshConfigEntry {
    pub fn tls_incoming(&self) -> Option<&MeshDirectionalTlsConfig> {
        self.tls.as_ref().and_then(|tls| tls.incoming.as_ref())
    }

    pub fn tls_outgoing(&self) -> Option<&MeshDirectionalTlsConfig> {
        self.tls.as_ref().and_then(|tls| tls.outgoing.as_ref())
    }
}

// === impl TlsVersion ===

impl std::str::FromStr for TlsVersion {
    type Err = UnknownTlsName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(Self::Unspecified),
            "TLS_AUTO" => Ok(Self::Auto),
            "TLSv1_0" => Ok(Self::V1_0),
            "TLSv1_1" => Ok(Self::V1_1),
            "TLSv1_2" => Ok(Self::V1_2),
            "TLSv1_3" => Ok(Self::V1_3),
            _ => Err(UnknownTlsName {
                kind: "TLS version",
                value: s.to_string(),
            }),
        }
    }
}

// === impl TlsCipherSuite ===

impl TlsCipherSuite {
    pub const ALL: [Self; 14] = [
        Self::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        Self::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        Self::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        Self::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        Self::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA,
        Self::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA,
        Self::TLS_RSA_WITH_AES_128_GCM_SHA256,
        Self::TLS_RSA_WITH_AES_128_CBC_SHA,
        Self::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        Self::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        Self::TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA,
        Self::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA,
        Self::TLS_RSA_WITH_AES_256_GCM_SHA384,
        Self::TLS_RSA_WITH_AES_256_CBC_SHA,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => {
                "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256"
            }
            Self::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
                "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256"
            }
            Self::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            Self::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
                "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256"
            }
            Self::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA => "TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA",
            Self::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
            Self::TLS_RSA_WITH_AES_128_GCM_SHA256 => "TLS_RSA_WITH_AES_128_GCM_SHA256",
            Self::TLS_RSA_WITH_AES_128_CBC_SHA => "TLS_RSA_WITH_AES_128_CBC_SHA",
            Self::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => {
                "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384"
            }
            Self::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            Self::TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA => "TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA",
            Self::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA => "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
            Self::TLS_RSA_WITH_AES_256_GCM_SHA384 => "TLS_RSA_WITH_AES_256_GCM_SHA384",
            Self::TLS_RSA_WITH_AES_256_CBC_SHA => "TLS_RSA_WITH_AES_256_CBC_SHA",
        }
    }
}

impl std::str::FromStr for TlsCipherSuite {
    type Err = UnknownTlsName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .find(|cs| cs.name() == s)
            .copied()
            .ok_or_else(|| UnknownTlsName {
                kind: "cipher suite",
                value: s.to_string(),
            })
    }
}

// === impl PeeringServiceMeta ===

impl PeeringServiceMeta {
    pub fn primary_sni(&self) -> &str {
        self.sni.first().map(String::as_str).unwrap_or("")
    }
}

// === impl ServiceConfigEntry ===

impl ServiceConfigEntry {
    pub fn namespace_or_default(&self) -> &str {
        or_default(&self.namespace)
    }

    pub fn partition_or_default(&self) -> &str {
        or_default(&self.partition)
    }
}
