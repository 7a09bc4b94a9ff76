#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tls {
    pub inbound_tls_parameters: Option<TlsParameters>,
    pub outbound_tls_parameters: Option<TlsParameters>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsParameters {
    pub min_version: Option<TlsVersion>,
    pub max_version: Option<TlsVersion>,
    pub cipher_suites: Vec<TlsCipherSuite>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TlsVersion {
    Auto,
    V1_0,
    V1_1,
    V1_2,
    V1_3,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TlsCipherSuite {
    EcdheEcdsaAes128GcmSha256,
    EcdheEcdsaChacha20Poly1305,
    EcdheRsaAes128GcmSha256,
    EcdheRsaChacha20Poly1305,
    EcdheEcdsaAes128Sha,
    EcdheRsaAes128Sha,
    Aes128GcmSha256,
    Aes128Sha,
    EcdheEcdsaAes256GcmSha384,
    EcdheRsaAes256GcmSha384,
    EcdheEcdsaAes256Sha,
    EcdheRsaAes256Sha,
    Aes256GcmSha384,
    Aes256Sha,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrustBundle {
    pub trust_domain: String,
    pub roots: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeafCertificate {
    pub cert: String,
    pub key: String,
}

/// TLS settings for one side of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportSocket {
    pub connection_tls: ConnectionTls,
    pub tls_parameters: TlsParameters,
    pub alpn_protocols: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionTls {
    InboundMesh(InboundMeshMtls),
    OutboundMesh(OutboundMeshMtls),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMeshMtls {
    /// Key of the leaf certificate presented to clients.
    pub identity_key: String,
    /// Every trust bundle a connecting client may be validated against.
    pub trust_bundle_peer_name_keys: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundMeshMtls {
    /// Key of the leaf certificate presented to servers. Empty when the
    /// proxy's own identity is not presented.
    pub identity_key: String,
    pub spiffe_ids: Vec<String>,
    pub trust_bundle_peer_name_key: String,
    pub sni: String,
}

// === impl TlsVersion ===

impl TlsVersion {
    /// Whether the cipher suite list can be configured when this version is
    /// the lower bound. TLS 1.3 suites are fixed by the protocol.
    pub fn has_configurable_cipher_suites(&self) -> bool {
        !matches!(self, Self::V1_3)
    }
}

// === impl TransportSocket ===

impl TransportSocket {
    pub fn identity_key(&self) -> &str {
        match self.connection_tls {
            ConnectionTls::InboundMesh(ref mtls) => &mtls.identity_key,
            ConnectionTls::OutboundMesh(ref mtls) => &mtls.identity_key,
        }
    }
}
