use crate::{Builder, Error};
use mesh_proxystate_core::{
    tls::{
        ConnectionTls, InboundMeshMtls, OutboundMeshMtls, TlsCipherSuite, TlsParameters,
        TlsVersion, TransportSocket,
    },
    LeafCertificate, Tls, TrustBundle, LOCAL_PEER_KEY,
};
use mesh_proxystate_snapshot::{
    mesh::{self, MeshDirectionalTlsConfig},
    PeeringTrustBundle, ServiceKind,
};
use tracing::{debug, warn};

impl Builder<'_> {
    /// Collects the trust bundles the proxy validates peers against, along
    /// with the mesh-wide TLS parameters.
    pub(crate) fn tls_from_snapshot(&mut self) -> Result<(), Error> {
        let snap = self.snap;
        self.state.trust_bundles.insert(
            LOCAL_PEER_KEY.to_string(),
            TrustBundle {
                trust_domain: snap.trust_domain().to_string(),
                roots: snap.roots.roots.iter().map(|r| r.root_cert.clone()).collect(),
            },
        );

        for bundle in snap.peering_trust_bundles() {
            self.add_peer_trust_bundle(bundle);
        }

        match snap.upstreams() {
            Ok(upstreams) => {
                let mut peers = upstreams
                    .upstream_peer_trust_bundles
                    .values()
                    .collect::<Vec<_>>();
                peers.sort_by(|a, b| a.peer_name.cmp(&b.peer_name));
                for bundle in peers {
                    self.add_peer_trust_bundle(bundle);
                }
            }
            Err(error)
                if matches!(
                    snap.kind,
                    ServiceKind::MeshGateway | ServiceKind::TerminatingGateway
                ) =>
            {
                debug!(%error, "gateway has no upstream peer trust bundles");
            }
            Err(error) => return Err(error.into()),
        }

        self.state.tls = Some(Tls {
            inbound_tls_parameters: Some(tls_parameters(snap.mesh_config_tls_incoming())),
            outbound_tls_parameters: Some(tls_parameters(snap.mesh_config_tls_outgoing())),
        });
        Ok(())
    }

    fn add_peer_trust_bundle(&mut self, bundle: &PeeringTrustBundle) {
        if bundle.peer_name == LOCAL_PEER_KEY {
            warn!(
                peer = %bundle.peer_name,
                "ignoring peer trust bundle that collides with the local trust bundle"
            );
            return;
        }
        self.state.trust_bundles.insert(
            bundle.peer_name.clone(),
            TrustBundle {
                trust_domain: bundle.trust_domain.clone(),
                roots: bundle.root_pems.clone(),
            },
        );
    }

    /// TLS for connections accepted by the public listener. Clients are
    /// validated against every known trust bundle since any peer may dial the
    /// proxy.
    pub(crate) fn create_inbound_mesh_mtls(&mut self) -> Result<TransportSocket, Error> {
        self.check_mesh_tls_kind()?;

        let mut trust_bundle_peer_name_keys = vec![LOCAL_PEER_KEY.to_string()];
        for bundle in self.snap.peering_trust_bundles() {
            if bundle.peer_name != LOCAL_PEER_KEY {
                trust_bundle_peer_name_keys.push(bundle.peer_name.clone());
            }
        }

        let cfg = self.proxy_config();
        let identity_key = self.register_leaf_certificate();
        Ok(TransportSocket {
            connection_tls: ConnectionTls::InboundMesh(InboundMeshMtls {
                identity_key,
                trust_bundle_peer_name_keys,
            }),
            tls_parameters: tls_parameters(self.snap.mesh_config_tls_incoming()),
            alpn_protocols: alpn_protocols(&cfg.protocol),
        })
    }

    /// TLS for connections to mesh services in the local trust domain.
    pub(crate) fn create_outbound_mesh_mtls(
        &mut self,
        spiffe_ids: Vec<String>,
        sni: String,
    ) -> Result<TransportSocket, Error> {
        self.check_mesh_tls_kind()?;

        let cfg = self.proxy_config();
        let identity_key = self.register_leaf_certificate();
        Ok(TransportSocket {
            connection_tls: ConnectionTls::OutboundMesh(OutboundMeshMtls {
                identity_key,
                spiffe_ids,
                trust_bundle_peer_name_key: LOCAL_PEER_KEY.to_string(),
                sni,
            }),
            tls_parameters: tls_parameters(self.snap.mesh_config_tls_outgoing()),
            alpn_protocols: alpn_protocols(&cfg.protocol),
        })
    }

    fn check_mesh_tls_kind(&self) -> Result<(), Error> {
        match self.snap.kind {
            ServiceKind::ConnectProxy | ServiceKind::MeshGateway => Ok(()),
            kind => Err(Error::MeshTlsUnsupported(kind)),
        }
    }

    /// Stores the proxy's current leaf certificate under a fresh key.
    fn register_leaf_certificate(&mut self) -> String {
        let leaf = self.snap.leaf();
        let key = uuid::Uuid::new_v4().to_string();
        self.state.leaf_certificates.insert(
            key.clone(),
            LeafCertificate {
                cert: leaf.cert_pem,
                key: leaf.private_key_pem,
            },
        );
        key
    }
}

/// TLS for connections to a service imported from a cluster peer, validated
/// against the peer's trust bundle.
pub(crate) fn peer_outbound_mtls(peer: &str, spiffe_ids: Vec<String>, sni: String) -> TransportSocket {
    TransportSocket {
        connection_tls: ConnectionTls::OutboundMesh(OutboundMeshMtls {
            identity_key: String::new(),
            spiffe_ids,
            trust_bundle_peer_name_key: peer.to_string(),
            sni,
        }),
        tls_parameters: TlsParameters::default(),
        alpn_protocols: vec![],
    }
}

pub(crate) fn tls_parameters(cfg: Option<&MeshDirectionalTlsConfig>) -> TlsParameters {
    let cfg = match cfg {
        Some(cfg) => cfg,
        None => return TlsParameters::default(),
    };

    let min_version = tls_version(cfg.tls_min_version);
    let max_version = tls_version(cfg.tls_max_version);

    let mut cipher_suites = cfg
        .cipher_suites
        .iter()
        .copied()
        .map(cipher_suite)
        .collect::<Vec<_>>();
    if let Some(min) = min_version {
        if !cipher_suites.is_empty() && !min.has_configurable_cipher_suites() {
            warn!(
                min_version = ?min,
                "ignoring cipher suites that cannot be configured for the minimum TLS version"
            );
            cipher_suites.clear();
        }
    }

    TlsParameters {
        min_version,
        max_version,
        cipher_suites,
    }
}

fn tls_version(v: mesh::TlsVersion) -> Option<TlsVersion> {
    match v {
        mesh::TlsVersion::Unspecified => None,
        mesh::TlsVersion::Auto => Some(TlsVersion::Auto),
        mesh::TlsVersion::V1_0 => Some(TlsVersion::V1_0),
        mesh::TlsVersion::V1_1 => Some(TlsVersion::V1_1),
        mesh::TlsVersion::V1_2 => Some(TlsVersion::V1_2),
        mesh::TlsVersion::V1_3 => Some(TlsVersion::V1_3),
    }
}

fn cipher_suite(cs: mesh::TlsCipherSuite) -> TlsCipherSuite {
    use mesh::TlsCipherSuite as Mesh;
    match cs {
        Mesh::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256 => TlsCipherSuite::EcdheEcdsaAes128GcmSha256,
        Mesh::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256 => {
            TlsCipherSuite::EcdheEcdsaChacha20Poly1305
        }
        Mesh::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256 => TlsCipherSuite::EcdheRsaAes128GcmSha256,
        Mesh::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256 => {
            TlsCipherSuite::EcdheRsaChacha20Poly1305
        }
        Mesh::TLS_ECDHE_ECDSA_WITH_AES_128_CBC_SHA => TlsCipherSuite::EcdheEcdsaAes128Sha,
        Mesh::TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA => TlsCipherSuite::EcdheRsaAes128Sha,
        Mesh::TLS_RSA_WITH_AES_128_GCM_SHA256 => TlsCipherSuite::Aes128GcmSha256,
        Mesh::TLS_RSA_WITH_AES_128_CBC_SHA => TlsCipherSuite::Aes128Sha,
        Mesh::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384 => TlsCipherSuite::EcdheEcdsaAes256GcmSha384,
        Mesh::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384 => TlsCipherSuite::EcdheRsaAes256GcmSha384,
        Mesh::TLS_ECDHE_ECDSA_WITH_AES_256_CBC_SHA => TlsCipherSuite::EcdheEcdsaAes256Sha,
        Mesh::TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA => TlsCipherSuite::EcdheRsaAes256Sha,
        Mesh::TLS_RSA_WITH_AES_256_GCM_SHA384 => TlsCipherSuite::Aes256GcmSha384,
        Mesh::TLS_RSA_WITH_AES_256_CBC_SHA => TlsCipherSuite::Aes256Sha,
    }
}

/// The protocols offered during ALPN for a proxy protocol.
pub(crate) fn alpn_protocols(protocol: &str) -> Vec<String> {
    let protocols: &[&str] = match protocol {
        "grpc" | "http2" => &["h2", "http/1.1"],
        "http" => &["http/1.1"],
        _ => &[],
    };
    protocols.iter().map(|p| p.to_string()).collect()
}
