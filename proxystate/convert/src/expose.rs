//! Listeners that expose individual paths of the local application, such as
//! health checks, to callers outside the mesh.

use crate::{listeners::DestinationOpts, Builder, Error};
use http::uri::{Authority, InvalidUri, Uri};
use mesh_proxystate_core::{
    exact_net,
    listener::{Direction, Match},
    IpNet, Listener, Router,
};
use mesh_proxystate_snapshot::{CheckType, ExposePath, ServiceId};
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::warn;

const NON_ALPHANUMERIC_REGEX: &str = r"[^a-zA-Z0-9]+";

const GRPC_HEALTH_CHECK_PATH: &str = "/grpc.health.v1.Health/Check";

#[derive(Debug, thiserror::Error)]
pub(crate) enum CheckPathError {
    #[error("failed to parse url {value:?}: {source}")]
    InvalidUri { value: String, source: InvalidUri },

    #[error("failed to parse port from {0:?}")]
    MissingPort(String),
}

impl Builder<'_> {
    /// The configured exposed paths followed by one path per HTTP or gRPC
    /// check of the proxied service, when checks are exposed.
    pub(crate) fn exposed_paths(&self) -> Vec<ExposePath> {
        let proxy = &self.snap.proxy;
        let mut paths = proxy.expose.paths.clone();
        if !proxy.expose.checks {
            return paths;
        }

        let psid = ServiceId {
            id: proxy.destination_service_id.clone(),
            namespace: self.snap.proxy_id.namespace.clone(),
            partition: self.snap.proxy_id.partition.clone(),
        };
        let checks = self
            .snap
            .connect_proxy
            .watched_service_checks
            .get(&psid)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for check in checks {
            match parse_check_path(check) {
                Ok(path) => paths.push(path),
                Err(error) => warn!(check = %check.check_id, %error, "failed to expose check"),
            }
        }
        paths
    }

    pub(crate) fn make_exposed_check_listener(
        &mut self,
        cluster: &str,
        path: &ExposePath,
    ) -> Result<Listener, Error> {
        let cfg = self.proxy_config();
        let addr = if !cfg.bind_address.is_empty() {
            cfg.bind_address.as_str()
        } else if !self.snap.address.is_empty() {
            self.snap.address.as_str()
        } else {
            "0.0.0.0"
        };

        let stripped = Regex::new(NON_ALPHANUMERIC_REGEX)
            .expect("should_compile")
            .replace_all(&path.path, "");
        let mut listener = Listener::host_port(
            &format!("exposed_path_{stripped}"),
            addr,
            path.listener_port,
            Direction::Inbound,
        );

        let filter_name = format!("exposed_path_filter_{stripped}_{}", path.listener_port);
        let destination = self.router_destination(&DestinationOpts {
            cluster,
            filter_name: &filter_name,
            route_name: &filter_name,
            protocol: path.protocol(),
            route_path: &path.path,
            ..Default::default()
        })?;
        let mut router = Router::new(destination);

        // Checks are only reachable from the local host and the agent.
        if path.parsed_from_check {
            let mut ranges = vec![IpNet::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8)
                .expect("prefix length is valid")];

            let advertise = self.fetcher.advertise_addr_lan();
            match advertise.parse::<IpAddr>() {
                Ok(ip) => ranges.push(exact_net(ip)),
                Err(_) => warn!(%advertise, "ignoring unparseable advertise address"),
            }

            if self.platform.supports_ipv6().map_err(Error::Platform)? {
                ranges.push(exact_net(IpAddr::V6(Ipv6Addr::LOCALHOST)));
            }

            router = router.with_match(Match {
                source_prefix_ranges: ranges,
                ..Default::default()
            });
        }

        listener.routers.push(router);
        Ok(listener)
    }
}

/// Derives the exposed path for an HTTP or gRPC check from the check's
/// target and its proxied target.
pub(crate) fn parse_check_path(check: &CheckType) -> Result<ExposePath, CheckPathError> {
    let mut path = ExposePath::default();

    if !check.http.is_empty() {
        path.protocol = "http".to_string();

        let uri = parse_uri(&check.http)?;
        path.path = uri.path().to_string();
        path.local_path_port = uri_port(&uri, &check.http)?;

        let uri = parse_uri(&check.proxy_http)?;
        path.listener_port = uri_port(&uri, &check.proxy_http)?;
    }

    if !check.grpc.is_empty() {
        path.path = GRPC_HEALTH_CHECK_PATH.to_string();
        path.protocol = "http2".to_string();
        path.local_path_port = grpc_port(&check.grpc)?;
        path.listener_port = grpc_port(&check.proxy_grpc)?;
    }

    path.parsed_from_check = true;
    Ok(path)
}

fn parse_uri(value: &str) -> Result<Uri, CheckPathError> {
    value
        .parse::<Uri>()
        .map_err(|source| CheckPathError::InvalidUri {
            value: value.to_string(),
            source,
        })
}

fn uri_port(uri: &Uri, value: &str) -> Result<u32, CheckPathError> {
    uri.port_u16()
        .map(u32::from)
        .ok_or_else(|| CheckPathError::MissingPort(value.to_string()))
}

/// gRPC check targets have the form `host:port[/service]`.
fn grpc_port(target: &str) -> Result<u32, CheckPathError> {
    let hostport = target.split_once('/').map_or(target, |(hp, _)| hp);
    let authority = hostport
        .parse::<Authority>()
        .map_err(|source| CheckPathError::InvalidUri {
            value: target.to_string(),
            source,
        })?;
    authority
        .port_u16()
        .map(u32::from)
        .ok_or_else(|| CheckPathError::MissingPort(target.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{naming, test_util::*};
    use mesh_proxystate_core::listener::{BindAddress, RouterDestination};
    use mesh_proxystate_core::route::PathMatch;
    use mesh_proxystate_snapshot::ExposeConfig;

    fn mk_http_check() -> CheckType {
        CheckType {
            check_id: "web-health".to_string(),
            http: "http://127.0.0.1:8080/health/ready".to_string(),
            proxy_http: "http://10.0.0.1:21500/health/ready".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn http_check_paths() {
        assert_eq!(
            parse_check_path(&mk_http_check()).unwrap(),
            ExposePath {
                listener_port: 21500,
                path: "/health/ready".to_string(),
                local_path_port: 8080,
                protocol: "http".to_string(),
                parsed_from_check: true,
            }
        );
    }

    #[test]
    fn grpc_check_paths() {
        let check = CheckType {
            grpc: "127.0.0.1:9090/my.Service".to_string(),
            proxy_grpc: "10.0.0.1:21501".to_string(),
            ..Default::default()
        };
        assert_eq!(
            parse_check_path(&check).unwrap(),
            ExposePath {
                listener_port: 21501,
                path: GRPC_HEALTH_CHECK_PATH.to_string(),
                local_path_port: 9090,
                protocol: "http2".to_string(),
                parsed_from_check: true,
            }
        );
    }

    #[test]
    fn checks_without_ports_are_rejected() {
        let check = CheckType {
            http: "http://localhost/health".to_string(),
            ..mk_http_check()
        };
        assert!(matches!(
            parse_check_path(&check),
            Err(CheckPathError::MissingPort(_))
        ));

        let check = CheckType {
            grpc: "localhost".to_string(),
            ..Default::default()
        };
        assert!(parse_check_path(&check).is_err());
    }

    #[test]
    fn malformed_checks_are_skipped() {
        let mut snap = mk_connect_proxy();
        snap.proxy.expose = ExposeConfig {
            checks: true,
            paths: vec![ExposePath {
                listener_port: 21400,
                path: "/metrics".to_string(),
                local_path_port: 9102,
                ..Default::default()
            }],
        };
        let psid = ServiceId {
            id: "web".to_string(),
            ..Default::default()
        };
        let broken = CheckType {
            check_id: "broken".to_string(),
            http: "http://127.0.0.1/health".to_string(),
            ..Default::default()
        };
        snap.connect_proxy
            .watched_service_checks
            .insert(psid, vec![broken, mk_http_check()]);

        let builder = mk_builder(&snap);
        let paths = builder.exposed_paths();
        let ports = paths.iter().map(|p| p.listener_port).collect::<Vec<_>>();
        assert_eq!(ports, vec![21400, 21500]);
    }

    #[test]
    fn check_listeners_only_admit_local_callers() {
        let snap = mk_connect_proxy();
        let path = parse_check_path(&mk_http_check()).unwrap();

        let mut builder = mk_builder(&snap);
        let listener = builder
            .make_exposed_check_listener(naming::LOCAL_APP_CLUSTER, &path)
            .unwrap();
        assert_eq!(listener.name, "exposed_path_healthready:10.0.0.1:21500");
        assert_eq!(
            listener.bind_address,
            Some(BindAddress::HostPort {
                host: "10.0.0.1".to_string(),
                port: 21500,
            })
        );

        let router = &listener.routers[0];
        let sources = &router.r#match.as_ref().unwrap().source_prefix_ranges;
        let sources = sources.iter().map(|n| n.to_string()).collect::<Vec<_>>();
        assert_eq!(sources, vec!["127.0.0.1/8", "10.0.0.1/32", "::1/128"]);

        let filter_name = "exposed_path_filter_healthready_21500";
        match router.destination {
            RouterDestination::L7(ref dst) => {
                assert_eq!(dst.name, filter_name);
                assert!(dst.static_route);
            }
            ref other => panic!("unexpected destination {other:?}"),
        }
        let route = &builder.state.routes[filter_name];
        assert_eq!(
            route.virtual_hosts[0].route_rules[0].r#match.path_match,
            PathMatch::Exact("/health/ready".to_string())
        );
    }

    #[test]
    fn configured_paths_are_open() {
        let snap = mk_connect_proxy();
        let path = ExposePath {
            listener_port: 21400,
            path: "/metrics".to_string(),
            local_path_port: 9102,
            protocol: "tcp".to_string(),
            parsed_from_check: false,
        };
        let mut builder = mk_builder(&snap);
        let listener = builder
            .make_exposed_check_listener(&naming::expose_cluster(9102), &path)
            .unwrap();
        let router = &listener.routers[0];
        assert!(router.r#match.is_none());
        assert_eq!(router.l4().map(|d| d.name.as_str()), Some("exposed_cluster_9102"));
    }
}
