//! The host-facing collaborators of a conversion.

use anyhow::Context;
use std::{io, path::PathBuf};

/// Agent configuration the converter reads.
pub trait ConfigFetcher {
    /// The address the local agent advertises to its LAN.
    fn advertise_addr_lan(&self) -> String;
}

/// Capabilities of the host the proxy runs on.
pub trait Platform {
    fn supports_ipv6(&self) -> anyhow::Result<bool>;
}

/// Probes the running host's kernel for IPv6 support.
#[derive(Clone, Debug)]
pub struct HostPlatform {
    if_inet6: PathBuf,
}

// === impl HostPlatform ===

impl Default for HostPlatform {
    fn default() -> Self {
        Self {
            if_inet6: PathBuf::from("/proc/net/if_inet6"),
        }
    }
}

impl Platform for HostPlatform {
    fn supports_ipv6(&self) -> anyhow::Result<bool> {
        match std::fs::metadata(&self.if_inet6) {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error)
                .with_context(|| format!("failed to stat {}", self.if_inet6.display())),
        }
    }
}

impl ConfigFetcher for String {
    fn advertise_addr_lan(&self) -> String {
        self.clone()
    }
}
