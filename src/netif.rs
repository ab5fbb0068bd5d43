//! Local identity resolution
//!
//! The local peer is identified by the configured hostname (or `HOSTNAME`)
//! and the first IPv4 address of a network interface. An explicit address
//! override skips interface inspection entirely.

use std::net::Ipv4Addr;
use tracing::debug;

use crate::config::LocalConfig;
use crate::error::{ResolutionError, SyncResult};
use crate::types::LocalPeer;

/// Looks up the primary IPv4 address of a named interface
pub trait AddressResolver: Send + Sync {
    fn resolve_primary_address(&self, interface: &str) -> Result<Ipv4Addr, ResolutionError>;
}

/// Resolver backed by the operating system's interface table
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[cfg(unix)]
impl AddressResolver for SystemResolver {
    fn resolve_primary_address(&self, interface: &str) -> Result<Ipv4Addr, ResolutionError> {
        use nix::ifaddrs::getifaddrs;
        use std::net::SocketAddrV4;

        let mut found_interface = false;
        for ifaddr in getifaddrs().map_err(std::io::Error::from)? {
            if ifaddr.interface_name != interface {
                continue;
            }
            found_interface = true;
            if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                return Ok(*SocketAddrV4::from(*sin).ip());
            }
        }

        if found_interface {
            Err(ResolutionError::NoIpv4Address(interface.to_string()))
        } else {
            Err(ResolutionError::InterfaceNotFound(interface.to_string()))
        }
    }
}

#[cfg(not(unix))]
impl AddressResolver for SystemResolver {
    fn resolve_primary_address(&self, _interface: &str) -> Result<Ipv4Addr, ResolutionError> {
        Err(ResolutionError::Unsupported)
    }
}

/// Resolver that always answers with a fixed address
#[derive(Debug, Clone, Copy)]
pub struct StaticResolver(pub Ipv4Addr);

impl AddressResolver for StaticResolver {
    fn resolve_primary_address(&self, _interface: &str) -> Result<Ipv4Addr, ResolutionError> {
        Ok(self.0)
    }
}

/// Determine this process's identity and address.
///
/// Identity comes from the configured hostname, then the `HOSTNAME`
/// environment variable. The address comes from the configured override,
/// then the configured interface.
pub fn resolve_local_peer(
    local: &LocalConfig,
    resolver: &dyn AddressResolver,
) -> SyncResult<LocalPeer> {
    let identity = local
        .hostname
        .clone()
        .filter(|h| !h.trim().is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.trim().is_empty()))
        .ok_or(ResolutionError::MissingIdentity)?;

    let address = match &local.address {
        Some(address) => address.clone(),
        None => resolver.resolve_primary_address(&local.interface)?.to_string(),
    };

    debug!(
        identity = %identity,
        address = %address,
        interface = %local.interface,
        "resolved local peer"
    );
    Ok(LocalPeer::new(identity, address))
}
