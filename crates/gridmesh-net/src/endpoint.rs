//! Endpoint discovery.
//!
//! A node is accessible when it has a globally routable address: its public
//! config IPv4, then its public config IPv6, then any global address on the
//! `zos` interface. Anything else makes it hidden.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use gridmesh_core::{ClientError, NodeId};
use tracing::debug;

use crate::client::{NodeRpc, ZOS_INTERFACE};
use crate::error::{NetError, NetResult};

/// Public address a node's WireGuard endpoint listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl Endpoint {
    pub fn is_ipv4(&self) -> bool {
        matches!(self, Endpoint::V4(_))
    }

    /// `ip:port`, with IPv6 addresses bracketed.
    pub fn with_port(&self, port: u16) -> String {
        format!("{self}:{port}")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::V4(ip) => write!(f, "{ip}"),
            Endpoint::V6(ip) => write!(f, "[{ip}]"),
        }
    }
}

impl From<IpAddr> for Endpoint {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(ip) => Endpoint::V4(ip),
            IpAddr::V6(ip) => Endpoint::V6(ip),
        }
    }
}

pub fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || ip.is_multicast()
        // 100.64.0.0/10, carrier-grade NAT
        || (ip.octets()[0] == 100 && (ip.octets()[1] & 0xc0) == 64))
}

pub fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    // 2000::/3 is the global unicast block.
    ((first & 0xe000) == 0x2000 && first != 0x2001) || is_global_2001(ip)
}

/// Last second segment of the IANA special-purpose block 2001::/23, which
/// holds Teredo (2001::/32), benchmarking (2001:2::/48) and ORCHIDv2
/// (2001:20::/28).
const IETF_PROTOCOL_BLOCK_END: u16 = 0x01ff;
/// 2001:db8::/32
const DOCUMENTATION: u16 = 0x0db8;

/// 2001::/16 is global unicast except for 2001::/23 and 2001:db8::/32.
fn is_global_2001(ip: Ipv6Addr) -> bool {
    let [a, b, ..] = ip.segments();
    a == 0x2001 && b > IETF_PROTOCOL_BLOCK_END && b != DOCUMENTATION
}

/// Discover the endpoint of `node`.
///
/// A missing public config falls through to the `zos` interface. Fails
/// with `NoAccessibleInterface` when nothing routable is found; any other
/// RPC failure is returned as `NetError::Rpc`.
pub async fn discover_endpoint(rpc: &dyn NodeRpc, node: NodeId) -> NetResult<Endpoint> {
    match rpc.network_get_public_config(node).await {
        Ok(config) => {
            if let Some(ip) = config.ipv4.map(|net| net.addr()) {
                if is_public_ipv4(ip) {
                    debug!(node, %ip, "endpoint from public config");
                    return Ok(Endpoint::V4(ip));
                }
            }
            if let Some(ip) = config.ipv6.map(|net| net.addr()) {
                if is_public_ipv6(ip) {
                    debug!(node, %ip, "endpoint from public config");
                    return Ok(Endpoint::V6(ip));
                }
            }
        }
        Err(ClientError::NotFound(_)) => {}
        Err(source) => return Err(NetError::Rpc { node, source }),
    }

    let interfaces = rpc
        .network_list_interfaces(node)
        .await
        .map_err(|source| NetError::Rpc { node, source })?;
    let addresses = interfaces.get(ZOS_INTERFACE).map(Vec::as_slice).unwrap_or(&[]);

    let v4 = addresses.iter().find_map(|ip| match ip {
        IpAddr::V4(v4) if is_public_ipv4(*v4) => Some(Endpoint::V4(*v4)),
        _ => None,
    });
    let v6 = addresses.iter().find_map(|ip| match ip {
        IpAddr::V6(v6) if is_public_ipv6(*v6) => Some(Endpoint::V6(*v6)),
        _ => None,
    });
    match v4.or(v6) {
        Some(endpoint) => {
            debug!(node, %endpoint, "endpoint from zos interface");
            Ok(endpoint)
        }
        None => Err(NetError::NoAccessibleInterface(node)),
    }
}
