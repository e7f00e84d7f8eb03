//! Host-id and subnet allocation.
//!
//! Every allocation is a scan over a set of "used" octets: host-ids are the
//! last octet of an address inside a node's /24, subnets are the third octet
//! of a /24 inside the network's /16. Octets 0, 1 and 255 are never handed
//! out (network, gateway and broadcast).

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::error::{NetError, NetResult};

pub const FIRST_HOST_ID: u8 = 2;
pub const LAST_HOST_ID: u8 = 254;

/// Supernet of every WireGuard transport address.
pub const WG_TRANSPORT_SUPERNET: Ipv4Net =
    Ipv4Net::new_assert(Ipv4Addr::new(100, 64, 0, 0), 16);

/// Lowest octet in 2..=254 absent from `used`.
pub fn next_free_host_id(used: &[u8]) -> NetResult<u8> {
    (FIRST_HOST_ID..=LAST_HOST_ID)
        .find(|id| !used.contains(id))
        .ok_or_else(|| {
            NetError::AddressSpaceExhausted(format!(
                "no free octet in {FIRST_HOST_ID}..={LAST_HOST_ID}"
            ))
        })
}

/// First free address of `subnet`. The caller records the returned host-id.
pub fn assign_within_subnet(subnet: Ipv4Net, used: &[u8]) -> NetResult<Ipv4Addr> {
    let id = next_free_host_id(used)
        .map_err(|_| NetError::AddressSpaceExhausted(format!("subnet {subnet}")))?;
    Ok(host_address(subnet, id))
}

/// First free /24 of `ip_range`, scanning the third octet.
pub fn next_free_subnet(ip_range: Ipv4Net, used_third_octets: &[u8]) -> NetResult<Ipv4Net> {
    let octet = next_free_host_id(used_third_octets)
        .map_err(|_| NetError::AddressSpaceExhausted(format!("network range {ip_range}")))?;
    let [a, b, _, _] = ip_range.network().octets();
    Ipv4Net::new(Ipv4Addr::new(a, b, octet, 0), 24).map_err(|e| NetError::InvalidIpRange {
        range: ip_range.to_string(),
        reason: e.to_string(),
    })
}

pub fn host_address(subnet: Ipv4Net, host_id: u8) -> Ipv4Addr {
    let [a, b, c, _] = subnet.network().octets();
    Ipv4Addr::new(a, b, c, host_id)
}

pub fn host_id(ip: Ipv4Addr) -> u8 {
    ip.octets()[3]
}

/// Third octet of a node subnet.
pub fn subnet_octet(subnet: Ipv4Net) -> u8 {
    subnet.network().octets()[2]
}

/// WireGuard transport address of a node subnet: `100.64.<o2>.<o3>/32`.
pub fn wg_transport_ip(subnet: Ipv4Net) -> Ipv4Net {
    let [_, b, c, _] = subnet.network().octets();
    Ipv4Net::from(Ipv4Addr::new(100, 64, b, c))
}

/// Allowed-IPs routing one node subnet: the subnet and its transport address.
pub fn subnet_routes(subnet: Ipv4Net) -> [Ipv4Net; 2] {
    [subnet, wg_transport_ip(subnet)]
}

/// A network range must be a private IPv4 /16.
pub fn validate_ip_range(range: Ipv4Net) -> NetResult<()> {
    let invalid = |reason: &str| NetError::InvalidIpRange {
        range: range.to_string(),
        reason: reason.to_string(),
    };
    if range.prefix_len() != 16 {
        return Err(invalid("prefix length must be 16"));
    }
    if range.addr() != range.network() {
        return Err(invalid("host bits must be zero"));
    }
    if !range.network().is_private() {
        return Err(invalid("range must be private"));
    }
    Ok(())
}

/// Host-id allocator for one subnet.
///
/// Addresses already inside the subnet are reserved up front so that
/// re-running an allocation over an unchanged set yields the same addresses.
#[derive(Debug, Clone)]
pub struct HostAllocator {
    subnet: Ipv4Net,
    used: Vec<u8>,
}

impl HostAllocator {
    pub fn new(subnet: Ipv4Net, used: impl IntoIterator<Item = u8>) -> Self {
        Self {
            subnet,
            used: used.into_iter().collect(),
        }
    }

    pub fn subnet(&self) -> Ipv4Net {
        self.subnet
    }

    /// Mark `ip` as taken. Returns false (and records nothing) when the
    /// address lies outside the subnet.
    pub fn reserve(&mut self, ip: Ipv4Addr) -> bool {
        if !self.subnet.contains(&ip) {
            return false;
        }
        let id = host_id(ip);
        if !self.used.contains(&id) {
            self.used.push(id);
        }
        true
    }

    /// Keep `current` when it lies inside the subnet, otherwise hand out the
    /// next free address.
    pub fn assign(&mut self, current: Option<Ipv4Addr>) -> NetResult<Ipv4Addr> {
        if let Some(ip) = current {
            if self.reserve(ip) {
                return Ok(ip);
            }
        }
        let ip = assign_within_subnet(self.subnet, &self.used)?;
        self.used.push(host_id(ip));
        Ok(ip)
    }

    /// Host-ids taken so far, sorted.
    pub fn used(&self) -> Vec<u8> {
        let mut used = self.used.clone();
        used.sort_unstable();
        used.dedup();
        used
    }
}
