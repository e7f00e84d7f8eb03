//! Typed workload payloads.
//!
//! Each `*Data` type is the `data` field of a `Workload` of the matching
//! `WorkloadType`; each `*Result` type is the `result.data` a node reports
//! once the workload is provisioned.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

// ── Network ───────────────────────────────────────────────────────

/// Payload of a `network` workload: one node's view of the overlay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkData {
    /// The whole overlay range (a /16).
    pub ip_range: Ipv4Net,
    /// This node's /24 inside `ip_range`.
    pub subnet: Ipv4Net,
    /// Base64 WireGuard private key of this node.
    pub wireguard_private_key: String,
    pub wireguard_listen_port: u16,
    #[serde(default)]
    pub peers: Vec<Peer>,
}

/// A WireGuard peer of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub subnet: Ipv4Net,
    pub wireguard_public_key: String,
    pub allowed_ips: Vec<Ipv4Net>,
    /// `ip:port` or `[ip6]:port`; empty when the peer is not reachable.
    #[serde(default)]
    pub endpoint: String,
}

// ── Machines ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZMachineData {
    pub flist: String,
    pub network: MachineNetwork,
    /// Root filesystem size in bytes; zero lets the node pick.
    #[serde(default)]
    pub size: u64,
    pub compute_capacity: ComputeCapacity,
    #[serde(default)]
    pub mounts: Vec<MachineMount>,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub corex: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MachineNetwork {
    /// Name of the `ip` workload attached to this machine, if any.
    #[serde(default)]
    pub public_ip: String,
    #[serde(default)]
    pub planetary: bool,
    #[serde(default)]
    pub interfaces: Vec<MachineInterface>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineInterface {
    /// Name of the network workload.
    pub network: String,
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeCapacity {
    pub cpu: u8,
    /// Memory in bytes.
    pub memory: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineMount {
    /// Name of a `zmount` or `qsfs` workload in the same deployment.
    pub name: String,
    pub mountpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZMachineResult {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ygg_ip: String,
    #[serde(default)]
    pub console_url: String,
}

// ── Disks & public IPs ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZMountData {
    /// Size in bytes.
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicIpData {
    #[serde(default)]
    pub v4: bool,
    #[serde(default)]
    pub v6: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublicIpResult {
    /// Reserved IPv4 in CIDR notation, empty when not requested.
    #[serde(default)]
    pub ip: String,
    /// Reserved IPv6 in CIDR notation, empty when not requested.
    #[serde(default)]
    pub ip6: String,
    #[serde(default)]
    pub gateway: String,
}

// ── ZDB ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZdbMode {
    #[default]
    User,
    Seq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZdbData {
    /// Size in bytes.
    pub size: u64,
    pub mode: ZdbMode,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub public: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZdbResult {
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub port: u32,
}

// ── QSFS ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZdbBackend {
    pub address: String,
    pub namespace: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfsGroup {
    pub backends: Vec<ZdbBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfsEncryption {
    pub algorithm: String,
    /// Hex-encoded key.
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfsMetaConfig {
    pub prefix: String,
    pub encryption: QsfsEncryption,
    pub backends: Vec<ZdbBackend>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfsMeta {
    #[serde(rename = "type")]
    pub meta_type: String,
    pub config: QsfsMetaConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfsCompression {
    pub algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfsData {
    /// Local cache size in bytes.
    pub cache: u64,
    pub minimal_shards: u32,
    pub expected_shards: u32,
    pub redundant_groups: u32,
    pub redundant_nodes: u32,
    pub max_zdb_data_dir_size: u32,
    pub encryption: QsfsEncryption,
    pub meta: QsfsMeta,
    pub groups: Vec<QsfsGroup>,
    pub compression: QsfsCompression,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QsfsResult {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub metrics_endpoint: String,
}

// ── Gateways ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayNameData {
    /// Subdomain registered through a name contract.
    pub name: String,
    #[serde(default)]
    pub tls_passthrough: bool,
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GatewayNameResult {
    #[serde(default)]
    pub fqdn: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayFqdnData {
    pub fqdn: String,
    #[serde(default)]
    pub tls_passthrough: bool,
    pub backends: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_data_wire_names() {
        let data = NetworkData {
            ip_range: "10.1.0.0/16".parse().unwrap(),
            subnet: "10.1.2.0/24".parse().unwrap(),
            wireguard_private_key: "key".to_string(),
            wireguard_listen_port: 3000,
            peers: vec![Peer {
                subnet: "10.1.3.0/24".parse().unwrap(),
                wireguard_public_key: "pub".to_string(),
                allowed_ips: vec!["10.1.3.0/24".parse().unwrap()],
                endpoint: "1.2.3.4:3001".to_string(),
            }],
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["ip_range"], "10.1.0.0/16");
        assert_eq!(value["wireguard_listen_port"], 3000);
        assert_eq!(value["peers"][0]["wireguard_public_key"], "pub");
        assert_eq!(value["peers"][0]["allowed_ips"][0], "10.1.3.0/24");
    }

    #[test]
    fn zdb_mode_lowercase() {
        assert_eq!(serde_json::to_string(&ZdbMode::Seq).unwrap(), "\"seq\"");
    }

    #[test]
    fn qsfs_meta_type_field() {
        let meta = QsfsMeta {
            meta_type: "zdb".to_string(),
            config: QsfsMetaConfig {
                prefix: "pre".to_string(),
                encryption: QsfsEncryption {
                    algorithm: "AES".to_string(),
                    key: "00".to_string(),
                },
                backends: vec![],
            },
        };
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["type"], "zdb");
    }
}
