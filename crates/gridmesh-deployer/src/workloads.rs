//! Typed views of the workloads a deployment resource declares.
//!
//! Each type renders to grid workloads and is rebuilt from the workloads a
//! node reports back. Sizes are declared in MB/GB and travel in bytes.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use gridmesh_core::{
    ComputeCapacity, CoreError, CoreResult, Deployment, MachineInterface, MachineMount,
    MachineNetwork, PublicIpData, PublicIpResult, QsfsCompression, QsfsData, QsfsEncryption,
    QsfsGroup, QsfsMeta, QsfsMetaConfig, QsfsResult, Workload, WorkloadType, ZMachineData,
    ZMachineResult, ZMountData, ZdbData, ZdbMode, ZdbResult,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::matcher::Matchable;

pub const MIB: u64 = 1024 * 1024;
pub const GIB: u64 = 1024 * MIB;

/// `value` declared in `unit`s, in bytes.
fn to_bytes(workload: &str, value: u64, unit: u64) -> CoreResult<u64> {
    value.checked_mul(unit).ok_or_else(|| CoreError::Encode {
        workload: workload.to_string(),
        message: format!("size {value} x {unit} bytes overflows"),
    })
}

/// Decode a workload result, treating an empty result as the default.
pub(crate) fn result_or_default<T: DeserializeOwned + Default>(workload: &Workload) -> CoreResult<T> {
    if workload.result.data.is_null() {
        return Ok(T::default());
    }
    workload.result_as()
}

// ── Disk ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub size_gb: u64,
    #[serde(default)]
    pub description: String,
}

impl Disk {
    pub fn to_workload(&self) -> CoreResult<Workload> {
        let data = ZMountData {
            size: to_bytes(&self.name, self.size_gb, GIB)?,
        };
        Ok(Workload::new(&self.name, WorkloadType::ZMount, &data)?
            .with_description(&self.description))
    }

    pub fn from_workload(workload: &Workload) -> CoreResult<Self> {
        let data: ZMountData = workload.data_as()?;
        Ok(Self {
            name: workload.name.clone(),
            size_gb: data.size / GIB,
            description: workload.description.clone(),
        })
    }
}

impl Matchable for Disk {
    fn name(&self) -> &str {
        &self.name
    }

    fn carry_over(&mut self, previous: &Self) {
        if self.description.is_empty() {
            self.description = previous.description.clone();
        }
    }
}

// ── ZDB ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zdb {
    pub name: String,
    pub size_gb: u64,
    #[serde(default)]
    pub mode: ZdbMode,
    pub password: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub port: u32,
    #[serde(default)]
    pub namespace: String,
}

impl Zdb {
    pub fn to_workload(&self) -> CoreResult<Workload> {
        let data = ZdbData {
            size: to_bytes(&self.name, self.size_gb, GIB)?,
            mode: self.mode,
            password: self.password.clone(),
            public: self.public,
        };
        Ok(Workload::new(&self.name, WorkloadType::Zdb, &data)?.with_description(&self.description))
    }

    pub fn from_workload(workload: &Workload) -> CoreResult<Self> {
        let data: ZdbData = workload.data_as()?;
        let result: ZdbResult = result_or_default(workload)?;
        Ok(Self {
            name: workload.name.clone(),
            size_gb: data.size / GIB,
            mode: data.mode,
            password: data.password,
            public: data.public,
            description: workload.description.clone(),
            ips: result.ips,
            port: result.port,
            namespace: result.namespace,
        })
    }
}

impl Matchable for Zdb {
    fn name(&self) -> &str {
        &self.name
    }

    fn carry_over(&mut self, previous: &Self) {
        if self.password.is_empty() {
            self.password = previous.password.clone();
        }
    }
}

// ── QSFS ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QsfsMetadata {
    #[serde(rename = "type", default = "default_meta_type")]
    pub meta_type: String,
    pub prefix: String,
    #[serde(default = "default_encryption_algorithm")]
    pub encryption_algorithm: String,
    /// Hex-encoded key.
    pub encryption_key: String,
    pub backends: Vec<gridmesh_core::ZdbBackend>,
}

fn default_meta_type() -> String {
    "zdb".to_string()
}

fn default_encryption_algorithm() -> String {
    "AES".to_string()
}

fn default_compression_algorithm() -> String {
    "snappy".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Qsfs {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub cache_mb: u64,
    pub minimal_shards: u32,
    pub expected_shards: u32,
    pub redundant_groups: u32,
    pub redundant_nodes: u32,
    pub max_zdb_data_dir_size: u32,
    #[serde(default = "default_encryption_algorithm")]
    pub encryption_algorithm: String,
    /// Hex-encoded key.
    pub encryption_key: String,
    #[serde(default = "default_compression_algorithm")]
    pub compression_algorithm: String,
    pub metadata: QsfsMetadata,
    pub groups: Vec<QsfsGroup>,

    #[serde(default)]
    pub metrics_endpoint: String,
}

impl Qsfs {
    pub fn to_workload(&self) -> CoreResult<Workload> {
        let data = QsfsData {
            cache: to_bytes(&self.name, self.cache_mb, MIB)?,
            minimal_shards: self.minimal_shards,
            expected_shards: self.expected_shards,
            redundant_groups: self.redundant_groups,
            redundant_nodes: self.redundant_nodes,
            max_zdb_data_dir_size: self.max_zdb_data_dir_size,
            encryption: QsfsEncryption {
                algorithm: self.encryption_algorithm.clone(),
                key: self.encryption_key.clone(),
            },
            meta: QsfsMeta {
                meta_type: self.metadata.meta_type.clone(),
                config: QsfsMetaConfig {
                    prefix: self.metadata.prefix.clone(),
                    encryption: QsfsEncryption {
                        algorithm: self.metadata.encryption_algorithm.clone(),
                        key: self.metadata.encryption_key.clone(),
                    },
                    backends: self.metadata.backends.clone(),
                },
            },
            groups: self.groups.clone(),
            compression: QsfsCompression {
                algorithm: self.compression_algorithm.clone(),
            },
        };
        Ok(Workload::new(&self.name, WorkloadType::Qsfs, &data)?.with_description(&self.description))
    }

    pub fn from_workload(workload: &Workload) -> CoreResult<Self> {
        let data: QsfsData = workload.data_as()?;
        let result: QsfsResult = result_or_default(workload)?;
        Ok(Self {
            name: workload.name.clone(),
            description: workload.description.clone(),
            cache_mb: data.cache / MIB,
            minimal_shards: data.minimal_shards,
            expected_shards: data.expected_shards,
            redundant_groups: data.redundant_groups,
            redundant_nodes: data.redundant_nodes,
            max_zdb_data_dir_size: data.max_zdb_data_dir_size,
            encryption_algorithm: data.encryption.algorithm,
            encryption_key: data.encryption.key,
            compression_algorithm: data.compression.algorithm,
            metadata: QsfsMetadata {
                meta_type: data.meta.meta_type,
                prefix: data.meta.config.prefix,
                encryption_algorithm: data.meta.config.encryption.algorithm,
                encryption_key: data.meta.config.encryption.key,
                backends: data.meta.config.backends,
            },
            groups: data.groups,
            metrics_endpoint: result.metrics_endpoint,
        })
    }
}

impl Matchable for Qsfs {
    fn name(&self) -> &str {
        &self.name
    }

    fn carry_over(&mut self, previous: &Self) {
        if self.encryption_key.is_empty() {
            self.encryption_key = previous.encryption_key.clone();
        }
        if self.metadata.encryption_key.is_empty() {
            self.metadata.encryption_key = previous.metadata.encryption_key.clone();
        }
    }
}

// ── VM ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Name of a disk or qsfs in the same deployment.
    pub disk_name: String,
    pub mount_point: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub name: String,
    pub flist: String,
    /// Never sent to the node; kept across syncs.
    #[serde(default)]
    pub flist_checksum: String,
    pub cpu: u8,
    pub memory_mb: u64,
    #[serde(default)]
    pub rootfs_size_mb: u64,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub publicip: bool,
    #[serde(default)]
    pub publicip6: bool,
    #[serde(default)]
    pub planetary: bool,
    #[serde(default)]
    pub corex: bool,
    #[serde(default)]
    pub description: String,
    /// Private address inside the node subnet; assigned when absent or
    /// outside the subnet.
    #[serde(default)]
    pub ip: Option<Ipv4Addr>,

    #[serde(default)]
    pub computed_ip: String,
    #[serde(default)]
    pub computed_ip6: String,
    #[serde(default)]
    pub ygg_ip: String,
    #[serde(default)]
    pub console_url: String,
}

impl Vm {
    pub fn public_ip_name(&self) -> String {
        format!("{}ip", self.name)
    }

    fn wants_public_ip(&self) -> bool {
        self.publicip || self.publicip6
    }

    /// The optional public ip workload followed by the machine.
    pub fn to_workloads(&self, network: &str) -> CoreResult<Vec<Workload>> {
        let ip = self.ip.ok_or_else(|| CoreError::Encode {
            workload: self.name.clone(),
            message: "no private ip assigned".into(),
        })?;

        let mut workloads = Vec::new();
        let public_ip = if self.wants_public_ip() {
            let data = PublicIpData {
                v4: self.publicip,
                v6: self.publicip6,
            };
            workloads.push(Workload::new(self.public_ip_name(), WorkloadType::PublicIp, &data)?);
            self.public_ip_name()
        } else {
            String::new()
        };

        let data = ZMachineData {
            flist: self.flist.clone(),
            network: MachineNetwork {
                public_ip,
                planetary: self.planetary,
                interfaces: vec![MachineInterface {
                    network: network.to_string(),
                    ip,
                }],
            },
            size: to_bytes(&self.name, self.rootfs_size_mb, MIB)?,
            compute_capacity: ComputeCapacity {
                cpu: self.cpu,
                memory: to_bytes(&self.name, self.memory_mb, MIB)?,
            },
            mounts: self
                .mounts
                .iter()
                .map(|m| MachineMount {
                    name: m.disk_name.clone(),
                    mountpoint: m.mount_point.clone(),
                })
                .collect(),
            entrypoint: self.entrypoint.clone(),
            env: self.env_vars.clone(),
            corex: self.corex,
        };
        workloads.push(
            Workload::new(&self.name, WorkloadType::ZMachine, &data)?
                .with_description(&self.description),
        );
        Ok(workloads)
    }

    /// Rebuild from a machine workload and the deployment holding its
    /// public ip workload.
    pub fn from_workloads(machine: &Workload, deployment: &Deployment) -> CoreResult<Self> {
        let data: ZMachineData = machine.data_as()?;
        let result: ZMachineResult = result_or_default(machine)?;
        let public = PublicAddresses::lookup(&data.network.public_ip, deployment)?;

        Ok(Self {
            name: machine.name.clone(),
            flist: data.flist,
            flist_checksum: String::new(),
            cpu: data.compute_capacity.cpu,
            memory_mb: data.compute_capacity.memory / MIB,
            rootfs_size_mb: data.size / MIB,
            entrypoint: data.entrypoint,
            env_vars: data.env,
            mounts: data
                .mounts
                .into_iter()
                .map(|m| Mount {
                    disk_name: m.name,
                    mount_point: m.mountpoint,
                })
                .collect(),
            publicip: public.v4,
            publicip6: public.v6,
            planetary: data.network.planetary,
            corex: data.corex,
            description: machine.description.clone(),
            ip: data.network.interfaces.first().map(|iface| iface.ip),
            computed_ip: public.computed_ip,
            computed_ip6: public.computed_ip6,
            ygg_ip: result.ygg_ip,
            console_url: result.console_url,
        })
    }
}

impl Matchable for Vm {
    fn name(&self) -> &str {
        &self.name
    }

    fn carry_over(&mut self, previous: &Self) {
        if self.flist_checksum.is_empty() {
            self.flist_checksum = previous.flist_checksum.clone();
        }
    }
}

/// Public addresses requested by and reserved for a machine.
///
/// The IPv4 and IPv6 results are read from separate fields; they are
/// never folded into one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublicAddresses {
    pub v4: bool,
    pub v6: bool,
    pub computed_ip: String,
    pub computed_ip6: String,
}

impl PublicAddresses {
    pub fn lookup(name: &str, deployment: &Deployment) -> CoreResult<Self> {
        if name.is_empty() {
            return Ok(Self::default());
        }
        let Some(workload) = deployment.workload(name) else {
            return Ok(Self::default());
        };
        let data: PublicIpData = workload.data_as()?;
        let result: PublicIpResult = result_or_default(workload)?;
        Ok(Self {
            v4: data.v4,
            v6: data.v6,
            computed_ip: result.ip,
            computed_ip6: result.ip6,
        })
    }
}
