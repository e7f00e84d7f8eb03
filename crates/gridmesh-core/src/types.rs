//! Deployment and workload envelopes.
//!
//! Field names follow the node wire format: a `Deployment` serialized with
//! serde_json is exactly what a node accepts, and what it reports back.

use std::collections::BTreeSet;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, CoreResult};
use crate::workloads::PublicIpData;

/// Identifier of a grid node.
pub type NodeId = u32;

/// Identifier of an on-chain contract. Zero is never a valid id.
pub type ContractId = u64;

/// Identifier of a chain twin (the account owning deployments).
pub type TwinId = u32;

// ── Workload ──────────────────────────────────────────────────────

/// Workload type tag, using node wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadType {
    #[serde(rename = "network")]
    Network,
    #[serde(rename = "zmachine")]
    ZMachine,
    #[serde(rename = "zmount")]
    ZMount,
    #[serde(rename = "ip")]
    PublicIp,
    #[serde(rename = "zdb")]
    Zdb,
    #[serde(rename = "qsfs")]
    Qsfs,
    #[serde(rename = "gateway-fqdn-proxy")]
    GatewayFqdn,
    #[serde(rename = "gateway-name-proxy")]
    GatewayName,
}

impl WorkloadType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadType::Network => "network",
            WorkloadType::ZMachine => "zmachine",
            WorkloadType::ZMount => "zmount",
            WorkloadType::PublicIp => "ip",
            WorkloadType::Zdb => "zdb",
            WorkloadType::Qsfs => "qsfs",
            WorkloadType::GatewayFqdn => "gateway-fqdn-proxy",
            WorkloadType::GatewayName => "gateway-name-proxy",
        }
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed state of a workload as reported by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    /// Accepted but not yet processed.
    #[default]
    #[serde(alias = "pending")]
    Init,
    Ok,
    Error,
    Deleted,
    Paused,
}

/// Result block attached to every workload by the node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkloadResult {
    /// Unix timestamp of the last state change.
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub state: ResultState,
    #[serde(default)]
    pub error: String,
    /// Type-specific payload (see `workloads::*Result`).
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One declarative unit of infrastructure inside a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workload {
    #[serde(default)]
    pub version: u32,
    /// Unique within a deployment; the identity key across reconciliations.
    pub name: String,
    #[serde(rename = "type")]
    pub workload_type: WorkloadType,
    pub data: serde_json::Value,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub result: WorkloadResult,
}

impl Workload {
    /// Build a workload from a typed payload.
    pub fn new<T: Serialize>(
        name: impl Into<String>,
        workload_type: WorkloadType,
        data: &T,
    ) -> CoreResult<Self> {
        let name = name.into();
        let data = serde_json::to_value(data).map_err(|e| CoreError::Encode {
            workload: name.clone(),
            message: e.to_string(),
        })?;
        Ok(Self {
            version: 0,
            name,
            workload_type,
            data,
            metadata: String::new(),
            description: String::new(),
            result: WorkloadResult::default(),
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Decode the typed payload.
    pub fn data_as<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| CoreError::Decode {
            workload: self.name.clone(),
            message: e.to_string(),
        })
    }

    /// Decode the typed result payload.
    pub fn result_as<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_value(self.result.data.clone()).map_err(|e| CoreError::Decode {
            workload: self.name.clone(),
            message: e.to_string(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.result.state == ResultState::Ok
    }

    /// Canonical text signed/hashed for this workload.
    pub fn challenge(&self) -> String {
        format!(
            "{}{}{}{}{}{}",
            self.version,
            self.name,
            self.workload_type,
            self.data,
            self.metadata,
            self.description
        )
    }

    /// Content hash ignoring the version, used to detect changed workloads.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(self.workload_type.as_str().as_bytes());
        hasher.update(self.data.to_string().as_bytes());
        hasher.update(self.metadata.as_bytes());
        hasher.update(self.description.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ── Deployment ────────────────────────────────────────────────────

/// A twin allowed to sign a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRequest {
    pub twin_id: TwinId,
    pub required: bool,
    pub weight: u32,
}

/// A signature collected on a deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub twin_id: TwinId,
    pub signature: String,
    pub signature_type: String,
}

/// Who must sign a deployment before a node accepts it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignatureRequirement {
    #[serde(default)]
    pub requests: Vec<SignatureRequest>,
    #[serde(default)]
    pub weight_required: u32,
    #[serde(default)]
    pub signatures: Vec<Signature>,
    #[serde(default)]
    pub signature_style: String,
}

/// The workload set of one node, bound to one node contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub version: u32,
    pub twin_id: TwinId,
    #[serde(default)]
    pub contract_id: ContractId,
    #[serde(default)]
    pub metadata: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expiration: u64,
    #[serde(default)]
    pub signature_requirement: SignatureRequirement,
    #[serde(default)]
    pub workloads: Vec<Workload>,
}

impl Deployment {
    /// New deployment owned (and signed) by a single twin.
    pub fn new(twin_id: TwinId, workloads: Vec<Workload>) -> Self {
        Self {
            version: 0,
            twin_id,
            contract_id: 0,
            metadata: String::new(),
            description: String::new(),
            expiration: 0,
            signature_requirement: SignatureRequirement {
                requests: vec![SignatureRequest {
                    twin_id,
                    required: false,
                    weight: 1,
                }],
                weight_required: 1,
                signatures: Vec::new(),
                signature_style: String::new(),
            },
            workloads,
        }
    }

    pub fn workload(&self, name: &str) -> Option<&Workload> {
        self.workloads.iter().find(|w| w.name == name)
    }

    pub fn workload_names(&self) -> BTreeSet<&str> {
        self.workloads.iter().map(|w| w.name.as_str()).collect()
    }

    /// Canonical text covering everything a node verifies.
    pub fn challenge(&self) -> String {
        let mut out = format!(
            "{}{}{}{}{}",
            self.version, self.twin_id, self.metadata, self.description, self.expiration
        );
        for w in &self.workloads {
            out.push_str(&w.challenge());
        }
        for r in &self.signature_requirement.requests {
            out.push_str(&format!("{}{}{}", r.twin_id, r.required, r.weight));
        }
        out.push_str(&self.signature_requirement.weight_required.to_string());
        out.push_str(&self.signature_requirement.signature_style);
        out
    }

    /// Hex-encoded SHA-256 of the challenge; stored on the node contract.
    pub fn challenge_hash(&self) -> String {
        hex::encode(Sha256::digest(self.challenge().as_bytes()))
    }

    /// Number of public IPv4 addresses the deployment reserves.
    pub fn count_public_ipv4(&self) -> u32 {
        self.workloads
            .iter()
            .filter(|w| w.workload_type == WorkloadType::PublicIp)
            .filter_map(|w| w.data_as::<PublicIpData>().ok())
            .filter(|ip| ip.v4)
            .count() as u32
    }
}
