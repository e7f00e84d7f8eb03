//! Reconciler errors.

use std::collections::BTreeMap;

use gridmesh_core::{ClientError, ContractId, CoreError, NodeId};
use gridmesh_net::NetError;
use gridmesh_state::StateError;
use thiserror::Error;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("contract {0} not found")]
    ContractNotFound(ContractId),

    #[error("contract {id} is invalid: {reason}")]
    ContractInvalid { id: ContractId, reason: String },

    /// Some nodes converged, others did not. `contracts` holds the contract
    /// of every node that has one and must be kept by the caller.
    #[error("{} node(s) failed to converge: {}", .failures.len(), summarize(.failures))]
    PartialConvergence {
        contracts: BTreeMap<NodeId, ContractId>,
        failures: BTreeMap<NodeId, String>,
    },

    #[error("node {node} is not part of network {network}")]
    NodeNotInNetwork { node: NodeId, network: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("chain: {0}")]
    Chain(#[source] ClientError),

    #[error("node {node}: {source}")]
    Node {
        node: NodeId,
        #[source]
        source: ClientError,
    },

    #[error("timed out waiting for contract {contract} on node {node}")]
    WaitTimeout { node: NodeId, contract: ContractId },

    #[error("workload {workload} on node {node} failed: {message}")]
    WorkloadFailed {
        node: NodeId,
        workload: String,
        message: String,
    },
}

fn summarize(failures: &BTreeMap<NodeId, String>) -> String {
    failures
        .iter()
        .map(|(node, error)| format!("node {node}: {error}"))
        .collect::<Vec<_>>()
        .join("; ")
}
