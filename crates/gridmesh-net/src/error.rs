//! Overlay network errors.

use gridmesh_core::{ClientError, CoreError, NodeId};
use thiserror::Error;

pub type NetResult<T> = Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("address space exhausted: {0}")]
    AddressSpaceExhausted(String),

    /// The node has no public IPv4/IPv6 address usable as an endpoint.
    /// Recoverable: the topology builder treats the node as hidden.
    #[error("node {0} has no accessible interface")]
    NoAccessibleInterface(NodeId),

    #[error("the network needs a public access node but none could be found")]
    PublicNodeRequired,

    #[error("invalid ip range {range}: {reason}")]
    InvalidIpRange { range: String, reason: String },

    #[error("invalid network: {0}")]
    InvalidNetwork(String),

    #[error("invalid wireguard key: {0}")]
    InvalidKey(String),

    #[error("no free wireguard port on node {0}")]
    NoFreePort(NodeId),

    #[error("rpc to node {node} failed: {source}")]
    Rpc {
        node: NodeId,
        #[source]
        source: ClientError,
    },

    #[error("public node discovery failed: {0}")]
    Discovery(#[source] ClientError),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] CoreError),
}
