//! Collaborators the topology builder talks to.
//!
//! The real transports live outside this workspace; `gridmesh-deployer`
//! ships in-memory implementations for tests and dry runs.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use gridmesh_core::{ClientError, NodeId};
use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

/// Name of the node interface carrying its own management addresses.
pub const ZOS_INTERFACE: &str = "zos";

/// Public network configuration of a node, when it has one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicConfig {
    #[serde(default)]
    pub ipv4: Option<Ipv4Net>,
    #[serde(default)]
    pub ipv6: Option<Ipv6Net>,
    #[serde(default)]
    pub gw4: Option<Ipv4Addr>,
    #[serde(default)]
    pub gw6: Option<Ipv6Addr>,
    #[serde(default)]
    pub domain: String,
}

/// Node RPC calls used for endpoint discovery and port selection.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Addresses per interface name.
    async fn network_list_interfaces(
        &self,
        node: NodeId,
    ) -> Result<HashMap<String, Vec<IpAddr>>, ClientError>;

    /// `ClientError::NotFound` when the node has no public config.
    async fn network_get_public_config(&self, node: NodeId) -> Result<PublicConfig, ClientError>;

    /// WireGuard ports already bound on the node.
    async fn network_list_wg_ports(&self, node: NodeId) -> Result<Vec<u16>, ClientError>;
}

/// Discovery of nodes with public IPv4 reachability.
#[async_trait]
pub trait PublicNodeFinder: Send + Sync {
    /// Candidate nodes, members of `preferred` first.
    async fn public_nodes(&self, preferred: &[NodeId]) -> Result<Vec<NodeId>, ClientError>;
}
