//! The persisted record of one overlay network.

use std::collections::{BTreeMap, BTreeSet};

use gridmesh_core::NodeId;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::allocator::validate_ip_range;
use crate::error::{NetError, NetResult};

/// Subnet and key handed to a WireGuard client outside the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalAccess {
    pub subnet: Ipv4Net,
    /// Base64 private key of the client.
    pub private_key: String,
}

/// Declared inputs plus every assignment made on previous passes.
///
/// The topology builder reuses recorded subnets, keys and ports so that
/// rebuilding an unchanged network yields the same deployments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Private /16 the node subnets are carved from.
    pub ip_range: Ipv4Net,
    /// Requested nodes.
    pub nodes: Vec<NodeId>,
    /// Render a client config for a machine outside the mesh.
    #[serde(default)]
    pub add_wg_access: bool,

    #[serde(default)]
    pub access_node: Option<NodeId>,
    #[serde(default)]
    pub external: Option<ExternalAccess>,
    #[serde(default)]
    pub subnets: BTreeMap<NodeId, Ipv4Net>,
    /// Base64 WireGuard private key per node.
    #[serde(default)]
    pub keys: BTreeMap<NodeId, String>,
    #[serde(default)]
    pub ports: BTreeMap<NodeId, u16>,
    /// Last rendered external client config, empty without external access.
    #[serde(default)]
    pub access_wg_config: String,
}

impl Network {
    pub fn new(name: impl Into<String>, ip_range: Ipv4Net, nodes: Vec<NodeId>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            ip_range,
            nodes,
            add_wg_access: false,
            access_node: None,
            external: None,
            subnets: BTreeMap::new(),
            keys: BTreeMap::new(),
            ports: BTreeMap::new(),
            access_wg_config: String::new(),
        }
    }

    pub fn with_wg_access(mut self, enabled: bool) -> Self {
        self.add_wg_access = enabled;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn validate(&self) -> NetResult<()> {
        if self.name.is_empty() {
            return Err(NetError::InvalidNetwork("name must not be empty".into()));
        }
        if self.nodes.is_empty() {
            return Err(NetError::InvalidNetwork(format!(
                "network {} has no nodes",
                self.name
            )));
        }
        validate_ip_range(self.ip_range)
    }

    /// Requested nodes, deduplicated.
    pub fn requested(&self) -> BTreeSet<NodeId> {
        self.nodes.iter().copied().collect()
    }

    /// Nodes currently holding a subnet, the access node included.
    pub fn members(&self) -> BTreeSet<NodeId> {
        self.subnets.keys().copied().collect()
    }

    /// Drop every assignment, keeping only the declared inputs.
    pub fn clear_assignments(&mut self) {
        self.access_node = None;
        self.external = None;
        self.subnets.clear();
        self.keys.clear();
        self.ports.clear();
        self.access_wg_config.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        let range: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        assert!(Network::new("net", range, vec![1]).validate().is_ok());
        assert!(Network::new("", range, vec![1]).validate().is_err());
        assert!(Network::new("net", range, vec![]).validate().is_err());
        let public: Ipv4Net = "8.8.0.0/16".parse().unwrap();
        assert!(matches!(
            Network::new("net", public, vec![1]).validate(),
            Err(NetError::InvalidIpRange { .. })
        ));
    }

    #[test]
    fn minimal_record_deserializes() {
        let net: Network =
            serde_json::from_str(r#"{"name":"n","ip_range":"10.1.0.0/16","nodes":[3,1,3]}"#)
                .unwrap();
        assert!(!net.add_wg_access);
        assert!(net.subnets.is_empty());
        assert_eq!(net.requested().into_iter().collect::<Vec<_>>(), vec![1, 3]);
    }
}
