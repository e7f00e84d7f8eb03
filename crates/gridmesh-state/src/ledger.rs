//! In-memory network ledger.
//!
//! `NetworkState` records, for one overlay network, which subnet each node
//! owns and which host-ids each deployment on that node has claimed. The
//! host-id entries are rebuilt from observed machine IPs on every sync and
//! trimmed when a deployment is canceled or its contract disappears.

use std::collections::BTreeMap;

use gridmesh_core::{ContractId, NodeId};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

/// Subnets and claimed host-ids of one network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkState {
    #[serde(default)]
    pub subnets: BTreeMap<NodeId, Ipv4Net>,
    /// node → contract → claimed host-id bytes.
    #[serde(default)]
    pub host_ids: BTreeMap<NodeId, BTreeMap<ContractId, Vec<u8>>>,
}

impl NetworkState {
    pub fn node_subnet(&self, node: NodeId) -> Option<Ipv4Net> {
        self.subnets.get(&node).copied()
    }

    pub fn set_node_subnet(&mut self, node: NodeId, subnet: Ipv4Net) {
        self.subnets.insert(node, subnet);
    }

    pub fn delete_node_subnet(&mut self, node: NodeId) {
        self.subnets.remove(&node);
    }

    /// Host-ids claimed by every deployment on `node`, sorted and deduplicated.
    pub fn used_host_ids(&self, node: NodeId) -> Vec<u8> {
        let mut used: Vec<u8> = self
            .host_ids
            .get(&node)
            .map(|by_contract| by_contract.values().flatten().copied().collect())
            .unwrap_or_default();
        used.sort_unstable();
        used.dedup();
        used
    }

    /// Host-ids claimed on `node` by every deployment except `contract`.
    pub fn used_host_ids_excluding(&self, node: NodeId, contract: ContractId) -> Vec<u8> {
        let mut used: Vec<u8> = self
            .host_ids
            .get(&node)
            .map(|by_contract| {
                by_contract
                    .iter()
                    .filter(|(id, _)| **id != contract)
                    .flat_map(|(_, ids)| ids.iter().copied())
                    .collect()
            })
            .unwrap_or_default();
        used.sort_unstable();
        used.dedup();
        used
    }

    pub fn deployment_host_ids(&self, node: NodeId, contract: ContractId) -> &[u8] {
        self.host_ids
            .get(&node)
            .and_then(|by_contract| by_contract.get(&contract))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replace the host-ids claimed by one deployment.
    pub fn set_deployment_host_ids(&mut self, node: NodeId, contract: ContractId, ids: Vec<u8>) {
        self.host_ids.entry(node).or_default().insert(contract, ids);
    }

    pub fn delete_deployment_host_ids(&mut self, node: NodeId, contract: ContractId) {
        if let Some(by_contract) = self.host_ids.get_mut(&node) {
            by_contract.remove(&contract);
            if by_contract.is_empty() {
                self.host_ids.remove(&node);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty() && self.host_ids.is_empty()
    }
}

/// All network ledgers known to this process, keyed by network name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkState>,
}

impl LocalState {
    pub fn network(&self, name: &str) -> Option<&NetworkState> {
        self.networks.get(name)
    }

    /// Ledger of `name`, created empty on first use.
    pub fn network_mut(&mut self, name: &str) -> &mut NetworkState {
        self.networks.entry(name.to_string()).or_default()
    }

    pub fn remove_network(&mut self, name: &str) -> Option<NetworkState> {
        self.networks.remove(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn used_host_ids_merges_deployments() {
        let mut net = NetworkState::default();
        net.set_deployment_host_ids(1, 100, vec![4, 2]);
        net.set_deployment_host_ids(1, 101, vec![3, 2]);
        net.set_deployment_host_ids(2, 102, vec![9]);
        assert_eq!(net.used_host_ids(1), vec![2, 3, 4]);
        assert_eq!(net.used_host_ids(2), vec![9]);
        assert!(net.used_host_ids(3).is_empty());
    }

    #[test]
    fn excluding_own_contract() {
        let mut net = NetworkState::default();
        net.set_deployment_host_ids(1, 100, vec![2]);
        net.set_deployment_host_ids(1, 101, vec![3]);
        assert_eq!(net.used_host_ids_excluding(1, 100), vec![3]);
    }

    #[test]
    fn delete_deployment_drops_empty_node() {
        let mut net = NetworkState::default();
        net.set_deployment_host_ids(1, 100, vec![2]);
        net.delete_deployment_host_ids(1, 100);
        assert!(net.host_ids.is_empty());
        // Deleting again is a no-op.
        net.delete_deployment_host_ids(1, 100);
        assert!(net.is_empty());
    }

    #[test]
    fn subnets_set_and_delete() {
        let mut net = NetworkState::default();
        let subnet: Ipv4Net = "10.1.2.0/24".parse().unwrap();
        net.set_node_subnet(7, subnet);
        assert_eq!(net.node_subnet(7), Some(subnet));
        net.delete_node_subnet(7);
        assert_eq!(net.node_subnet(7), None);
    }

    #[test]
    fn local_state_serializes_numeric_keys() {
        let mut state = LocalState::default();
        state
            .network_mut("net")
            .set_deployment_host_ids(11, 5, vec![2, 3]);
        let json = serde_json::to_string(&state).unwrap();
        let back: LocalState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
